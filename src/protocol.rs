/// PLC protocol definitions and the frame codec strategy
///
/// Every protocol family (MELSEC A1E, MC 3E, A3C, Omron FINS, HostLink) is
/// expressed as one [`FrameCodec`] value. The same value drives both directions:
/// clients build requests and decode responses with it, virtual servers decode
/// requests and build responses with it.

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::address::{AddressResolver, AddressSpec, DataMode, DeviceTable};
use crate::error::{PlcError, PlcResult};
use crate::framing::FrameProgress;
use crate::utils::ByteOrder;

/// Logical operation of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => f.write_str("read"),
            Operation::Write => f.write_str("write"),
        }
    }
}

/// Data carried by a write request or a read response
///
/// Word data is kept as raw bytes in the codec's byte order; bit data as one
/// boolean per point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPayload {
    Bytes(Vec<u8>),
    Bits(Vec<bool>),
}

impl DataPayload {
    /// Number of points represented (words for byte payloads)
    pub fn points(&self) -> usize {
        match self {
            DataPayload::Bytes(bytes) => bytes.len() / 2,
            DataPayload::Bits(bits) => bits.len(),
        }
    }

    pub fn mode(&self) -> DataMode {
        match self {
            DataPayload::Bytes(_) => DataMode::Word,
            DataPayload::Bits(_) => DataMode::Bit,
        }
    }

    /// Slice `count` points starting at point `offset`
    pub fn slice(&self, offset: usize, count: usize) -> DataPayload {
        match self {
            DataPayload::Bytes(bytes) => DataPayload::Bytes(bytes[offset * 2..(offset + count) * 2].to_vec()),
            DataPayload::Bits(bits) => DataPayload::Bits(bits[offset..offset + count].to_vec()),
        }
    }

    /// Concatenate sub-frame results in order
    pub fn concat(parts: Vec<DataPayload>) -> PlcResult<DataPayload> {
        let mut iter = parts.into_iter();
        let mut merged = iter
            .next()
            .ok_or_else(|| PlcError::internal("no sub-frame results to merge"))?;
        for part in iter {
            match (&mut merged, part) {
                (DataPayload::Bytes(acc), DataPayload::Bytes(more)) => acc.extend_from_slice(&more),
                (DataPayload::Bits(acc), DataPayload::Bits(more)) => acc.extend_from_slice(&more),
                _ => return Err(PlcError::internal("mixed bit and word sub-frame results")),
            }
        }
        Ok(merged)
    }

    pub fn into_bytes(self) -> PlcResult<Vec<u8>> {
        match self {
            DataPayload::Bytes(bytes) => Ok(bytes),
            DataPayload::Bits(_) => Err(PlcError::invalid_data("expected word data, got bits")),
        }
    }

    pub fn into_bits(self) -> PlcResult<Vec<bool>> {
        match self {
            DataPayload::Bits(bits) => Ok(bits),
            DataPayload::Bytes(_) => Err(PlcError::invalid_data("expected bit data, got words")),
        }
    }
}

/// One wire request, before encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub operation: Operation,
    pub mode: DataMode,
    /// Station / unit / PLC number
    pub station: u8,
    /// Network number (MC) or destination network (FINS)
    pub network: u8,
    /// Device-type code as carried on the wire
    pub device_code: u16,
    /// Start offset in device units (word address for bit-in-word access)
    pub start: u32,
    /// Bit position inside `start` for bit-in-word access
    pub bit: Option<u8>,
    /// Points in this frame
    pub points: usize,
    /// Write data
    pub payload: Option<DataPayload>,
    /// Sequence / service id
    pub sequence: u16,
    /// Header bytes a server must echo back (routing fields)
    pub route: Vec<u8>,
}

impl CommandFrame {
    /// Read frame with no payload
    pub fn read(mode: DataMode, device_code: u16, start: u32, points: usize) -> Self {
        Self {
            operation: Operation::Read,
            mode,
            station: 0,
            network: 0,
            device_code,
            start,
            bit: None,
            points,
            payload: None,
            sequence: 0,
            route: Vec::new(),
        }
    }

    /// Write frame carrying `payload`
    pub fn write(device_code: u16, start: u32, payload: DataPayload) -> Self {
        Self {
            operation: Operation::Write,
            mode: payload.mode(),
            points: payload.points(),
            payload: Some(payload),
            ..Self::read(DataMode::Word, device_code, start, 0)
        }
    }

    /// Expected number of response payload bytes for binary word reads
    pub fn word_bytes(&self) -> usize {
        self.points * 2
    }

    /// Linear bit position for bit-in-word access
    pub fn linear_bit(&self) -> Option<u64> {
        self.bit.map(|bit| self.start as u64 * 16 + bit as u64)
    }
}

/// Decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Status / end code (0 on success)
    pub status: u16,
    /// Read data
    pub payload: Option<DataPayload>,
    /// Size of the raw frame
    pub raw_len: usize,
}

/// Per-connection identifiers and counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Our node address (client node for clients, server node for servers)
    pub local_node: u8,
    /// The peer's node address
    pub remote_node: u8,
    /// Handshake-assigned session / connection id
    pub session_id: u32,
    sequence: u16,
}

impl SessionContext {
    pub fn new(local_node: u8, remote_node: u8) -> Self {
        Self {
            local_node,
            remote_node,
            session_id: 0,
            sequence: 0,
        }
    }

    /// Advance and return the sequence counter
    pub fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }
}

/// Maximum points per frame, per operation and mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointCeilings {
    pub read_words: usize,
    pub read_bits: usize,
    pub write_words: usize,
    pub write_bits: usize,
    /// Whether oversized writes are split or rejected
    pub split_writes: bool,
}

impl PointCeilings {
    pub fn uniform(ceiling: usize) -> Self {
        Self {
            read_words: ceiling,
            read_bits: ceiling,
            write_words: ceiling,
            write_bits: ceiling,
            split_writes: true,
        }
    }

    pub fn ceiling(&self, operation: Operation, mode: DataMode) -> usize {
        match (operation, mode) {
            (Operation::Read, DataMode::Word) => self.read_words,
            (Operation::Read, DataMode::Bit) => self.read_bits,
            (Operation::Write, DataMode::Word) => self.write_words,
            (Operation::Write, DataMode::Bit) => self.write_bits,
        }
    }
}

/// Semantic faults a server reports with a status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerFault {
    /// Address or length outside the region
    OutOfRange,
    /// Device type not served
    UnsupportedDevice,
    /// Write refused (read-only region or writes disabled)
    WriteDisabled,
}

/// A decoded inbound server frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Session handshake, answered directly with `reply`
    Handshake { reply: Vec<u8> },
    /// A read or write command
    Command(CommandFrame),
}

/// Protocol strategy shared by clients and servers
///
/// Implementations are stateless; per-connection state lives in
/// [`SessionContext`].
pub trait FrameCodec: Send + Sync + fmt::Debug {
    /// Short protocol name used in logs
    fn name(&self) -> &'static str;

    /// Device-type table for address resolution and dispatch
    fn device_table(&self) -> &DeviceTable;

    /// Per-frame point ceilings
    fn ceilings(&self) -> PointCeilings;

    /// Byte order of word data in payloads
    fn byte_order(&self) -> ByteOrder;

    /// Station used when the address has no `s=` override
    fn station(&self) -> u8 {
        0
    }

    /// Network used when the address has no `net=` override
    fn network(&self) -> u8 {
        0
    }

    /// Whether serial framing is used (affects logging only)
    fn is_text(&self) -> bool {
        false
    }

    /// Fresh session state for a new connection
    fn new_session(&self) -> SessionContext {
        SessionContext::default()
    }

    /// Resolve an address against this codec's device table
    fn resolve(&self, address: &str) -> PlcResult<AddressSpec> {
        AddressResolver::new(self.device_table()).resolve(address)
    }

    /// Split a logical request into wire-sized command frames
    fn plan(
        &self,
        spec: &AddressSpec,
        operation: Operation,
        points: usize,
        payload: Option<&DataPayload>,
    ) -> PlcResult<Vec<CommandFrame>> {
        split_request(self, spec, operation, points, payload)
    }

    /// Encode one command frame
    fn encode_command(&self, frame: &CommandFrame, session: &SessionContext) -> PlcResult<Vec<u8>>;

    /// Framing progress of a response to `request`
    fn response_progress(&self, buf: &[u8], request: &CommandFrame) -> PlcResult<FrameProgress>;

    /// Decode a complete response frame
    ///
    /// A non-zero status is returned as [`PlcError::ProtocolStatus`].
    fn decode_response(&self, raw: &[u8], request: &CommandFrame, session: &SessionContext) -> PlcResult<ResponseFrame>;

    /// Frame sent once after connecting, if the protocol has a handshake
    fn handshake_request(&self, _session: &SessionContext) -> Option<Vec<u8>> {
        None
    }

    /// Framing progress of the handshake reply
    fn handshake_progress(&self, _buf: &[u8]) -> PlcResult<FrameProgress> {
        Err(PlcError::frame(format!("{} has no handshake", self.name())))
    }

    /// Validate the handshake reply and record the identifiers it carries
    fn accept_handshake(&self, _raw: &[u8], _session: &mut SessionContext) -> PlcResult<()> {
        Ok(())
    }

    /// Framing progress of an inbound request
    fn request_progress(&self, buf: &[u8]) -> PlcResult<FrameProgress>;

    /// Decode a complete inbound request
    fn decode_inbound(&self, raw: &[u8], session: &mut SessionContext) -> PlcResult<Inbound>;

    /// Encode the reply to `request`
    fn encode_reply(
        &self,
        request: &CommandFrame,
        status: u16,
        payload: Option<&DataPayload>,
        session: &SessionContext,
    ) -> PlcResult<Vec<u8>>;

    /// Protocol status used for a server-side fault
    fn fault_status(&self, fault: ServerFault) -> u16;

    /// Human-readable text for a status code
    fn describe_status(&self, code: u16) -> String;

    /// Resolve, split and encode a logical request in one step
    ///
    /// Returns the command frames alongside their encodings, in the order
    /// their results concatenate.
    fn encode_request(
        &self,
        spec: &AddressSpec,
        operation: Operation,
        points: usize,
        payload: Option<&DataPayload>,
        session: &mut SessionContext,
    ) -> PlcResult<Vec<(CommandFrame, Vec<u8>)>> {
        let frames = self.plan(spec, operation, points, payload)?;
        frames
            .into_iter()
            .map(|mut frame| {
                frame.sequence = session.next_sequence();
                let bytes = self.encode_command(&frame, session)?;
                Ok((frame, bytes))
            })
            .collect()
    }
}

/// Shared splitting rule used by [`FrameCodec::plan`]
///
/// Sub-frames carry advancing start addresses; bit-in-word addresses advance
/// along the linear bit position.
pub fn split_request<C: FrameCodec + ?Sized>(
    codec: &C,
    spec: &AddressSpec,
    operation: Operation,
    points: usize,
    payload: Option<&DataPayload>,
) -> PlcResult<Vec<CommandFrame>> {
    if points == 0 {
        return Err(PlcError::invalid_data("point count must be at least 1"));
    }

    match (operation, payload) {
        (Operation::Write, None) => return Err(PlcError::invalid_data("write without payload")),
        (Operation::Write, Some(data)) => {
            if data.mode() != spec.mode {
                return Err(PlcError::invalid_data(format!(
                    "{} payload for a {} address",
                    data.mode(),
                    spec.mode
                )));
            }
            if let DataPayload::Bytes(bytes) = data {
                if bytes.len() % 2 != 0 {
                    return Err(PlcError::invalid_data("word payload must have an even byte count"));
                }
            }
            if data.points() != points {
                return Err(PlcError::invalid_data(format!(
                    "payload holds {} points, request declares {}",
                    data.points(),
                    points
                )));
            }
        }
        (Operation::Read, _) => {}
    }

    let first = match spec.bit {
        Some(bit) => spec.start as u64 * 16 + bit as u64,
        None => spec.start as u64,
    };
    let span = first
        .checked_add(points as u64 - 1)
        .ok_or_else(|| PlcError::length_exceeded(points, spec.device.max_address as usize))?;
    let last = if spec.bit.is_some() { span / 16 } else { span };
    if last > spec.device.max_address as u64 {
        return Err(PlcError::address(
            crate::error::AddressErrorKind::OutOfRange,
            format!("{}{}", spec.device.prefix, spec.start),
            format!("{} points run past {}", points, spec.device.max_address),
        ));
    }

    let ceilings = codec.ceilings();
    let ceiling = ceilings.ceiling(operation, spec.mode).max(1);
    if operation == Operation::Write && !ceilings.split_writes && points > ceiling {
        return Err(PlcError::length_exceeded(points, ceiling));
    }

    let station = spec.station.unwrap_or_else(|| codec.station());
    let network = spec.network.unwrap_or_else(|| codec.network());
    let device_code = spec.device_code();

    let mut frames = Vec::with_capacity((points + ceiling - 1) / ceiling);
    let mut offset = 0usize;
    while offset < points {
        let count = ceiling.min(points - offset);
        let (start, bit) = match spec.bit {
            Some(bit) => {
                let linear = spec.start as u64 * 16 + bit as u64 + offset as u64;
                ((linear / 16) as u32, Some((linear % 16) as u8))
            }
            None => (spec.start + offset as u32, None),
        };
        frames.push(CommandFrame {
            operation,
            mode: spec.mode,
            station,
            network,
            device_code,
            start,
            bit,
            points: count,
            payload: payload.map(|data| data.slice(offset, count)),
            sequence: 0,
            route: Vec::new(),
        });
        offset += count;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{DeviceEntry, NumericBase};

    #[derive(Debug)]
    struct FixedCodec {
        table: DeviceTable,
        ceilings: PointCeilings,
    }

    impl FixedCodec {
        fn new(ceilings: PointCeilings) -> Self {
            Self {
                table: DeviceTable::new(vec![
                    DeviceEntry::word("D", 0x82, NumericBase::Decimal).with_bit_code(0x02),
                    DeviceEntry::bit("M", 0x90, NumericBase::Decimal),
                ]),
                ceilings,
            }
        }
    }

    impl FrameCodec for FixedCodec {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn device_table(&self) -> &DeviceTable {
            &self.table
        }
        fn ceilings(&self) -> PointCeilings {
            self.ceilings
        }
        fn byte_order(&self) -> ByteOrder {
            ByteOrder::BigEndian
        }
        fn station(&self) -> u8 {
            7
        }
        fn encode_command(&self, frame: &CommandFrame, _session: &SessionContext) -> PlcResult<Vec<u8>> {
            Ok(vec![frame.start as u8, frame.points as u8])
        }
        fn response_progress(&self, buf: &[u8], _request: &CommandFrame) -> PlcResult<FrameProgress> {
            Ok(FrameProgress::Complete(buf.len()))
        }
        fn decode_response(&self, raw: &[u8], _request: &CommandFrame, _session: &SessionContext) -> PlcResult<ResponseFrame> {
            Ok(ResponseFrame { status: 0, payload: None, raw_len: raw.len() })
        }
        fn request_progress(&self, buf: &[u8]) -> PlcResult<FrameProgress> {
            Ok(FrameProgress::Complete(buf.len()))
        }
        fn decode_inbound(&self, _raw: &[u8], _session: &mut SessionContext) -> PlcResult<Inbound> {
            Err(PlcError::frame("unused"))
        }
        fn encode_reply(&self, _request: &CommandFrame, _status: u16, _payload: Option<&DataPayload>, _session: &SessionContext) -> PlcResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn fault_status(&self, _fault: ServerFault) -> u16 {
            1
        }
        fn describe_status(&self, code: u16) -> String {
            format!("status {}", code)
        }
    }

    #[test]
    fn test_split_sums_to_requested_length() {
        let codec = FixedCodec::new(PointCeilings::uniform(30));
        let spec = codec.resolve("D100").unwrap();
        let frames = codec.plan(&spec, Operation::Read, 75, None).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames.iter().map(|f| f.points).collect::<Vec<_>>(), vec![30, 30, 15]);
        assert_eq!(frames.iter().map(|f| f.start).collect::<Vec<_>>(), vec![100, 130, 160]);
        assert!(frames.iter().all(|f| f.station == 7));
    }

    #[test]
    fn test_split_write_payload() {
        let codec = FixedCodec::new(PointCeilings::uniform(2));
        let spec = codec.resolve("s=3;D0").unwrap();
        let payload = DataPayload::Bytes(vec![1, 2, 3, 4, 5, 6]);
        let frames = codec.plan(&spec, Operation::Write, 3, Some(&payload)).unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, Some(DataPayload::Bytes(vec![1, 2, 3, 4])));
        assert_eq!(frames[1].payload, Some(DataPayload::Bytes(vec![5, 6])));
        assert_eq!(frames[1].station, 3);
    }

    #[test]
    fn test_single_frame_write_rejected() {
        let mut ceilings = PointCeilings::uniform(30);
        ceilings.split_writes = false;
        let codec = FixedCodec::new(ceilings);
        let spec = codec.resolve("D0").unwrap();
        let payload = DataPayload::Bytes(vec![0; 62]);
        let err = codec.plan(&spec, Operation::Write, 31, Some(&payload)).unwrap_err();
        assert_eq!(err, PlcError::length_exceeded(31, 30));
    }

    #[test]
    fn test_huge_point_count_does_not_overflow() {
        let codec = FixedCodec::new(PointCeilings::uniform(30));
        let spec = codec.resolve("D100").unwrap();
        assert!(matches!(
            codec.plan(&spec, Operation::Read, usize::MAX, None),
            Err(PlcError::LengthExceeded { .. })
        ));
        let spec = codec.resolve("D1.12").unwrap();
        assert!(matches!(
            codec.plan(&spec, Operation::Read, usize::MAX, None),
            Err(PlcError::LengthExceeded { .. })
        ));
    }

    #[test]
    fn test_bit_in_word_split() {
        let codec = FixedCodec::new(PointCeilings::uniform(10));
        let spec = codec.resolve("D1.12").unwrap();
        let frames = codec.plan(&spec, Operation::Read, 12, None).unwrap();

        assert_eq!(frames[0].device_code, 0x02);
        assert_eq!((frames[0].start, frames[0].bit), (1, Some(12)));
        assert_eq!((frames[1].start, frames[1].bit), (2, Some(6)));
        assert_eq!(frames[1].points, 2);
    }

    #[test]
    fn test_payload_mismatch() {
        let codec = FixedCodec::new(PointCeilings::uniform(30));
        let spec = codec.resolve("M0").unwrap();
        let words = DataPayload::Bytes(vec![0, 1]);
        assert!(codec.plan(&spec, Operation::Write, 1, Some(&words)).is_err());
        assert!(codec.plan(&spec, Operation::Write, 1, None).is_err());
        assert!(codec.plan(&spec, Operation::Read, 0, None).is_err());
    }

    #[test]
    fn test_encode_request_advances_sequence() {
        let codec = FixedCodec::new(PointCeilings::uniform(5));
        let spec = codec.resolve("D0").unwrap();
        let mut session = SessionContext::default();
        let encoded = codec.encode_request(&spec, Operation::Read, 12, None, &mut session).unwrap();

        assert_eq!(encoded.len(), 3);
        assert_eq!(encoded[2].0.sequence, 3);
        assert_eq!(encoded[1].1, vec![5, 5]);
    }

    #[test]
    fn test_concat() {
        let merged = DataPayload::concat(vec![
            DataPayload::Bits(vec![true]),
            DataPayload::Bits(vec![false, true]),
        ])
        .unwrap();
        assert_eq!(merged, DataPayload::Bits(vec![true, false, true]));
        assert!(DataPayload::concat(vec![DataPayload::Bits(vec![]), DataPayload::Bytes(vec![])]).is_err());
    }
}
