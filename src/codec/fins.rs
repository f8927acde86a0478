//! Omron FINS over TCP and UDP
//!
//! Every command carries the 10-byte FINS header
//! `ICF RSV GCT DNA DA1 DA2 SNA SA1 SA2 SID` followed by MRC/SRC and the
//! memory-area body `area address(2 BE) bit count(2 BE)`. Responses add a
//! 2-byte end code after MRC/SRC.
//!
//! FINS/TCP wraps each frame in a 16-byte header `"FINS" length command error`
//! and opens the connection with a node-address exchange: the client sends
//! its node (0 asks the server to assign one) and the server answers with the
//! client and server node numbers. FINS/UDP sends the bare frame.

use byteorder::{BigEndian, ByteOrder as _};
use serde::{Deserialize, Serialize};

use crate::address::{DataMode, DeviceEntry, DeviceTable, NumericBase};
use crate::codec::{check_status, require_len};
use crate::error::{PlcError, PlcResult};
use crate::framing::{self, FrameProgress};
use crate::protocol::{
    CommandFrame, DataPayload, FrameCodec, Inbound, Operation, PointCeilings, ResponseFrame, ServerFault,
    SessionContext,
};
use crate::utils::{bits, ByteOrder};

const MAGIC: &[u8; 4] = b"FINS";
const TCP_HEADER: usize = 16;
const FINS_HEADER: usize = 10;
const COMMAND_BODY: usize = FINS_HEADER + 8;
const RESPONSE_HEADER: usize = FINS_HEADER + 4;

const TCP_NODE_REQUEST: u32 = 0;
const TCP_NODE_REPLY: u32 = 1;
const TCP_FRAME: u32 = 2;

const ICF_COMMAND: u8 = 0x80;
const ICF_RESPONSE: u8 = 0xC0;
const ICF_RESPONSE_BIT: u8 = 0x40;
const GCT: u8 = 0x02;

const MRC_MEMORY: u8 = 0x01;
const SRC_READ: u8 = 0x01;
const SRC_WRITE: u8 = 0x02;

/// Transport framing of FINS frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinsFraming {
    Tcp,
    Udp,
}

/// FINS codec
#[derive(Debug, Clone)]
pub struct FinsCodec {
    framing: FinsFraming,
    local_node: u8,
    remote_node: u8,
    network: u8,
    unit: u8,
    table: DeviceTable,
}

impl FinsCodec {
    pub fn new(framing: FinsFraming) -> Self {
        Self {
            framing,
            local_node: 0,
            remote_node: 0,
            network: 0,
            unit: 0,
            table: Self::default_table(),
        }
    }

    pub fn tcp() -> Self {
        Self::new(FinsFraming::Tcp)
    }

    pub fn udp() -> Self {
        Self::new(FinsFraming::Udp)
    }

    /// Our node (client node, or the server's own node when serving)
    pub fn with_local_node(mut self, node: u8) -> Self {
        self.local_node = node;
        self
    }

    /// Peer node used until a handshake says otherwise
    pub fn with_remote_node(mut self, node: u8) -> Self {
        self.remote_node = node;
        self
    }

    /// Destination unit address (DA2)
    pub fn with_unit(mut self, unit: u8) -> Self {
        self.unit = unit;
        self
    }

    pub fn framing(&self) -> FinsFraming {
        self.framing
    }

    /// CS/CJ memory areas: word code with the bit code for `.n` access
    pub fn default_table() -> DeviceTable {
        let area = |prefix: &str, word: u16, bit: u16| {
            DeviceEntry::word(prefix, word, NumericBase::Decimal)
                .with_bit_code(bit)
                .with_max_address(0xFFFF)
        };
        DeviceTable::new(vec![
            area("CIO", 0xB0, 0x30),
            area("C", 0xB0, 0x30),
            area("WR", 0xB1, 0x31),
            area("W", 0xB1, 0x31),
            area("HR", 0xB2, 0x32),
            area("H", 0xB2, 0x32),
            area("AR", 0xB3, 0x33),
            area("A", 0xB3, 0x33),
            area("DM", 0x82, 0x02),
            area("D", 0x82, 0x02),
        ])
    }

    fn mode_of_area(&self, area: u8) -> DataMode {
        match self.table.by_code(area as u16) {
            Some((_, mode)) => mode,
            None if area & 0x80 != 0 => DataMode::Word,
            None => DataMode::Bit,
        }
    }

    fn data_len(mode: DataMode, points: usize) -> usize {
        match mode {
            DataMode::Word => points * 2,
            DataMode::Bit => points,
        }
    }

    fn encode_data(payload: &DataPayload) -> Vec<u8> {
        match payload {
            DataPayload::Bytes(bytes) => bytes.clone(),
            DataPayload::Bits(values) => bits::bits_to_bytes(values),
        }
    }

    fn decode_data(data: &[u8], mode: DataMode, points: usize) -> PlcResult<DataPayload> {
        let needed = Self::data_len(mode, points);
        require_len(data, needed)?;
        Ok(match mode {
            DataMode::Word => DataPayload::Bytes(data[..needed].to_vec()),
            DataMode::Bit => DataPayload::Bits(bits::bytes_to_bits(&data[..needed])),
        })
    }

    fn tcp_wrap(command: u32, error: u32, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; TCP_HEADER];
        out[..4].copy_from_slice(MAGIC);
        BigEndian::write_u32(&mut out[4..8], (8 + body.len()) as u32);
        BigEndian::write_u32(&mut out[8..12], command);
        BigEndian::write_u32(&mut out[12..16], error);
        out.extend_from_slice(body);
        out
    }

    /// Strip the TCP header, returning its command and the inner bytes
    fn tcp_unwrap<'a>(&self, raw: &'a [u8]) -> PlcResult<(u32, &'a [u8])> {
        require_len(raw, TCP_HEADER)?;
        if &raw[..4] != MAGIC {
            return Err(PlcError::frame("missing FINS/TCP magic"));
        }
        let error = BigEndian::read_u32(&raw[12..16]);
        if error != 0 {
            return Err(PlcError::connection(format!("FINS/TCP error code 0x{:08X}", error)));
        }
        Ok((BigEndian::read_u32(&raw[8..12]), &raw[TCP_HEADER..]))
    }

    fn tcp_progress(buf: &[u8]) -> PlcResult<FrameProgress> {
        framing::by_length(buf, 8, |header| {
            if &header[..4] != MAGIC {
                return Err(PlcError::frame("missing FINS/TCP magic"));
            }
            Ok(8 + BigEndian::read_u32(&header[4..8]) as usize)
        })
    }

    /// Inner frame of a data message for the configured framing
    fn inner<'a>(&self, raw: &'a [u8]) -> PlcResult<&'a [u8]> {
        match self.framing {
            FinsFraming::Udp => Ok(raw),
            FinsFraming::Tcp => match self.tcp_unwrap(raw)? {
                (TCP_FRAME, inner) => Ok(inner),
                (command, _) => Err(PlcError::frame(format!("unexpected FINS/TCP command {}", command))),
            },
        }
    }

    fn wrap(&self, inner: Vec<u8>) -> Vec<u8> {
        match self.framing {
            FinsFraming::Udp => inner,
            FinsFraming::Tcp => Self::tcp_wrap(TCP_FRAME, 0, &inner),
        }
    }

    fn src(operation: Operation) -> u8 {
        match operation {
            Operation::Read => SRC_READ,
            Operation::Write => SRC_WRITE,
        }
    }
}

impl Default for FinsCodec {
    fn default() -> Self {
        Self::tcp()
    }
}

impl FrameCodec for FinsCodec {
    fn name(&self) -> &'static str {
        match self.framing {
            FinsFraming::Tcp => "FINS/TCP",
            FinsFraming::Udp => "FINS/UDP",
        }
    }

    fn device_table(&self) -> &DeviceTable {
        &self.table
    }

    fn ceilings(&self) -> PointCeilings {
        PointCeilings::uniform(999)
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::BigEndian
    }

    fn network(&self) -> u8 {
        self.network
    }

    fn new_session(&self) -> SessionContext {
        SessionContext::new(self.local_node, self.remote_node)
    }

    fn encode_command(&self, frame: &CommandFrame, session: &SessionContext) -> PlcResult<Vec<u8>> {
        if frame.start > 0xFFFF {
            return Err(PlcError::invalid_data(format!("FINS word address {} exceeds 0xFFFF", frame.start)));
        }
        if frame.points > 0xFFFF {
            return Err(PlcError::length_exceeded(frame.points, 0xFFFF));
        }
        let mut inner = Vec::with_capacity(COMMAND_BODY + frame.points * 2);
        inner.extend_from_slice(&[
            ICF_COMMAND,
            0x00,
            GCT,
            frame.network,
            session.remote_node,
            self.unit,
            0x00,
            session.local_node,
            0x00,
            frame.sequence as u8,
            MRC_MEMORY,
            Self::src(frame.operation),
            frame.device_code as u8,
        ]);
        let mut field = [0u8; 2];
        BigEndian::write_u16(&mut field, frame.start as u16);
        inner.extend_from_slice(&field);
        inner.push(frame.bit.unwrap_or(0));
        BigEndian::write_u16(&mut field, frame.points as u16);
        inner.extend_from_slice(&field);

        match (frame.operation, &frame.payload) {
            (Operation::Write, Some(payload)) => inner.extend_from_slice(&Self::encode_data(payload)),
            (Operation::Write, None) => return Err(PlcError::invalid_data("write frame without payload")),
            (Operation::Read, _) => {}
        }
        Ok(self.wrap(inner))
    }

    fn response_progress(&self, buf: &[u8], request: &CommandFrame) -> PlcResult<FrameProgress> {
        match self.framing {
            FinsFraming::Tcp => Self::tcp_progress(buf),
            FinsFraming::Udp => framing::by_length(buf, RESPONSE_HEADER, |header| {
                let ok = header[12] & 0x7F == 0 && header[13] & 0x3F == 0;
                Ok(match request.operation {
                    Operation::Read if ok => RESPONSE_HEADER + Self::data_len(request.mode, request.points),
                    _ => RESPONSE_HEADER,
                })
            }),
        }
    }

    fn decode_response(&self, raw: &[u8], request: &CommandFrame, _session: &SessionContext) -> PlcResult<ResponseFrame> {
        let inner = self.inner(raw)?;
        require_len(inner, RESPONSE_HEADER)?;

        if inner[0] & ICF_RESPONSE_BIT == 0 {
            return Err(PlcError::frame("FINS frame is not a response"));
        }
        if inner[9] != request.sequence as u8 {
            return Err(PlcError::frame(format!(
                "FINS SID {} does not match request {}",
                inner[9], request.sequence as u8
            )));
        }
        if inner[10] != MRC_MEMORY || inner[11] != Self::src(request.operation) {
            return Err(PlcError::frame(format!(
                "FINS response to command {:02X}{:02X}",
                inner[10], inner[11]
            )));
        }

        let status = ((inner[12] & 0x7F) as u16) << 8 | (inner[13] & 0x3F) as u16;
        check_status(self, status)?;

        let payload = match request.operation {
            Operation::Read => Some(Self::decode_data(&inner[RESPONSE_HEADER..], request.mode, request.points)?),
            Operation::Write => None,
        };
        Ok(ResponseFrame {
            status,
            payload,
            raw_len: raw.len(),
        })
    }

    fn handshake_request(&self, session: &SessionContext) -> Option<Vec<u8>> {
        match self.framing {
            FinsFraming::Udp => None,
            FinsFraming::Tcp => {
                let mut node = [0u8; 4];
                BigEndian::write_u32(&mut node, session.local_node as u32);
                Some(Self::tcp_wrap(TCP_NODE_REQUEST, 0, &node))
            }
        }
    }

    fn handshake_progress(&self, buf: &[u8]) -> PlcResult<FrameProgress> {
        Self::tcp_progress(buf)
    }

    fn accept_handshake(&self, raw: &[u8], session: &mut SessionContext) -> PlcResult<()> {
        let (command, body) = self.tcp_unwrap(raw)?;
        if command != TCP_NODE_REPLY {
            return Err(PlcError::connection(format!("expected node address reply, got command {}", command)));
        }
        require_len(body, 8)?;
        session.local_node = BigEndian::read_u32(&body[0..4]) as u8;
        session.remote_node = BigEndian::read_u32(&body[4..8]) as u8;
        session.session_id = session.local_node as u32;
        Ok(())
    }

    fn request_progress(&self, buf: &[u8]) -> PlcResult<FrameProgress> {
        match self.framing {
            FinsFraming::Tcp => Self::tcp_progress(buf),
            FinsFraming::Udp => framing::by_length(buf, COMMAND_BODY, |header| {
                let data = match header[11] {
                    SRC_WRITE => {
                        Self::data_len(self.mode_of_area(header[12]), BigEndian::read_u16(&header[16..18]) as usize)
                    }
                    _ => 0,
                };
                Ok(COMMAND_BODY + data)
            }),
        }
    }

    fn decode_inbound(&self, raw: &[u8], session: &mut SessionContext) -> PlcResult<Inbound> {
        let inner = match self.framing {
            FinsFraming::Udp => raw,
            FinsFraming::Tcp => match self.tcp_unwrap(raw)? {
                (TCP_NODE_REQUEST, body) => {
                    require_len(body, 4)?;
                    let requested = BigEndian::read_u32(&body[0..4]) as u8;
                    let assigned = match requested {
                        0 => match session.local_node.wrapping_add(1) {
                            0 => 1,
                            node => node,
                        },
                        node => node,
                    };
                    session.remote_node = assigned;
                    session.session_id = assigned as u32;
                    let mut nodes = [0u8; 8];
                    BigEndian::write_u32(&mut nodes[0..4], assigned as u32);
                    BigEndian::write_u32(&mut nodes[4..8], session.local_node as u32);
                    return Ok(Inbound::Handshake {
                        reply: Self::tcp_wrap(TCP_NODE_REPLY, 0, &nodes),
                    });
                }
                (TCP_FRAME, inner) => inner,
                (command, _) => return Err(PlcError::frame(format!("unexpected FINS/TCP command {}", command))),
            },
        };

        require_len(inner, COMMAND_BODY)?;
        if inner[0] & ICF_RESPONSE_BIT != 0 {
            return Err(PlcError::frame("FINS request carries the response flag"));
        }
        let operation = match (inner[10], inner[11]) {
            (MRC_MEMORY, SRC_READ) => Operation::Read,
            (MRC_MEMORY, SRC_WRITE) => Operation::Write,
            (mrc, src) => return Err(PlcError::frame(format!("unsupported FINS command {:02X}{:02X}", mrc, src))),
        };
        let area = inner[12];
        let mode = self.mode_of_area(area);
        let start = BigEndian::read_u16(&inner[13..15]) as u32;
        let bit = match mode {
            DataMode::Bit => Some(inner[15]),
            DataMode::Word => None,
        };
        if let Some(index) = bit {
            if index > 15 {
                return Err(PlcError::frame(format!("FINS bit position {} above 15", index)));
            }
        }
        let points = BigEndian::read_u16(&inner[16..18]) as usize;

        let payload = match operation {
            Operation::Write => {
                let data = &inner[COMMAND_BODY..];
                if data.len() != Self::data_len(mode, points) {
                    return Err(PlcError::frame(format!(
                        "FINS write of {} points carries {} data bytes",
                        points,
                        data.len()
                    )));
                }
                Some(Self::decode_data(data, mode, points)?)
            }
            Operation::Read => None,
        };

        Ok(Inbound::Command(CommandFrame {
            operation,
            mode,
            station: inner[4],
            network: inner[3],
            device_code: area as u16,
            start,
            bit,
            points,
            payload,
            sequence: inner[9] as u16,
            route: inner[..FINS_HEADER].to_vec(),
        }))
    }

    fn encode_reply(
        &self,
        request: &CommandFrame,
        status: u16,
        payload: Option<&DataPayload>,
        session: &SessionContext,
    ) -> PlcResult<Vec<u8>> {
        let header: [u8; FINS_HEADER] = if request.route.len() == FINS_HEADER {
            let r = &request.route;
            [ICF_RESPONSE, 0x00, GCT, r[6], r[7], r[8], r[3], r[4], r[5], r[9]]
        } else {
            [
                ICF_RESPONSE,
                0x00,
                GCT,
                0x00,
                session.remote_node,
                0x00,
                request.network,
                session.local_node,
                self.unit,
                request.sequence as u8,
            ]
        };

        let mut inner = Vec::with_capacity(RESPONSE_HEADER + request.points * 2);
        inner.extend_from_slice(&header);
        inner.push(MRC_MEMORY);
        inner.push(Self::src(request.operation));
        inner.extend_from_slice(&status.to_be_bytes());
        if status == 0 {
            if let Some(data) = payload {
                inner.extend_from_slice(&Self::encode_data(data));
            }
        }
        Ok(self.wrap(inner))
    }

    fn fault_status(&self, fault: ServerFault) -> u16 {
        match fault {
            ServerFault::OutOfRange => 0x1103,
            ServerFault::UnsupportedDevice => 0x1101,
            ServerFault::WriteDisabled => 0x2101,
        }
    }

    fn describe_status(&self, code: u16) -> String {
        let text = match code {
            0x0000 => "Normal completion",
            0x0001 => "Service was canceled",
            0x0101 => "Local node is not in the network",
            0x0105 => "Node address setting error",
            0x0201 => "Destination node is not in the network",
            0x0205 => "Response timeout",
            0x0401 => "Undefined command",
            0x1001 => "Command is too long",
            0x1002 => "Command is too short",
            0x1003 => "Number of elements does not match the data",
            0x1101 => "Area classification is missing",
            0x1103 => "Address range exceeded",
            0x1104 => "Address range exceeded at the end",
            0x2101 => "Area is read-only",
            0x2102 => "Area is protected",
            0x2201 => "Operation not possible in the current mode",
            _ => "Unknown FINS end code",
        };
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(codec: &FinsCodec, address: &str, operation: Operation, points: usize, payload: Option<&DataPayload>, session: &mut SessionContext) -> Vec<(CommandFrame, Vec<u8>)> {
        let spec = codec.resolve(address).unwrap();
        codec.encode_request(&spec, operation, points, payload, session).unwrap()
    }

    #[test]
    fn test_udp_read_layout() {
        let codec = FinsCodec::udp().with_local_node(0x22).with_remote_node(0x01);
        let mut session = codec.new_session();
        let frames = encode(&codec, "D100", Operation::Read, 10, None, &mut session);
        assert_eq!(
            frames[0].1,
            vec![0x80, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00, 0x22, 0x00, 0x01, 0x01, 0x01, 0x82, 0x00, 0x64, 0x00, 0x00, 0x0A]
        );
    }

    #[test]
    fn test_bit_in_word_request() {
        let codec = FinsCodec::udp();
        let mut session = codec.new_session();
        let frames = encode(&codec, "CIO100.5", Operation::Read, 3, None, &mut session);
        let bytes = &frames[0].1;
        assert_eq!(bytes[12], 0x30);
        assert_eq!(&bytes[13..16], &[0x00, 0x64, 0x05]);
    }

    #[test]
    fn test_tcp_handshake_both_sides() {
        let client = FinsCodec::tcp();
        let server = FinsCodec::tcp().with_local_node(10);

        let mut client_session = client.new_session();
        let hello = client.handshake_request(&client_session).unwrap();
        assert_eq!(&hello[..4], b"FINS");
        assert_eq!(BigEndian::read_u32(&hello[4..8]), 12);

        let mut server_session = server.new_session();
        assert_eq!(server.request_progress(&hello).unwrap(), FrameProgress::Complete(20));
        let reply = match server.decode_inbound(&hello, &mut server_session).unwrap() {
            Inbound::Handshake { reply } => reply,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(server_session.remote_node, 11);

        assert_eq!(client.handshake_progress(&reply).unwrap(), FrameProgress::Complete(24));
        client.accept_handshake(&reply, &mut client_session).unwrap();
        assert_eq!(client_session.local_node, 11);
        assert_eq!(client_session.remote_node, 10);
    }

    #[test]
    fn test_tcp_mirror_words() {
        let codec = FinsCodec::tcp();
        let mut session = SessionContext::new(11, 10);
        let payload = DataPayload::Bytes(vec![0x12, 0x34, 0x56, 0x78]);
        let frames = encode(&codec, "D200", Operation::Write, 2, Some(&payload), &mut session);
        let (request, bytes) = &frames[0];

        let mut server_session = SessionContext::new(10, 11);
        let command = match codec.decode_inbound(bytes, &mut server_session).unwrap() {
            Inbound::Command(command) => command,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(command.payload.as_ref(), Some(&payload));
        assert_eq!(command.sequence, request.sequence);

        let reply = codec.encode_reply(&command, 0, None, &server_session).unwrap();
        assert_eq!(reply[TCP_HEADER + 4], 11); // DA1 = client node
        assert_eq!(codec.response_progress(&reply, request).unwrap(), FrameProgress::Complete(reply.len()));
        assert_eq!(codec.decode_response(&reply, request, &session).unwrap().status, 0);
    }

    #[test]
    fn test_end_code_and_sid() {
        let codec = FinsCodec::udp();
        let mut session = codec.new_session();
        let frames = encode(&codec, "D0", Operation::Read, 1, None, &mut session);
        let request = &frames[0].0;
        let command = match codec.decode_inbound(&frames[0].1, &mut SessionContext::default()).unwrap() {
            Inbound::Command(command) => command,
            other => panic!("unexpected {:?}", other),
        };

        let reply = codec.encode_reply(&command, 0x1103, None, &session).unwrap();
        assert_eq!(codec.response_progress(&reply, request).unwrap(), FrameProgress::Complete(RESPONSE_HEADER));
        assert!(matches!(
            codec.decode_response(&reply, request, &session),
            Err(PlcError::ProtocolStatus { code: 0x1103, .. })
        ));

        let mut stale = request.clone();
        stale.sequence += 1;
        let reply = codec.encode_reply(&command, 0, Some(&DataPayload::Bytes(vec![0, 1])), &session).unwrap();
        assert!(matches!(codec.decode_response(&reply, &stale, &session), Err(PlcError::Frame { .. })));
    }
}
