//! MELSEC serial communication, 3C frame format 1 (A3C)
//!
//! ```text
//! request   ENQ station net PC self command sub device address points [data] sum
//! read ok   STX station net PC self data ETX sum
//! write ok  ACK station net PC self
//! error     NAK station net PC self code
//! ```
//!
//! Every field is hex text. The sum check is the additive checksum of the
//! characters after the leading control byte (through `ETX` for data replies).

use crate::address::{DataMode, DeviceEntry, DeviceTable, NumericBase};
use crate::checksum::ChecksumKind;
use crate::codec::{check_status, require_len, McCodec};
use crate::error::{PlcError, PlcResult};
use crate::framing::{self, FrameProgress};
use crate::protocol::{
    CommandFrame, DataPayload, FrameCodec, Inbound, Operation, PointCeilings, ResponseFrame, ServerFault,
    SessionContext,
};
use crate::utils::{ascii, ByteOrder};

const ENQ: u8 = 0x05;
const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

const REQUEST_HEADER: usize = 29;
const ROUTE_END: usize = 9;
const NAK_LEN: usize = 13;
const UNKNOWN_DEVICE: u16 = 0xFFFF;

/// A3C format 1 codec
#[derive(Debug, Clone)]
pub struct A3cCodec {
    station: u8,
    network: u8,
    pc: u8,
    self_station: u8,
    table: DeviceTable,
}

impl Default for A3cCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl A3cCodec {
    pub fn new(station: u8) -> Self {
        Self {
            station,
            network: 0,
            pc: 0xFF,
            self_station: 0,
            table: McCodec::default_table(),
        }
    }

    pub fn with_network(mut self, network: u8) -> Self {
        self.network = network;
        self
    }

    fn entry_for_code(&self, code: u16) -> PlcResult<&DeviceEntry> {
        self.table
            .by_code(code)
            .map(|(entry, _)| entry)
            .ok_or_else(|| PlcError::unsupported_device(format!("0x{:02X}", code)))
    }

    fn entry_for_name(&self, name: &[u8]) -> Option<&DeviceEntry> {
        let trimmed: Vec<u8> = name.iter().copied().filter(|&c| c != b'*').collect();
        self.table
            .entries()
            .iter()
            .find(|entry| entry.prefix.as_bytes().eq_ignore_ascii_case(&trimmed))
    }

    fn data_len(mode: DataMode, points: usize) -> usize {
        match mode {
            DataMode::Word => points * 4,
            DataMode::Bit => points,
        }
    }

    fn encode_data(payload: &DataPayload) -> PlcResult<Vec<u8>> {
        match payload {
            DataPayload::Bytes(bytes) => ascii::words_to_ascii(bytes, ByteOrder::LittleEndian),
            DataPayload::Bits(values) => Ok(ascii::bits_to_ascii(values)),
        }
    }

    fn decode_data(data: &[u8], mode: DataMode, points: usize) -> PlcResult<DataPayload> {
        let needed = Self::data_len(mode, points);
        if data.len() != needed {
            return Err(PlcError::frame(format!("{} data characters, {} points need {}", data.len(), points, needed)));
        }
        Ok(match mode {
            DataMode::Word => DataPayload::Bytes(ascii::ascii_to_words(data, ByteOrder::LittleEndian)?),
            DataMode::Bit => DataPayload::Bits(ascii::ascii_to_bits(data)?),
        })
    }

    /// station, network, PC, self-station as 8 hex characters
    fn route(&self, station: u8, network: u8) -> Vec<u8> {
        [station, network, self.pc, self.self_station]
            .iter()
            .flat_map(|&b| ascii::byte_to_ascii_hex(b))
            .collect()
    }

    fn check_station(&self, raw: &[u8], expected: u8) -> PlcResult<()> {
        let actual = ascii::ascii_hex_to_byte(&raw[1..3])?;
        if actual != expected {
            return Err(PlcError::station_mismatch(expected, actual));
        }
        Ok(())
    }
}

impl FrameCodec for A3cCodec {
    fn name(&self) -> &'static str {
        "A3C"
    }

    fn device_table(&self) -> &DeviceTable {
        &self.table
    }

    /// Format 1 limits one frame to 64 words or 256 bits
    fn ceilings(&self) -> PointCeilings {
        PointCeilings {
            read_words: 64,
            read_bits: 256,
            write_words: 64,
            write_bits: 256,
            split_writes: true,
        }
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::LittleEndian
    }

    fn station(&self) -> u8 {
        self.station
    }

    fn network(&self) -> u8 {
        self.network
    }

    fn is_text(&self) -> bool {
        true
    }

    fn encode_command(&self, frame: &CommandFrame, _session: &SessionContext) -> PlcResult<Vec<u8>> {
        let entry = self.entry_for_code(frame.device_code)?;
        let (command, data) = match (frame.operation, &frame.payload) {
            (Operation::Read, _) => ("0401", Vec::new()),
            (Operation::Write, Some(payload)) => ("1401", Self::encode_data(payload)?),
            (Operation::Write, None) => return Err(PlcError::invalid_data("write frame without payload")),
        };
        let subcommand = match frame.mode {
            DataMode::Word => "0000",
            DataMode::Bit => "0001",
        };

        let mut out = Vec::with_capacity(REQUEST_HEADER + data.len() + 2);
        out.push(ENQ);
        out.extend_from_slice(&self.route(frame.station, frame.network));
        out.extend_from_slice(command.as_bytes());
        out.extend_from_slice(subcommand.as_bytes());
        let mut name = entry.prefix.as_bytes().to_vec();
        name.resize(2, b'*');
        out.extend_from_slice(&name);
        let start = match entry.base {
            NumericBase::Hex => ascii::checked_hex_field(frame.start, 6, "start")?,
            _ => ascii::checked_dec_field(frame.start, 6, "start")?,
        };
        out.extend_from_slice(&start);
        out.extend_from_slice(&ascii::checked_hex_field(frame.points as u32, 4, "point count")?);
        out.extend_from_slice(&data);
        ChecksumKind::Sum8.append(&mut out, 1);
        Ok(out)
    }

    fn response_progress(&self, buf: &[u8], _request: &CommandFrame) -> PlcResult<FrameProgress> {
        if let Some(garbage) = framing::garbage_before(buf, &[STX, ACK, NAK]) {
            return Ok(FrameProgress::Discard(garbage));
        }
        match buf[0] {
            ACK => framing::by_length(buf, ROUTE_END, |_| Ok(ROUTE_END)),
            NAK => framing::by_length(buf, NAK_LEN, |_| Ok(NAK_LEN)),
            _ => Ok(match framing::find_terminator(buf, 1, &[ETX]) {
                Some(end) if buf.len() >= end + 2 => FrameProgress::Complete(end + 2),
                Some(end) => FrameProgress::NeedMore(end + 2 - buf.len()),
                None => FrameProgress::NeedMore(1),
            }),
        }
    }

    fn decode_response(&self, raw: &[u8], request: &CommandFrame, _session: &SessionContext) -> PlcResult<ResponseFrame> {
        require_len(raw, ROUTE_END)?;
        self.check_station(raw, request.station)?;

        match raw[0] {
            NAK => {
                require_len(raw, NAK_LEN)?;
                let code = ascii::parse_hex_field(&raw[9..13])? as u16;
                check_status(self, code)?;
                Err(PlcError::frame("NAK reply without an error code"))
            }
            ACK if request.operation == Operation::Write => Ok(ResponseFrame {
                status: 0,
                payload: None,
                raw_len: raw.len(),
            }),
            STX if request.operation == Operation::Read => {
                let etx = raw.len().checked_sub(3).filter(|&i| i >= ROUTE_END && raw[i] == ETX).ok_or_else(|| {
                    PlcError::frame("STX reply is not terminated by ETX and a sum check")
                })?;
                ChecksumKind::Sum8.check(raw, 1..etx + 1, etx + 1)?;
                let payload = Self::decode_data(&raw[ROUTE_END..etx], request.mode, request.points)?;
                Ok(ResponseFrame {
                    status: 0,
                    payload: Some(payload),
                    raw_len: raw.len(),
                })
            }
            other => Err(PlcError::frame(format!(
                "unexpected control byte 0x{:02X} for a {} reply",
                other, request.operation
            ))),
        }
    }

    fn request_progress(&self, buf: &[u8]) -> PlcResult<FrameProgress> {
        if let Some(garbage) = framing::garbage_before(buf, &[ENQ]) {
            return Ok(FrameProgress::Discard(garbage));
        }
        framing::by_length(buf, REQUEST_HEADER, |header| {
            let mode = match &header[13..17] {
                b"0000" => DataMode::Word,
                _ => DataMode::Bit,
            };
            let points = ascii::parse_hex_field(&header[25..29])? as usize;
            let data = match &header[9..13] {
                b"1401" => Self::data_len(mode, points),
                _ => 0,
            };
            Ok(REQUEST_HEADER + data + 2)
        })
    }

    fn decode_inbound(&self, raw: &[u8], _session: &mut SessionContext) -> PlcResult<Inbound> {
        require_len(raw, REQUEST_HEADER + 2)?;
        if raw[0] != ENQ {
            return Err(PlcError::frame(format!("request starts with 0x{:02X}, expected ENQ", raw[0])));
        }
        let sum_at = raw.len() - 2;
        ChecksumKind::Sum8.check(raw, 1..sum_at, sum_at)?;
        self.check_station(raw, self.station)?;

        let station = ascii::ascii_hex_to_byte(&raw[1..3])?;
        let network = ascii::ascii_hex_to_byte(&raw[3..5])?;
        let operation = match &raw[9..13] {
            b"0401" => Operation::Read,
            b"1401" => Operation::Write,
            other => {
                return Err(PlcError::frame(format!(
                    "unsupported command {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        let mode = match &raw[13..17] {
            b"0000" => DataMode::Word,
            b"0001" => DataMode::Bit,
            other => {
                return Err(PlcError::frame(format!(
                    "unsupported subcommand {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        let (device_code, base) = self
            .entry_for_name(&raw[17..19])
            .map_or((UNKNOWN_DEVICE, NumericBase::Hex), |entry| (entry.code, entry.base));
        let start = match base {
            NumericBase::Hex => ascii::parse_hex_field(&raw[19..25])?,
            _ => ascii::parse_dec_field(&raw[19..25])?,
        };
        let points = ascii::parse_hex_field(&raw[25..29])? as usize;
        let payload = match operation {
            Operation::Write => Some(Self::decode_data(&raw[REQUEST_HEADER..sum_at], mode, points)?),
            Operation::Read => None,
        };

        Ok(Inbound::Command(CommandFrame {
            operation,
            mode,
            station,
            network,
            device_code,
            start,
            bit: None,
            points,
            payload,
            sequence: 0,
            route: Vec::new(),
        }))
    }

    fn encode_reply(
        &self,
        request: &CommandFrame,
        status: u16,
        payload: Option<&DataPayload>,
        _session: &SessionContext,
    ) -> PlcResult<Vec<u8>> {
        let route = self.route(request.station, request.network);
        let mut out = Vec::new();
        if status != 0 {
            out.push(NAK);
            out.extend_from_slice(&route);
            out.extend_from_slice(&ascii::hex_field(status as u32, 4));
            return Ok(out);
        }
        match (request.operation, payload) {
            (Operation::Read, Some(data)) => {
                out.push(STX);
                out.extend_from_slice(&route);
                out.extend_from_slice(&Self::encode_data(data)?);
                out.push(ETX);
                ChecksumKind::Sum8.append(&mut out, 1);
            }
            (Operation::Read, None) => return Err(PlcError::internal("read reply without data")),
            (Operation::Write, _) => {
                out.push(ACK);
                out.extend_from_slice(&route);
            }
        }
        Ok(out)
    }

    fn fault_status(&self, fault: ServerFault) -> u16 {
        match fault {
            ServerFault::OutOfRange => 0x7142,
            ServerFault::UnsupportedDevice => 0x7140,
            ServerFault::WriteDisabled => 0x7144,
        }
    }

    fn describe_status(&self, code: u16) -> String {
        let text = match code {
            0x0000 => "Normal completion",
            0x7140 => "Device name or command is invalid",
            0x7142 => "Device address or point count is out of range",
            0x7144 => "Writing is not permitted for the device",
            0x7151 => "Command cannot be executed in the current CPU state",
            0x7153 => "Sum check error detected by the PLC",
            0x7155 => "Frame length error detected by the PLC",
            _ => "Unknown 3C error code",
        };
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(codec: &A3cCodec, address: &str, operation: Operation, points: usize, payload: Option<&DataPayload>) -> Vec<(CommandFrame, Vec<u8>)> {
        let spec = codec.resolve(address).unwrap();
        codec
            .encode_request(&spec, operation, points, payload, &mut SessionContext::default())
            .unwrap()
    }

    #[test]
    fn test_read_request_layout() {
        let codec = A3cCodec::new(0);
        let encoded = frames(&codec, "D100", Operation::Read, 2, None);
        let bytes = &encoded[0].1;
        assert_eq!(bytes[0], ENQ);
        assert_eq!(&bytes[1..bytes.len() - 2], b"0000FF0004010000D*0001000002");
        assert!(ChecksumKind::Sum8.verify(bytes, 1..bytes.len() - 2, bytes.len() - 2));
    }

    #[test]
    fn test_split_at_64_words() {
        let codec = A3cCodec::new(0);
        let encoded = frames(&codec, "D0", Operation::Read, 130, None);
        assert_eq!(encoded.iter().map(|(f, _)| f.points).collect::<Vec<_>>(), vec![64, 64, 2]);
    }

    #[test]
    fn test_start_field_holds_six_digits() {
        let codec = A3cCodec::new(0);
        let encoded = frames(&codec, "D999999", Operation::Read, 1, None);
        let bytes = &encoded[0].1;
        assert_eq!(&bytes[1..bytes.len() - 2], b"0000FF0004010000D*9999990001");

        assert!(codec.resolve("D1000000").is_err());
        let frame = CommandFrame::read(DataMode::Word, 0xA8, 1_000_000, 1);
        assert!(matches!(
            codec.encode_command(&frame, &SessionContext::default()),
            Err(PlcError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_garbled_prefix_is_discarded() {
        let codec = A3cCodec::new(0);
        let encoded = frames(&codec, "D100", Operation::Read, 1, None);
        let request = &encoded[0].0;
        let reply = codec
            .encode_reply(request, 0, Some(&DataPayload::Bytes(vec![0x34, 0x12])), &SessionContext::default())
            .unwrap();

        let mut noisy = vec![0xFF, b'x'];
        noisy.extend_from_slice(&reply);
        assert_eq!(codec.response_progress(&noisy, request).unwrap(), FrameProgress::Discard(2));
        assert_eq!(codec.response_progress(&reply, request).unwrap(), FrameProgress::Complete(reply.len()));
        assert_eq!(
            codec.response_progress(&reply[..reply.len() - 1], request).unwrap(),
            FrameProgress::NeedMore(1)
        );

        let response = codec.decode_response(&reply, request, &SessionContext::default()).unwrap();
        assert_eq!(response.payload, Some(DataPayload::Bytes(vec![0x34, 0x12])));
    }

    #[test]
    fn test_sum_check_failure() {
        let codec = A3cCodec::new(0);
        let encoded = frames(&codec, "D100", Operation::Read, 1, None);
        let request = &encoded[0].0;
        let mut reply = codec
            .encode_reply(request, 0, Some(&DataPayload::Bytes(vec![0x34, 0x12])), &SessionContext::default())
            .unwrap();
        reply[10] ^= 0x01;
        assert!(matches!(
            codec.decode_response(&reply, request, &SessionContext::default()),
            Err(PlcError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_nak_reply() {
        let codec = A3cCodec::new(0);
        let encoded = frames(&codec, "D100", Operation::Read, 1, None);
        let request = &encoded[0].0;
        let reply = codec.encode_reply(request, 0x7142, None, &SessionContext::default()).unwrap();
        assert_eq!(reply.len(), NAK_LEN);
        assert_eq!(codec.response_progress(&reply, request).unwrap(), FrameProgress::Complete(NAK_LEN));
        assert!(matches!(
            codec.decode_response(&reply, request, &SessionContext::default()),
            Err(PlcError::ProtocolStatus { code: 0x7142, .. })
        ));
    }

    #[test]
    fn test_inbound_station_check() {
        let server = A3cCodec::new(1);
        let client = A3cCodec::new(2);
        let values = DataPayload::Bits(vec![true, false]);
        let encoded = frames(&client, "M0", Operation::Write, 2, Some(&values));
        let bytes = &encoded[0].1;
        assert_eq!(server.request_progress(bytes).unwrap(), FrameProgress::Complete(bytes.len()));
        assert_eq!(
            server.decode_inbound(bytes, &mut SessionContext::default()).unwrap_err(),
            PlcError::station_mismatch(1, 2)
        );

        let matching = A3cCodec::new(2);
        match matching.decode_inbound(bytes, &mut SessionContext::default()).unwrap() {
            Inbound::Command(command) => assert_eq!(command.payload, Some(values)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
