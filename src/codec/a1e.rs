//! MELSEC A-compatible 1E frame (A1E), binary and ASCII
//!
//! Binary request, 12 bytes plus write data:
//!
//! ```text
//! subtitle(1) | PLC#(1) | watchdog(2 LE) | start(4 LE) | device code(2 LE) | points(1, 256 -> 0) | 0x00
//! ```
//!
//! The ASCII form carries subtitle, PLC#, watchdog, device code, start and
//! points as hex text (24 characters). Responses start with `subtitle | 0x80`
//! followed by a completion code; `0x5B` is followed by an abnormal code.

use byteorder::{ByteOrder as _, LittleEndian};

use crate::address::{DataMode, DeviceEntry, DeviceTable, NumericBase};
use crate::codec::{check_status, even, require_len, Encoding};
use crate::error::{PlcError, PlcResult};
use crate::framing::{self, FrameProgress};
use crate::protocol::{
    CommandFrame, DataPayload, FrameCodec, Inbound, Operation, PointCeilings, ResponseFrame, ServerFault,
    SessionContext,
};
use crate::utils::{ascii, bits, ByteOrder};

const ABNORMAL: u8 = 0x5B;
const MAX_POINTS: usize = 256;

/// A1E codec
#[derive(Debug, Clone)]
pub struct A1eCodec {
    encoding: Encoding,
    plc_number: u8,
    watchdog: u16,
    table: DeviceTable,
}

impl A1eCodec {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            plc_number: 0xFF,
            watchdog: 0x000A,
            table: Self::default_table(),
        }
    }

    pub fn binary() -> Self {
        Self::new(Encoding::Binary)
    }

    pub fn ascii() -> Self {
        Self::new(Encoding::Ascii)
    }

    pub fn with_plc_number(mut self, plc_number: u8) -> Self {
        self.plc_number = plc_number;
        self
    }

    /// Monitoring timer in 250 ms units
    pub fn with_watchdog(mut self, watchdog: u16) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// A-series device codes are the two ASCII letters of the device name
    pub fn default_table() -> DeviceTable {
        DeviceTable::new(vec![
            DeviceEntry::bit("X", 0x5820, NumericBase::Octal),
            DeviceEntry::bit("Y", 0x5920, NumericBase::Octal),
            DeviceEntry::bit("M", 0x4D20, NumericBase::Decimal),
            DeviceEntry::bit("S", 0x5320, NumericBase::Decimal),
            DeviceEntry::bit("F", 0x4620, NumericBase::Decimal),
            DeviceEntry::bit("B", 0x4220, NumericBase::Hex),
            DeviceEntry::bit("TS", 0x5453, NumericBase::Decimal),
            DeviceEntry::bit("CS", 0x4353, NumericBase::Decimal),
            DeviceEntry::word("TN", 0x544E, NumericBase::Decimal),
            DeviceEntry::word("CN", 0x434E, NumericBase::Decimal),
            DeviceEntry::word("D", 0x4420, NumericBase::Decimal),
            DeviceEntry::word("W", 0x5720, NumericBase::Hex),
            DeviceEntry::word("R", 0x5220, NumericBase::Decimal),
        ])
    }

    fn subtitle(operation: Operation, mode: DataMode) -> u8 {
        match (operation, mode) {
            (Operation::Read, DataMode::Bit) => 0x00,
            (Operation::Read, DataMode::Word) => 0x01,
            (Operation::Write, DataMode::Bit) => 0x02,
            (Operation::Write, DataMode::Word) => 0x03,
        }
    }

    fn from_subtitle(subtitle: u8) -> PlcResult<(Operation, DataMode)> {
        match subtitle {
            0x00 => Ok((Operation::Read, DataMode::Bit)),
            0x01 => Ok((Operation::Read, DataMode::Word)),
            0x02 => Ok((Operation::Write, DataMode::Bit)),
            0x03 => Ok((Operation::Write, DataMode::Word)),
            other => Err(PlcError::frame(format!("unsupported A1E subtitle 0x{:02X}", other))),
        }
    }

    fn request_header_len(&self) -> usize {
        match self.encoding {
            Encoding::Binary => 12,
            Encoding::Ascii => 24,
        }
    }

    fn reply_header_len(&self) -> usize {
        match self.encoding {
            Encoding::Binary => 2,
            Encoding::Ascii => 4,
        }
    }

    /// Bytes of data for `points` in the current encoding
    fn data_len(&self, mode: DataMode, points: usize) -> usize {
        match (self.encoding, mode) {
            (Encoding::Binary, DataMode::Word) => points * 2,
            (Encoding::Binary, DataMode::Bit) => (points + 1) / 2,
            (Encoding::Ascii, DataMode::Word) => points * 4,
            (Encoding::Ascii, DataMode::Bit) => even(points),
        }
    }

    fn encode_data(&self, payload: &DataPayload) -> PlcResult<Vec<u8>> {
        Ok(match (self.encoding, payload) {
            (Encoding::Binary, DataPayload::Bytes(bytes)) => bytes.clone(),
            (Encoding::Binary, DataPayload::Bits(values)) => bits::pack_nibbles(values),
            (Encoding::Ascii, DataPayload::Bytes(bytes)) => ascii::words_to_ascii(bytes, ByteOrder::LittleEndian)?,
            (Encoding::Ascii, DataPayload::Bits(values)) => {
                let mut text = ascii::bits_to_ascii(values);
                if text.len() % 2 == 1 {
                    text.push(b'0');
                }
                text
            }
        })
    }

    fn decode_data(&self, data: &[u8], mode: DataMode, points: usize) -> PlcResult<DataPayload> {
        let needed = self.data_len(mode, points);
        require_len(data, needed)?;
        Ok(match (self.encoding, mode) {
            (Encoding::Binary, DataMode::Word) => DataPayload::Bytes(data[..needed].to_vec()),
            (Encoding::Binary, DataMode::Bit) => DataPayload::Bits(bits::unpack_nibbles(&data[..needed], points)),
            (Encoding::Ascii, DataMode::Word) => {
                DataPayload::Bytes(ascii::ascii_to_words(&data[..needed], ByteOrder::LittleEndian)?)
            }
            (Encoding::Ascii, DataMode::Bit) => DataPayload::Bits(ascii::ascii_to_bits(&data[..points])?),
        })
    }

    /// Completion code and, after `0x5B`, the abnormal code
    fn reply_status(&self, header: &[u8]) -> PlcResult<(u8, Option<u8>)> {
        match self.encoding {
            Encoding::Binary => {
                let completion = header[1];
                let abnormal = if completion == ABNORMAL { header.get(2).copied() } else { None };
                Ok((completion, abnormal))
            }
            Encoding::Ascii => {
                let completion = ascii::ascii_hex_to_byte(&header[2..4])?;
                let abnormal = match (completion, header.get(4..6)) {
                    (ABNORMAL, Some(text)) => Some(ascii::ascii_hex_to_byte(text)?),
                    _ => None,
                };
                Ok((completion, abnormal))
            }
        }
    }

    fn reply_subheader(&self, raw: &[u8]) -> PlcResult<u8> {
        match self.encoding {
            Encoding::Binary => Ok(raw[0]),
            Encoding::Ascii => ascii::ascii_hex_to_byte(&raw[0..2]),
        }
    }

    fn points_field(points: usize) -> PlcResult<u8> {
        if points == 0 || points > MAX_POINTS {
            return Err(PlcError::length_exceeded(points, MAX_POINTS));
        }
        Ok((points % 256) as u8)
    }
}

impl Default for A1eCodec {
    fn default() -> Self {
        Self::binary()
    }
}

impl FrameCodec for A1eCodec {
    fn name(&self) -> &'static str {
        match self.encoding {
            Encoding::Binary => "A1E",
            Encoding::Ascii => "A1E-ASCII",
        }
    }

    fn device_table(&self) -> &DeviceTable {
        &self.table
    }

    fn ceilings(&self) -> PointCeilings {
        PointCeilings::uniform(MAX_POINTS)
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::LittleEndian
    }

    fn station(&self) -> u8 {
        self.plc_number
    }

    fn is_text(&self) -> bool {
        self.encoding == Encoding::Ascii
    }

    fn encode_command(&self, frame: &CommandFrame, _session: &SessionContext) -> PlcResult<Vec<u8>> {
        let subtitle = Self::subtitle(frame.operation, frame.mode);
        let points = Self::points_field(frame.points)?;
        let data = match (frame.operation, &frame.payload) {
            (Operation::Write, Some(payload)) => self.encode_data(payload)?,
            (Operation::Write, None) => return Err(PlcError::invalid_data("write frame without payload")),
            (Operation::Read, _) => Vec::new(),
        };

        let mut out = Vec::with_capacity(self.request_header_len() + data.len());
        match self.encoding {
            Encoding::Binary => {
                let mut header = [0u8; 12];
                header[0] = subtitle;
                header[1] = frame.station;
                LittleEndian::write_u16(&mut header[2..4], self.watchdog);
                LittleEndian::write_u32(&mut header[4..8], frame.start);
                LittleEndian::write_u16(&mut header[8..10], frame.device_code);
                header[10] = points;
                out.extend_from_slice(&header);
            }
            Encoding::Ascii => {
                out.extend_from_slice(&ascii::hex_field(subtitle as u32, 2));
                out.extend_from_slice(&ascii::hex_field(frame.station as u32, 2));
                out.extend_from_slice(&ascii::hex_field(self.watchdog as u32, 4));
                out.extend_from_slice(&ascii::hex_field(frame.device_code as u32, 4));
                out.extend_from_slice(&ascii::hex_field(frame.start, 8));
                out.extend_from_slice(&ascii::hex_field(points as u32, 2));
                out.extend_from_slice(b"00");
            }
        }
        out.extend_from_slice(&data);
        Ok(out)
    }

    fn response_progress(&self, buf: &[u8], request: &CommandFrame) -> PlcResult<FrameProgress> {
        let header_len = self.reply_header_len();
        if buf.len() < header_len {
            return Ok(FrameProgress::NeedMore(header_len - buf.len()));
        }
        let (completion, _) = self.reply_status(buf)?;
        let total = match completion {
            0 if request.operation == Operation::Read => header_len + self.data_len(request.mode, request.points),
            0 => header_len,
            ABNORMAL => header_len + header_len / 2,
            _ => header_len,
        };
        framing::by_length(buf, header_len, |_| Ok(total))
    }

    fn decode_response(&self, raw: &[u8], request: &CommandFrame, _session: &SessionContext) -> PlcResult<ResponseFrame> {
        let header_len = self.reply_header_len();
        require_len(raw, header_len)?;

        let expected = Self::subtitle(request.operation, request.mode) | 0x80;
        let subheader = self.reply_subheader(raw)?;
        if subheader != expected {
            return Err(PlcError::frame(format!(
                "A1E subheader 0x{:02X}, expected 0x{:02X}",
                subheader, expected
            )));
        }

        let (completion, abnormal) = self.reply_status(raw)?;
        let status = match (completion, abnormal) {
            (ABNORMAL, Some(code)) => 0x5B00 | code as u16,
            (ABNORMAL, None) => return Err(PlcError::short_response(header_len + header_len / 2, raw.len())),
            (code, _) => code as u16,
        };
        check_status(self, status)?;

        let payload = match request.operation {
            Operation::Read => Some(self.decode_data(&raw[header_len..], request.mode, request.points)?),
            Operation::Write => None,
        };
        Ok(ResponseFrame {
            status,
            payload,
            raw_len: raw.len(),
        })
    }

    fn request_progress(&self, buf: &[u8]) -> PlcResult<FrameProgress> {
        let header_len = self.request_header_len();
        framing::by_length(buf, header_len, |header| {
            let (subtitle, points) = match self.encoding {
                Encoding::Binary => (header[0], header[10]),
                Encoding::Ascii => (
                    ascii::ascii_hex_to_byte(&header[0..2])?,
                    ascii::ascii_hex_to_byte(&header[20..22])?,
                ),
            };
            let (operation, mode) = Self::from_subtitle(subtitle)?;
            let points = if points == 0 { MAX_POINTS } else { points as usize };
            Ok(match operation {
                Operation::Read => header_len,
                Operation::Write => header_len + self.data_len(mode, points),
            })
        })
    }

    fn decode_inbound(&self, raw: &[u8], _session: &mut SessionContext) -> PlcResult<Inbound> {
        let header_len = self.request_header_len();
        require_len(raw, header_len)?;

        let (subtitle, station, start, device_code, points) = match self.encoding {
            Encoding::Binary => (
                raw[0],
                raw[1],
                LittleEndian::read_u32(&raw[4..8]),
                LittleEndian::read_u16(&raw[8..10]),
                raw[10],
            ),
            Encoding::Ascii => (
                ascii::ascii_hex_to_byte(&raw[0..2])?,
                ascii::ascii_hex_to_byte(&raw[2..4])?,
                ascii::parse_hex_field(&raw[12..20])?,
                ascii::parse_hex_field(&raw[8..12])? as u16,
                ascii::ascii_hex_to_byte(&raw[20..22])?,
            ),
        };
        let (operation, mode) = Self::from_subtitle(subtitle)?;
        let points = if points == 0 { MAX_POINTS } else { points as usize };

        let payload = match operation {
            Operation::Write => Some(self.decode_data(&raw[header_len..], mode, points)?),
            Operation::Read => None,
        };

        Ok(Inbound::Command(CommandFrame {
            operation,
            mode,
            station,
            network: 0,
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
        let subheader = Self::subtitle(request.operation, request.mode) | 0x80;
        let mut codes = vec![subheader];
        if status > 0xFF {
            codes.push(ABNORMAL);
            codes.push((status & 0xFF) as u8);
        } else {
            codes.push(status as u8);
        }

        let mut out = match self.encoding {
            Encoding::Binary => codes,
            Encoding::Ascii => codes.iter().flat_map(|&b| ascii::byte_to_ascii_hex(b)).collect(),
        };
        if status == 0 {
            if let Some(data) = payload {
                out.extend_from_slice(&self.encode_data(data)?);
            }
        }
        Ok(out)
    }

    fn fault_status(&self, fault: ServerFault) -> u16 {
        match fault {
            ServerFault::OutOfRange => 0x58,
            ServerFault::UnsupportedDevice => 0x56,
            ServerFault::WriteDisabled => 0x55,
        }
    }

    fn describe_status(&self, code: u16) -> String {
        let text = match code {
            0x00 => "Normal completion",
            0x50 => "Command or response type code is invalid",
            0x51 => "Network or PC number is invalid",
            0x54 => "ASCII text could not be converted to binary",
            0x55 => "Writing is not permitted while the CPU is running",
            0x56 => "Device specification is invalid",
            0x57 => "Point count or data length is invalid",
            0x58 => "Start address or point range is out of bounds",
            0x60 => "Communication with the CPU timed out",
            c if c >> 8 == ABNORMAL as u16 => "Abnormal completion reported by the CPU",
            _ => "Unknown A1E completion code",
        };
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_frame(codec: &A1eCodec, address: &str, points: usize) -> (CommandFrame, Vec<u8>) {
        let spec = codec.resolve(address).unwrap();
        let mut session = SessionContext::default();
        let mut frames = codec.encode_request(&spec, Operation::Read, points, None, &mut session).unwrap();
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    #[test]
    fn test_binary_read_words_layout() {
        let codec = A1eCodec::binary();
        let (_, bytes) = read_frame(&codec, "D100", 10);
        assert_eq!(
            bytes,
            vec![0x01, 0xFF, 0x0A, 0x00, 0x64, 0x00, 0x00, 0x00, 0x20, 0x44, 0x0A, 0x00]
        );
    }

    #[test]
    fn test_ascii_read_words_layout() {
        let codec = A1eCodec::ascii();
        let (_, bytes) = read_frame(&codec, "D100", 10);
        assert_eq!(bytes, b"01FF000A4420000000640A00".to_vec());
        assert_eq!(bytes.len(), 24);
    }

    #[test]
    fn test_binary_response_decode() {
        let codec = A1eCodec::binary();
        let (frame, _) = read_frame(&codec, "D100", 2);
        let raw = [0x81, 0x00, 0x34, 0x12, 0x78, 0x56];
        assert_eq!(codec.response_progress(&raw[..3], &frame).unwrap(), FrameProgress::NeedMore(3));
        assert_eq!(codec.response_progress(&raw, &frame).unwrap(), FrameProgress::Complete(6));

        let response = codec.decode_response(&raw, &frame, &SessionContext::default()).unwrap();
        assert_eq!(response.payload, Some(DataPayload::Bytes(vec![0x34, 0x12, 0x78, 0x56])));
    }

    #[test]
    fn test_abnormal_completion() {
        let codec = A1eCodec::binary();
        let (frame, _) = read_frame(&codec, "D100", 2);
        let raw = [0x81, 0x5B, 0x10];
        assert_eq!(codec.response_progress(&raw, &frame).unwrap(), FrameProgress::Complete(3));
        match codec.decode_response(&raw, &frame, &SessionContext::default()) {
            Err(PlcError::ProtocolStatus { code, .. }) => assert_eq!(code, 0x5B10),
            other => panic!("unexpected {:?}", other),
        }

        let raw = [0x81, 0x58];
        assert_eq!(codec.response_progress(&raw, &frame).unwrap(), FrameProgress::Complete(2));
        assert!(matches!(
            codec.decode_response(&raw, &frame, &SessionContext::default()),
            Err(PlcError::ProtocolStatus { code: 0x58, .. })
        ));
    }

    #[test]
    fn test_bit_split_and_points_field() {
        let codec = A1eCodec::binary();
        let spec = codec.resolve("M0").unwrap();
        let mut session = SessionContext::default();
        let frames = codec.encode_request(&spec, Operation::Read, 300, None, &mut session).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1[10], 0x00); // 256 points
        assert_eq!(frames[1].1[10], 44);
        assert_eq!(LittleEndian::read_u32(&frames[1].1[4..8]), 256);
    }

    #[test]
    fn test_server_mirror_write_bits() {
        for codec in [A1eCodec::binary(), A1eCodec::ascii()] {
            let spec = codec.resolve("Y17").unwrap();
            assert_eq!(spec.start, 0o17);
            let values = vec![true, false, true];
            let payload = DataPayload::Bits(values.clone());
            let mut session = SessionContext::default();
            let (frame, bytes) = codec
                .encode_request(&spec, Operation::Write, 3, Some(&payload), &mut session)
                .unwrap()
                .remove(0);

            assert_eq!(codec.request_progress(&bytes).unwrap(), FrameProgress::Complete(bytes.len()));
            let inbound = codec.decode_inbound(&bytes, &mut session).unwrap();
            match inbound {
                Inbound::Command(command) => {
                    assert_eq!(command.payload, Some(payload.clone()));
                    assert_eq!(command.start, 15);
                    assert_eq!(command.device_code, 0x5920);
                }
                other => panic!("unexpected {:?}", other),
            }

            let reply = codec.encode_reply(&frame, 0, None, &session).unwrap();
            let response = codec.decode_response(&reply, &frame, &session).unwrap();
            assert_eq!(response.status, 0);
        }
    }

    #[test]
    fn test_ascii_read_bits_reply() {
        let codec = A1eCodec::ascii();
        let (frame, _) = read_frame(&codec, "M10", 3);
        let reply = codec
            .encode_reply(&frame, 0, Some(&DataPayload::Bits(vec![true, true, false])), &SessionContext::default())
            .unwrap();
        assert_eq!(reply, b"80001100".to_vec());
        assert_eq!(codec.response_progress(&reply, &frame).unwrap(), FrameProgress::Complete(8));
        let response = codec.decode_response(&reply, &frame, &SessionContext::default()).unwrap();
        assert_eq!(response.payload, Some(DataPayload::Bits(vec![true, true, false])));
    }
}
