//! Omron HostLink (C-mode) over serial lines
//!
//! ```text
//! read    @ unit R<area> address(4) count(4) FCS * CR
//! write   @ unit W<area> address(4) data(4 hex per word) FCS * CR
//! reply   @ unit <header> end-code(2) [data] FCS * CR
//! ```
//!
//! The FCS is the XOR of every character from `@` up to the FCS itself.
//! HostLink only moves words; a single frame carries at most 30 of them.

use crate::address::{DataMode, DeviceEntry, DeviceTable, NumericBase};
use crate::checksum::ChecksumKind;
use crate::codec::{check_status, require_len};
use crate::error::{PlcError, PlcResult};
use crate::framing::{self, FrameProgress};
use crate::protocol::{
    CommandFrame, DataPayload, FrameCodec, Inbound, Operation, PointCeilings, ResponseFrame, ServerFault,
    SessionContext,
};
use crate::utils::{ascii, ByteOrder};

const START: u8 = b'@';
const TERMINATOR: &[u8; 2] = b"*\r";
const MAX_WORDS: usize = 30;
/// Highest unit number on a HostLink multidrop line
const MAX_UNIT: u8 = 31;
/// `@` unit(2) header(2) end-code(2) FCS(2) `*` CR
const MIN_REPLY: usize = 11;
/// `@` unit(2) header(2) address(4)
const REQUEST_HEAD: usize = 9;

/// HostLink codec
#[derive(Debug, Clone)]
pub struct HostLinkCodec {
    unit: u8,
    table: DeviceTable,
}

impl Default for HostLinkCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl HostLinkCodec {
    /// Codec talking to (or serving as) unit `unit`, 0..=31
    pub fn new(unit: u8) -> Self {
        Self {
            unit,
            table: Self::default_table(),
        }
    }

    /// Memory areas keyed by the second header character
    pub fn default_table() -> DeviceTable {
        let area = |prefix: &str, letter: u8| {
            DeviceEntry::word(prefix, letter as u16, NumericBase::Decimal).with_max_address(9999)
        };
        DeviceTable::new(vec![
            area("DM", b'D'),
            area("D", b'D'),
            area("CIO", b'R'),
            area("IR", b'R'),
            area("HR", b'H'),
            area("H", b'H'),
            area("LR", b'L'),
            area("AR", b'J'),
        ])
    }

    fn header(operation: Operation, device_code: u16) -> PlcResult<[u8; 2]> {
        let letter = u8::try_from(device_code)
            .ok()
            .filter(u8::is_ascii_uppercase)
            .ok_or_else(|| PlcError::unsupported_device(format!("0x{:04X}", device_code)))?;
        Ok(match operation {
            Operation::Read => [b'R', letter],
            Operation::Write => [b'W', letter],
        })
    }

    fn finish(mut out: Vec<u8>) -> Vec<u8> {
        ChecksumKind::Xor8.append(&mut out, 0);
        out.extend_from_slice(TERMINATOR);
        out
    }

    /// Validate terminator and FCS, returning the body before the FCS
    fn body<'a>(raw: &'a [u8]) -> PlcResult<&'a [u8]> {
        require_len(raw, MIN_REPLY)?;
        let fcs_at = raw.len() - 4;
        if &raw[raw.len() - 2..] != TERMINATOR {
            return Err(PlcError::frame("HostLink frame is not terminated by '*' CR"));
        }
        if raw[0] != START {
            return Err(PlcError::frame(format!("HostLink frame starts with 0x{:02X}", raw[0])));
        }
        ChecksumKind::Xor8.check(raw, 0..fcs_at, fcs_at)?;
        Ok(&raw[..fcs_at])
    }

    fn unit_of(body: &[u8]) -> PlcResult<u8> {
        Ok(ascii::parse_dec_field(&body[1..3])? as u8)
    }

    fn progress(buf: &[u8]) -> PlcResult<FrameProgress> {
        if let Some(garbage) = framing::garbage_before(buf, &[START]) {
            return Ok(FrameProgress::Discard(garbage));
        }
        Ok(match framing::find_terminator(buf, 1, TERMINATOR) {
            Some(end) => FrameProgress::Complete(end),
            None => FrameProgress::NeedMore(1),
        })
    }
}

impl FrameCodec for HostLinkCodec {
    fn name(&self) -> &'static str {
        "HostLink"
    }

    fn device_table(&self) -> &DeviceTable {
        &self.table
    }

    /// Reads split at 30 words; writes must fit a single frame
    fn ceilings(&self) -> PointCeilings {
        PointCeilings {
            read_words: MAX_WORDS,
            read_bits: MAX_WORDS,
            write_words: MAX_WORDS,
            write_bits: MAX_WORDS,
            split_writes: false,
        }
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::BigEndian
    }

    fn station(&self) -> u8 {
        self.unit
    }

    fn is_text(&self) -> bool {
        true
    }

    fn encode_command(&self, frame: &CommandFrame, _session: &SessionContext) -> PlcResult<Vec<u8>> {
        if frame.mode != DataMode::Word {
            return Err(PlcError::invalid_data("HostLink only transfers words"));
        }
        if frame.station > MAX_UNIT {
            return Err(PlcError::invalid_data(format!(
                "HostLink unit {} is above {}",
                frame.station, MAX_UNIT
            )));
        }
        if frame.start > 9999 || frame.points > 9999 {
            return Err(PlcError::invalid_data(format!(
                "HostLink fields hold four digits (start {}, count {})",
                frame.start, frame.points
            )));
        }
        let mut out = Vec::with_capacity(REQUEST_HEAD + 8 + frame.points * 4);
        out.push(START);
        out.extend_from_slice(&ascii::dec_field(frame.station as u32, 2));
        out.extend_from_slice(&Self::header(frame.operation, frame.device_code)?);
        out.extend_from_slice(&ascii::dec_field(frame.start, 4));
        match (frame.operation, &frame.payload) {
            (Operation::Read, _) => out.extend_from_slice(&ascii::dec_field(frame.points as u32, 4)),
            (Operation::Write, Some(DataPayload::Bytes(bytes))) => {
                out.extend_from_slice(&ascii::words_to_ascii(bytes, ByteOrder::BigEndian)?)
            }
            (Operation::Write, _) => return Err(PlcError::invalid_data("write frame without word payload")),
        }
        Ok(Self::finish(out))
    }

    fn response_progress(&self, buf: &[u8], _request: &CommandFrame) -> PlcResult<FrameProgress> {
        Self::progress(buf)
    }

    fn decode_response(&self, raw: &[u8], request: &CommandFrame, _session: &SessionContext) -> PlcResult<ResponseFrame> {
        let body = Self::body(raw)?;
        let unit = Self::unit_of(body)?;
        if unit != request.station {
            return Err(PlcError::station_mismatch(request.station, unit));
        }
        let header = Self::header(request.operation, request.device_code)?;
        if body[3..5] != header {
            return Err(PlcError::frame(format!(
                "reply header {} does not answer {}",
                String::from_utf8_lossy(&body[3..5]),
                String::from_utf8_lossy(&header)
            )));
        }

        let status = ascii::ascii_hex_to_byte(&body[5..7])? as u16;
        check_status(self, status)?;

        let payload = match request.operation {
            Operation::Read => {
                let data = &body[7..];
                if data.len() != request.points * 4 {
                    return Err(PlcError::short_response(request.points * 4, data.len()));
                }
                Some(DataPayload::Bytes(ascii::ascii_to_words(data, ByteOrder::BigEndian)?))
            }
            Operation::Write => None,
        };
        Ok(ResponseFrame {
            status,
            payload,
            raw_len: raw.len(),
        })
    }

    fn request_progress(&self, buf: &[u8]) -> PlcResult<FrameProgress> {
        Self::progress(buf)
    }

    fn decode_inbound(&self, raw: &[u8], _session: &mut SessionContext) -> PlcResult<Inbound> {
        let body = Self::body(raw)?;
        require_len(body, REQUEST_HEAD)?;

        let unit = Self::unit_of(body)?;
        if unit != self.unit {
            return Err(PlcError::station_mismatch(self.unit, unit));
        }

        let operation = match body[3] {
            b'R' => Operation::Read,
            b'W' => Operation::Write,
            other => {
                return Err(PlcError::frame(format!(
                    "unsupported HostLink header {}{}",
                    other as char, body[4] as char
                )))
            }
        };
        let device_code = body[4] as u16;
        let start = ascii::parse_dec_field(&body[5..9])?;

        let (points, payload) = match operation {
            Operation::Read => {
                if body.len() != REQUEST_HEAD + 4 {
                    return Err(PlcError::frame("HostLink read carries a four-digit count"));
                }
                (ascii::parse_dec_field(&body[9..13])? as usize, None)
            }
            Operation::Write => {
                let data = &body[REQUEST_HEAD..];
                if data.is_empty() || data.len() % 4 != 0 {
                    return Err(PlcError::frame(format!("{} data characters are not whole words", data.len())));
                }
                let bytes = ascii::ascii_to_words(data, ByteOrder::BigEndian)?;
                (data.len() / 4, Some(DataPayload::Bytes(bytes)))
            }
        };

        Ok(Inbound::Command(CommandFrame {
            operation,
            mode: DataMode::Word,
            station: unit,
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
        let mut out = Vec::with_capacity(MIN_REPLY + request.points * 4);
        out.push(START);
        out.extend_from_slice(&ascii::dec_field(request.station as u32, 2));
        out.push(match request.operation {
            Operation::Read => b'R',
            Operation::Write => b'W',
        });
        out.push(request.device_code as u8);
        out.extend_from_slice(&ascii::byte_to_ascii_hex(status as u8));
        if status == 0 {
            if let Some(DataPayload::Bytes(bytes)) = payload {
                out.extend_from_slice(&ascii::words_to_ascii(bytes, ByteOrder::BigEndian)?);
            }
        }
        Ok(Self::finish(out))
    }

    fn fault_status(&self, fault: ServerFault) -> u16 {
        match fault {
            ServerFault::OutOfRange => 0x15,
            ServerFault::UnsupportedDevice => 0x16,
            ServerFault::WriteDisabled => 0x01,
        }
    }

    fn describe_status(&self, code: u16) -> String {
        let text = match code {
            0x00 => "Normal completion",
            0x01 => "Not executable in RUN mode",
            0x02 => "Not executable in MONITOR mode",
            0x03 => "UM area is write-protected",
            0x04 => "Address over",
            0x0B => "Not executable in PROGRAM mode",
            0x13 => "FCS error",
            0x14 => "Format error",
            0x15 => "Entry number data error",
            0x16 => "Command not supported",
            0x18 => "Frame length error",
            0x19 => "Not executable",
            0x23 => "User memory protected",
            0xA3 => "Aborted due to FCS error in transmit data",
            0xA4 => "Aborted due to format error in transmit data",
            0xA5 => "Aborted due to entry number data error in transmit data",
            0xA8 => "Aborted due to frame length error in transmit data",
            _ => "Unknown HostLink end code",
        };
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(codec: &HostLinkCodec, address: &str, operation: Operation, points: usize, payload: Option<&DataPayload>) -> PlcResult<Vec<(CommandFrame, Vec<u8>)>> {
        let spec = codec.resolve(address)?;
        codec.encode_request(&spec, operation, points, payload, &mut SessionContext::default())
    }

    #[test]
    fn test_read_request_layout() {
        let codec = HostLinkCodec::new(0);
        let frames = encode(&codec, "DM100", Operation::Read, 2, None).unwrap();
        let bytes = &frames[0].1;
        assert_eq!(&bytes[..13], b"@00RD01000002");
        assert_eq!(&bytes[13..15], &ascii::byte_to_ascii_hex(ChecksumKind::Xor8.compute(&bytes[..13])));
        assert_eq!(&bytes[15..], b"*\r");
    }

    #[test]
    fn test_fcs_of_known_frame() {
        let mut frame = b"@00RD00000001".to_vec();
        ChecksumKind::Xor8.append(&mut frame, 0);
        assert_eq!(&frame[13..], b"57");
    }

    #[test]
    fn test_reads_split_writes_rejected() {
        let codec = HostLinkCodec::new(0);
        let frames = encode(&codec, "D0", Operation::Read, 75, None).unwrap();
        assert_eq!(frames.iter().map(|(f, _)| f.points).collect::<Vec<_>>(), vec![30, 30, 15]);
        assert_eq!(frames[2].0.start, 60);

        let payload = DataPayload::Bytes(vec![0; 62]);
        let err = encode(&codec, "D0", Operation::Write, 31, Some(&payload)).unwrap_err();
        assert_eq!(err, PlcError::length_exceeded(31, 30));
    }

    #[test]
    fn test_mirror_write_and_read() {
        let client = HostLinkCodec::new(3);
        let server = HostLinkCodec::new(3);
        let payload = DataPayload::Bytes(vec![0x12, 0x34, 0xAB, 0xCD]);
        let frames = encode(&client, "HR10", Operation::Write, 2, Some(&payload)).unwrap();
        let (request, bytes) = &frames[0];
        assert_eq!(&bytes[..17], b"@03WH00101234ABCD");

        let command = match server.decode_inbound(bytes, &mut SessionContext::default()).unwrap() {
            Inbound::Command(command) => command,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(command.payload.as_ref(), Some(&payload));
        assert_eq!((command.device_code, command.start, command.points), (b'H' as u16, 10, 2));

        let reply = server.encode_reply(&command, 0, None, &SessionContext::default()).unwrap();
        assert_eq!(client.response_progress(&reply, request).unwrap(), FrameProgress::Complete(reply.len()));
        assert_eq!(client.decode_response(&reply, request, &SessionContext::default()).unwrap().status, 0);
    }

    #[test]
    fn test_station_mismatch_both_sides() {
        let client = HostLinkCodec::new(1);
        let server = HostLinkCodec::new(2);
        let frames = encode(&client, "D5", Operation::Read, 1, None).unwrap();
        let (request, bytes) = &frames[0];

        assert_eq!(
            server.decode_inbound(bytes, &mut SessionContext::default()).unwrap_err(),
            PlcError::station_mismatch(2, 1)
        );

        let mut foreign = request.clone();
        foreign.station = 2;
        let reply = server
            .encode_reply(&foreign, 0, Some(&DataPayload::Bytes(vec![0, 1])), &SessionContext::default())
            .unwrap();
        assert_eq!(
            client.decode_response(&reply, request, &SessionContext::default()).unwrap_err(),
            PlcError::station_mismatch(1, 2)
        );
    }

    #[test]
    fn test_unit_number_range() {
        let frames = encode(&HostLinkCodec::new(0), "s=31;D0", Operation::Read, 1, None).unwrap();
        assert_eq!(&frames[0].1[..3], b"@31");
        assert!(matches!(
            encode(&HostLinkCodec::new(0), "s=150;D0", Operation::Read, 1, None),
            Err(PlcError::InvalidData { .. })
        ));
        assert!(matches!(
            encode(&HostLinkCodec::new(32), "D0", Operation::Read, 1, None),
            Err(PlcError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_fcs_error_and_end_code() {
        let codec = HostLinkCodec::new(0);
        let frames = encode(&codec, "D5", Operation::Read, 1, None).unwrap();
        let request = &frames[0].0;

        let mut reply = codec
            .encode_reply(request, 0, Some(&DataPayload::Bytes(vec![0, 7])), &SessionContext::default())
            .unwrap();
        reply[8] ^= 0x02;
        assert!(matches!(
            codec.decode_response(&reply, request, &SessionContext::default()),
            Err(PlcError::ChecksumMismatch { .. })
        ));

        let reply = codec.encode_reply(request, 0x15, None, &SessionContext::default()).unwrap();
        assert!(matches!(
            codec.decode_response(&reply, request, &SessionContext::default()),
            Err(PlcError::ProtocolStatus { code: 0x15, .. })
        ));
    }

    #[test]
    fn test_noise_before_frame() {
        let codec = HostLinkCodec::new(0);
        let mut buf = b"\x00\xFF".to_vec();
        buf.extend_from_slice(b"@00RD00");
        assert_eq!(codec.request_progress(&buf).unwrap(), FrameProgress::Discard(2));
        assert_eq!(codec.request_progress(&buf[2..]).unwrap(), FrameProgress::NeedMore(1));
    }
}
