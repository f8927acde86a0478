//! MELSEC communication protocol, QnA-compatible 3E frame (binary and ASCII)
//!
//! Binary request:
//!
//! ```text
//! 50 00 | network | PC | I/O (2 LE) | station | length (2 LE) | timer (2 LE)
//!       | command (2 LE) | subcommand (2 LE) | start (3 LE) | device (1) | points (2 LE) | data
//! ```
//!
//! `length` counts everything from the timer onwards. The response begins with
//! `D0 00`, repeats the routing fields, and carries a 2-byte end code after the
//! length. The ASCII form renders the same fields as hex text, the device as a
//! two-character name (`D*`, `ZR`) and the start as six decimal or hex digits
//! depending on the device's base.

use byteorder::{ByteOrder as _, LittleEndian};

use crate::address::{DataMode, DeviceEntry, DeviceTable, NumericBase};
use crate::codec::{check_status, require_len, Encoding};
use crate::error::{PlcError, PlcResult};
use crate::framing::{self, FrameProgress};
use crate::protocol::{
    CommandFrame, DataPayload, FrameCodec, Inbound, Operation, PointCeilings, ResponseFrame, ServerFault,
    SessionContext,
};
use crate::utils::{ascii, bits, ByteOrder};

const CMD_BATCH_READ: u16 = 0x0401;
const CMD_BATCH_WRITE: u16 = 0x1401;
const SUB_WORD: u16 = 0x0000;
const SUB_BIT: u16 = 0x0001;

/// Largest start a decimal device can put in the ASCII start field
const MAX_DECIMAL_START: u32 = 999_999;

const UNKNOWN_DEVICE: u16 = 0xFFFF;

const BIN_HEADER: usize = 9;
const ASCII_HEADER: usize = 18;

/// MC 3E codec
#[derive(Debug, Clone)]
pub struct McCodec {
    encoding: Encoding,
    network: u8,
    pc: u8,
    io: u16,
    station: u8,
    timer: u16,
    table: DeviceTable,
}

impl McCodec {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            network: 0x00,
            pc: 0xFF,
            io: 0x03FF,
            station: 0x00,
            timer: 0x000A,
            table: Self::default_table(),
        }
    }

    pub fn binary() -> Self {
        Self::new(Encoding::Binary)
    }

    pub fn ascii() -> Self {
        Self::new(Encoding::Ascii)
    }

    pub fn with_network(mut self, network: u8) -> Self {
        self.network = network;
        self
    }

    pub fn with_station(mut self, station: u8) -> Self {
        self.station = station;
        self
    }

    pub fn with_pc(mut self, pc: u8) -> Self {
        self.pc = pc;
        self
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Q/L series devices; X, Y, B, W, SB, SW are hexadecimal
    ///
    /// Decimal devices stop at 999999, the widest value the six-digit ASCII
    /// start field can carry.
    pub fn default_table() -> DeviceTable {
        let entries = vec![
            DeviceEntry::bit("X", 0x9C, NumericBase::Hex).with_octal_hint(),
            DeviceEntry::bit("Y", 0x9D, NumericBase::Hex).with_octal_hint(),
            DeviceEntry::bit("M", 0x90, NumericBase::Decimal),
            DeviceEntry::bit("L", 0x92, NumericBase::Decimal),
            DeviceEntry::bit("F", 0x93, NumericBase::Decimal),
            DeviceEntry::bit("V", 0x94, NumericBase::Decimal),
            DeviceEntry::bit("B", 0xA0, NumericBase::Hex),
            DeviceEntry::bit("SM", 0x91, NumericBase::Decimal),
            DeviceEntry::bit("SB", 0xA1, NumericBase::Hex),
            DeviceEntry::bit("TS", 0xC1, NumericBase::Decimal),
            DeviceEntry::bit("TC", 0xC0, NumericBase::Decimal),
            DeviceEntry::bit("CS", 0xC4, NumericBase::Decimal),
            DeviceEntry::bit("CC", 0xC3, NumericBase::Decimal),
            DeviceEntry::word("D", 0xA8, NumericBase::Decimal),
            DeviceEntry::word("SD", 0xA9, NumericBase::Decimal),
            DeviceEntry::word("W", 0xB4, NumericBase::Hex),
            DeviceEntry::word("SW", 0xB5, NumericBase::Hex),
            DeviceEntry::word("R", 0xAF, NumericBase::Decimal),
            DeviceEntry::word("ZR", 0xB0, NumericBase::Hex),
            DeviceEntry::word("TN", 0xC2, NumericBase::Decimal),
            DeviceEntry::word("CN", 0xC5, NumericBase::Decimal),
        ];
        DeviceTable::new(
            entries
                .into_iter()
                .map(|entry| match entry.base {
                    NumericBase::Decimal => entry.with_max_address(MAX_DECIMAL_START),
                    _ => entry,
                })
                .collect(),
        )
    }

    fn entry_for_code(&self, code: u16) -> PlcResult<&DeviceEntry> {
        self.table
            .by_code(code)
            .map(|(entry, _)| entry)
            .ok_or_else(|| PlcError::unsupported_device(format!("0x{:02X}", code)))
    }

    /// Two-character ASCII device name, padded with `*`
    fn ascii_name(entry: &DeviceEntry) -> Vec<u8> {
        let mut name = entry.prefix.as_bytes().to_vec();
        name.resize(2, b'*');
        name
    }

    fn entry_for_name(&self, name: &[u8]) -> Option<&DeviceEntry> {
        let trimmed: Vec<u8> = name.iter().copied().filter(|&c| c != b'*').collect();
        self.table
            .entries()
            .iter()
            .find(|entry| entry.prefix.as_bytes().eq_ignore_ascii_case(&trimmed))
    }

    fn header_len(&self) -> usize {
        match self.encoding {
            Encoding::Binary => BIN_HEADER,
            Encoding::Ascii => ASCII_HEADER,
        }
    }

    fn data_len(&self, mode: DataMode, points: usize) -> usize {
        match (self.encoding, mode) {
            (Encoding::Binary, DataMode::Word) => points * 2,
            (Encoding::Binary, DataMode::Bit) => (points + 1) / 2,
            (Encoding::Ascii, DataMode::Word) => points * 4,
            (Encoding::Ascii, DataMode::Bit) => points,
        }
    }

    fn encode_data(&self, payload: &DataPayload) -> PlcResult<Vec<u8>> {
        Ok(match (self.encoding, payload) {
            (Encoding::Binary, DataPayload::Bytes(bytes)) => bytes.clone(),
            (Encoding::Binary, DataPayload::Bits(values)) => bits::pack_nibbles(values),
            (Encoding::Ascii, DataPayload::Bytes(bytes)) => ascii::words_to_ascii(bytes, ByteOrder::LittleEndian)?,
            (Encoding::Ascii, DataPayload::Bits(values)) => ascii::bits_to_ascii(values),
        })
    }

    fn decode_data(&self, data: &[u8], mode: DataMode, points: usize) -> PlcResult<DataPayload> {
        let needed = self.data_len(mode, points);
        require_len(data, needed)?;
        let data = &data[..needed];
        Ok(match (self.encoding, mode) {
            (Encoding::Binary, DataMode::Word) => DataPayload::Bytes(data.to_vec()),
            (Encoding::Binary, DataMode::Bit) => DataPayload::Bits(bits::unpack_nibbles(data, points)),
            (Encoding::Ascii, DataMode::Word) => DataPayload::Bytes(ascii::ascii_to_words(data, ByteOrder::LittleEndian)?),
            (Encoding::Ascii, DataMode::Bit) => DataPayload::Bits(ascii::ascii_to_bits(data)?),
        })
    }

    /// Routing fields: network, PC, I/O (LE), station
    fn route_for(&self, frame: &CommandFrame) -> [u8; 5] {
        if frame.route.len() == 5 {
            let mut route = [0u8; 5];
            route.copy_from_slice(&frame.route);
            return route;
        }
        let io = self.io.to_le_bytes();
        [frame.network, self.pc, io[0], io[1], frame.station]
    }

    fn push_route(&self, out: &mut Vec<u8>, route: &[u8; 5]) {
        match self.encoding {
            Encoding::Binary => out.extend_from_slice(route),
            Encoding::Ascii => {
                out.extend_from_slice(&ascii::hex_field(route[0] as u32, 2));
                out.extend_from_slice(&ascii::hex_field(route[1] as u32, 2));
                out.extend_from_slice(&ascii::hex_field(u16::from_le_bytes([route[2], route[3]]) as u32, 4));
                out.extend_from_slice(&ascii::hex_field(route[4] as u32, 2));
            }
        }
    }

    fn read_route(&self, raw: &[u8]) -> PlcResult<Vec<u8>> {
        match self.encoding {
            Encoding::Binary => Ok(raw[2..7].to_vec()),
            Encoding::Ascii => {
                let io = ascii::parse_hex_field(&raw[8..12])? as u16;
                let io = io.to_le_bytes();
                Ok(vec![
                    ascii::ascii_hex_to_byte(&raw[4..6])?,
                    ascii::ascii_hex_to_byte(&raw[6..8])?,
                    io[0],
                    io[1],
                    ascii::ascii_hex_to_byte(&raw[12..14])?,
                ])
            }
        }
    }

    fn push_u16(&self, out: &mut Vec<u8>, value: u16) {
        match self.encoding {
            Encoding::Binary => out.extend_from_slice(&value.to_le_bytes()),
            Encoding::Ascii => out.extend_from_slice(&ascii::hex_field(value as u32, 4)),
        }
    }

    /// Total frame length announced by the header's length field
    fn announced_total(&self, header: &[u8], marker: &[u8]) -> PlcResult<usize> {
        let (prefix, length) = match self.encoding {
            Encoding::Binary => (&header[0..2], LittleEndian::read_u16(&header[7..9]) as usize),
            Encoding::Ascii => (&header[0..4], ascii::parse_hex_field(&header[14..18])? as usize),
        };
        if prefix != marker {
            return Err(PlcError::frame(format!("unexpected MC subheader {:02X?}", prefix)));
        }
        Ok(self.header_len() + length)
    }

    fn request_marker(&self) -> &'static [u8] {
        match self.encoding {
            Encoding::Binary => &[0x50, 0x00],
            Encoding::Ascii => b"5000",
        }
    }

    fn response_marker(&self) -> &'static [u8] {
        match self.encoding {
            Encoding::Binary => &[0xD0, 0x00],
            Encoding::Ascii => b"D000",
        }
    }
}

impl Default for McCodec {
    fn default() -> Self {
        Self::binary()
    }
}

impl FrameCodec for McCodec {
    fn name(&self) -> &'static str {
        match self.encoding {
            Encoding::Binary => "MC-3E",
            Encoding::Ascii => "MC-3E-ASCII",
        }
    }

    fn device_table(&self) -> &DeviceTable {
        &self.table
    }

    fn ceilings(&self) -> PointCeilings {
        let bits = match self.encoding {
            Encoding::Binary => 7168,
            Encoding::Ascii => 3584,
        };
        PointCeilings {
            read_words: 960,
            read_bits: bits,
            write_words: 960,
            write_bits: bits,
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
        self.encoding == Encoding::Ascii
    }

    fn encode_command(&self, frame: &CommandFrame, _session: &SessionContext) -> PlcResult<Vec<u8>> {
        let entry = self.entry_for_code(frame.device_code)?;
        let (command, data) = match (frame.operation, &frame.payload) {
            (Operation::Read, _) => (CMD_BATCH_READ, Vec::new()),
            (Operation::Write, Some(payload)) => (CMD_BATCH_WRITE, self.encode_data(payload)?),
            (Operation::Write, None) => return Err(PlcError::invalid_data("write frame without payload")),
        };
        let subcommand = match frame.mode {
            DataMode::Word => SUB_WORD,
            DataMode::Bit => SUB_BIT,
        };
        if frame.start > 0x00FF_FFFF {
            return Err(PlcError::invalid_data(format!("start {} exceeds 3-byte field", frame.start)));
        }

        let mut body = Vec::with_capacity(24 + data.len());
        self.push_u16(&mut body, self.timer);
        self.push_u16(&mut body, command);
        self.push_u16(&mut body, subcommand);
        match self.encoding {
            Encoding::Binary => {
                body.extend_from_slice(&frame.start.to_le_bytes()[..3]);
                body.push(frame.device_code as u8);
            }
            Encoding::Ascii => {
                body.extend_from_slice(&Self::ascii_name(entry));
                let start = match entry.base {
                    NumericBase::Hex => ascii::checked_hex_field(frame.start, 6, "start")?,
                    _ => ascii::checked_dec_field(frame.start, 6, "start")?,
                };
                body.extend_from_slice(&start);
            }
        }
        self.push_u16(&mut body, frame.points as u16);
        body.extend_from_slice(&data);

        let mut out = Vec::with_capacity(self.header_len() + body.len());
        out.extend_from_slice(self.request_marker());
        self.push_route(&mut out, &self.route_for(frame));
        self.push_u16(&mut out, body.len() as u16);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn response_progress(&self, buf: &[u8], _request: &CommandFrame) -> PlcResult<FrameProgress> {
        framing::by_length(buf, self.header_len(), |header| {
            self.announced_total(header, self.response_marker())
        })
    }

    fn decode_response(&self, raw: &[u8], request: &CommandFrame, _session: &SessionContext) -> PlcResult<ResponseFrame> {
        let header_len = self.header_len();
        let end_len = match self.encoding {
            Encoding::Binary => 2,
            Encoding::Ascii => 4,
        };
        require_len(raw, header_len + end_len)?;
        let total = self.announced_total(&raw[..header_len], self.response_marker())?;
        require_len(raw, total)?;

        let status = match self.encoding {
            Encoding::Binary => LittleEndian::read_u16(&raw[9..11]),
            Encoding::Ascii => ascii::parse_hex_field(&raw[18..22])? as u16,
        };
        check_status(self, status)?;

        let payload = match request.operation {
            Operation::Read => Some(self.decode_data(&raw[header_len + end_len..total], request.mode, request.points)?),
            Operation::Write => None,
        };
        Ok(ResponseFrame {
            status,
            payload,
            raw_len: raw.len(),
        })
    }

    fn request_progress(&self, buf: &[u8]) -> PlcResult<FrameProgress> {
        framing::by_length(buf, self.header_len(), |header| {
            self.announced_total(header, self.request_marker())
        })
    }

    fn decode_inbound(&self, raw: &[u8], _session: &mut SessionContext) -> PlcResult<Inbound> {
        let header_len = self.header_len();
        let fixed = match self.encoding {
            Encoding::Binary => 12,
            Encoding::Ascii => 24,
        };
        require_len(raw, header_len + fixed)?;
        let total = self.announced_total(&raw[..header_len], self.request_marker())?;
        require_len(raw, total)?;
        let route = self.read_route(raw)?;

        let (command, subcommand, device_code, start, points, data_at) = match self.encoding {
            Encoding::Binary => (
                LittleEndian::read_u16(&raw[11..13]),
                LittleEndian::read_u16(&raw[13..15]),
                raw[18] as u16,
                LittleEndian::read_u24(&raw[15..18]),
                LittleEndian::read_u16(&raw[19..21]) as usize,
                21,
            ),
            Encoding::Ascii => {
                // unknown names are answered with a device fault, not a closed session
                let (code, base) = self
                    .entry_for_name(&raw[30..32])
                    .map_or((UNKNOWN_DEVICE, NumericBase::Hex), |entry| (entry.code, entry.base));
                let start = match base {
                    NumericBase::Hex => ascii::parse_hex_field(&raw[32..38])?,
                    _ => ascii::parse_dec_field(&raw[32..38])?,
                };
                (
                    ascii::parse_hex_field(&raw[22..26])? as u16,
                    ascii::parse_hex_field(&raw[26..30])? as u16,
                    code,
                    start,
                    ascii::parse_hex_field(&raw[38..42])? as usize,
                    42,
                )
            }
        };

        let operation = match command {
            CMD_BATCH_READ => Operation::Read,
            CMD_BATCH_WRITE => Operation::Write,
            other => return Err(PlcError::frame(format!("unsupported MC command 0x{:04X}", other))),
        };
        let mode = match subcommand {
            SUB_WORD => DataMode::Word,
            SUB_BIT => DataMode::Bit,
            other => return Err(PlcError::frame(format!("unsupported MC subcommand 0x{:04X}", other))),
        };

        let payload = match operation {
            Operation::Write => {
                let data = &raw[data_at..total];
                if data.len() != self.data_len(mode, points) {
                    return Err(PlcError::frame(format!(
                        "length field carries {} data bytes, {} points need {}",
                        data.len(),
                        points,
                        self.data_len(mode, points)
                    )));
                }
                Some(self.decode_data(data, mode, points)?)
            }
            Operation::Read => None,
        };

        Ok(Inbound::Command(CommandFrame {
            operation,
            mode,
            station: route[4],
            network: route[0],
            device_code,
            start,
            bit: None,
            points,
            payload,
            sequence: 0,
            route,
        }))
    }

    fn encode_reply(
        &self,
        request: &CommandFrame,
        status: u16,
        payload: Option<&DataPayload>,
        _session: &SessionContext,
    ) -> PlcResult<Vec<u8>> {
        let route = self.route_for(request);
        let mut body = Vec::new();
        self.push_u16(&mut body, status);
        if status == 0 {
            if let Some(data) = payload {
                body.extend_from_slice(&self.encode_data(data)?);
            }
        } else {
            // error information: route, command, subcommand of the failed request
            self.push_route(&mut body, &route);
            let command = match request.operation {
                Operation::Read => CMD_BATCH_READ,
                Operation::Write => CMD_BATCH_WRITE,
            };
            let subcommand = match request.mode {
                DataMode::Word => SUB_WORD,
                DataMode::Bit => SUB_BIT,
            };
            self.push_u16(&mut body, command);
            self.push_u16(&mut body, subcommand);
        }

        let mut out = Vec::with_capacity(self.header_len() + body.len());
        out.extend_from_slice(self.response_marker());
        self.push_route(&mut out, &route);
        self.push_u16(&mut out, body.len() as u16);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn fault_status(&self, fault: ServerFault) -> u16 {
        match fault {
            ServerFault::OutOfRange => 0xC056,
            ServerFault::UnsupportedDevice => 0xC059,
            ServerFault::WriteDisabled => 0xC05B,
        }
    }

    fn describe_status(&self, code: u16) -> String {
        let text = match code {
            0x0000 => "Normal completion",
            0xC050 => "ASCII data could not be converted to binary",
            0xC051..=0xC054 => "Number of points is out of range",
            0xC055 => "Number of file data points is out of range",
            0xC056 => "Read/write request exceeds the maximum address",
            0xC058 => "Request data length does not match the character count",
            0xC059 => "Command or subcommand is not supported, or the device cannot be specified",
            0xC05B => "The CPU cannot read or write the specified device",
            0xC05C => "Request content is invalid",
            0xC061 => "Request data length does not match the number of data",
            0x4000..=0x4FFF => "Error detected by the CPU module",
            _ => "Unknown MC end code",
        };
        text.to_string()
    }
}
