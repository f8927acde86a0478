//! # Textual device-address resolution
//!
//! Every protocol addresses its registers with strings such as `"D100"`,
//! `"X1A0"`, `"s=2;D100"` or `"D100.5"`. The resolver turns such a string into
//! an [`AddressSpec`] using a [`DeviceTable`] supplied by the codec. Adding a
//! controller family means adding table rows, not new types.
//!
//! ## Grammar
//!
//! ```text
//! address   := (param ';')* prefix numeral ('.' bit)?
//! param     := key '=' decimal          ; s|station, net|network, x|ext
//! prefix    := longest case-insensitive match in the device table
//! numeral   := digits in the device's numeric base
//! ```
//!
//! Entries flagged with the octal hint read a numeral with a leading `0` as
//! octal, so `"X017"` resolves to offset 15 even when `X` is a hex device.
//!
//! ```rust
//! use voltage_plc::address::{AddressResolver, DeviceEntry, DeviceTable, NumericBase};
//!
//! let table = DeviceTable::new(vec![
//!     DeviceEntry::word("D", 0xA8, NumericBase::Decimal),
//!     DeviceEntry::bit("X", 0x9C, NumericBase::Hex).with_octal_hint(),
//! ]);
//! let resolver = AddressResolver::new(&table);
//!
//! assert_eq!(resolver.resolve("D100").unwrap().start, 100);
//! assert_eq!(resolver.resolve("X017").unwrap().start, 15);
//! assert!(resolver.resolve("Q1").is_err());
//! ```

use std::fmt;
use std::num::IntErrorKind;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AddressErrorKind, PlcError, PlcResult};

/// Whether a request addresses single bits or 16-bit words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataMode {
    Bit,
    Word,
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataMode::Bit => f.write_str("bit"),
            DataMode::Word => f.write_str("word"),
        }
    }
}

/// Numeric base of a device's address numeral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericBase {
    Octal,
    Decimal,
    Hex,
    /// Decimal numeral whose last two digits are a bit index (`R1015` = word 10, bit 15)
    WordBit100,
}

impl NumericBase {
    /// Radix used to parse the numeral text
    pub fn radix(self) -> u32 {
        match self {
            NumericBase::Octal => 8,
            NumericBase::Decimal | NumericBase::WordBit100 => 10,
            NumericBase::Hex => 16,
        }
    }
}

/// One row of a protocol's device-type table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Prefix letters, matched case-insensitively
    pub prefix: String,
    /// Device-type code put on the wire
    pub code: u16,
    /// Base the numeral is written in
    pub base: NumericBase,
    /// Default addressing mode
    pub mode: DataMode,
    /// A leading `0` switches the numeral to octal
    pub octal_hint: bool,
    /// Code used for `.n` bit access inside a word device
    pub bit_code: Option<u16>,
    /// Largest valid start offset
    pub max_address: u32,
}

impl DeviceEntry {
    /// Word device row
    pub fn word<S: Into<String>>(prefix: S, code: u16, base: NumericBase) -> Self {
        Self {
            prefix: prefix.into(),
            code,
            base,
            mode: DataMode::Word,
            octal_hint: false,
            bit_code: None,
            max_address: 0x00FF_FFFF,
        }
    }

    /// Bit device row
    pub fn bit<S: Into<String>>(prefix: S, code: u16, base: NumericBase) -> Self {
        Self {
            mode: DataMode::Bit,
            ..Self::word(prefix, code, base)
        }
    }

    /// Accept a leading `0` as an octal marker
    pub fn with_octal_hint(mut self) -> Self {
        self.octal_hint = true;
        self
    }

    /// Allow `.n` bit access, sent with `bit_code`
    pub fn with_bit_code(mut self, bit_code: u16) -> Self {
        self.bit_code = Some(bit_code);
        self
    }

    /// Limit the valid start offset
    pub fn with_max_address(mut self, max_address: u32) -> Self {
        self.max_address = max_address;
        self
    }
}

/// Device-type lookup table supplied by a concrete protocol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTable {
    entries: Vec<DeviceEntry>,
}

impl DeviceTable {
    pub fn new(entries: Vec<DeviceEntry>) -> Self {
        Self { entries }
    }

    /// Add a row
    pub fn push(&mut self, entry: DeviceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[DeviceEntry] {
        &self.entries
    }

    /// Longest case-insensitive prefix match at the start of `text`
    pub fn match_prefix(&self, text: &str) -> Option<&DeviceEntry> {
        self.entries
            .iter()
            .filter(|entry| {
                text.get(..entry.prefix.len())
                    .map_or(false, |head| head.eq_ignore_ascii_case(&entry.prefix))
            })
            .max_by_key(|entry| entry.prefix.len())
    }

    /// Find the row owning a wire code, and the mode that code implies
    ///
    /// Aliases that share a code resolve to the first row declared.
    pub fn by_code(&self, code: u16) -> Option<(&DeviceEntry, DataMode)> {
        self.entries
            .iter()
            .find(|entry| entry.code == code)
            .map(|entry| (entry, entry.mode))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|entry| entry.bit_code == Some(code))
                    .map(|entry| (entry, DataMode::Bit))
            })
    }
}

/// Structured result of resolving an address string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    /// The matched table row
    pub device: DeviceEntry,
    /// Effective mode (bit when a `.n` index was given)
    pub mode: DataMode,
    /// Start offset in device units
    pub start: u32,
    /// Bit index inside the start word
    pub bit: Option<u8>,
    /// `s=` / `station=` override
    pub station: Option<u8>,
    /// `net=` / `network=` override
    pub network: Option<u8>,
    /// `x=` / `ext=` extension index
    pub extension: Option<u16>,
}

impl AddressSpec {
    /// Wire code for this access (the bit code for `.n` addresses)
    pub fn device_code(&self) -> u16 {
        match (self.bit, self.device.bit_code) {
            (Some(_), Some(bit_code)) => bit_code,
            _ => self.device.code,
        }
    }
}

/// Stateless address parser over a device table
#[derive(Debug, Clone, Copy)]
pub struct AddressResolver<'a> {
    table: &'a DeviceTable,
}

impl<'a> AddressResolver<'a> {
    pub fn new(table: &'a DeviceTable) -> Self {
        Self { table }
    }

    /// Resolve an address string
    pub fn resolve(&self, address: &str) -> PlcResult<AddressSpec> {
        let text = address.trim();
        let mut station = None;
        let mut network = None;
        let mut extension = None;

        let mut segments: Vec<&str> = text.split(';').collect();
        let body = segments.pop().unwrap_or_default().trim();

        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                PlcError::address(
                    AddressErrorKind::MalformedNumeral,
                    address,
                    format!("parameter '{}' is not key=value", segment),
                )
            })?;
            match key.trim().to_ascii_lowercase().as_str() {
                "s" | "station" => station = Some(parse_param(address, value, u8::MAX as u32)? as u8),
                "net" | "network" => network = Some(parse_param(address, value, u8::MAX as u32)? as u8),
                "x" | "ext" => extension = Some(parse_param(address, value, u16::MAX as u32)? as u16),
                other => debug!("ignoring unknown address parameter '{}' in '{}'", other, address),
            }
        }

        let entry = self.table.match_prefix(body).ok_or_else(|| {
            PlcError::address(AddressErrorKind::UnknownPrefix, address, "no device prefix matches")
        })?;

        let rest = &body[entry.prefix.len()..];
        let (numeral, bit_text) = match rest.split_once('.') {
            Some((numeral, bit)) => (numeral, Some(bit)),
            None => (rest, None),
        };

        let bit = match bit_text {
            None => None,
            Some(bit_text) => {
                if entry.mode != DataMode::Word || entry.bit_code.is_none() {
                    return Err(PlcError::address(
                        AddressErrorKind::UnsupportedBitIndex,
                        address,
                        format!("device {} has no bit access", entry.prefix),
                    ));
                }
                let index: u8 = bit_text.parse().map_err(|_| {
                    PlcError::address(
                        AddressErrorKind::UnsupportedBitIndex,
                        address,
                        format!("'{}' is not a bit index", bit_text),
                    )
                })?;
                if index > 15 {
                    return Err(PlcError::address(
                        AddressErrorKind::UnsupportedBitIndex,
                        address,
                        format!("bit index {} is above 15", index),
                    ));
                }
                Some(index)
            }
        };

        let radix = if entry.octal_hint && numeral.len() > 1 && numeral.starts_with('0') {
            8
        } else {
            entry.base.radix()
        };

        if numeral.is_empty() {
            return Err(PlcError::address(AddressErrorKind::MalformedNumeral, address, "missing numeral"));
        }

        let value = u32::from_str_radix(numeral, radix).map_err(|e| {
            let kind = match e.kind() {
                IntErrorKind::PosOverflow => AddressErrorKind::OutOfRange,
                _ => AddressErrorKind::MalformedNumeral,
            };
            PlcError::address(kind, address, format!("'{}' is not a base-{} numeral", numeral, radix))
        })?;

        let start = match entry.base {
            NumericBase::WordBit100 => {
                let (word, bit_index) = (value / 100, value % 100);
                if bit_index > 15 {
                    return Err(PlcError::address(
                        AddressErrorKind::UnsupportedBitIndex,
                        address,
                        format!("bit digits {} are above 15", bit_index),
                    ));
                }
                word * 16 + bit_index
            }
            _ => value,
        };

        if start > entry.max_address {
            return Err(PlcError::address(
                AddressErrorKind::OutOfRange,
                address,
                format!("{} exceeds the {} limit {}", start, entry.prefix, entry.max_address),
            ));
        }

        let mode = if bit.is_some() { DataMode::Bit } else { entry.mode };

        Ok(AddressSpec {
            device: entry.clone(),
            mode,
            start,
            bit,
            station,
            network,
            extension,
        })
    }
}

fn parse_param(address: &str, value: &str, max: u32) -> PlcResult<u32> {
    let parsed: u32 = value.trim().parse().map_err(|_| {
        PlcError::address(
            AddressErrorKind::MalformedNumeral,
            address,
            format!("parameter value '{}' is not decimal", value),
        )
    })?;
    if parsed > max {
        return Err(PlcError::address(
            AddressErrorKind::OutOfRange,
            address,
            format!("parameter value {} exceeds {}", parsed, max),
        ));
    }
    Ok(parsed)
}
