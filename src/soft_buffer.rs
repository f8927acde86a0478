/// In-memory register store for virtual PLC servers
///
/// One [`SoftBuffer`] backs one device type. Word devices hold two bytes per
/// address in the serving codec's byte order; bit devices hold one byte per bit
/// and are only packed at the codec boundary. Each buffer is guarded by a single
/// `RwLock`, so concurrent sessions see last-write-wins semantics.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::address::{DataMode, DeviceTable};
use crate::error::{AddressErrorKind, PlcError, PlcResult};
use crate::utils::ByteOrder;

/// Default number of addressable units per device type
pub const DEFAULT_UNITS: usize = 65536;

/// Fixed-capacity memory region for one device type
#[derive(Debug)]
pub struct SoftBuffer {
    name: String,
    mode: DataMode,
    order: ByteOrder,
    units: usize,
    data: RwLock<Vec<u8>>,
}

impl SoftBuffer {
    /// Create a zero-filled region of `units` addresses
    pub fn new<S: Into<String>>(name: S, mode: DataMode, units: usize, order: ByteOrder) -> Self {
        let bytes = match mode {
            DataMode::Word => units * 2,
            DataMode::Bit => units,
        };
        Self {
            name: name.into(),
            mode,
            order,
            units,
            data: RwLock::new(vec![0; bytes]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    /// Number of addressable units
    pub fn units(&self) -> usize {
        self.units
    }

    /// Capacity in bytes
    pub fn byte_len(&self) -> usize {
        match self.mode {
            DataMode::Word => self.units * 2,
            DataMode::Bit => self.units,
        }
    }

    fn check_range(&self, offset: usize, len: usize, limit: usize) -> PlcResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(PlcError::address(
                AddressErrorKind::OutOfRange,
                format!("{}{}", self.name, offset),
                format!("{} units from {} exceed capacity {}", len, offset, limit),
            )),
        }
    }

    /// Read `len` raw bytes at byte `offset`
    pub fn get_bytes(&self, offset: usize, len: usize) -> PlcResult<Vec<u8>> {
        self.check_range(offset, len, self.byte_len())?;
        let data = self.data.read().map_err(|_| PlcError::internal(format!("Failed to lock {}", self.name)))?;
        Ok(data[offset..offset + len].to_vec())
    }

    /// Write raw bytes at byte `offset`
    pub fn set_bytes(&self, bytes: &[u8], offset: usize) -> PlcResult<()> {
        self.check_range(offset, bytes.len(), self.byte_len())?;
        let mut data = self.data.write().map_err(|_| PlcError::internal(format!("Failed to lock {}", self.name)))?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read `count` bits starting at bit `offset`
    ///
    /// For word regions the offset is the linear bit position `word * 16 + bit`.
    pub fn get_bool(&self, offset: usize, count: usize) -> PlcResult<Vec<bool>> {
        let data = self.data.read().map_err(|_| PlcError::internal(format!("Failed to lock {}", self.name)))?;
        match self.mode {
            DataMode::Bit => {
                self.check_range(offset, count, self.units)?;
                Ok(data[offset..offset + count].iter().map(|&b| b != 0).collect())
            }
            DataMode::Word => {
                self.check_range(offset, count, self.units * 16)?;
                Ok((offset..offset + count)
                    .map(|linear| self.word_at(&data, linear / 16) & (1 << (linear % 16)) != 0)
                    .collect())
            }
        }
    }

    /// Write bits starting at bit `offset`
    pub fn set_bool(&self, values: &[bool], offset: usize) -> PlcResult<()> {
        let mut data = self.data.write().map_err(|_| PlcError::internal(format!("Failed to lock {}", self.name)))?;
        match self.mode {
            DataMode::Bit => {
                self.check_range(offset, values.len(), self.units)?;
                for (slot, &value) in data[offset..offset + values.len()].iter_mut().zip(values) {
                    *slot = value as u8;
                }
            }
            DataMode::Word => {
                self.check_range(offset, values.len(), self.units * 16)?;
                for (i, &value) in values.iter().enumerate() {
                    let linear = offset + i;
                    let mut word = self.word_at(&data, linear / 16);
                    if value {
                        word |= 1 << (linear % 16);
                    } else {
                        word &= !(1 << (linear % 16));
                    }
                    self.put_word(&mut data, linear / 16, word);
                }
            }
        }
        Ok(())
    }

    /// Read word values at word `address`
    pub fn read_words(&self, address: usize, count: usize) -> PlcResult<Vec<u16>> {
        let bytes = self.get_bytes(address * 2, count * 2)?;
        crate::utils::words::bytes_to_words(&bytes, self.order)
    }

    /// Write word values at word `address`
    pub fn write_words(&self, values: &[u16], address: usize) -> PlcResult<()> {
        self.set_bytes(&crate::utils::words::words_to_bytes(values, self.order), address * 2)
    }

    /// Replace the region contents from a snapshot
    ///
    /// A shorter blob fills the front of the region; the rest is zeroed.
    pub fn load_from_bytes(&self, blob: &[u8]) -> PlcResult<()> {
        if blob.len() > self.byte_len() {
            return Err(PlcError::invalid_data(format!(
                "snapshot of {} bytes exceeds {} capacity {}",
                blob.len(),
                self.name,
                self.byte_len()
            )));
        }
        let mut data = self.data.write().map_err(|_| PlcError::internal(format!("Failed to lock {}", self.name)))?;
        data[..blob.len()].copy_from_slice(blob);
        data[blob.len()..].iter_mut().for_each(|b| *b = 0);
        Ok(())
    }

    /// Snapshot of the whole region
    pub fn save_to_bytes(&self) -> PlcResult<Vec<u8>> {
        let data = self.data.read().map_err(|_| PlcError::internal(format!("Failed to lock {}", self.name)))?;
        Ok(data.clone())
    }

    fn word_at(&self, data: &[u8], word: usize) -> u16 {
        let pair = [data[word * 2], data[word * 2 + 1]];
        match self.order {
            ByteOrder::LittleEndian => u16::from_le_bytes(pair),
            ByteOrder::BigEndian => u16::from_be_bytes(pair),
        }
    }

    fn put_word(&self, data: &mut [u8], word: usize, value: u16) {
        let pair = match self.order {
            ByteOrder::LittleEndian => value.to_le_bytes(),
            ByteOrder::BigEndian => value.to_be_bytes(),
        };
        data[word * 2..word * 2 + 2].copy_from_slice(&pair);
    }
}

/// Regions for every device type of a table, keyed by wire code
///
/// Bit codes of word devices and table aliases resolve to the same region.
#[derive(Debug, Clone, Default)]
pub struct MemoryBank {
    regions: HashMap<u16, Arc<SoftBuffer>>,
    names: HashMap<String, u16>,
}

impl MemoryBank {
    /// Allocate `units` addresses for each distinct device code in `table`
    pub fn for_table(table: &DeviceTable, units: usize, order: ByteOrder) -> Self {
        let mut bank = Self::default();
        for entry in table.entries() {
            let region = bank
                .regions
                .entry(entry.code)
                .or_insert_with(|| Arc::new(SoftBuffer::new(entry.prefix.clone(), entry.mode, units, order)))
                .clone();
            if let Some(bit_code) = entry.bit_code {
                bank.regions.entry(bit_code).or_insert(region);
            }
            bank.names.insert(entry.prefix.to_ascii_uppercase(), entry.code);
        }
        bank
    }

    /// Region serving a wire device code
    pub fn region(&self, code: u16) -> Option<Arc<SoftBuffer>> {
        self.regions.get(&code).cloned()
    }

    /// Region serving a device prefix such as `"D"`
    pub fn by_prefix(&self, prefix: &str) -> Option<Arc<SoftBuffer>> {
        self.names
            .get(&prefix.to_ascii_uppercase())
            .and_then(|code| self.region(*code))
    }

    /// Distinct wire codes with a region
    pub fn codes(&self) -> Vec<u16> {
        let mut codes: Vec<u16> = self.regions.keys().copied().collect();
        codes.sort_unstable();
        codes
    }
}
