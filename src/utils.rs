/// Utility functions shared by the codecs, client and server
///
/// ASCII field rendering, bit packing, word/byte conversion and the
/// performance counters recorded by the clients.

use std::time::{Duration, Instant};
use log::{debug, info, warn};
use crate::error::{PlcError, PlcResult};

/// Byte order of 16-bit words inside binary payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ByteOrder {
    /// Low byte first (MELSEC)
    LittleEndian,
    /// High byte first (Omron)
    BigEndian,
}

/// Performance metrics for PLC operations
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PerformanceMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful operation
    pub fn record_success(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_duration += duration;

        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));

        self.avg_duration = self.total_duration / self.total_requests as u32;
    }

    /// Record a failed operation
    pub fn record_failure(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.total_duration += duration;

        self.avg_duration = self.total_duration / self.total_requests as u32;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }

    /// Stop timer, log the outcome and fold it into `metrics`
    pub fn stop_and_record(self, success: bool, metrics: &mut PerformanceMetrics) -> Duration {
        let duration = self.start.elapsed();
        if success {
            info!("Operation '{}' succeeded in {:?}", self.operation_name, duration);
            metrics.record_success(duration);
        } else {
            warn!("Operation '{}' failed after {:?}", self.operation_name, duration);
            metrics.record_failure(duration);
        }
        duration
    }
}

/// ASCII field rendering and parsing
pub mod ascii {
    use super::*;

    /// Convert byte to 2-character uppercase ASCII hex
    ///
    /// ```text
    /// 0x01 -> "01"
    /// 0xFF -> "FF"
    /// ```
    pub fn byte_to_ascii_hex(byte: u8) -> [u8; 2] {
        let high = (byte >> 4) & 0x0F;
        let low = byte & 0x0F;
        [nibble_to_char(high), nibble_to_char(low)]
    }

    fn nibble_to_char(nibble: u8) -> u8 {
        if nibble < 10 {
            b'0' + nibble
        } else {
            b'A' + (nibble - 10)
        }
    }

    /// Convert single ASCII character to hex value
    pub fn ascii_char_to_hex(c: u8) -> PlcResult<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            _ => Err(PlcError::frame(format!("Invalid ASCII hex character: 0x{:02X}", c))),
        }
    }

    /// Convert 2-character ASCII hex to byte
    pub fn ascii_hex_to_byte(ascii: &[u8]) -> PlcResult<u8> {
        if ascii.len() != 2 {
            return Err(PlcError::frame("Invalid ASCII hex length"));
        }
        Ok((ascii_char_to_hex(ascii[0])? << 4) | ascii_char_to_hex(ascii[1])?)
    }

    /// Render `value` as fixed-width uppercase hex text
    pub fn hex_field(value: u32, width: usize) -> Vec<u8> {
        format!("{:0width$X}", value, width = width).into_bytes()
    }

    /// Render `value` as fixed-width decimal text
    pub fn dec_field(value: u32, width: usize) -> Vec<u8> {
        format!("{:0width$}", value, width = width).into_bytes()
    }

    /// [`hex_field`] that refuses values wider than `width` digits
    pub fn checked_hex_field(value: u32, width: usize, field: &str) -> PlcResult<Vec<u8>> {
        let text = hex_field(value, width);
        if text.len() > width {
            return Err(PlcError::invalid_data(format!(
                "{} 0x{:X} does not fit {} hex digits",
                field, value, width
            )));
        }
        Ok(text)
    }

    /// [`dec_field`] that refuses values wider than `width` digits
    pub fn checked_dec_field(value: u32, width: usize, field: &str) -> PlcResult<Vec<u8>> {
        let text = dec_field(value, width);
        if text.len() > width {
            return Err(PlcError::invalid_data(format!(
                "{} {} does not fit {} decimal digits",
                field, value, width
            )));
        }
        Ok(text)
    }

    /// Parse fixed-width hex text
    pub fn parse_hex_field(text: &[u8]) -> PlcResult<u32> {
        if text.is_empty() || text.len() > 8 {
            return Err(PlcError::frame(format!("Invalid hex field width {}", text.len())));
        }
        text.iter()
            .try_fold(0u32, |acc, &c| Ok((acc << 4) | ascii_char_to_hex(c)? as u32))
    }

    /// Parse fixed-width decimal text
    pub fn parse_dec_field(text: &[u8]) -> PlcResult<u32> {
        if text.is_empty() || text.len() > 9 {
            return Err(PlcError::frame(format!("Invalid decimal field width {}", text.len())));
        }
        text.iter().try_fold(0u32, |acc, &c| match c {
            b'0'..=b'9' => Ok(acc * 10 + (c - b'0') as u32),
            _ => Err(PlcError::frame(format!("Invalid decimal character: 0x{:02X}", c))),
        })
    }

    /// Expand binary word bytes into 4 hex chars per word
    pub fn words_to_ascii(bytes: &[u8], order: ByteOrder) -> PlcResult<Vec<u8>> {
        let words = words::bytes_to_words(bytes, order)?;
        let mut text = Vec::with_capacity(words.len() * 4);
        for word in words {
            text.extend_from_slice(&hex_field(word as u32, 4));
        }
        Ok(text)
    }

    /// Collapse 4 hex chars per word back into binary word bytes
    pub fn ascii_to_words(text: &[u8], order: ByteOrder) -> PlcResult<Vec<u8>> {
        if text.len() % 4 != 0 {
            return Err(PlcError::frame(format!("ASCII word data length {} is not a multiple of 4", text.len())));
        }
        let mut values = Vec::with_capacity(text.len() / 4);
        for chunk in text.chunks(4) {
            values.push(parse_hex_field(chunk)? as u16);
        }
        Ok(words::words_to_bytes(&values, order))
    }

    /// One `'1'`/`'0'` character per bit
    pub fn bits_to_ascii(bits: &[bool]) -> Vec<u8> {
        bits.iter().map(|&b| if b { b'1' } else { b'0' }).collect()
    }

    /// Parse `'1'`/`'0'` characters back into bits
    pub fn ascii_to_bits(text: &[u8]) -> PlcResult<Vec<bool>> {
        text.iter()
            .map(|&c| match c {
                b'1' => Ok(true),
                b'0' => Ok(false),
                _ => Err(PlcError::frame(format!("Invalid bit character: 0x{:02X}", c))),
            })
            .collect()
    }
}

/// Bit packing used on the wire
pub mod bits {
    /// Pack two bits per byte using the high (0x10) and low (0x01) nibble flags
    pub fn pack_nibbles(bits: &[bool]) -> Vec<u8> {
        bits.chunks(2)
            .map(|pair| {
                let mut byte = 0u8;
                if pair[0] {
                    byte |= 0x10;
                }
                if pair.len() > 1 && pair[1] {
                    byte |= 0x01;
                }
                byte
            })
            .collect()
    }

    /// Unpack nibble-flag bytes into `count` bits
    pub fn unpack_nibbles(bytes: &[u8], count: usize) -> Vec<bool> {
        bytes.iter()
            .flat_map(|&b| [b & 0x10 != 0, b & 0x01 != 0])
            .take(count)
            .collect()
    }

    /// One byte per bit (0x00 / 0x01)
    pub fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
        bits.iter().map(|&b| b as u8).collect()
    }

    /// Any non-zero byte is a set bit
    pub fn bytes_to_bits(bytes: &[u8]) -> Vec<bool> {
        bytes.iter().map(|&b| b != 0).collect()
    }
}

/// Word / byte conversion
pub mod words {
    use super::*;

    /// Convert word values to bytes in the given order
    pub fn words_to_bytes(words: &[u16], order: ByteOrder) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(words.len() * 2);
        for &word in words {
            match order {
                ByteOrder::LittleEndian => bytes.extend_from_slice(&word.to_le_bytes()),
                ByteOrder::BigEndian => bytes.extend_from_slice(&word.to_be_bytes()),
            }
        }
        bytes
    }

    /// Convert bytes to word values in the given order
    pub fn bytes_to_words(bytes: &[u8], order: ByteOrder) -> PlcResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(PlcError::invalid_data("Byte array length must be even"));
        }
        Ok(bytes.chunks(2)
            .map(|chunk| match order {
                ByteOrder::LittleEndian => u16::from_le_bytes([chunk[0], chunk[1]]),
                ByteOrder::BigEndian => u16::from_be_bytes([chunk[0], chunk[1]]),
            })
            .collect())
    }
}

/// Formatting and display utilities
pub mod format {
    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Printable rendering of an ASCII frame, control bytes shown as `<XX>`
    pub fn bytes_to_text(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|&b| {
                if (0x20..0x7F).contains(&b) {
                    (b as char).to_string()
                } else {
                    format!("<{:02X}>", b)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performance_metrics() {
        let mut metrics = PerformanceMetrics::new();

        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(200));
        metrics.record_failure(Duration::from_millis(150));

        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(100)));
        assert!((metrics.success_rate() - 66.67).abs() < 0.1);
    }

    #[test]
    fn test_ascii_hex_conversion() {
        assert_eq!(ascii::byte_to_ascii_hex(0x01), *b"01");
        assert_eq!(ascii::byte_to_ascii_hex(0xAF), *b"AF");
        assert_eq!(ascii::ascii_hex_to_byte(b"fe").unwrap(), 0xFE);
        assert!(ascii::ascii_hex_to_byte(b"G0").is_err());

        assert_eq!(ascii::hex_field(0x3FF, 4), b"03FF".to_vec());
        assert_eq!(ascii::dec_field(100, 6), b"000100".to_vec());
        assert_eq!(ascii::parse_hex_field(b"00000064").unwrap(), 100);
        assert_eq!(ascii::parse_dec_field(b"0100").unwrap(), 100);
        assert!(ascii::parse_dec_field(b"01A0").is_err());
    }

    #[test]
    fn test_checked_fields() {
        assert_eq!(ascii::checked_dec_field(999_999, 6, "start").unwrap(), b"999999".to_vec());
        assert!(matches!(
            ascii::checked_dec_field(1_000_000, 6, "start"),
            Err(PlcError::InvalidData { .. })
        ));
        assert_eq!(ascii::checked_hex_field(0xFFFF, 4, "count").unwrap(), b"FFFF".to_vec());
        assert!(ascii::checked_hex_field(0x10000, 4, "count").is_err());
    }

    #[test]
    fn test_ascii_words() {
        let bytes = vec![0x34, 0x12, 0xCD, 0xAB];
        let text = ascii::words_to_ascii(&bytes, ByteOrder::LittleEndian).unwrap();
        assert_eq!(text, b"1234ABCD".to_vec());
        assert_eq!(ascii::ascii_to_words(&text, ByteOrder::LittleEndian).unwrap(), bytes);
        assert!(ascii::ascii_to_words(b"123", ByteOrder::BigEndian).is_err());
    }

    #[test]
    fn test_nibble_packing() {
        let values = vec![true, false, false, true, true];
        let packed = bits::pack_nibbles(&values);
        assert_eq!(packed, vec![0x10, 0x01, 0x10]);
        assert_eq!(bits::unpack_nibbles(&packed, values.len()), values);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::bytes_to_hex(&[0x01, 0x03, 0x10, 0xFF]), "01 03 10 FF");
        assert_eq!(format::bytes_to_text(b"@00RD\r"), "@00RD<0D>");
    }
}
