//! 8-bit frame checksums rendered as two ASCII hex characters
//!
//! MELSEC serial formats use an additive sum, Omron HostLink an XOR "FCS".
//! Both cover a caller-chosen byte range and are carried as two uppercase
//! hex characters.

use serde::{Deserialize, Serialize};

use crate::error::{PlcError, PlcResult};
use crate::utils::ascii;

/// Checksum algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumKind {
    /// Additive sum modulo 256
    Sum8,
    /// Bytewise XOR
    Xor8,
}

impl ChecksumKind {
    /// Compute the checksum over `data`
    pub fn compute(self, data: &[u8]) -> u8 {
        match self {
            ChecksumKind::Sum8 => data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)),
            ChecksumKind::Xor8 => data.iter().fold(0u8, |acc, &b| acc ^ b),
        }
    }

    /// Compute and append the two hex characters covering `frame[start..]`
    pub fn append(self, frame: &mut Vec<u8>, start: usize) {
        let value = self.compute(frame.get(start..).unwrap_or_default());
        frame.extend_from_slice(&ascii::byte_to_ascii_hex(value));
    }

    /// Write the checksum of `frame[range]` at `offset`, overwriting or extending
    pub fn build(self, frame: &mut Vec<u8>, range: std::ops::Range<usize>, offset: usize) -> PlcResult<()> {
        let covered = frame
            .get(range.clone())
            .ok_or_else(|| PlcError::invalid_data(format!("checksum range {:?} outside frame of {} bytes", range, frame.len())))?;
        let text = ascii::byte_to_ascii_hex(self.compute(covered));
        if offset > frame.len() {
            return Err(PlcError::invalid_data(format!("checksum offset {} past frame end {}", offset, frame.len())));
        }
        if frame.len() < offset + 2 {
            frame.resize(offset + 2, 0);
        }
        frame[offset..offset + 2].copy_from_slice(&text);
        Ok(())
    }

    /// Recompute over `frame[range]` and compare with the characters at `offset`
    pub fn verify(self, frame: &[u8], range: std::ops::Range<usize>, offset: usize) -> bool {
        self.check(frame, range, offset).is_ok()
    }

    /// Like [`verify`](Self::verify) but reports the mismatching values
    pub fn check(self, frame: &[u8], range: std::ops::Range<usize>, offset: usize) -> PlcResult<()> {
        let covered = frame
            .get(range)
            .ok_or_else(|| PlcError::short_response(offset + 2, frame.len()))?;
        let carried = frame
            .get(offset..offset + 2)
            .ok_or_else(|| PlcError::short_response(offset + 2, frame.len()))?;
        let expected = self.compute(covered);
        let actual = ascii::ascii_hex_to_byte(carried)?;
        if expected != actual {
            return Err(PlcError::checksum_mismatch(expected, actual));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_and_xor() {
        assert_eq!(ChecksumKind::Sum8.compute(&[0xFF, 0x02]), 0x01);
        assert_eq!(ChecksumKind::Xor8.compute(&[0x12, 0x12]), 0);
        assert_eq!(ChecksumKind::Xor8.compute(&[0x40, 0x30, 0x30]), 0x40);
    }

    #[test]
    fn test_build_and_verify() {
        let mut frame = b"@00RD00000001".to_vec();
        let body = frame.len();
        ChecksumKind::Xor8.build(&mut frame, 0..body, body).unwrap();
        assert_eq!(frame.len(), body + 2);
        assert!(ChecksumKind::Xor8.verify(&frame, 0..body, body));

        // overwrite in place
        frame.extend_from_slice(b"*\r");
        frame[body] = b'0';
        frame[body + 1] = b'0';
        ChecksumKind::Xor8.build(&mut frame, 0..body, body).unwrap();
        assert!(ChecksumKind::Xor8.verify(&frame, 0..body, body));
        assert_eq!(&frame[body + 2..], b"*\r");
    }

    #[test]
    fn test_single_bit_flip_detected() {
        for kind in [ChecksumKind::Sum8, ChecksumKind::Xor8] {
            let mut frame = b"\x0500FF00WR0D*000100000A".to_vec();
            let body = frame.len();
            kind.build(&mut frame, 1..body, body).unwrap();
            assert!(kind.verify(&frame, 1..body, body));

            for index in 1..body {
                for bit in 0..8 {
                    let mut corrupted = frame.clone();
                    corrupted[index] ^= 1 << bit;
                    assert!(!kind.verify(&corrupted, 1..body, body), "{:?} missed flip at {}:{}", kind, index, bit);
                }
            }
        }
    }

    #[test]
    fn test_check_reports_values() {
        let frame = b"AB00".to_vec();
        match ChecksumKind::Sum8.check(&frame, 0..2, 2) {
            Err(PlcError::ChecksumMismatch { expected, actual }) => {
                assert_eq!(expected, b'A'.wrapping_add(b'B'));
                assert_eq!(actual, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(ChecksumKind::Sum8.check(&frame, 0..2, 3), Err(PlcError::ShortResponse { .. })));
    }
}
