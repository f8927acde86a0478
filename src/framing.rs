//! Frame boundary detection over a byte stream
//!
//! Codecs report how far a buffer is from holding one complete frame
//! ([`FrameProgress`]); [`FrameBuffer`] accumulates reads and splits frames
//! off as they complete. Serial framings may also ask for leading garbage to
//! be discarded before a start marker.

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use crate::error::{PlcError, PlcResult};
use crate::utils::format::bytes_to_hex;

/// Default upper bound on buffered bytes before the stream is declared garbled
pub const DEFAULT_FRAME_LIMIT: usize = 16 * 1024;

/// Result of inspecting a partially received buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameProgress {
    /// Not complete yet; at least this many more bytes are needed (1 when unknown)
    NeedMore(usize),
    /// A complete frame occupies the first `n` bytes
    Complete(usize),
    /// The first `n` bytes can never start a frame and must be dropped
    Discard(usize),
}

/// Length-field framing: `header_len` bytes are needed to learn the total size
///
/// `total` receives the header and returns the full frame length.
pub fn by_length<F>(buf: &[u8], header_len: usize, total: F) -> PlcResult<FrameProgress>
where
    F: FnOnce(&[u8]) -> PlcResult<usize>,
{
    if buf.len() < header_len {
        return Ok(FrameProgress::NeedMore(header_len - buf.len()));
    }
    let total = total(&buf[..header_len])?;
    if total < header_len {
        return Err(PlcError::frame(format!("length field gives {} bytes, header alone is {}", total, header_len)));
    }
    if buf.len() < total {
        Ok(FrameProgress::NeedMore(total - buf.len()))
    } else {
        Ok(FrameProgress::Complete(total))
    }
}

/// Number of leading bytes that precede the first start marker
///
/// Returns `None` when `buf[0]` is already a start marker.
pub fn garbage_before(buf: &[u8], markers: &[u8]) -> Option<usize> {
    match buf.iter().position(|b| markers.contains(b)) {
        Some(0) => None,
        Some(pos) => Some(pos),
        None if buf.is_empty() => None,
        None => Some(buf.len()),
    }
}

/// End index (exclusive) of the first `terminator` found at or after `from`
pub fn find_terminator(buf: &[u8], from: usize, terminator: &[u8]) -> Option<usize> {
    if terminator.is_empty() || buf.len() < from + terminator.len() {
        return None;
    }
    buf[from..]
        .windows(terminator.len())
        .position(|w| w == terminator)
        .map(|pos| from + pos + terminator.len())
}

/// Accumulates stream bytes and yields complete frames
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    limit: usize,
    discarded: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_LIMIT)
    }
}

impl FrameBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(512),
            limit,
            discarded: 0,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes dropped as garbage since creation
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Split off the next complete frame, if any
    ///
    /// `Ok(None)` means more input is needed. A buffer that grows past the
    /// limit without completing a frame is an error.
    pub fn next_frame<F>(&mut self, mut progress: F) -> PlcResult<Option<Bytes>>
    where
        F: FnMut(&[u8]) -> PlcResult<FrameProgress>,
    {
        loop {
            if self.buf.is_empty() {
                return Ok(None);
            }
            match progress(&self.buf[..])? {
                FrameProgress::Complete(n) => return Ok(Some(self.buf.split_to(n).freeze())),
                FrameProgress::Discard(n) => {
                    let n = n.min(self.buf.len()).max(1);
                    debug!("discarding {} garbage bytes: {}", n, bytes_to_hex(&self.buf[..n]));
                    self.buf.advance(n);
                    self.discarded += n;
                }
                FrameProgress::NeedMore(_) => {
                    if self.buf.len() > self.limit {
                        return Err(PlcError::frame(format!(
                            "{} bytes buffered without a complete frame",
                            self.buf.len()
                        )));
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminated(buf: &[u8]) -> PlcResult<FrameProgress> {
        if let Some(n) = garbage_before(buf, b"@") {
            return Ok(FrameProgress::Discard(n));
        }
        Ok(match find_terminator(buf, 1, b"*\r") {
            Some(end) => FrameProgress::Complete(end),
            None => FrameProgress::NeedMore(1),
        })
    }

    #[test]
    fn test_by_length() {
        let total = |h: &[u8]| -> PlcResult<usize> { Ok(2 + h[1] as usize) };
        assert_eq!(by_length(&[0x00], 2, total).unwrap(), FrameProgress::NeedMore(1));
        assert_eq!(by_length(&[0x00, 0x03, 1], 2, total).unwrap(), FrameProgress::NeedMore(2));
        assert_eq!(by_length(&[0x00, 0x01, 1, 9], 2, total).unwrap(), FrameProgress::Complete(3));
    }

    #[test]
    fn test_terminator_scan() {
        assert_eq!(find_terminator(b"@00RD*\r", 1, b"*\r"), Some(7));
        assert_eq!(find_terminator(b"@00RD*", 1, b"*\r"), None);
        assert_eq!(garbage_before(b"xx@", b"@"), Some(2));
        assert_eq!(garbage_before(b"@", b"@"), None);
        assert_eq!(garbage_before(b"xyz", b"@"), Some(3));
    }

    #[test]
    fn test_frame_buffer_garbled_prefix() {
        let mut buffer = FrameBuffer::default();
        buffer.extend(b"\xFF\x00@00RD");
        assert!(buffer.next_frame(terminated).unwrap().is_none());
        assert_eq!(buffer.discarded(), 2);

        buffer.extend(b"0000*\r@01");
        let frame = buffer.next_frame(terminated).unwrap().unwrap();
        assert_eq!(&frame[..], b"@00RD0000*\r");
        assert_eq!(buffer.as_slice(), b"@01");
    }

    #[test]
    fn test_frame_buffer_limit() {
        let mut buffer = FrameBuffer::new(8);
        buffer.extend(b"@0123456789");
        assert!(buffer.next_frame(terminated).is_err());
    }
}
