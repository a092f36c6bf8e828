//! Byte accumulator for data that arrives in arbitrary fragments.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management. The parser uses
//! one of these to snapshot a partial argument line or payload when an input
//! chunk ends mid-frame, so the next chunk can resume without data loss.
//!
//! # Example
//!
//! ```
//! use natswire::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//! buffer.extend(b"hel");
//! buffer.extend(b"lo");
//! assert_eq!(buffer.view(), b"hello");
//! let head = buffer.take(4);
//! assert_eq!(&head[..], b"hell");
//! assert_eq!(buffer.view(), b"o");
//! ```

use bytes::{Bytes, BytesMut};

/// Growable byte accumulator with contiguous peek and front drain.
///
/// All data lives in a single `BytesMut`, so fragments appended across
/// multiple socket reads merge into one contiguous view on demand.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Create a buffer pre-sized for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Create a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
        }
    }

    /// Append bytes to the end of the buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Contiguous view over all buffered bytes.
    #[inline]
    pub fn view(&self) -> &[u8] {
        &self.buf
    }

    /// Drain the first `n` bytes out of the buffer (zero-copy freeze).
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` bytes are buffered.
    pub fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    /// Drain the whole buffer.
    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_merges_fragments() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(b"MSG foo");
        buffer.extend(b".bar 1 5");

        assert_eq!(buffer.view(), b"MSG foo.bar 1 5");
        assert_eq!(buffer.len(), 15);
    }

    #[test]
    fn test_take_drains_front() {
        let mut buffer = FrameBuffer::from_slice(b"headerbody");

        let head = buffer.take(6);
        assert_eq!(&head[..], b"header");
        assert_eq!(buffer.view(), b"body");
    }

    #[test]
    fn test_take_all_empties_buffer() {
        let mut buffer = FrameBuffer::from_slice(b"payload");

        let all = buffer.take_all();
        assert_eq!(&all[..], b"payload");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_all_on_empty_is_empty() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.take_all().is_empty());
    }

    #[test]
    fn test_clear_resets() {
        let mut buffer = FrameBuffer::from_slice(b"stale");
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        for b in b"hello" {
            buffer.extend(&[*b]);
        }
        assert_eq!(buffer.view(), b"hello");
    }

    #[test]
    fn test_binary_bytes_preserved() {
        let data: Vec<u8> = (0..=255).collect();
        let mut buffer = FrameBuffer::new();
        buffer.extend(&data);

        assert_eq!(buffer.view(), &data[..]);
        let out = buffer.take(256);
        assert_eq!(&out[..], &data[..]);
    }
}
