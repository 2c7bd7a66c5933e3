//! Fixed-capacity byte buffers used as TLS wrap/unwrap scratch space.
//!
//! A [`RecordBuf`] has a capacity, a position and a limit. In *fill mode*
//! (after [`RecordBuf::clear`] or [`RecordBuf::compact`]) the position is the
//! write cursor and the limit is the capacity. [`RecordBuf::flip`] switches to
//! *drain mode*, where `position..limit` is the readable data.

use std::fmt;

/// Byte buffer with position/limit cursors.
#[derive(Clone, PartialEq, Eq)]
pub struct RecordBuf {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl RecordBuf {
    /// Creates an empty buffer in fill mode.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            position: 0,
            limit: capacity,
        }
    }

    /// Creates a buffer in drain mode holding exactly `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            position: 0,
            limit: bytes.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes between position and limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// Moves the position. Panics if `position > limit`.
    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.limit, "position {position} beyond limit {}", self.limit);
        self.position = position;
    }

    /// Moves the limit, clamping the position. Panics if `limit > capacity`.
    pub fn set_limit(&mut self, limit: usize) {
        assert!(limit <= self.capacity(), "limit {limit} beyond capacity {}", self.capacity());
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
    }

    /// Empties the buffer and puts it in fill mode.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// Switches from fill mode to drain mode.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Moves the unread bytes to the front and switches to fill mode after them.
    pub fn compact(&mut self) {
        let remaining = self.remaining();
        self.data.copy_within(self.position..self.limit, 0);
        self.position = remaining;
        self.limit = self.capacity();
    }

    /// Advances the position by `n`. Panics if that would pass the limit.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance {n} past remaining {}", self.remaining());
        self.position += n;
    }

    /// The bytes between position and limit.
    pub fn chunk(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    /// The writable bytes between position and limit.
    pub fn chunk_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.position..self.limit]
    }

    /// Copies `src` at the position. Panics if `src` does not fit.
    pub fn put_slice(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.remaining(),
            "put of {} bytes overflows remaining {}",
            src.len(),
            self.remaining()
        );
        self.data[self.position..self.position + src.len()].copy_from_slice(src);
        self.position += src.len();
    }
}

impl fmt::Debug for RecordBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordBuf")
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Replaces `buf` with one of at least double its capacity.
///
/// The new capacity is the larger of `2 * capacity` and `min_len` (and never
/// zero). When `flip_before_copy` is set, `buf` is flipped first so that the
/// bytes written so far are carried over; otherwise `position..limit` is
/// carried over as-is. The replacement is left in fill mode, positioned after
/// the copied bytes.
pub fn grow(buf: &mut RecordBuf, flip_before_copy: bool, min_len: usize) {
    let capacity = buf.capacity().saturating_mul(2).max(min_len).max(1);
    if flip_before_copy {
        buf.flip();
    }
    let mut grown = RecordBuf::with_capacity(capacity);
    grown.put_slice(buf.chunk());
    *buf = grown;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_and_compact_track_cursors() {
        let mut buf = RecordBuf::with_capacity(8);
        buf.put_slice(b"abcde");
        buf.flip();
        assert_eq!(buf.chunk(), b"abcde");

        buf.advance(3);
        buf.compact();
        assert_eq!(buf.position(), 2);
        assert_eq!(buf.limit(), 8);

        buf.flip();
        assert_eq!(buf.chunk(), b"de");
    }

    #[test]
    fn grow_with_flip_keeps_written_bytes() {
        let mut buf = RecordBuf::with_capacity(4);
        buf.put_slice(b"wxyz");

        grow(&mut buf, true, 0);

        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.position(), 4);
        buf.flip();
        assert_eq!(buf.chunk(), b"wxyz");
    }

    #[test]
    fn grow_without_flip_keeps_unread_bytes() {
        let mut buf = RecordBuf::from_slice(b"0123456789");
        buf.advance(6);

        grow(&mut buf, false, 0);

        assert_eq!(buf.capacity(), 20);
        buf.flip();
        assert_eq!(buf.chunk(), b"6789");
    }

    #[test]
    fn grow_honours_minimum_and_never_shrinks() {
        let mut buf = RecordBuf::with_capacity(16);
        grow(&mut buf, true, 100);
        assert_eq!(buf.capacity(), 100);

        let mut empty = RecordBuf::with_capacity(0);
        grow(&mut empty, true, 0);
        assert_eq!(empty.capacity(), 1);
    }
}
