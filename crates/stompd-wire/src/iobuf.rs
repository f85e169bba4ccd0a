use std::io::{Read, Write};

use stompd_util::ByteString;

/// Windowed byte buffer bridging sockets and the frame codec.
///
/// The readable region is `data[position .. position + length]`; everything
/// after it is slack for appends. Invariant: `position + length <= capacity`.
/// Growth is geometric and writers never fail for lack of space; a `max_size`
/// cap is a future extension.
pub struct IoBuf {
    data: Vec<u8>,
    position: usize,
    length: usize,
}

impl IoBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: vec![0; capacity.max(1)], position: 0, length: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    fn slack(&self) -> usize {
        self.data.len() - self.position - self.length
    }

    /// The readable region.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.position..self.position + self.length]
    }

    /// Byte at `index` relative to the read cursor.
    pub fn byte_at(&self, index: usize) -> Option<u8> {
        if index >= self.length {
            return None;
        }
        Some(self.data[self.position + index])
    }

    /// Position of `byte` relative to the read cursor.
    pub fn find_byte(&self, byte: u8) -> Option<usize> {
        self.as_slice().iter().position(|&b| b == byte)
    }

    /// Like [`find_byte`](Self::find_byte) but only searches the first `end`
    /// readable bytes.
    pub fn find_byte_before(&self, byte: u8, end: usize) -> Option<usize> {
        let end = end.min(self.length);
        self.as_slice()[..end].iter().position(|&b| b == byte)
    }

    /// Moves the readable region to offset zero.
    pub fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        self.data.copy_within(self.position..self.position + self.length, 0);
        self.position = 0;
    }

    /// Guarantees at least `wanted` bytes of slack, growing geometrically
    /// (at least doubling) when short.
    pub fn ensure_slack(&mut self, wanted: usize) {
        if self.slack() >= wanted {
            return;
        }
        let target = self.data.len() + (wanted - self.slack());
        let new_size = (self.data.len() * 2).max(target);
        self.data.resize(new_size, 0);
        self.compact();
    }

    pub fn push_byte(&mut self, byte: u8) {
        self.ensure_slack(1);
        self.data[self.position + self.length] = byte;
        self.length += 1;
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.ensure_slack(bytes.len());
        let start = self.position + self.length;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.length += bytes.len();
    }

    /// Appends `len` readable bytes starting at `start` (relative to the read
    /// cursor) to `out`, without consuming them.
    pub fn copy_range_into(&self, start: usize, len: usize, out: &mut ByteString) {
        let from = self.position + start;
        out.extend_from_slice(&self.data[from..from + len]);
    }

    /// Discards `count` bytes from the reader side. Draining the buffer
    /// completely resets both cursors to zero.
    pub fn consume(&mut self, count: usize) {
        if count < self.length {
            self.position += count;
            self.length -= count;
        } else {
            self.position = 0;
            self.length = 0;
        }
    }

    /// Reads up to `max` bytes from `src` into the slack. Returns `Ok(0)` on
    /// EOF; `WouldBlock` is passed through for the caller to classify.
    pub fn read_from<R: Read>(&mut self, src: &mut R, max: usize) -> std::io::Result<usize> {
        self.ensure_slack(max);
        let start = self.position + self.length;
        let count = src.read(&mut self.data[start..start + max])?;
        self.length += count;
        Ok(count)
    }

    /// Writes up to `max` readable bytes into `dst`, consuming what was
    /// accepted.
    pub fn write_to<W: Write>(&mut self, dst: &mut W, max: usize) -> std::io::Result<usize> {
        let count = max.min(self.length);
        if count == 0 {
            return Ok(0);
        }
        let written = dst.write(&self.data[self.position..self.position + count])?;
        self.position += written;
        self.length -= written;
        if self.length == 0 {
            self.position = 0;
        }
        Ok(written)
    }
}
