//! Bounded scrollback for replay on attach.
//!
//! Keeps the last N bytes of PTY output so that a reconnecting client
//! can redraw its screen without the server keeping unbounded history.

/// Default scrollback size per session (256 KiB).
pub const DEFAULT_SCROLLBACK_BYTES: usize = 256 * 1024;

/// A fixed-capacity circular byte buffer. Oldest bytes are evicted first.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Write position (wraps around).
    write_pos: usize,
    /// Total bytes ever written (used to detect wrap).
    total_written: u64,
}

impl ScrollbackBuffer {
    /// Create a new buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Append data, overwriting the oldest bytes once full.
    pub fn write(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;
        if self.capacity == 0 {
            return;
        }

        // Only the tail of an oversized chunk can survive.
        let data = if data.len() > self.capacity {
            let skipped = data.len() - self.capacity;
            self.write_pos = (self.write_pos + skipped) % self.capacity;
            &data[skipped..]
        } else {
            data
        };

        let first = (self.capacity - self.write_pos).min(data.len());
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buf[..rest].copy_from_slice(&data[first..]);
        self.write_pos = (self.write_pos + data.len()) % self.capacity;
    }

    /// Copy out the buffered bytes in emission order.
    pub fn snapshot(&self) -> Vec<u8> {
        let len = self.len();
        let mut result = Vec::with_capacity(len);

        if self.total_written <= self.capacity as u64 {
            // Haven't wrapped yet; data starts at 0.
            result.extend_from_slice(&self.buf[..len]);
        } else {
            // Wrapped; oldest data starts at write_pos.
            result.extend_from_slice(&self.buf[self.write_pos..]);
            result.extend_from_slice(&self.buf[..self.write_pos]);
        }

        result
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        if self.total_written >= self.capacity as u64 {
            self.capacity
        } else {
            self.total_written as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes ever written through this buffer.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_write_read() {
        let mut sb = ScrollbackBuffer::new(10);
        sb.write(b"hello");
        assert_eq!(sb.snapshot(), b"hello");
        assert_eq!(sb.len(), 5);
    }

    #[test]
    fn wrap_around() {
        let mut sb = ScrollbackBuffer::new(5);
        sb.write(b"abcde"); // fills exactly
        sb.write(b"fg"); // evicts a, b
        assert_eq!(sb.snapshot(), b"cdefg");
        assert_eq!(sb.len(), 5);
        assert_eq!(sb.total_written(), 7);
    }

    #[test]
    fn oversized_chunk_keeps_tail() {
        let mut sb = ScrollbackBuffer::new(4);
        sb.write(b"xy");
        sb.write(b"0123456789");
        assert_eq!(sb.snapshot(), b"6789");
        sb.write(b"ab");
        assert_eq!(sb.snapshot(), b"89ab");
    }

    #[test]
    fn matches_tail_of_full_stream() {
        // Uneven chunk sizes across several wraps.
        let stream: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut sb = ScrollbackBuffer::new(64);
        let mut offset = 0;
        let mut step = 1;
        while offset < stream.len() {
            let end = (offset + step).min(stream.len());
            sb.write(&stream[offset..end]);
            offset = end;
            step = step * 3 % 97 + 1;

            let expected = &stream[offset.saturating_sub(64)..offset];
            assert_eq!(sb.snapshot(), expected);
        }
    }

    #[test]
    fn empty_buffer() {
        let sb = ScrollbackBuffer::new(10);
        assert!(sb.is_empty());
        assert_eq!(sb.snapshot(), Vec::<u8>::new());
    }

    #[test]
    fn zero_capacity() {
        let mut sb = ScrollbackBuffer::new(0);
        sb.write(b"test");
        assert!(sb.is_empty());
        assert_eq!(sb.snapshot(), Vec::<u8>::new());
    }
}
