//! Reassembly buffer for length-prefixed messages.
//!
//! A [`FramingBuffer`] accumulates raw stream chunks and recognizes complete
//! frames in them. The owning read loop writes into [`free_space`], advances
//! the cursor with [`track_data`], drains every recognized message, and grows
//! the region when a partial frame no longer fits.
//!
//! [`free_space`]: FramingBuffer::free_space
//! [`track_data`]: FramingBuffer::track_data

use tracing::{debug, trace};

use crate::error::WireError;
use crate::frame::{declared_len, HEADER_SIZE};

/// Initial capacity used when none is configured
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Growable contiguous buffer that reassembles length-prefixed frames.
///
/// Two cursors partition the region: `start` points at the oldest unconsumed
/// byte, `data_end` at the end of written data. The invariant
/// `start <= data_end <= capacity` holds at every public method boundary.
#[derive(Debug)]
pub struct FramingBuffer {
    data: Vec<u8>,
    start: usize,
    data_end: usize,
}

impl FramingBuffer {
    /// Create a buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(HEADER_SIZE)],
            start: 0,
            data_end: 0,
        }
    }

    /// Total capacity of the underlying region.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unconsumed bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.data_end - self.start
    }

    /// True when no free space remains for further reads.
    pub fn is_full(&self) -> bool {
        self.data_end == self.data.len()
    }

    /// Writable tail of the region, from `data_end` to capacity.
    ///
    /// The caller reads stream bytes into this slice and then calls
    /// [`track_data`](Self::track_data) with the number of bytes written.
    pub fn free_space(&mut self) -> &mut [u8] {
        &mut self.data[self.data_end..]
    }

    /// Advance `data_end` after `n` bytes were written into free space.
    pub fn track_data(&mut self, n: usize) -> Result<(), WireError> {
        let free = self.data.len() - self.data_end;
        if n > free {
            return Err(WireError::Overrun(n, free));
        }
        self.data_end += n;
        trace!(tracked = n, buffered = self.buffered(), "tracked stream data");
        Ok(())
    }

    /// Copy `bytes` into free space and track them in one step.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let free = self.data.len() - self.data_end;
        if bytes.len() > free {
            return Err(WireError::Write(bytes.len(), free));
        }
        self.data[self.data_end..self.data_end + bytes.len()].copy_from_slice(bytes);
        self.data_end += bytes.len();
        Ok(())
    }

    /// Declared body length of the frame at `start`, once its header is
    /// fully buffered. `None` while fewer than [`HEADER_SIZE`] bytes remain.
    pub fn pending_message_len(&self) -> Option<usize> {
        if self.buffered() < HEADER_SIZE {
            return None;
        }
        Some(declared_len(&self.data[self.start..]))
    }

    /// True when a full header and body are buffered at `start`.
    pub fn contains_full_message(&self) -> bool {
        match self.pending_message_len() {
            Some(len) => self.buffered() >= HEADER_SIZE + len,
            None => false,
        }
    }

    /// The recognized message body, or an empty slice while incomplete.
    pub fn message(&self) -> &[u8] {
        match self.pending_message_len() {
            Some(len) if self.buffered() >= HEADER_SIZE + len => {
                let body = self.start + HEADER_SIZE;
                &self.data[body..body + len]
            }
            _ => &[],
        }
    }

    /// Drop the currently recognized message and reclaim free space.
    ///
    /// Advances `start` past the frame, then compacts the remaining bytes to
    /// the front of the region unless another complete frame is already
    /// addressable (that one will be consumed and reset first).
    pub fn reset(&mut self) {
        if let Some(len) = self.pending_message_len() {
            if self.buffered() >= HEADER_SIZE + len {
                self.start += HEADER_SIZE + len;
            }
        }

        if !self.contains_full_message() && self.start > 0 {
            self.data.copy_within(self.start..self.data_end, 0);
            self.data_end -= self.start;
            self.start = 0;
            trace!(buffered = self.buffered(), "compacted framing buffer");
        }
    }

    /// Double the capacity, preserving buffered bytes and cursors.
    ///
    /// Only valid when the buffer [`is_full`](Self::is_full); callers invoke
    /// it when a partial frame cannot complete within the current region.
    pub fn grow(&mut self) -> Result<(), WireError> {
        if !self.is_full() {
            return Err(WireError::NotFull);
        }
        let new_capacity = self.data.len() * 2;
        debug!(
            old = self.data.len(),
            new = new_capacity,
            "growing framing buffer"
        );
        self.data.resize(new_capacity, 0);
        Ok(())
    }
}

impl Default for FramingBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_small_exact_message() {
        let mut buf = FramingBuffer::with_capacity(10);
        buf.write(&[2, 0, 0, 0, 1, 3]).unwrap();

        assert!(buf.contains_full_message());
        assert_eq!(buf.message(), &[1, 3]);
        assert_eq!(buf.free_space().len(), 10 - 4 - 2);
    }

    #[test]
    fn test_header_only_message_is_valid() {
        let mut buf = FramingBuffer::with_capacity(8);
        buf.write(&[0, 0, 0, 0]).unwrap();

        assert!(buf.contains_full_message());
        assert_eq!(buf.message(), &[] as &[u8]);

        buf.reset();
        assert!(!buf.contains_full_message());
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn test_incomplete_message_reports_empty() {
        let mut buf = FramingBuffer::with_capacity(16);
        buf.write(&[5, 0, 0, 0, 1, 2]).unwrap();

        assert!(!buf.contains_full_message());
        assert_eq!(buf.message(), &[] as &[u8]);
        assert_eq!(buf.pending_message_len(), Some(5));
    }

    #[test]
    fn test_reset_preserves_partial_follower() {
        let mut buf = FramingBuffer::with_capacity(16);
        // Full message A [1, 3], then header of B (len 3) plus one body byte.
        buf.write(&[2, 0, 0, 0, 1, 3]).unwrap();
        buf.write(&[3, 0, 0, 0, 7]).unwrap();

        assert_eq!(buf.message(), &[1, 3]);
        buf.reset();

        // B's bytes moved to the front, free space is the whole tail.
        assert_eq!(buf.pending_message_len(), Some(3));
        assert!(!buf.contains_full_message());
        assert_eq!(buf.free_space().len(), 16 - 5);

        buf.write(&[8, 9]).unwrap();
        assert_eq!(buf.message(), &[7, 8, 9]);
    }

    #[test]
    fn test_reset_keeps_next_message_addressable() {
        let mut buf = FramingBuffer::with_capacity(32);
        buf.write(&[1, 0, 0, 0, 0xAA]).unwrap();
        buf.write(&[2, 0, 0, 0, 0xBB, 0xCC]).unwrap();

        assert_eq!(buf.message(), &[0xAA]);
        buf.reset();
        assert_eq!(buf.message(), &[0xBB, 0xCC]);
        buf.reset();
        assert_eq!(buf.buffered(), 0);
        assert_eq!(buf.free_space().len(), 32);
    }

    #[test]
    fn test_track_data_rejects_overrun() {
        let mut buf = FramingBuffer::with_capacity(4);
        assert!(matches!(buf.track_data(5), Err(WireError::Overrun(5, 4))));
        buf.track_data(4).unwrap();
        assert!(buf.is_full());
    }

    #[test]
    fn test_grow_requires_full_buffer() {
        let mut buf = FramingBuffer::with_capacity(6);
        assert!(matches!(buf.grow(), Err(WireError::NotFull)));

        // Partial frame fills the region entirely.
        buf.write(&[8, 0, 0, 0, 1, 2]).unwrap();
        assert!(buf.is_full());
        assert!(!buf.contains_full_message());

        buf.grow().unwrap();
        assert_eq!(buf.capacity(), 12);
        assert_eq!(buf.pending_message_len(), Some(8));

        buf.write(&[3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(buf.message(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_random_chunking_round_trips_in_order() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        let messages: Vec<Vec<u8>> = (0..64)
            .map(|_| {
                let len = rng.gen_range(0..200);
                (0..len).map(|_| rng.gen()).collect()
            })
            .collect();

        let mut stream = Vec::new();
        for msg in &messages {
            stream.extend_from_slice(&encode_frame(msg, usize::MAX).unwrap());
        }

        let mut buf = FramingBuffer::with_capacity(8);
        let mut recovered = Vec::new();
        let mut offset = 0;

        while recovered.len() < messages.len() {
            while buf.contains_full_message() {
                recovered.push(buf.message().to_vec());
                buf.reset();
            }
            if offset >= stream.len() {
                break;
            }
            if buf.is_full() {
                buf.grow().unwrap();
            }
            // Arbitrary chunk sizes, including single bytes.
            let chunk = rng.gen_range(1..=16).min(stream.len() - offset);
            let room = buf.free_space().len().min(chunk);
            buf.write(&stream[offset..offset + room]).unwrap();
            offset += room;
        }
        while buf.contains_full_message() {
            recovered.push(buf.message().to_vec());
            buf.reset();
        }

        assert_eq!(recovered, messages);
    }
}
