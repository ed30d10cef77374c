//! Input and output byte buffers backing every connection.
//!
//! The input buffer accumulates bytes read off a socket until a full
//! frame is available; it always starts at a message boundary. The
//! output buffer is a FIFO of framed messages awaiting transmission,
//! with support for bumping priority traffic ahead of queued frames.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::mesh::error::*;

/// Bytes received from a peer, in arrival order.
///
/// Stored as a sequence of owned chunks, one per socket read; peeking
/// coalesces head chunks in place, so repeated header previews of the
/// same message do not copy twice.
pub struct InputBuffer {
    chunks: VecDeque<Vec<u8>>,
    length: usize,
}

impl InputBuffer {
    pub fn new() -> Self {
        InputBuffer {
            chunks: VecDeque::new(),
            length: 0,
        }
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Appends bytes read from the socket.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.length += bytes.len();
        self.chunks.push_back(bytes.to_vec());
    }

    /// Returns the first `n` bytes without consuming them.
    ///
    /// Chunks are merged from the head until the first one holds at
    /// least `n` bytes; their relative order never changes.
    pub fn peek(&mut self, n: usize) -> Result<&[u8]> {
        if n > self.length {
            return Err("Not enough bytes in input buffer to peek").wrapped(ErrorKind::Buffers);
        }
        if n == 0 {
            return Ok(&[]);
        }
        self.coalesce_head(n);
        Ok(&self.chunks[0][..n])
    }

    /// Removes and returns the first `n` bytes.
    ///
    /// The caller is responsible for only ever removing whole frames,
    /// keeping the buffer aligned on a message boundary.
    pub fn remove(&mut self, n: usize) -> Result<Vec<u8>> {
        if n > self.length {
            return Err("Not enough bytes in input buffer to remove").wrapped(ErrorKind::Buffers);
        }
        if n == 0 {
            return Ok(Vec::new());
        }
        self.coalesce_head(n);
        self.length -= n;
        let head = &mut self.chunks[0];
        let bytes = if head.len() == n {
            self.chunks.pop_front().unwrap_or_default()
        } else {
            let rest = head.split_off(n);
            std::mem::replace(head, rest)
        };
        Ok(bytes)
    }

    /// Copies out the bytes in `[lo, hi)`, which may span chunks.
    pub fn get_slice(&self, lo: usize, hi: usize) -> Result<SmallVec<[u8; 64]>> {
        if lo > hi || hi > self.length {
            return Err("Input buffer slice out of range").wrapped(ErrorKind::Buffers);
        }
        let mut out = SmallVec::new();
        let mut skip = lo;
        let mut take = hi - lo;
        for chunk in self.chunks.iter() {
            if take == 0 {
                break;
            }
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let avail = &chunk[skip..];
            skip = 0;
            let n = avail.len().min(take);
            out.extend_from_slice(&avail[..n]);
            take -= n;
        }
        Ok(out)
    }

    fn coalesce_head(&mut self, n: usize) {
        debug_assert!(n <= self.length);
        while self.chunks[0].len() < n {
            let next = self.chunks.remove(1).unwrap_or_default();
            self.chunks[0].extend_from_slice(&next);
        }
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Framed messages waiting to be written to a socket.
///
/// Frames leave in FIFO order; `prepend` raises a frame's priority
/// but never splits the frame currently going out on the wire.
pub struct OutputBuffer {
    frames: VecDeque<Vec<u8>>,
    // bytes of the head frame already written to the socket
    head_offset: usize,
    length: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        OutputBuffer {
            frames: VecDeque::new(),
            head_offset: 0,
            length: 0,
        }
    }

    /// Number of bytes not yet handed to the socket.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn has_more_bytes(&self) -> bool {
        self.length > 0
    }

    /// True when no frame is partially written.
    pub fn at_message_boundary(&self) -> bool {
        self.head_offset == 0
    }

    /// Queues a frame behind all pending traffic.
    pub fn enqueue(&mut self, frame: Vec<u8>) {
        self.length += frame.len();
        self.frames.push_back(frame);
    }

    /// Queues a frame ahead of pending traffic.
    ///
    /// If the head frame has bytes already on the wire, the new frame
    /// lands right after it instead, so the in-flight frame is never
    /// interleaved.
    pub fn prepend(&mut self, frame: Vec<u8>) {
        self.length += frame.len();
        if self.head_offset > 0 && !self.frames.is_empty() {
            self.frames.insert(1, frame);
        } else {
            self.frames.push_front(frame);
        }
    }

    /// Returns the unsent remainder of the head frame, or an empty
    /// slice when nothing is queued.
    pub fn head(&self) -> &[u8] {
        match self.frames.front() {
            Some(frame) => &frame[self.head_offset..],
            None => &[],
        }
    }

    /// Marks `n` bytes of the head frame as sent.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        let head_len = match self.frames.front() {
            Some(frame) => frame.len(),
            None if n == 0 => return Ok(()),
            None => return Err("Advanced past an empty output buffer").wrapped(ErrorKind::Buffers),
        };
        if self.head_offset + n > head_len {
            return Err("Advanced past the head frame boundary").wrapped(ErrorKind::Buffers);
        }
        self.head_offset += n;
        self.length -= n;
        if self.head_offset == head_len {
            self.frames.pop_front();
            self.head_offset = 0;
        }
        Ok(())
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_coalesces_across_chunks() {
        let mut buf = InputBuffer::new();
        buf.append(&[1, 2]);
        buf.append(&[3, 4, 5]);
        assert_eq!(&[1, 2, 3, 4][..], buf.peek(4).unwrap());
        // nothing was consumed
        assert_eq!(5, buf.len());
        assert_eq!(&[1, 2, 3, 4][..], buf.peek(4).unwrap());
    }

    #[test]
    fn test_remove_preserves_remainder() {
        let mut buf = InputBuffer::new();
        buf.append(&[1, 2, 3]);
        buf.append(&[4, 5]);
        assert_eq!(vec![1, 2, 3, 4], buf.remove(4).unwrap());
        assert_eq!(1, buf.len());
        assert_eq!(&[5][..], buf.peek(1).unwrap());
    }

    #[test]
    fn test_get_slice_spans_chunks() {
        let mut buf = InputBuffer::new();
        buf.append(&[1, 2, 3]);
        buf.append(&[4, 5, 6]);
        let slice = buf.get_slice(2, 5).unwrap();
        assert_eq!(&[3, 4, 5][..], &slice[..]);
        assert!(buf.get_slice(2, 7).is_err());
    }

    #[test]
    fn test_peek_past_end_fails() {
        let mut buf = InputBuffer::new();
        buf.append(&[1]);
        assert!(buf.peek(2).is_err());
    }

    #[test]
    fn test_output_fifo_order() {
        let mut buf = OutputBuffer::new();
        buf.enqueue(vec![1, 2]);
        buf.enqueue(vec![3]);
        assert_eq!(&[1, 2][..], buf.head());
        buf.advance(2).unwrap();
        assert_eq!(&[3][..], buf.head());
        buf.advance(1).unwrap();
        assert!(!buf.has_more_bytes());
    }

    #[test]
    fn test_prepend_at_boundary_goes_first() {
        let mut buf = OutputBuffer::new();
        buf.enqueue(vec![1, 2]);
        buf.prepend(vec![9]);
        assert_eq!(&[9][..], buf.head());
    }

    #[test]
    fn test_prepend_never_splits_partial_head() {
        let mut buf = OutputBuffer::new();
        buf.enqueue(vec![1, 2, 3]);
        buf.enqueue(vec![4]);
        buf.advance(1).unwrap();
        assert!(!buf.at_message_boundary());
        buf.prepend(vec![9]);
        // in-flight frame finishes first, then the priority frame
        assert_eq!(&[2, 3][..], buf.head());
        buf.advance(2).unwrap();
        assert_eq!(&[9][..], buf.head());
        buf.advance(1).unwrap();
        assert_eq!(&[4][..], buf.head());
    }

    #[test]
    fn test_advance_past_frame_boundary_fails() {
        let mut buf = OutputBuffer::new();
        buf.enqueue(vec![1, 2]);
        assert!(buf.advance(3).is_err());
        assert!(buf.advance(2).is_ok());
    }
}
