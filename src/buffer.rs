// Pushback FIFO sitting in front of a transport.

use bytes::{Buf, BufMut, BytesMut};

/// Byte FIFO holding data that was read speculatively off the wire and must
/// be handed back on the next read. Insertion order is preserved; the line
/// framer additionally prepends the unread tail of a chunk it split.
#[derive(Debug, Default)]
pub struct ByteQueue {
    buf: BytesMut,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Bytes currently readable.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append `src` at the tail.
    pub fn append(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        self.buf.put_slice(src);
    }

    /// Remove up to `dst.len()` bytes from the head into `dst`, returning
    /// how many were moved.
    pub fn take(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.buf.len());
        dst[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }

    /// Insert `src` in front of whatever is already queued.
    pub fn prepend(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        let mut next = BytesMut::with_capacity(src.len() + self.buf.len());
        next.put_slice(src);
        next.put_slice(&self.buf);
        self.buf = next;
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_appended_bytes_in_order() {
        let mut q = ByteQueue::new();
        q.append(b"abc");
        q.append(b"def");

        let mut dst = [0u8; 4];
        assert_eq!(q.take(&mut dst), 4);
        assert_eq!(&dst, b"abcd");
        assert_eq!(q.len(), 2);

        let mut rest = [0u8; 8];
        assert_eq!(q.take(&mut rest), 2);
        assert_eq!(&rest[..2], b"ef");
        assert!(q.is_empty());
    }

    #[test]
    fn interleaved_round_trip() {
        // Concatenation of takes equals concatenation of appends, truncated
        // to the number of bytes taken.
        let inputs: &[&[u8]] = &[b"one", b"", b"twothree", b"4", b"five!"];
        let mut q = ByteQueue::new();
        let mut fed = Vec::new();
        let mut got = Vec::new();

        for (i, chunk) in inputs.iter().enumerate() {
            q.append(chunk);
            fed.extend_from_slice(chunk);
            let mut dst = vec![0u8; i + 1];
            let n = q.take(&mut dst);
            got.extend_from_slice(&dst[..n]);
        }
        while !q.is_empty() {
            let mut dst = [0u8; 3];
            let n = q.take(&mut dst);
            got.extend_from_slice(&dst[..n]);
        }

        assert_eq!(got, fed);
    }

    #[test]
    fn prepend_goes_to_the_front() {
        let mut q = ByteQueue::new();
        q.append(b"tail");
        q.prepend(b"head ");

        let mut dst = [0u8; 9];
        assert_eq!(q.take(&mut dst), 9);
        assert_eq!(&dst, b"head tail");
    }

    #[test]
    fn take_from_empty_is_zero() {
        let mut q = ByteQueue::new();
        let mut dst = [0u8; 4];
        assert_eq!(q.take(&mut dst), 0);
    }

    #[test]
    fn clear_discards_everything() {
        let mut q = ByteQueue::new();
        q.append(b"data");
        q.clear();
        assert!(q.is_empty());
        let mut dst = [0u8; 4];
        assert_eq!(q.take(&mut dst), 0);
    }
}
