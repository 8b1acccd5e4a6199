//! Growable byte queue for Connection's input/output paths. Grounded on
//! §3/§4.7 and muduo's `Buffer.h`.

use std::io::{self, IoSliceMut};
use std::os::unix::io::RawFd;

const INITIAL_SIZE: usize = 1024;
const PREPEND_SIZE: usize = 8;
/// Secondary scatter-read region: lets one `readv` absorb up to this much
/// above the buffer's current writable space, so a single syscall always
/// drains the socket regardless of how much is queued.
const EXTRA_BUF_SIZE: usize = 65536;

/// A byte queue with a reserved prepend region ahead of the readable
/// bytes, so a length-prefix header can be stitched on without a memmove,
/// plus a single-syscall scatter-read path sized for typical TCP reads.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; PREPEND_SIZE + initial_size],
            reader_index: PREPEND_SIZE,
            writer_index: PREPEND_SIZE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable region, left untouched.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Advances the reader index past `n` bytes without copying them out.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader_index += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = PREPEND_SIZE;
        self.writer_index = PREPEND_SIZE;
    }

    /// Copies out and retires every readable byte.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_vec(n)
    }

    pub fn retrieve_as_vec(&mut self, n: usize) -> Vec<u8> {
        let result = self.peek()[..n].to_vec();
        self.retrieve(n);
        result
    }

    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_vec(n)).into_owned()
    }

    /// Appends `data` to the readable tail, growing the buffer if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` just ahead of the readable region, e.g. to stitch on
    /// a fixed-width length header after the payload was already
    /// appended. Panics if there isn't enough prepend space reserved.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + PREPEND_SIZE {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Slide the readable region down to the start of the usable
            // area instead of growing: reclaims space already retrieved.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader_index..self.writer_index, PREPEND_SIZE);
            self.reader_index = PREPEND_SIZE;
            self.writer_index = PREPEND_SIZE + readable;
        }
    }

    /// One `readv` into the writable tail plus a 64 KiB stack region, so
    /// a single syscall drains the socket even when more than the
    /// buffer's current writable space is queued. Mirrors muduo's
    /// `Buffer::readFd`.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iovs = [
            IoSliceMut::new(&mut self.buf[self.writer_index..]),
            IoSliceMut::new(&mut extra_buf),
        ];
        let n = crate::sys::readv(fd, &mut iovs)?;

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }

        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::Buffer;

    #[test]
    fn append_and_retrieve_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.retrieve_as_vec(5), b"hello");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn prepend_writes_just_ahead_of_readable() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &7u32.to_be_bytes());
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    fn make_space_reclaims_retrieved_region_without_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[1u8; 10]);
        buf.retrieve(10);
        let cap_before = buf.buf.len();
        buf.append(&[2u8; 10]);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.readable_bytes(), 10);
    }

    #[test]
    fn grows_when_retrieved_region_is_not_enough() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[1u8; 16]);
        buf.append(&[2u8; 16]);
        assert_eq!(buf.readable_bytes(), 32);
    }
}
