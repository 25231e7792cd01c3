//! Readable/writable byte buffer used by every [`TcpConnection`](crate::tcp_connection::TcpConnection).
//!
//! The buffer is partitioned into three contiguous regions by two indices `reader <= writer <=
//! len()`: `[0, reader)` is prependable space, `[reader, writer)` is readable, and `[writer, len())`
//! is writable. `ensure_writable` first reclaims prepend space via `compact` before falling back to
//! growing the backing `Vec`.

use std::io::{self, IoSliceMut, Read};

/// Bytes reserved at the front of every buffer so that protocol layers (e.g. the HTTP response
/// length prefix) can prepend a small header without triggering a reallocation.
pub const CHEAP_PREPEND: usize = 8;

const INITIAL_SIZE: usize = 1024;
const EXTRA_BUF_SIZE: usize = 65536;

/// A growable byte buffer with a prependable region.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates an empty buffer with `CHEAP_PREPEND` bytes of prependable space reserved.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Creates an empty buffer whose writable region can hold at least `initial_size` bytes
    /// without growing.
    pub fn with_capacity(initial_size: usize) -> Self {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to be read.
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    /// Number of bytes that can be written without growing the buffer.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    /// Number of bytes currently available to prepend without growing the buffer.
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    /// Borrows the readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Appends `data` to the writable region, growing the buffer first if necessary.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Ensures at least `len` bytes of writable space, compacting the prepend region before
    /// growing the underlying allocation.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Drops `len` bytes from the front of the readable region. Clamps to `readable_bytes()`.
    pub fn retrieve(&mut self, len: usize) {
        let len = len.min(self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Drops all readable bytes, resetting both indices to the start of the prependable region.
    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Drops `len` bytes from the front of the readable region and returns them as a `String`.
    /// Invalid UTF-8 is replaced, matching `String::from_utf8_lossy`.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let s = String::from_utf8_lossy(&self.buf[self.reader..self.reader + len]).into_owned();
        self.retrieve(len);
        s
    }

    /// Drops and returns every readable byte.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let data = self.peek().to_vec();
        self.retrieve_all();
        data
    }

    /// Writes `data` into the prependable region. Panics if `data.len() > prependable_bytes()`;
    /// callers are expected to size their prepended header to fit within `CHEAP_PREPEND`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Finds the first `\r\n` in the readable region, returning its starting offset relative to
    /// the start of the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Finds the first bare `\n` in the readable region (used for lenient line splitting),
    /// returning its offset relative to the start of the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Reads as much as is available from `reader` in a single syscall, scattering into the
    /// writable region plus a 64 KiB stack-allocated scratch buffer so that a burst larger than
    /// the current writable region doesn't require a second `read` call. Returns `Ok(0)` on
    /// orderly peer close.
    pub fn read_fd<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let mut slices = [
                IoSliceMut::new(&mut self.buf[self.writer..]),
                IoSliceMut::new(&mut extra),
            ];
            reader.read_vectored(&mut slices)?
        };

        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            let overflow = n - writable;
            self.append(&extra[..overflow]);
        }

        Ok(n)
    }

    /// Compacts unused prepend space if that alone satisfies `len`, otherwise grows the backing
    /// allocation.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() - CHEAP_PREPEND >= len {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = CHEAP_PREPEND + readable;
        } else {
            let needed = self.writer + len;
            self.buf.resize(needed, 0);
        }
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.peek()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fake::Fake;
    use std::io::Cursor;

    #[test]
    fn new_buffer_has_no_readable_bytes_and_full_prepend() {
        let buf = Buffer::new();
        assert_eq!(0, buf.readable_bytes());
        assert_eq!(CHEAP_PREPEND, buf.prependable_bytes());
        assert_eq!(INITIAL_SIZE, buf.writable_bytes());
    }

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(11, buf.readable_bytes());
        assert_eq!(b"hello world", buf.peek());

        buf.retrieve(6);
        assert_eq!(5, buf.readable_bytes());
        assert_eq!(b"world", buf.peek());
    }

    #[test]
    fn round_trip_property_holds_for_arbitrary_prefix_retrieval() {
        let mut samples: Vec<Vec<u8>> = vec![vec![], vec![b'a']];
        for _ in 0..16 {
            let len: usize = (0..256).fake();
            samples.push(fake::vec![u8; len]);
        }

        for s in &samples {
            for k in 0..=s.len() {
                let mut buf = Buffer::new();
                buf.append(s);
                buf.retrieve(k);
                assert_eq!(s.len() - k, buf.readable_bytes());
                assert_eq!(&s[k..], buf.peek());
            }
        }
    }

    #[test]
    fn growing_past_initial_capacity_preserves_contents() {
        let mut buf = Buffer::with_capacity(4);
        let data = vec![7u8; 4096];
        buf.append(&data);
        assert_eq!(data.len(), buf.readable_bytes());
        assert_eq!(&data[..], buf.peek());
    }

    #[test]
    fn retrieve_all_resets_to_full_prepend_capacity() {
        let mut buf = Buffer::new();
        buf.append(b"data");
        buf.retrieve_all();
        assert_eq!(0, buf.readable_bytes());
        assert!(buf.prependable_bytes() >= CHEAP_PREPEND);
    }

    #[test]
    fn prepend_writes_into_reserved_region() {
        let mut buf = Buffer::new();
        buf.append(b"world");
        buf.prepend(b"hello ");
        assert_eq!(b"hello world", buf.peek());
    }

    #[test]
    fn prependable_bytes_stay_at_least_cheap_prepend_after_retrieve_all() {
        let mut buf = Buffer::new();
        for _ in 0..5 {
            buf.append(b"chunk-of-bytes");
            buf.retrieve_all();
            assert!(buf.prependable_bytes() >= CHEAP_PREPEND);
        }
    }

    #[test]
    fn find_crlf_locates_line_terminator() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let pos = buf.find_crlf().unwrap();
        assert_eq!(b"GET / HTTP/1.1", &buf.peek()[..pos]);
    }

    #[test]
    fn read_fd_absorbs_burst_larger_than_writable_region() {
        let mut buf = Buffer::with_capacity(16);
        let big = vec![9u8; 200_000];
        let mut cursor = Cursor::new(big.clone());
        let n = buf.read_fd(&mut cursor).unwrap();
        assert_eq!(big.len(), n);
        assert_eq!(big.len(), buf.readable_bytes());
        assert_eq!(&big[..], buf.peek());
    }

    #[test]
    fn read_fd_returns_zero_on_orderly_close() {
        let mut buf = Buffer::new();
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let n = buf.read_fd(&mut cursor).unwrap();
        assert_eq!(0, n);
    }

    #[test]
    fn retrieve_as_string_consumes_and_decodes() {
        let mut buf = Buffer::new();
        buf.append(b"hi there");
        let s = buf.retrieve_as_string(2);
        assert_eq!("hi", s);
        assert_eq!(b" there", buf.peek());
    }
}
