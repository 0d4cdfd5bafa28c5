//! Growable byte buffer with prepend, readable, and writable windows.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index   <=   capacity
//! ```
//!
//! Incoming bytes land in the writable window and become readable;
//! retrieving advances the reader. The 8-byte prepend region lets a
//! protocol layer stamp a length header in front of already-assembled
//! payload without shifting it.

use std::os::fd::RawFd;

/// Bytes reserved in front of the readable window for cheap prepends.
pub const CHEAP_PREPEND: usize = 8;

/// Initial usable capacity (excluding the prepend region).
pub const INITIAL_SIZE: usize = 1024;

/// Stack spill buffer size for [`Buffer::read_fd`].
const EXTRA_BUF_SIZE: usize = 65536;

/// Byte buffer backing a connection's input and output.
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}

impl Buffer {
    /// A buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// A buffer with `initial` usable bytes plus the prepend region.
    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes in front of the readable window.
    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable window.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Find the first `\r\n` in the readable window. Returns the offset of
    /// the `\r` relative to the start of the window.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// Like [`find_crlf`](Self::find_crlf), starting the search at `start`
    /// (an offset into the readable window).
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|pos| pos + start)
    }

    /// Find the first `\n` in the readable window.
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Like [`find_eol`](Self::find_eol), starting the search at `start`.
    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| pos + start)
    }

    /// Drop `len` bytes from the front of the readable window.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Drop everything; both indices return to the prepend boundary.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Take `len` bytes out of the readable window.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    /// Take the whole readable window.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Take the whole readable window as a string, replacing invalid UTF-8.
    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_bytes()).into_owned()
    }

    /// Append bytes, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Insert bytes directly in front of the readable window.
    ///
    /// Requires `prependable_bytes() >= data.len()`; the prepend region
    /// guarantees 8 bytes after any `retrieve_all`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    /// Make sure at least `len` bytes are writable.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    // ── Typed big-endian accessors ───────────────────────────────────

    /// Append an integer in network byte order.
    pub fn append_i8(&mut self, v: i8) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_i16(&mut self, v: i16) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_i32(&mut self, v: i32) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_i64(&mut self, v: i64) {
        self.append(&v.to_be_bytes());
    }

    /// Read the leading integer without consuming it.
    pub fn peek_i8(&self) -> i8 {
        assert!(self.readable_bytes() >= 1);
        self.peek()[0] as i8
    }

    pub fn peek_i16(&self) -> i16 {
        assert!(self.readable_bytes() >= 2);
        i16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }

    pub fn peek_i32(&self) -> i32 {
        assert!(self.readable_bytes() >= 4);
        i32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }

    pub fn peek_i64(&self) -> i64 {
        assert!(self.readable_bytes() >= 8);
        i64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    /// Read and consume the leading integer.
    pub fn read_i8(&mut self) -> i8 {
        let v = self.peek_i8();
        self.retrieve(1);
        v
    }

    pub fn read_i16(&mut self) -> i16 {
        let v = self.peek_i16();
        self.retrieve(2);
        v
    }

    pub fn read_i32(&mut self) -> i32 {
        let v = self.peek_i32();
        self.retrieve(4);
        v
    }

    pub fn read_i64(&mut self) -> i64 {
        let v = self.peek_i64();
        self.retrieve(8);
        v
    }

    /// Prepend an integer in network byte order.
    pub fn prepend_i8(&mut self, v: i8) {
        self.prepend(&v.to_be_bytes());
    }

    pub fn prepend_i16(&mut self, v: i16) {
        self.prepend(&v.to_be_bytes());
    }

    pub fn prepend_i32(&mut self, v: i32) {
        self.prepend(&v.to_be_bytes());
    }

    pub fn prepend_i64(&mut self, v: i64) {
        self.prepend(&v.to_be_bytes());
    }

    // ── Descriptor I/O ───────────────────────────────────────────────

    /// Scatter-read from `fd` into the writable tail plus a 64 KiB stack
    /// buffer in a single `readv`. The stack buffer caps resident
    /// per-connection memory while still draining large reads in one
    /// syscall; any spill is appended after the fact.
    ///
    /// Returns the byte count from `readv`; on a negative return the OS
    /// errno is stored in `saved_errno`.
    pub fn read_fd(&mut self, fd: RawFd, saved_errno: &mut i32) -> isize {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_BUF_SIZE,
            },
        ];
        // Skip the stack buffer when the tail alone is bigger than it.
        let iovcnt: libc::c_int = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            *saved_errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        } else if n as usize <= writable {
            self.writer_index += n as usize;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n as usize - writable]);
        }
        n as isize
    }

    /// Grow or compact so that at least `len` bytes are writable.
    ///
    /// When the free space on both sides cannot hold `len` plus the
    /// prepend region, the storage grows; otherwise the readable window
    /// slides back to the prepend boundary and no allocation happens.
    /// Either way the readable bytes are preserved.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let data = vec![b'x'; 200];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);

        buf.retrieve(50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);

        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 350);

        let out = buf.retrieve_all_as_bytes();
        assert_eq!(out.len(), 350);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let mut buf = Buffer::new();
        let input: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        let mut output = Vec::new();

        // Interleave appends and partial retrieves.
        for chunk in input.chunks(700) {
            buf.append(chunk);
            let take = buf.readable_bytes() / 2;
            output.extend_from_slice(&buf.retrieve_as_bytes(take));
        }
        output.extend_from_slice(&buf.retrieve_all_as_bytes());
        assert_eq!(output, input);
    }

    #[test]
    fn grow_preserves_readable() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        buf.append(&vec![b'z'; 1000]); // forces growth
        assert_eq!(buf.readable_bytes(), 1400);
        let out = buf.retrieve_all_as_bytes();
        assert!(out[..400].iter().all(|&b| b == b'y'));
        assert!(out[400..].iter().all(|&b| b == b'z'));
    }

    #[test]
    fn compact_instead_of_grow() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; 800]);
        buf.retrieve(700);
        // 100 readable, 224 writable, 708 prependable: sliding suffices.
        buf.append(&vec![2u8; 400]);
        assert_eq!(buf.readable_bytes(), 500);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        let out = buf.retrieve_all_as_bytes();
        assert!(out[..100].iter().all(|&b| b == 1));
        assert!(out[100..].iter().all(|&b| b == 2));
    }

    #[test]
    fn prepend_in_front_of_payload() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_i32(7);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.read_i32(), 7);
        assert_eq!(buf.retrieve_all_as_bytes(), b"payload");
    }

    #[test]
    fn int_round_trips_are_big_endian() {
        let mut buf = Buffer::new();
        buf.append_i64(0x0102030405060708);
        buf.append_i32(0x0a0b0c0d);
        buf.append_i16(0x1122);
        buf.append_i8(0x7f);
        assert_eq!(buf.readable_bytes(), 15);
        assert_eq!(
            buf.peek()[..8],
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );

        assert_eq!(buf.read_i64(), 0x0102030405060708);
        assert_eq!(buf.peek_i32(), 0x0a0b0c0d);
        assert_eq!(buf.read_i32(), 0x0a0b0c0d);
        assert_eq!(buf.read_i16(), 0x1122);
        assert_eq!(buf.read_i8(), 0x7f);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn negative_ints_survive() {
        let mut buf = Buffer::new();
        buf.append_i32(-42);
        buf.append_i16(-7);
        assert_eq!(buf.read_i32(), -42);
        assert_eq!(buf.read_i16(), -7);
    }

    #[test]
    fn find_crlf_and_eol() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_crlf_from(15), Some(23));
        assert_eq!(buf.find_crlf_from(24), None);

        buf.retrieve_all();
        buf.append(b"one\ntwo\n");
        assert_eq!(buf.find_eol(), Some(3));
        // The from-variant honors the start offset.
        assert_eq!(buf.find_eol_from(4), Some(7));
        assert_eq!(buf.find_eol_from(8), None);
    }

    #[test]
    fn read_fd_drains_through_stack_spill() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let payload = vec![0xabu8; 2000];
        let written =
            unsafe { libc::write(wr, payload.as_ptr() as *const libc::c_void, payload.len()) };
        assert_eq!(written, 2000);

        // A tiny buffer forces part of the read through the spill path.
        let mut buf = Buffer::with_capacity(64);
        let mut saved_errno = 0;
        let n = buf.read_fd(rd, &mut saved_errno);
        assert_eq!(n, 2000);
        assert_eq!(buf.readable_bytes(), 2000);
        assert!(buf.peek().iter().all(|&b| b == 0xab));

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn read_fd_reports_errno() {
        let mut buf = Buffer::new();
        let mut saved_errno = 0;
        let n = buf.read_fd(-1, &mut saved_errno);
        assert!(n < 0);
        assert_eq!(saved_errno, libc::EBADF);
    }
}
