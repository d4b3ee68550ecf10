use std::io;
use std::os::fd::RawFd;

/// Bytes reserved in front of the readable region so a small header can be
/// prepended without shifting the payload.
pub const CHEAP_PREPEND: usize = 8;

const INITIAL_SIZE: usize = 1024;

/// Growable byte buffer with separate read and write cursors.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0        <=     read_pos   <=      write_pos    <=     capacity
/// ```
///
/// Incoming socket bytes are appended at the write cursor and consumed from
/// the read cursor. The prependable region starts out [`CHEAP_PREPEND`] bytes
/// wide, which lets the framing codec stamp a length header in front of a
/// payload without reallocating or copying it.
///
/// # Examples
///
/// ```
/// use lightvoice::Buffer;
///
/// let mut buf = Buffer::new();
/// buf.append(b"hello");
/// buf.prepend(&5u32.to_be_bytes());
/// assert_eq!(buf.retrieve_u32(), 5);
/// assert_eq!(buf.peek(), b"hello");
/// ```
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with `capacity` writable bytes (plus the prepend
    /// region).
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + capacity],
            read_pos: CHEAP_PREPEND,
            write_pos: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// Borrows the readable bytes without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Reads a big-endian `u32` at the read cursor without consuming it.
    ///
    /// # Panics
    ///
    /// Panics when fewer than four bytes are readable.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        let bytes: [u8; 4] = self.buf[self.read_pos..self.read_pos + 4]
            .try_into()
            .unwrap();
        u32::from_be_bytes(bytes)
    }

    /// Advances the read cursor by `len` bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_pos += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Drops all readable bytes, resetting both cursors.
    pub fn retrieve_all(&mut self) {
        self.read_pos = CHEAP_PREPEND;
        self.write_pos = CHEAP_PREPEND;
    }

    /// Consumes and returns a big-endian `u32`.
    pub fn retrieve_u32(&mut self) -> u32 {
        let value = self.peek_u32();
        self.retrieve(4);
        value
    }

    /// Consumes `len` bytes into an owned vector.
    pub fn retrieve_vec(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let bytes = self.buf[self.read_pos..self.read_pos + len].to_vec();
        self.retrieve(len);
        bytes
    }

    /// Consumes every readable byte into a string, replacing invalid UTF-8.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Copies `data` after the write cursor, growing the buffer if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    /// Copies `data` in front of the read cursor, into the reserved prefix
    /// region. Never reallocates.
    ///
    /// # Panics
    ///
    /// Panics when the prefix region is exhausted.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_pos -= data.len();
        self.buf[self.read_pos..self.read_pos + data.len()].copy_from_slice(data);
    }

    /// Makes room for at least `len` writable bytes.
    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            // Not enough slack anywhere: grow the backing store.
            self.buf.resize(self.write_pos + len, 0);
        } else {
            // Enough dead space in front of the readable region: compact.
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, CHEAP_PREPEND);
            self.read_pos = CHEAP_PREPEND;
            self.write_pos = self.read_pos + readable;
        }
    }

    /// Reads from `fd` directly after the write cursor, using a 64 KiB stack
    /// side-buffer as the second leg of a scatter read. One syscall can
    /// therefore absorb up to the current writable capacity plus 64 KiB
    /// before the buffer has to grow; whatever lands in the side-buffer is
    /// appended afterwards.
    ///
    /// Returns the total number of bytes read; `Ok(0)` means end-of-stream.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // Skip the side-buffer when the main buffer alone is already large.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, CHEAP_PREPEND};
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");

        assert_eq!(buf.retrieve_all_as_string(), "world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn prepend_uses_reserved_prefix() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let capacity_before = buf.writable_bytes();

        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.writable_bytes(), capacity_before);
        assert_eq!(buf.retrieve_u32(), 7);
        assert_eq!(buf.peek(), b"payload");
    }

    #[test]
    fn u32_round_trip() {
        let mut buf = Buffer::new();
        buf.append_u32(0xdead_beef);
        assert_eq!(buf.peek(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(buf.peek_u32(), 0xdead_beef);
        assert_eq!(buf.retrieve_u32(), 0xdead_beef);
    }

    #[test]
    fn grows_and_compacts() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[b'x'; 16]);
        // Full: appending more must grow.
        buf.append(&[b'y'; 16]);
        assert_eq!(buf.readable_bytes(), 32);

        // Consume most of it, then append something that fits only after
        // compaction.
        buf.retrieve(30);
        buf.append(&[b'z'; 8]);
        assert_eq!(buf.readable_bytes(), 10);
        assert_eq!(&buf.peek()[..2], b"yy");
        assert_eq!(&buf.peek()[2..], &[b'z'; 8]);
    }

    #[test]
    fn read_fd_small() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"over the wire").unwrap();

        let mut buf = Buffer::new();
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 13);
        assert_eq!(buf.peek(), b"over the wire");
    }

    #[test]
    fn read_fd_spills_into_side_buffer() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload: Vec<u8> = (0..70_000u32).map(|i| i as u8).collect();
        let expected = payload.clone();
        let writer = std::thread::spawn(move || {
            tx.write_all(&payload).unwrap();
        });

        let mut buf = Buffer::with_capacity(16);
        while buf.readable_bytes() < expected.len() {
            buf.read_fd(rx.as_raw_fd()).unwrap();
        }
        writer.join().unwrap();
        assert_eq!(buf.peek(), &expected[..]);
    }
}
