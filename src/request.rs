//! The request builder and buffer pool.
//!
//! A `Request` is one RESP array frame built directly into a `BytesMut`: no
//! intermediate `Frame` tree, no second formatting pass for integers. Buffers
//! come from a small pool (`RequestPool`) so steady-state command execution
//! allocates nothing beyond what the caller's own arguments need.

use bytes::{BufMut, BytesMut};
use std::sync::Mutex;

/// A single request buffer: a complete `*<argc>\r\n...` frame plus the room to
/// grow for the next command that borrows it from the pool.
pub(crate) struct Request {
    buf: BytesMut,
}

impl Request {
    pub(crate) fn new() -> Self {
        Self { buf: BytesMut::with_capacity(128) }
    }

    fn reset(&mut self) {
        self.buf.clear();
    }

    /// Starts a new array frame with `argc` elements, e.g. `*3\r\n`.
    pub(crate) fn start(&mut self, argc: usize) {
        self.buf.put_u8(b'*');
        write_decimal(&mut self.buf, argc as u64);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Appends a precomputed bulk-string argument, e.g. `$3\r\nGET\r\n`. Used for
    /// command name prefixes, which are fixed at compile time.
    pub(crate) fn arg_raw(&mut self, precomputed: &[u8]) {
        self.buf.extend_from_slice(precomputed);
    }

    /// Appends an arbitrary byte string as a bulk argument: `$<len>\r\n<bytes>\r\n`.
    pub(crate) fn arg_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_u8(b'$');
        write_decimal(&mut self.buf, bytes.len() as u64);
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(bytes);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Appends an integer argument as its decimal text representation, using
    /// the length-backfill trick: the digit count of `value` is known up front
    /// from its magnitude, so the `$<len>\r\n` header can be written once the
    /// digits are in place rather than formatting twice.
    pub(crate) fn arg_int(&mut self, value: i64) {
        // Reserve one byte for "most" values and two for the rare larger ones:
        // single digit-count of the length fits when value is in (-10^8, 10^9).
        let single_digit_len = (-100_000_000..1_000_000_000).contains(&value);

        self.buf.put_u8(b'$');
        let len_pos = self.buf.len();
        if single_digit_len {
            self.buf.put_u8(0); // placeholder, backfilled below
        } else {
            self.buf.put_u8(0);
            self.buf.put_u8(0);
        }
        self.buf.extend_from_slice(b"\r\n");

        let digits_start = self.buf.len();
        write_signed_decimal(&mut self.buf, value);
        let digits_len = self.buf.len() - digits_start;
        self.buf.extend_from_slice(b"\r\n");

        if single_digit_len {
            debug_assert!(digits_len < 10);
            self.buf[len_pos] = b'0' + digits_len as u8;
        } else {
            let tens = digits_len / 10;
            let ones = digits_len % 10;
            self.buf[len_pos] = b'0' + tens as u8;
            self.buf[len_pos + 1] = b'0' + ones as u8;
        }
    }

    /// The encoded frame, ready to write to the socket.
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

fn write_decimal(buf: &mut BytesMut, mut value: u64) {
    if value == 0 {
        buf.put_u8(b'0');
        return;
    }
    let start = buf.len();
    while value > 0 {
        buf.put_u8(b'0' + (value % 10) as u8);
        value /= 10;
    }
    buf[start..].reverse();
}

fn write_signed_decimal(buf: &mut BytesMut, value: i64) {
    if value < 0 {
        buf.put_u8(b'-');
        write_decimal(buf, value.unsigned_abs());
    } else {
        write_decimal(buf, value as u64);
    }
}

/// A free-list of [`Request`] buffers shared by one [`crate::Client`]. Buffer
/// capacity only ever grows (never shrinks), so it tracks the peak frame size
/// seen so far.
pub(crate) struct RequestPool {
    free: Mutex<Vec<Request>>,
}

/// A borrowed [`Request`], returned to the pool on drop.
pub(crate) struct PooledRequest<'a> {
    pool: &'a RequestPool,
    inner: Option<Request>,
}

impl RequestPool {
    pub(crate) fn new() -> Self {
        Self { free: Mutex::new(Vec::new()) }
    }

    pub(crate) fn acquire(&self) -> PooledRequest<'_> {
        let mut request = self.free.lock().unwrap().pop().unwrap_or_else(Request::new);
        request.reset();
        PooledRequest {
            pool: self,
            inner: Some(request),
        }
    }
}

impl std::ops::Deref for PooledRequest<'_> {
    type Target = Request;
    fn deref(&self) -> &Request {
        self.inner.as_ref().expect("request taken")
    }
}

impl std::ops::DerefMut for PooledRequest<'_> {
    fn deref_mut(&mut self) -> &mut Request {
        self.inner.as_mut().expect("request taken")
    }
}

impl Drop for PooledRequest<'_> {
    fn drop(&mut self) {
        if let Some(request) = self.inner.take() {
            self.pool.free.lock().unwrap().push(request);
        }
    }
}
