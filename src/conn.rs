//! The socket-facing half of the connection core.
//!
//! The write half and the read half need to live on different tasks at
//! different moments (the idle reader token moves between whichever caller
//! currently holds the reader role), so the two are split: [`ConnWriter`]
//! stays resident in the [`crate::client::slot::Slot`], while [`ConnReader`]
//! is the value that travels as the idle token / handoff payload. Both wrap a
//! single underlying stream, split via `into_split`.

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameError};

use bytes::{Buf, BytesMut};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::unix::{OwnedReadHalf as UnixOwnedReadHalf, OwnedWriteHalf as UnixOwnedWriteHalf};
use tokio::net::{TcpStream, UnixStream};

/// A conservative MSS-sized read buffer.
const READ_BUFFER_SIZE: usize = 1208;

/// Either transport, behind one enum so the rest of the crate doesn't need to be
/// generic over `TcpStream` vs `UnixStream`.
pub(crate) enum RawReadHalf {
    Tcp(OwnedReadHalf),
    Unix(UnixOwnedReadHalf),
}

pub(crate) enum RawWriteHalf {
    Tcp(BufWriter<OwnedWriteHalf>),
    Unix(BufWriter<UnixOwnedWriteHalf>),
}

impl RawReadHalf {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            RawReadHalf::Tcp(r) => r.read_buf(buf).await,
            RawReadHalf::Unix(r) => r.read_buf(buf).await,
        }
    }

    /// A raw, unbuffered read into a fixed-size scratch slice, used to drain
    /// bytes off the wire without retaining them anywhere.
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            RawReadHalf::Tcp(r) => r.read(buf).await,
            RawReadHalf::Unix(r) => r.read(buf).await,
        }
    }
}

impl RawWriteHalf {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            RawWriteHalf::Tcp(w) => w.write_all(bytes).await,
            RawWriteHalf::Unix(w) => w.write_all(bytes).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            RawWriteHalf::Tcp(w) => w.flush().await,
            RawWriteHalf::Unix(w) => w.flush().await,
        }
    }
}

/// Dials `host:port` or a Unix domain socket path and returns the split halves,
/// with the socket already tuned (Nagle disabled, linger disabled).
pub(crate) async fn dial_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<(RawReadHalf, RawWriteHalf)> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::timeout(connect_timeout))??;

    tune_tcp(&stream)?;

    let (r, w) = stream.into_split();
    Ok((RawReadHalf::Tcp(r), RawWriteHalf::Tcp(BufWriter::new(w))))
}

pub(crate) async fn dial_unix(path: &Path, connect_timeout: Duration) -> Result<(RawReadHalf, RawWriteHalf)> {
    let stream = tokio::time::timeout(connect_timeout, UnixStream::connect(path))
        .await
        .map_err(|_| Error::timeout(connect_timeout))??;

    let (r, w) = stream.into_split();
    Ok((RawReadHalf::Unix(r), RawWriteHalf::Unix(BufWriter::new(w))))
}

/// Disables Nagle's algorithm (small frames should hit the wire immediately)
/// and SO_LINGER (teardown must not block waiting on a graceful FIN/ACK dance).
/// Grounded in the reference pack's `fred` connection setup, which tunes the raw
/// socket the same way via `socket2` before handing it back to tokio.
fn tune_tcp(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = socket2::SockRef::from(stream);
    sock_ref.set_linger(Some(Duration::from_secs(0)))?;
    Ok(())
}

/// The write half of a connection. Lives inside the slot for as long as the
/// connection is live; every `Submit` call writes through this.
pub(crate) struct ConnWriter {
    stream: RawWriteHalf,
}

impl ConnWriter {
    pub(crate) fn new(stream: RawWriteHalf) -> Self {
        Self { stream }
    }

    /// Writes a fully-encoded request buffer and flushes it. `deadline` is
    /// applied to the whole write+flush.
    pub(crate) async fn write_request(&mut self, bytes: &[u8], deadline: Option<Duration>) -> Result<()> {
        let fut = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await?;
            Ok::<_, std::io::Error>(())
        };

        match deadline {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| Error::timeout(d))??,
            None => fut.await?,
        }

        Ok(())
    }
}

/// The read half of a connection, plus its accumulation buffer. This is the
/// buffered reader: it sits idle in the slot, travels through a handoff cell,
/// and is what a command wrapper is handed back by `submit` to decode exactly
/// one frame from.
pub(crate) struct ConnReader {
    stream: RawReadHalf,
    buffer: BytesMut,
}

impl ConnReader {
    pub(crate) fn new(stream: RawReadHalf) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Reads a single `Frame` off the stream, applying `deadline` to the whole
    /// operation (it may span several socket reads if the frame arrives in
    /// pieces). `Ok(None)` means the peer closed the stream cleanly between
    /// frames.
    pub(crate) async fn read_frame(&mut self, deadline: Option<Duration>) -> Result<Option<Frame>> {
        let fut = self.read_frame_inner();
        match deadline {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| Error::timeout(d))?,
            None => fut.await,
        }
    }

    async fn read_frame_inner(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if 0 != self.stream.read_buf(&mut self.buffer).await? {
                continue;
            }

            if self.buffer.is_empty() {
                return Ok(None);
            } else {
                return Err(Error::protocol("connection reset by peer mid-frame"));
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = Cursor::new(&self.buffer[..]);
        match Frame::check(&mut buf) {
            Ok(()) => {
                let len = buf.position() as usize;
                buf.set_position(0);
                let frame = Frame::from(&mut buf);
                self.buffer.advance(len);
                Ok(Some(frame))
            }
            Err(FrameError::Incomplete) => Ok(None),
            Err(FrameError::Protocol(msg)) => Err(Error::protocol(msg)),
        }
    }

    /// Reads one pub/sub push (`*3\r\n` of kind, channel, and a trailer that is
    /// either an integer confirmation count or the message payload), bounding
    /// the payload bulk to `max_payload` bytes.
    ///
    /// Unlike [`read_frame`][Self::read_frame], this never accumulates a bulk
    /// string's declared length into the read buffer before knowing whether it
    /// fits the bound: a payload over `max_payload` is drained straight off the
    /// socket through a small fixed scratch buffer and reported as
    /// [`PushFrame::Oversized`] instead of being buffered in full first. This is
    /// what actually keeps `message_buffer_size` a memory bound rather than a
    /// post-hoc check.
    pub(crate) async fn read_push_frame(&mut self, max_payload: u64, deadline: Option<Duration>) -> Result<Option<PushFrame>> {
        let fut = self.read_push_frame_inner(max_payload);
        match deadline {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| Error::timeout(d))?,
            None => fut.await,
        }
    }

    async fn read_push_frame_inner(&mut self, max_payload: u64) -> Result<Option<PushFrame>> {
        if self.buffer.is_empty() && 0 == self.stream.read_buf(&mut self.buffer).await? {
            return Ok(None);
        }

        let header = self.read_line().await?;
        if header.first() != Some(&b'*') {
            return Err(Error::protocol("expected an array frame for a push message"));
        }
        let count: u64 = atoi::atoi(&header[1..]).ok_or_else(|| Error::protocol("invalid push frame array length"))?;
        if count != 3 {
            return Err(Error::protocol("push frame must have exactly 3 elements"));
        }

        let kind = self.read_bulk_string().await?;
        let channel = self.read_bulk_string().await?;

        match kind.as_str() {
            "message" | "pmessage" => {
                let trailer = self.read_line().await?;
                if trailer.first() != Some(&b'$') {
                    return Err(Error::protocol("expected a bulk payload for a message push"));
                }
                let len = parse_bulk_len(&trailer[1..])?;

                if len > max_payload {
                    self.discard(len + 2).await?;
                    return Ok(Some(PushFrame::Oversized { channel, len }));
                }

                let payload = self.read_exact_bytes(len).await?;
                Ok(Some(PushFrame::Message { channel, payload }))
            }
            "subscribe" => {
                self.read_integer_trailer().await?;
                Ok(Some(PushFrame::Subscribed { channel }))
            }
            "unsubscribe" => {
                self.read_integer_trailer().await?;
                Ok(Some(PushFrame::Unsubscribed { channel }))
            }
            other => Err(Error::protocol(format!("unrecognized push kind `{other}`"))),
        }
    }

    async fn read_integer_trailer(&mut self) -> Result<i64> {
        let trailer = self.read_line().await?;
        if trailer.first() != Some(&b':') {
            return Err(Error::protocol("expected an integer count in a push frame"));
        }
        atoi::atoi(&trailer[1..]).ok_or_else(|| Error::protocol("invalid push frame integer"))
    }

    async fn read_bulk_string(&mut self) -> Result<String> {
        let header = self.read_line().await?;
        if header.first() != Some(&b'$') {
            return Err(Error::protocol("expected a bulk string in a push frame"));
        }
        let len = parse_bulk_len(&header[1..])?;
        let bytes = self.read_exact_bytes(len).await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::protocol("push frame element is not valid utf-8"))
    }

    /// Reads up to and including the next `\r\n`, returning the line without
    /// the terminator. Refills `self.buffer` from the socket as needed.
    async fn read_line(&mut self) -> Result<bytes::Bytes> {
        loop {
            if let Some(pos) = self.buffer[..].windows(2).position(|w| w == b"\r\n") {
                let line = self.buffer.split_to(pos).freeze();
                self.buffer.advance(2);
                return Ok(line);
            }
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err(Error::protocol("connection reset by peer mid-frame"));
            }
        }
    }

    /// Reads exactly `len` bytes followed by `\r\n`, refilling from the socket
    /// as needed.
    async fn read_exact_bytes(&mut self, len: u64) -> Result<bytes::Bytes> {
        let len = len as usize;
        while self.buffer.len() < len + 2 {
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err(Error::protocol("connection reset by peer mid-frame"));
            }
        }
        let bytes = self.buffer.split_to(len).freeze();
        self.buffer.advance(2);
        Ok(bytes)
    }

    /// Drains `n` bytes from the connection without retaining them: first
    /// whatever is already buffered, then directly off the socket through a
    /// small fixed scratch slice, so skipping an oversized payload never costs
    /// more memory than the scratch size.
    async fn discard(&mut self, n: u64) -> Result<()> {
        let from_buffer = n.min(self.buffer.len() as u64) as usize;
        self.buffer.advance(from_buffer);
        let mut remaining = n - from_buffer as u64;

        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let want = remaining.min(scratch.len() as u64) as usize;
            let read = self.stream.read(&mut scratch[..want]).await?;
            if read == 0 {
                return Err(Error::protocol("connection reset by peer while skipping an oversized payload"));
            }
            remaining -= read as u64;
        }
        Ok(())
    }
}

fn parse_bulk_len(digits: &[u8]) -> Result<u64> {
    let len: u64 = atoi::atoi(digits).ok_or_else(|| Error::protocol("invalid bulk string length"))?;
    if len > crate::frame::SIZE_MAX {
        return Err(Error::protocol(format!("bulk string length {len} exceeds {}", crate::frame::SIZE_MAX)));
    }
    Ok(len)
}

/// One decoded pub/sub push. `Oversized` is reported instead of `Message` when
/// the payload exceeds the bound passed to [`ConnReader::read_push_frame`];
/// its bytes have already been discarded off the wire.
pub(crate) enum PushFrame {
    Message { channel: String, payload: bytes::Bytes },
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Oversized { channel: String, len: u64 },
}
