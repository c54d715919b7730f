//! A type representing one RESP v2 frame, and the two-pass check/parse routine
//! used to pull a frame out of a byte buffer without double-allocating.
//!
//! Uses a "check, then parse" split (so a partially-received frame costs
//! nothing but a cursor scan) and a `Cursor`-based line reader. Bulk payloads
//! over 512 MiB and array element counts over 2^32-1 are protocol violations,
//! not just large frames.

use bytes::{Buf, Bytes};
use std::convert::TryInto;
use std::fmt;
use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// The maximum size of a bulk string payload.
pub const SIZE_MAX: u64 = 512 * 1024 * 1024;

/// The maximum number of elements in an array frame.
pub const ELEMENT_MAX: u64 = u32::MAX as u64;

/// One frame of the RESP v2 protocol.
#[derive(Clone, Debug)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(u64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

#[derive(Debug)]
pub enum FrameError {
    /// Not enough data has been buffered yet to parse a whole frame.
    Incomplete,
    /// The buffered bytes are not a valid frame.
    Protocol(String),
}

impl Frame {
    pub(crate) fn array() -> Frame {
        Frame::Array(vec![])
    }

    pub(crate) fn push_bulk(&mut self, bytes: Bytes) {
        match self {
            Frame::Array(vec) => vec.push(Frame::Bulk(bytes)),
            _ => panic!("not an array frame"),
        }
    }

    pub(crate) fn push_int(&mut self, value: u64) {
        match self {
            Frame::Array(vec) => vec.push(Frame::Integer(value)),
            _ => panic!("not an array frame"),
        }
    }

    /// Checks whether a complete frame is present at the front of `src`, without
    /// allocating anything. On success, `src`'s position is left at the end of
    /// the frame so the caller can recover its length.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), FrameError> {
        match get_u8(src)? {
            b'+' => {
                get_line(src)?;
                Ok(())
            }
            b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                let _ = get_decimal(src)?;
                Ok(())
            }
            b'$' => {
                if b'-' == peek_u8(src)? {
                    // skip "-1\r\n"
                    skip(src, 4)
                } else {
                    let len = get_decimal(src)?;
                    if len > SIZE_MAX {
                        return Err(FrameError::Protocol(format!("bulk string length {len} exceeds {SIZE_MAX}")));
                    }
                    let len: usize = len.try_into()?;
                    skip(src, len + 2)
                }
            }
            b'*' => {
                if b'-' == peek_u8(src)? {
                    return skip(src, 4);
                }
                let len = get_decimal(src)?;
                if len > ELEMENT_MAX {
                    return Err(FrameError::Protocol(format!("array length {len} exceeds {ELEMENT_MAX}")));
                }
                (0..len).try_for_each(|_| Frame::check(src))
            }
            actual => Err(FrameError::Protocol(format!("invalid frame type byte `{actual}`"))),
        }
    }
}

impl From<&mut Cursor<&[u8]>> for Frame {
    /// The message has already been validated by [`Frame::check`].
    fn from(src: &mut Cursor<&[u8]>) -> Frame {
        match get_u8(src).unwrap() {
            b'+' => {
                let line = get_line(src).unwrap().to_vec();
                Frame::Simple(String::from_utf8(line).unwrap())
            }
            b'-' => {
                let line = get_line(src).unwrap().to_vec();
                Frame::Error(String::from_utf8(line).unwrap())
            }
            b':' => {
                let len = get_decimal(src).unwrap();
                Frame::Integer(len)
            }
            b'$' => {
                if b'-' == peek_u8(src).unwrap() {
                    let _ = get_line(src);
                    Frame::Null
                } else {
                    let len = get_decimal(src).unwrap().try_into().unwrap();
                    let bytes = Bytes::copy_from_slice(&src.chunk()[..len]);
                    skip(src, len + 2).unwrap();
                    Frame::Bulk(bytes)
                }
            }
            b'*' => {
                if b'-' == peek_u8(src).unwrap() {
                    let _ = get_line(src);
                    return Frame::Null;
                }
                let len = get_decimal(src).unwrap().try_into().unwrap();
                // Sequential, not parallel: order must be preserved.
                let vec = (0..len).map(|_| Frame::from(&mut *src)).collect();
                Frame::Array(vec)
            }
            actual => unreachable!("Frame::check should have rejected byte `{actual}`"),
        }
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Frame::Simple(s) => s.eq(other),
            Frame::Bulk(s) => s.eq(other),
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use std::str;

        match self {
            Frame::Simple(response) => response.fmt(fmt),
            Frame::Error(msg) => write!(fmt, "error: {msg}"),
            Frame::Integer(num) => num.fmt(fmt),
            Frame::Bulk(msg) => match str::from_utf8(msg) {
                Ok(string) => string.fmt(fmt),
                Err(_) => write!(fmt, "{msg:?}"),
            },
            Frame::Null => "(nil)".fmt(fmt),
            Frame::Array(parts) => parts.iter().enumerate().try_for_each(|(i, part)| {
                if i > 0 {
                    write!(fmt, " ")?;
                }
                part.fmt(fmt)
            }),
        }
    }
}

impl From<FromUtf8Error> for FrameError {
    fn from(_: FromUtf8Error) -> FrameError {
        FrameError::Protocol("invalid frame format: not valid utf-8".into())
    }
}

impl From<TryFromIntError> for FrameError {
    fn from(_: TryFromIntError) -> FrameError {
        FrameError::Protocol("invalid frame format: length out of range".into())
    }
}

impl std::error::Error for FrameError {}

impl fmt::Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::Incomplete => "stream ended early".fmt(fmt),
            FrameError::Protocol(msg) => msg.fmt(fmt),
        }
    }
}

fn peek_u8(src: &mut Cursor<&[u8]>) -> Result<u8, FrameError> {
    if !src.has_remaining() {
        return Err(FrameError::Incomplete);
    }
    Ok(src.chunk()[0])
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, FrameError> {
    if !src.has_remaining() {
        return Err(FrameError::Incomplete);
    }
    Ok(src.get_u8())
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), FrameError> {
    if src.remaining() < n {
        return Err(FrameError::Incomplete);
    }
    src.advance(n);
    Ok(())
}

/// Reads a newline-terminated decimal number.
fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<u64, FrameError> {
    use atoi::atoi;

    let line = get_line(src)?;
    atoi::<u64>(line).ok_or_else(|| FrameError::Protocol("invalid frame format: not a decimal".into()))
}

/// Finds a line, i.e. the data up to (but excluding) the next `\r\n`. Reports
/// `Incomplete` if the buffer doesn't yet contain a full line — this is the one
/// place a too-long line is caught, since `get_line` is bounded by the buffer
/// length rather than scanning unboundedly.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], FrameError> {
    let start = src.position() as usize;
    let buf = src.get_ref();
    if buf.is_empty() {
        return Err(FrameError::Incomplete);
    }
    let end = buf.len() - 1;

    (start..end)
        .find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
        .map(|i| {
            src.set_position((i + 2) as u64);
            &buf[start..i]
        })
        .ok_or(FrameError::Incomplete)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_and_parse(bytes: &[u8]) -> Frame {
        let mut buf = Cursor::new(bytes);
        Frame::check(&mut buf).unwrap();
        let len = buf.position() as usize;
        assert_eq!(len, bytes.len());
        buf.set_position(0);
        Frame::from(&mut buf)
    }

    #[test]
    fn parses_simple_string() {
        assert!(matches!(check_and_parse(b"+OK\r\n"), Frame::Simple(s) if s == "OK"));
    }

    #[test]
    fn parses_error() {
        assert!(matches!(check_and_parse(b"-ERR boom\r\n"), Frame::Error(s) if s == "ERR boom"));
    }

    #[test]
    fn parses_null_bulk() {
        assert!(matches!(check_and_parse(b"$-1\r\n"), Frame::Null));
    }

    #[test]
    fn parses_bulk() {
        assert!(matches!(check_and_parse(b"$5\r\nhello\r\n"), Frame::Bulk(b) if &b[..] == b"hello"));
    }

    #[test]
    fn parses_array() {
        let frame = check_and_parse(b"*2\r\n$1\r\na\r\n$1\r\nb\r\n");
        match frame {
            Frame::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_frame_reports_incomplete() {
        let mut buf = Cursor::new(&b"$5\r\nhel"[..]);
        assert!(matches!(Frame::check(&mut buf), Err(FrameError::Incomplete)));
    }

    #[test]
    fn oversized_bulk_is_a_protocol_violation() {
        let header = format!("${}\r\n", SIZE_MAX + 1);
        let mut buf = Cursor::new(header.as_bytes());
        assert!(matches!(Frame::check(&mut buf), Err(FrameError::Protocol(_))));
    }

    #[test]
    fn oversized_array_is_a_protocol_violation() {
        let header = format!("*{}\r\n", ELEMENT_MAX + 1);
        let mut buf = Cursor::new(header.as_bytes());
        assert!(matches!(Frame::check(&mut buf), Err(FrameError::Protocol(_))));
    }
}
