//! The five response decoder shapes.
//!
//! Each function takes the one [`Frame`] already pulled off the wire by
//! [`crate::conn::ConnReader::read_frame`] and narrows it to a typed result. A
//! `Frame::Error` is never a decoder's own failure — it is the server answering
//! with an application-level error, which must not be treated as
//! connection-impacting. Any other frame shape the decoder didn't expect *is* a
//! protocol violation, because it means the command catalog and the wire have
//! disagreed about what shape a reply should take.

use crate::error::{Error, Result};
use crate::frame::Frame;

use bytes::Bytes;

fn unexpected(frame: &Frame) -> Error {
    Error::protocol(format!("unexpected frame in response: {frame}"))
}

/// Converts a just-read `Frame` into a typed `Result`, peeling off `Frame::Error`
/// as a server error. Every decoder below starts here.
fn classify(frame: Option<Frame>) -> Result<Frame> {
    match frame {
        Some(Frame::Error(msg)) => Err(Error::server(msg)),
        Some(frame) => Ok(frame),
        None => Err(Error::protocol("connection closed before a response frame arrived")),
    }
}

/// `+OK\r\n` or `$-1\r\n` (null, treated as "no error, nothing to return").
pub(crate) fn decode_ok(frame: Option<Frame>) -> Result<()> {
    match classify(frame)? {
        Frame::Simple(_) => Ok(()),
        Frame::Null => Ok(()),
        frame => Err(unexpected(&frame)),
    }
}

/// `:<decimal>\r\n`.
pub(crate) fn decode_integer(frame: Option<Frame>) -> Result<i64> {
    match classify(frame)? {
        Frame::Integer(n) => Ok(n as i64),
        frame => Err(unexpected(&frame)),
    }
}

/// `$<n>\r\n<n bytes>\r\n`, or `$-1\r\n` → `None`. Simple strings are also
/// accepted as bulk-shaped (the wire sometimes answers a bulk-typed command
/// with a simple string, e.g. some servers' `PING`).
pub(crate) fn decode_bulk(frame: Option<Frame>) -> Result<Option<Bytes>> {
    match classify(frame)? {
        Frame::Bulk(bytes) => Ok(Some(bytes)),
        Frame::Simple(s) => Ok(Some(Bytes::from(s.into_bytes()))),
        Frame::Null => Ok(None),
        frame => Err(unexpected(&frame)),
    }
}

/// `*<k>\r\n` of bulk strings, or `*-1\r\n` → `None`.
pub(crate) fn decode_array_bytes(frame: Option<Frame>) -> Result<Option<Vec<Bytes>>> {
    match classify(frame)? {
        Frame::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Frame::Bulk(b) => Ok(b),
                Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
                Frame::Null => Ok(Bytes::new()),
                other => Err(unexpected(&other)),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Frame::Null => Ok(None),
        frame => Err(unexpected(&frame)),
    }
}

/// Same shape as [`decode_array_bytes`], but bulks are interpreted as UTF-8 text.
pub(crate) fn decode_array_string(frame: Option<Frame>) -> Result<Option<Vec<String>>> {
    match classify(frame)? {
        Frame::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Frame::Bulk(b) => String::from_utf8(b.to_vec()).map_err(|_| Error::protocol("array element is not valid utf-8")),
                Frame::Simple(s) => Ok(s),
                other => Err(unexpected(&other)),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Frame::Null => Ok(None),
        frame => Err(unexpected(&frame)),
    }
}
