//! The request/response command catalog.
//!
//! A small, representative set of commands sitting on top of
//! [`Client::submit`]/[`Client::pass`][pass], one wrapper per command but
//! collapsed into a single file here since each is now a few lines: build a
//! request, submit it, decode one frame, pass the reader back.
//!
//! [pass]: crate::client::ReaderHandle::pass

use crate::client::PassOutcome;
use crate::decode;
use crate::error::Result;
use crate::frame::Frame;
use crate::Client;

use bytes::Bytes;
use std::time::Duration;

const PING: &[u8] = b"$4\r\nPING\r\n";
const GET: &[u8] = b"$3\r\nGET\r\n";
const SET: &[u8] = b"$3\r\nSET\r\n";
const EX: &[u8] = b"$2\r\nEX\r\n";
const DEL: &[u8] = b"$3\r\nDEL\r\n";
const INCR: &[u8] = b"$4\r\nINCR\r\n";
const APPEND: &[u8] = b"$6\r\nAPPEND\r\n";
const RPUSH: &[u8] = b"$5\r\nRPUSH\r\n";
const LRANGE: &[u8] = b"$6\r\nLRANGE\r\n";
const PUBLISH: &[u8] = b"$7\r\nPUBLISH\r\n";

/// Runs one request/decode/pass cycle: the shared plumbing every command
/// wrapper below reduces to.
async fn roundtrip<T>(client: &Client, request: &[u8], decode: impl FnOnce(Option<Frame>) -> Result<T>) -> Result<T> {
    let mut reader = client.submit(request).await?;
    let deadline = client.command_timeout();

    match reader.read_frame(deadline).await {
        Ok(frame) => {
            let decoded = decode(frame);
            let outcome = match &decoded {
                Err(e) if e.is_connection_impacting() => PassOutcome::Disconnect,
                _ => PassOutcome::Healthy,
            };
            reader.pass(outcome).await;
            decoded
        }
        Err(e) => {
            reader.pass(PassOutcome::Disconnect).await;
            Err(e)
        }
    }
}

impl Client {
    /// `PING [msg]`. Without a message the server replies `+PONG\r\n`; with one
    /// it echoes the message back as a bulk string.
    pub async fn ping(&self, message: Option<&[u8]>) -> Result<Bytes> {
        let mut request = self.request_pool().acquire();
        match message {
            Some(msg) => {
                request.start(2);
                request.arg_raw(PING);
                request.arg_bytes(msg);
            }
            None => {
                request.start(1);
                request.arg_raw(PING);
            }
        }

        roundtrip(self, request.bytes(), |frame| decode::decode_bulk(frame).map(|b| b.unwrap_or_default())).await
    }

    /// `GET key`.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let mut request = self.request_pool().acquire();
        request.start(2);
        request.arg_raw(GET);
        request.arg_bytes(key);

        roundtrip(self, request.bytes(), decode::decode_bulk).await
    }

    /// `SET key value [EX seconds]`.
    pub async fn set(&self, key: &[u8], value: &[u8], expire: Option<Duration>) -> Result<()> {
        let mut request = self.request_pool().acquire();
        match expire {
            Some(ttl) => {
                request.start(5);
                request.arg_raw(SET);
                request.arg_bytes(key);
                request.arg_bytes(value);
                request.arg_raw(EX);
                request.arg_int(ttl.as_secs() as i64);
            }
            None => {
                request.start(3);
                request.arg_raw(SET);
                request.arg_bytes(key);
                request.arg_bytes(value);
            }
        }

        roundtrip(self, request.bytes(), decode::decode_ok).await
    }

    /// `DEL key [key ...]`.
    pub async fn del<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<u64> {
        let mut request = self.request_pool().acquire();
        request.start(1 + keys.len());
        request.arg_raw(DEL);
        for key in keys {
            request.arg_bytes(key.as_ref());
        }

        roundtrip(self, request.bytes(), |frame| decode::decode_integer(frame).map(|n| n as u64)).await
    }

    /// `INCR key`. A non-integer value at `key` surfaces as a `WRONGTYPE`
    /// server error without affecting the connection.
    pub async fn incr(&self, key: &[u8]) -> Result<i64> {
        let mut request = self.request_pool().acquire();
        request.start(2);
        request.arg_raw(INCR);
        request.arg_bytes(key);

        roundtrip(self, request.bytes(), decode::decode_integer).await
    }

    /// `APPEND key value`, returning the length of the string after the append.
    pub async fn append(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        let mut request = self.request_pool().acquire();
        request.start(3);
        request.arg_raw(APPEND);
        request.arg_bytes(key);
        request.arg_bytes(value);

        roundtrip(self, request.bytes(), |frame| decode::decode_integer(frame).map(|n| n as u64)).await
    }

    /// `RPUSH key value [value ...]`, returning the list length after the push.
    pub async fn rpush<V: AsRef<[u8]>>(&self, key: &[u8], values: &[V]) -> Result<u64> {
        let mut request = self.request_pool().acquire();
        request.start(2 + values.len());
        request.arg_raw(RPUSH);
        request.arg_bytes(key);
        for value in values {
            request.arg_bytes(value.as_ref());
        }

        roundtrip(self, request.bytes(), |frame| decode::decode_integer(frame).map(|n| n as u64)).await
    }

    /// `LRANGE key start stop`.
    pub async fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let mut request = self.request_pool().acquire();
        request.start(4);
        request.arg_raw(LRANGE);
        request.arg_bytes(key);
        request.arg_int(start);
        request.arg_int(stop);

        roundtrip(self, request.bytes(), |frame| decode::decode_array_bytes(frame).map(|v| v.unwrap_or_default())).await
    }

    /// `PUBLISH channel message`, returning the number of subscribers that
    /// received it.
    pub async fn publish(&self, channel: &[u8], message: &[u8]) -> Result<u64> {
        let mut request = self.request_pool().acquire();
        request.start(3);
        request.arg_raw(PUBLISH);
        request.arg_bytes(channel);
        request.arg_bytes(message);

        roundtrip(self, request.bytes(), |frame| decode::decode_integer(frame).map(|n| n as u64)).await
    }
}
