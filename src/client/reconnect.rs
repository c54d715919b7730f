//! The reconnect loop. One task per connection attempt cycle: spawned
//! at construction and again by any write or read failure, it dials until it
//! either succeeds or discovers the slot has been closed out from under it.

use super::slot::{ActiveReader, LiveSlot, Slot, TCP_QUEUE_CAPACITY, UNIX_QUEUE_CAPACITY};
use super::Shared;
use crate::addr::Address;
use crate::backoff::Backoff;
use crate::conn::{self, ConnReader, ConnWriter};
use crate::error::Result;
use crate::request::Request;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) async fn run(shared: Arc<Shared>) {
    let mut backoff = Backoff::new();

    loop {
        match dial_and_handshake(&shared).await {
            Ok((writer, reader)) => {
                let capacity = if shared.addr.is_unix() { UNIX_QUEUE_CAPACITY } else { TCP_QUEUE_CAPACITY };
                let (read_tx, read_rx) = mpsc::channel(capacity);
                let live = LiveSlot {
                    writer,
                    read_tx,
                    idle_reader: Some(ActiveReader { conn: reader, queue_rx: read_rx }),
                };

                let mut guard = shared.slot.lock().await;
                if matches!(*guard, Slot::Closed) {
                    // Closed always wins races against a looping reconnector.
                    return;
                }
                *guard = Slot::Live(live);
                tracing::debug!(address = %shared.addr, "connection established");
                return;
            }
            Err(e) => {
                tracing::warn!(address = %shared.addr, error = %e, "dial failed");

                let mut guard = shared.slot.lock().await;
                if matches!(*guard, Slot::Closed) {
                    return;
                }
                *guard = Slot::Offline(e.to_string());
                drop(guard);

                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}

async fn dial_and_handshake(shared: &Arc<Shared>) -> Result<(ConnWriter, ConnReader)> {
    let (read_half, write_half) = match &shared.addr {
        Address::Tcp { host, port } => conn::dial_tcp(host, *port, shared.connect_timeout).await?,
        Address::Unix(path) => conn::dial_unix(path, shared.connect_timeout).await?,
    };

    let mut writer = ConnWriter::new(write_half);
    let mut reader = ConnReader::new(read_half);

    if let Some(password) = &shared.password {
        send_handshake_command(&mut writer, &mut reader, shared.connect_timeout, &[b"AUTH", password.as_bytes()]).await?;
    }

    if shared.database != 0 {
        let db = shared.database.to_string();
        send_handshake_command(&mut writer, &mut reader, shared.connect_timeout, &[b"SELECT", db.as_bytes()]).await?;
    }

    Ok((writer, reader))
}

async fn send_handshake_command(writer: &mut ConnWriter, reader: &mut ConnReader, deadline: Duration, args: &[&[u8]]) -> Result<()> {
    let mut request = Request::new();
    request.start(args.len());
    for arg in args {
        request.arg_bytes(arg);
    }

    writer.write_request(request.bytes(), Some(deadline)).await?;
    let frame = reader.read_frame(Some(deadline)).await?;
    crate::decode::decode_ok(frame)
}
