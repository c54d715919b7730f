//! The connection core: a connection slot shared by every clone of a
//! [`Client`], serializing writes and passing the reader role between
//! whichever callers currently have requests in flight.
//!
//! This module is built from the ground up to the multiplexing contract: a
//! cheap `Clone` handle (`Arc<Shared>`) around state a background task
//! maintains, holding the connection slot for its whole lifetime rather than
//! dialing once and assuming one in-flight command at a time.

mod disconnect;
mod reader;
mod reconnect;
mod slot;

use crate::addr::Address;
use crate::error::{Error, Result};
use crate::request::RequestPool;
use slot::Slot;

pub(crate) use reader::{PassOutcome, ReaderHandle};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::error::TrySendError, Mutex, Notify};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Construction parameters for a [`Client`].
#[derive(Debug, Clone)]
pub struct Config {
    address: Address,
    command_timeout: Option<Duration>,
    connect_timeout: Duration,
    password: Option<String>,
    database: i64,
}

impl Config {
    /// Starts from `address` (see [`Address::parse`] for the accepted forms),
    /// no command timeout, a 1 second connect timeout, no password, and
    /// database 0.
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            command_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            password: None,
            database: 0,
        }
    }

    /// Every command's write and read are each bounded by this duration.
    /// `Duration::ZERO` disables the timeout (the default).
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Bounds how long a single dial attempt may take. `Duration::ZERO` falls
    /// back to the 1 second default.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = if timeout.is_zero() { DEFAULT_CONNECT_TIMEOUT } else { timeout };
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }
}

pub(crate) struct Shared {
    pub(crate) slot: Mutex<Slot>,
    /// Wakes an active reader blocked in a socket read so Close can reclaim
    /// the reader role without waiting for that read to finish on its own.
    pub(crate) interrupt: Notify,
    /// Signaled once by whichever reader retires without parking or handing
    /// off to a live waiter, so Close can tell when it's safe to return.
    pub(crate) retired: Notify,
    pub(crate) addr: Address,
    pub(crate) command_timeout: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    pub(crate) password: Option<String>,
    pub(crate) database: i64,
    pub(crate) requests: RequestPool,
}

/// A multiplexed connection to a single Redis server node.
///
/// Cheap to clone: every clone shares the same underlying connection slot, so
/// many tasks can submit commands concurrently and have them automatically
/// pipelined over one socket. See the crate-level docs for the concurrency
/// discipline this relies on.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Builds a handle and starts the initial connection attempt in the
    /// background. Returns immediately; the handle is usable right away —
    /// commands issued before the connection comes up see the dial error
    /// until it succeeds.
    pub async fn connect(config: Config) -> Result<Client> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Offline("not yet connected".to_string())),
            interrupt: Notify::new(),
            retired: Notify::new(),
            addr: config.address,
            command_timeout: config.command_timeout,
            connect_timeout: config.connect_timeout,
            password: config.password,
            database: config.database,
            requests: RequestPool::new(),
        });

        tokio::spawn(reconnect::run(shared.clone()));

        Ok(Client { shared })
    }

    pub(crate) fn request_pool(&self) -> &RequestPool {
        &self.shared.requests
    }

    pub(crate) fn command_timeout(&self) -> Option<Duration> {
        self.shared.command_timeout
    }

    /// Submits a raw request frame, returning the reader handle once it is
    /// this caller's turn to read the response.
    pub(crate) async fn submit(&self, request: &[u8]) -> Result<ReaderHandle> {
        let mut guard = self.shared.slot.lock().await;

        match &mut *guard {
            Slot::Closed => Err(Error::closed()),
            Slot::Offline(message) => Err(Error::offline(message.clone())),
            Slot::Live(live) => {
                if let Err(write_err) = live.writer.write_request(request, self.shared.command_timeout).await {
                    // Publish Offline before dropping the guard so no other
                    // submit can write to this dead connection while we sort
                    // out who tears it down.
                    let idle = live.idle_reader.take();
                    *guard = Slot::Offline(write_err.to_string());
                    drop(guard);

                    match idle {
                        // No reader active elsewhere: nothing else holds this
                        // connection, so it's safe to tear down and reconnect
                        // right here.
                        Some(active) => {
                            drop(active);
                            tokio::spawn(reconnect::run(self.shared.clone()));
                        }
                        // A reader is active elsewhere on this same dying
                        // connection. Interrupt it and wait for its own
                        // `pass(Disconnect)` to retire and spawn reconnect,
                        // rather than racing a bare reconnect here that could
                        // republish a fresh Live slot before the stale reader
                        // notices the connection is gone.
                        None => {
                            self.shared.interrupt.notify_one();
                            self.shared.retired.notified().await;
                        }
                    }

                    return Err(write_err);
                }

                if let Some(active) = live.idle_reader.take() {
                    return Ok(ReaderHandle::new(active, self.shared.clone()));
                }

                let (tx, rx) = tokio::sync::oneshot::channel();
                match live.read_tx.try_send(tx) {
                    Ok(()) => {}
                    Err(TrySendError::Full(tx)) => {
                        // The queue is at capacity; wait for room the same way a
                        // writer in the reference design blocks here — holding the
                        // slot is exactly what lets disconnect-from-reader's
                        // non-blocking drain break this out if the reader has died.
                        let sender = live.read_tx.clone();
                        drop(guard);
                        if sender.send(tx).await.is_err() {
                            return Err(Error::connection_lost());
                        }
                        return self.await_handoff(rx).await;
                    }
                    Err(TrySendError::Closed(_)) => return Err(Error::connection_lost()),
                }

                drop(guard);
                self.await_handoff(rx).await
            }
        }
    }

    async fn await_handoff(&self, rx: tokio::sync::oneshot::Receiver<slot::Handoff>) -> Result<ReaderHandle> {
        match rx.await {
            Ok(slot::Handoff::Reader(active)) => Ok(ReaderHandle::new(active, self.shared.clone())),
            Ok(slot::Handoff::ConnectionLost) | Err(_) => Err(Error::connection_lost()),
        }
    }

    /// Idempotently tears the connection down. After this returns, every
    /// subsequent command on any clone of this handle sees the closed
    /// sentinel.
    pub async fn close(&self) {
        let mut guard = self.shared.slot.lock().await;
        match std::mem::replace(&mut *guard, Slot::Closed) {
            Slot::Closed => {}
            Slot::Offline(_) => {}
            Slot::Live(mut live) => {
                if live.idle_reader.take().is_some() {
                    // Nothing else to do: dropping `live` at the end of this
                    // arm closes both the writer and the idle reader's socket.
                } else {
                    drop(guard);
                    self.shared.interrupt.notify_one();
                    self.shared.retired.notified().await;
                    return;
                }
            }
        }
    }
}
