//! The pub/sub listener.
//!
//! A background task owns a connection dedicated to pub/sub and reacts to
//! both server pushes and user subscribe/unsubscribe/close requests arriving
//! over a command channel, reconnecting and resubscribing on its own when the
//! connection drops.

mod state;

use crate::addr::Address;
use crate::backoff::Backoff;
use crate::conn::{self, ConnReader, ConnWriter, PushFrame};
use crate::error::Error;
use crate::request::Request;
use state::SubscriptionState;

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MESSAGE_BUFFER_SIZE: usize = 32 * 1024;

/// Construction parameters for a [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    address: Address,
    connect_timeout: Duration,
    password: Option<String>,
    message_buffer_size: usize,
}

impl ListenerConfig {
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            password: None,
            message_buffer_size: DEFAULT_MESSAGE_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = if timeout.is_zero() { DEFAULT_CONNECT_TIMEOUT } else { timeout };
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Messages whose payload exceeds this many bytes are reported to the
    /// callback as a short-buffer error instead of being delivered.
    pub fn with_message_buffer_size(mut self, size: usize) -> Self {
        self.message_buffer_size = size;
        self
    }
}

/// One event delivered to a [`Listener`]'s callback.
#[derive(Debug)]
pub struct Message {
    /// Empty for events not tied to a particular channel (e.g. the terminal
    /// closed notification).
    pub channel: String,
    pub payload: Bytes,
    pub error: Option<Error>,
}

impl Message {
    fn received(channel: String, payload: Bytes) -> Self {
        Self { channel, payload, error: None }
    }

    fn failed(channel: String, error: Error) -> Self {
        Self { channel, payload: Bytes::new(), error: Some(error) }
    }
}

type Callback = Box<dyn Fn(Message) + Send + Sync>;

enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Close,
}

/// A handle to a background task maintaining a pub/sub connection. Not
/// `Clone`: `close` consumes the handle so the termination rendezvous (the
/// background task's `JoinHandle`) has exactly one owner.
pub struct Listener {
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: tokio::task::JoinHandle<()>,
}

impl Listener {
    /// Starts the background reader/writer task and returns immediately. The
    /// callback is invoked on every message, and exactly once more with the
    /// terminal closed error right before the task exits.
    pub fn connect(config: ListenerConfig, callback: impl Fn(Message) + Send + Sync + 'static) -> Listener {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(config, Box::new(callback), cmd_rx));
        Listener { cmd_tx, task }
    }

    /// Adds `channels` to the desired subscription set, emitting `SUBSCRIBE`
    /// immediately if a connection is currently up.
    pub fn subscribe<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _ = self.cmd_tx.send(Command::Subscribe(channels.into_iter().map(Into::into).collect()));
    }

    /// Removes `channels` from the desired subscription set, emitting
    /// `UNSUBSCRIBE` immediately if a connection is currently up.
    pub fn unsubscribe<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _ = self.cmd_tx.send(Command::Unsubscribe(channels.into_iter().map(Into::into).collect()));
    }

    /// Terminates the reconnect loop, the reader, and the callback dispatch
    /// cycle, waiting for the background task to actually exit.
    pub async fn close(self) {
        let _ = self.cmd_tx.send(Command::Close);
        let _ = self.task.await;
    }
}

async fn run(config: ListenerConfig, callback: Callback, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut state = SubscriptionState::default();
    let mut backoff = Backoff::new();

    'reconnect: loop {
        let (mut writer, mut reader) = match dial_and_handshake(&config).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(address = %config.address, error = %e, "listener dial failed");
                callback(Message::failed(String::new(), e));

                tokio::select! {
                    _ = tokio::time::sleep(backoff.next_delay()) => continue 'reconnect,
                    cmd = cmd_rx.recv() => {
                        if drain_until_close(cmd, &mut cmd_rx, &mut state).await {
                            return;
                        }
                        continue 'reconnect;
                    }
                }
            }
        };
        backoff = Backoff::new();

        if !state.desired.is_empty() {
            let channels: Vec<String> = state.desired.iter().cloned().collect();
            if let Err(e) = send_subscribe(&mut writer, "SUBSCRIBE", &channels).await {
                callback(Message::failed(String::new(), e));
                continue 'reconnect;
            }
        }

        loop {
            tokio::select! {
                frame = reader.read_push_frame(config.message_buffer_size as u64, None) => {
                    match frame {
                        Ok(Some(raw)) => handle_push(raw, &mut state, &callback),
                        Ok(None) => {
                            callback(Message::failed(String::new(), Error::connection_lost()));
                            state.reset_confirmed();
                            continue 'reconnect;
                        }
                        Err(e) => {
                            callback(Message::failed(String::new(), e));
                            state.reset_confirmed();
                            continue 'reconnect;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(channels)) => {
                            state.add_desired(channels.iter().cloned());
                            if let Err(e) = send_subscribe(&mut writer, "SUBSCRIBE", &channels).await {
                                callback(Message::failed(String::new(), e));
                                state.reset_confirmed();
                                continue 'reconnect;
                            }
                        }
                        Some(Command::Unsubscribe(channels)) => {
                            state.remove_desired(&channels);
                            if let Err(e) = send_subscribe(&mut writer, "UNSUBSCRIBE", &channels).await {
                                callback(Message::failed(String::new(), e));
                                state.reset_confirmed();
                                continue 'reconnect;
                            }
                        }
                        Some(Command::Close) | None => {
                            callback(Message::failed(String::new(), Error::closed()));
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Drains commands received while offline between backoff attempts; `true`
/// means the caller should stop entirely (an explicit close, or the last
/// handle having been dropped).
async fn drain_until_close(first: Option<Command>, cmd_rx: &mut mpsc::UnboundedReceiver<Command>, state: &mut SubscriptionState) -> bool {
    match first {
        Some(Command::Subscribe(channels)) => state.add_desired(channels),
        Some(Command::Unsubscribe(channels)) => state.remove_desired(&channels),
        Some(Command::Close) | None => return true,
    }

    loop {
        match cmd_rx.try_recv() {
            Ok(Command::Subscribe(channels)) => state.add_desired(channels),
            Ok(Command::Unsubscribe(channels)) => state.remove_desired(&channels),
            Ok(Command::Close) => return true,
            Err(mpsc::error::TryRecvError::Empty) => return false,
            Err(mpsc::error::TryRecvError::Disconnected) => return true,
        }
    }
}

fn handle_push(frame: PushFrame, state: &mut SubscriptionState, callback: &Callback) {
    match frame {
        PushFrame::Message { channel, payload } => {
            if state.is_confirmed(&channel) {
                callback(Message::received(channel, payload));
            }
        }
        // The payload has already been skipped off the wire without being
        // buffered; report the overflow without touching `is_confirmed` since
        // there's no payload to withhold from an unconfirmed channel.
        PushFrame::Oversized { channel, .. } => {
            callback(Message::failed(channel, Error::protocol("message payload exceeds the configured buffer size")));
        }
        PushFrame::Subscribed { channel } => state.confirm(channel),
        PushFrame::Unsubscribed { channel } => state.disconfirm(&channel),
    }
}

async fn dial_and_handshake(config: &ListenerConfig) -> crate::error::Result<(ConnWriter, ConnReader)> {
    let (read_half, write_half) = match &config.address {
        Address::Tcp { host, port } => conn::dial_tcp(host, *port, config.connect_timeout).await?,
        Address::Unix(path) => conn::dial_unix(path, config.connect_timeout).await?,
    };

    let mut writer = ConnWriter::new(write_half);
    let mut reader = ConnReader::new(read_half);

    if let Some(password) = &config.password {
        let mut request = Request::new();
        request.start(2);
        request.arg_bytes(b"AUTH");
        request.arg_bytes(password.as_bytes());
        writer.write_request(request.bytes(), Some(config.connect_timeout)).await?;
        let frame = reader.read_frame(Some(config.connect_timeout)).await?;
        crate::decode::decode_ok(frame)?;
    }

    Ok((writer, reader))
}

async fn send_subscribe(writer: &mut ConnWriter, verb: &str, channels: &[String]) -> crate::error::Result<()> {
    let mut request = Request::new();
    request.start(1 + channels.len());
    request.arg_bytes(verb.as_bytes());
    for channel in channels {
        request.arg_bytes(channel.as_bytes());
    }
    writer.write_request(request.bytes(), None).await
}
