//! A scripted RESP server for integration-testing the connection core without
//! a real Redis. Speaks just enough of the protocol to answer the command set
//! in `src/commands.rs` plus `AUTH`/`SELECT`/`SUBSCRIBE`/`UNSUBSCRIBE`, backed
//! by an in-memory store and a pub/sub fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

#[derive(Clone)]
enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
}

#[derive(Default)]
struct Store {
    data: HashMap<Vec<u8>, Value>,
    channels: HashMap<String, broadcast::Sender<Bytes>>,
    /// Set by `MockServer::delay_next_reply`; consumed by the next command
    /// any connection handles, simulating a server stall for timeout tests.
    delay_next: Option<std::time::Duration>,
}

/// A running mock server. Accepts connections until dropped; each connection
/// is served by its own task for the lifetime of the test.
pub struct MockServer {
    pub addr: std::net::SocketAddr,
    store: Arc<Mutex<Store>>,
    connections: Arc<Mutex<Vec<tokio::task::AbortHandle>>>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        Self::start_refusing(0).await
    }

    /// The first `refuse_first` accepted connections are closed immediately
    /// after accept, simulating a server that is briefly unreachable so tests
    /// can exercise reconnect-with-backoff.
    pub async fn start_refusing(refuse_first: usize) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Mutex::new(Store::default()));
        let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(refuse_first));
        let connections = Arc::new(Mutex::new(Vec::new()));

        let accept_store = store.clone();
        let accept_connections = connections.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };

                if remaining.load(Ordering::SeqCst) > 0 {
                    remaining.fetch_sub(1, Ordering::SeqCst);
                    drop(stream);
                    continue;
                }

                let store = accept_store.clone();
                let handle = tokio::spawn(async move {
                    let _ = handle_connection(stream, store).await;
                });
                accept_connections.lock().unwrap().push(handle.abort_handle());
            }
        });

        MockServer { addr, store, connections }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Publishes directly into the store's fan-out, bypassing the wire.
    pub fn publish(&self, channel: &str, payload: &[u8]) {
        let store = self.store.lock().unwrap();
        if let Some(tx) = store.channels.get(channel) {
            let _ = tx.send(Bytes::copy_from_slice(payload));
        }
    }

    /// The next command received on any connection waits `delay` before a
    /// reply is written, simulating a stalled server for timeout tests.
    pub fn delay_next_reply(&self, delay: std::time::Duration) {
        self.store.lock().unwrap().delay_next = Some(delay);
    }

    /// Aborts every connection handler task currently running, simulating the
    /// server dropping all connections out from under its clients.
    pub fn drop_all_connections(&self) {
        for handle in self.connections.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

async fn handle_connection(mut stream: TcpStream, store: Arc<Mutex<Store>>) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<(String, Bytes)>();
    let mut stop_flags: HashMap<String, Arc<AtomicBool>> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            result = read_command(&mut stream, &mut buf) => {
                match result? {
                    None => return Ok(()),
                    Some(args) => {
                        let delay = store.lock().unwrap().delay_next.take();
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        dispatch(&mut stream, &store, args, &push_tx, &mut stop_flags).await?
                    }
                }
            }
            push = push_rx.recv() => {
                if let Some((channel, payload)) = push {
                    write_array3(&mut stream, b"message", channel.as_bytes(), &payload).await?;
                }
            }
        }
    }
}

async fn dispatch(
    stream: &mut TcpStream,
    store: &Arc<Mutex<Store>>,
    args: Vec<Bytes>,
    push_tx: &mpsc::UnboundedSender<(String, Bytes)>,
    stop_flags: &mut HashMap<String, Arc<AtomicBool>>,
) -> std::io::Result<()> {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

    match name.as_str() {
        "PING" => {
            if args.len() > 1 {
                write_bulk(stream, Some(&args[1])).await?;
            } else {
                write_simple(stream, "PONG").await?;
            }
        }
        "AUTH" | "SELECT" => write_simple(stream, "OK").await?,
        "GET" => {
            let store = store.lock().unwrap();
            match store.data.get(&args[1][..]) {
                Some(Value::Str(v)) => write_bulk(stream, Some(&v.clone())).await?,
                Some(Value::List(_)) => write_error(stream, "WRONGTYPE Operation against a key holding the wrong kind of value").await?,
                None => write_bulk(stream, None).await?,
            }
        }
        "SET" => {
            store.lock().unwrap().data.insert(args[1].to_vec(), Value::Str(args[2].clone()));
            write_simple(stream, "OK").await?;
        }
        "DEL" => {
            let n = {
                let mut store = store.lock().unwrap();
                args[1..].iter().filter(|k| store.data.remove(&k[..]).is_some()).count()
            };
            write_integer(stream, n as u64).await?;
        }
        "INCR" => {
            let outcome = {
                let mut store = store.lock().unwrap();
                let entry = store.data.entry(args[1].to_vec()).or_insert_with(|| Value::Str(Bytes::from_static(b"0")));
                match entry {
                    Value::Str(v) => match std::str::from_utf8(v).ok().and_then(|s| s.parse::<i64>().ok()) {
                        Some(n) => {
                            let n = n + 1;
                            *v = Bytes::from(n.to_string());
                            Ok(n)
                        }
                        None => Err("ERR value is not an integer or out of range"),
                    },
                    Value::List(_) => Err("WRONGTYPE Operation against a key holding the wrong kind of value"),
                }
            };
            match outcome {
                Ok(n) => write_integer(stream, n as u64).await?,
                Err(msg) => write_error(stream, msg).await?,
            }
        }
        "APPEND" => {
            let len = {
                let mut store = store.lock().unwrap();
                let entry = store.data.entry(args[1].to_vec()).or_insert_with(|| Value::Str(Bytes::new()));
                match entry {
                    Value::Str(v) => {
                        let mut combined = v.to_vec();
                        combined.extend_from_slice(&args[2]);
                        *v = Bytes::from(combined);
                        v.len()
                    }
                    Value::List(_) => 0,
                }
            };
            write_integer(stream, len as u64).await?;
        }
        "RPUSH" => {
            let len = {
                let mut store = store.lock().unwrap();
                let entry = store.data.entry(args[1].to_vec()).or_insert_with(|| Value::List(VecDeque::new()));
                match entry {
                    Value::List(list) => {
                        list.extend(args[2..].iter().cloned());
                        list.len()
                    }
                    Value::Str(_) => 0,
                }
            };
            write_integer(stream, len as u64).await?;
        }
        "LRANGE" => {
            let items: Vec<Bytes> = {
                let store = store.lock().unwrap();
                match store.data.get(&args[1][..]) {
                    Some(Value::List(list)) => list.iter().cloned().collect(),
                    _ => Vec::new(),
                }
            };
            write_array_bulk(stream, &items).await?;
        }
        "PUBLISH" => {
            let subscribers = {
                let mut store = store.lock().unwrap();
                let channel = String::from_utf8_lossy(&args[1]).to_string();
                store.channels.entry(channel).or_insert_with(|| broadcast::channel(64).0).receiver_count()
            };
            write_integer(stream, subscribers as u64).await?;
        }
        "SUBSCRIBE" => {
            for channel in &args[1..] {
                let channel_name = String::from_utf8_lossy(channel).to_string();
                let rx = {
                    let mut store = store.lock().unwrap();
                    store.channels.entry(channel_name.clone()).or_insert_with(|| broadcast::channel(64).0).subscribe()
                };

                let stop = Arc::new(AtomicBool::new(false));
                stop_flags.insert(channel_name.clone(), stop.clone());
                spawn_forwarder(rx, channel_name.clone(), push_tx.clone(), stop);

                write_subscription_ack(stream, b"subscribe", channel_name.as_bytes(), stop_flags.len() as i64).await?;
            }
        }
        "UNSUBSCRIBE" => {
            for channel in &args[1..] {
                let channel_name = String::from_utf8_lossy(channel).to_string();
                if let Some(stop) = stop_flags.remove(&channel_name) {
                    stop.store(true, Ordering::SeqCst);
                }
                write_subscription_ack(stream, b"unsubscribe", channel_name.as_bytes(), stop_flags.len() as i64).await?;
            }
        }
        _ => write_error(stream, &format!("ERR unknown command `{name}`")).await?,
    }

    Ok(())
}

fn spawn_forwarder(mut rx: broadcast::Receiver<Bytes>, channel: String, tx: mpsc::UnboundedSender<(String, Bytes)>, stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    if stop.load(Ordering::SeqCst) || tx.send((channel.clone(), payload)).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });
}

async fn read_command(stream: &mut TcpStream, buf: &mut BytesMut) -> std::io::Result<Option<Vec<Bytes>>> {
    loop {
        if let Some(args) = try_parse_command(buf) {
            return Ok(Some(args));
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn try_parse_command(buf: &mut BytesMut) -> Option<Vec<Bytes>> {
    let text = &buf[..];
    if text.is_empty() || text[0] != b'*' {
        return None;
    }
    let (argc, mut pos) = read_decimal_line(text, 1)?;

    let mut args = Vec::with_capacity(argc.max(0) as usize);
    for _ in 0..argc {
        if pos >= text.len() || text[pos] != b'$' {
            return None;
        }
        let (len, next) = read_decimal_line(text, pos + 1)?;
        pos = next;
        let len = len as usize;
        if pos + len + 2 > text.len() {
            return None;
        }
        args.push(Bytes::copy_from_slice(&text[pos..pos + len]));
        pos += len + 2;
    }

    buf.advance(pos);
    Some(args)
}

fn read_decimal_line(text: &[u8], start: usize) -> Option<(i64, usize)> {
    let rest = text.get(start..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    let value: i64 = std::str::from_utf8(&rest[..end]).ok()?.parse().ok()?;
    Some((value, start + end + 2))
}

async fn write_simple(stream: &mut TcpStream, s: &str) -> std::io::Result<()> {
    stream.write_all(format!("+{s}\r\n").as_bytes()).await
}

async fn write_error(stream: &mut TcpStream, s: &str) -> std::io::Result<()> {
    stream.write_all(format!("-{s}\r\n").as_bytes()).await
}

async fn write_integer(stream: &mut TcpStream, n: u64) -> std::io::Result<()> {
    stream.write_all(format!(":{n}\r\n").as_bytes()).await
}

async fn write_bulk(stream: &mut TcpStream, value: Option<&Bytes>) -> std::io::Result<()> {
    match value {
        Some(v) => {
            stream.write_all(format!("${}\r\n", v.len()).as_bytes()).await?;
            stream.write_all(v).await?;
            stream.write_all(b"\r\n").await
        }
        None => stream.write_all(b"$-1\r\n").await,
    }
}

async fn write_array_bulk(stream: &mut TcpStream, items: &[Bytes]) -> std::io::Result<()> {
    stream.write_all(format!("*{}\r\n", items.len()).as_bytes()).await?;
    for item in items {
        write_bulk(stream, Some(item)).await?;
    }
    Ok(())
}

async fn write_array3(stream: &mut TcpStream, kind: &[u8], channel: &[u8], payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(b"*3\r\n").await?;
    write_bulk(stream, Some(&Bytes::copy_from_slice(kind))).await?;
    write_bulk(stream, Some(&Bytes::copy_from_slice(channel))).await?;
    write_bulk(stream, Some(&Bytes::copy_from_slice(payload))).await?;
    Ok(())
}

/// `subscribe`/`unsubscribe` confirmations carry their count as an integer
/// reply, not a bulk string.
async fn write_subscription_ack(stream: &mut TcpStream, kind: &[u8], channel: &[u8], count: i64) -> std::io::Result<()> {
    stream.write_all(b"*3\r\n").await?;
    write_bulk(stream, Some(&Bytes::copy_from_slice(kind))).await?;
    write_bulk(stream, Some(&Bytes::copy_from_slice(channel))).await?;
    write_integer(stream, count as u64).await
}
