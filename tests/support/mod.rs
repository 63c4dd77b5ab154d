//! In-process fake broker for integration tests.
//!
//! Speaks just enough of the protocol to drive a client: verbose acks,
//! credential checks, subject routing with `*`/`>` wildcards, and a payload
//! limit. Every `SUB` line it receives is recorded, and all live sockets
//! can be dropped at once to simulate a transport failure. Handshakes can
//! be held back to keep a client mid-reconnect.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use natwire::{ConnectionInfo, NoopLogger};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;

pub const USER: &str = "nats";
pub const PASS: &str = "nats";
pub const MAX_PAYLOAD: usize = 1024;

#[derive(Deserialize)]
struct ConnectBody {
    verbose: bool,
    user: String,
    pass: String,
}

struct Client {
    outbound: mpsc::UnboundedSender<Bytes>,
    tasks: Vec<AbortHandle>,
}

struct Route {
    client: u64,
    pattern: String,
    sid: u64,
}

#[derive(Default)]
struct State {
    clients: Mutex<HashMap<u64, Client>>,
    routes: Mutex<Vec<Route>>,
    sub_lines: Mutex<Vec<String>>,
    /// `SUB`, `UNSUB` and `PUB` lines from every client, in arrival order.
    control_lines: Mutex<Vec<String>>,
    hold_handshakes: AtomicBool,
    handshake_released: Notify,
    next_client: AtomicU64,
    accepted: AtomicUsize,
}

impl State {
    fn send_to(&self, client: u64, bytes: Bytes) {
        if let Some(client) = self.clients.lock().unwrap().get(&client) {
            let _ = client.outbound.send(bytes);
        }
    }

    async fn handshake_gate(&self) {
        loop {
            let released = self.handshake_released.notified();
            if !self.hold_handshakes.load(Ordering::SeqCst) {
                return;
            }
            released.await;
        }
    }

    fn forget(&self, client: u64) {
        self.clients.lock().unwrap().remove(&client);
        self.routes.lock().unwrap().retain(|r| r.client != client);
    }
}

pub struct FakeBroker {
    addr: String,
    state: Arc<State>,
    accept: AbortHandle,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(State::default());

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accept_client(accept_state.clone(), stream);
            }
        })
        .abort_handle();

        Self {
            addr,
            state,
            accept,
        }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Endpoint with the broker's credentials.
    pub fn info(&self) -> ConnectionInfo {
        self.info_with(USER, PASS)
    }

    pub fn info_with(&self, user: &str, pass: &str) -> ConnectionInfo {
        ConnectionInfo::new(self.addr(), user, pass).with_logger(Arc::new(NoopLogger))
    }

    /// Every `SUB` control line received so far, without CRLF.
    pub fn sub_lines(&self) -> Vec<String> {
        self.state.sub_lines.lock().unwrap().clone()
    }

    /// `SUB`, `UNSUB` and `PUB` control lines received so far, in order.
    pub fn control_lines(&self) -> Vec<String> {
        self.state.control_lines.lock().unwrap().clone()
    }

    /// While held, `CONNECT` gets no answer.
    pub fn hold_handshakes(&self, hold: bool) {
        self.state.hold_handshakes.store(hold, Ordering::SeqCst);
        if !hold {
            self.state.handshake_released.notify_waiters();
        }
    }

    /// Connections accepted since start.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.state.clients.lock().unwrap().len()
    }

    /// Drop every client socket.
    pub fn kill_connections(&self) {
        let clients: Vec<Client> = self
            .state
            .clients
            .lock()
            .unwrap()
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in clients {
            for task in client.tasks {
                task.abort();
            }
        }
        self.state.routes.lock().unwrap().clear();
    }

    /// Write raw bytes to every connected client.
    pub fn inject(&self, bytes: &'static [u8]) {
        for client in self.state.clients.lock().unwrap().values() {
            let _ = client.outbound.send(Bytes::from_static(bytes));
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept.abort();
        self.kill_connections();
    }
}

fn accept_client(state: Arc<State>, stream: TcpStream) {
    state.accepted.fetch_add(1, Ordering::SeqCst);
    let id = state.next_client.fetch_add(1, Ordering::SeqCst);
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    let _ = tx.send(Bytes::from_static(
        b"INFO {\"server_id\":\"fake\",\"max_payload\":1024}\r\n",
    ));

    // Registered before the reader starts so its first reply has a target.
    state.clients.lock().unwrap().insert(
        id,
        Client {
            outbound: tx,
            tasks: Vec::new(),
        },
    );

    let writer = tokio::spawn(write_loop(write_half, rx)).abort_handle();
    let reader = {
        let state = state.clone();
        tokio::spawn(async move {
            let _ = read_loop(&state, id, read_half).await;
            state.forget(id);
        })
        .abort_handle()
    };

    // Absent if the reader already finished and cleaned up.
    if let Some(client) = state.clients.lock().unwrap().get_mut(&id) {
        client.tasks = vec![reader, writer];
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(state: &State, id: u64, read_half: OwnedReadHalf) -> std::io::Result<()> {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    let mut authed = false;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }

        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        let (op, rest) = text.split_once(' ').unwrap_or((text.as_str(), ""));
        if matches!(op, "SUB" | "UNSUB" | "PUB") {
            state.control_lines.lock().unwrap().push(text.clone());
        }

        if !authed && op != "CONNECT" {
            state.send_to(id, err("Authorization Violation"));
            return Ok(());
        }

        match op {
            "CONNECT" => {
                let body: ConnectBody = serde_json::from_str(rest)?;
                state.handshake_gate().await;
                if !body.verbose || body.user != USER || body.pass != PASS {
                    state.send_to(id, err("Authorization Violation"));
                    return Ok(());
                }
                authed = true;
                state.send_to(id, ok());
            }
            "PING" => state.send_to(id, Bytes::from_static(b"PONG\r\n")),
            "PONG" => {}
            "SUB" => {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                let [subject, sid] = tokens[..] else {
                    state.send_to(id, err("Unknown Protocol Operation"));
                    continue;
                };
                state.sub_lines.lock().unwrap().push(text.clone());
                state.routes.lock().unwrap().push(Route {
                    client: id,
                    pattern: subject.to_string(),
                    sid: sid.parse().unwrap_or(0),
                });
                state.send_to(id, ok());
            }
            "UNSUB" => {
                let sid: u64 = rest.trim().parse().unwrap_or(0);
                state
                    .routes
                    .lock()
                    .unwrap()
                    .retain(|r| !(r.client == id && r.sid == sid));
                state.send_to(id, ok());
            }
            "PUB" => {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                let (subject, reply_to, len) = match tokens[..] {
                    [subject, len] => (subject, None, len),
                    [subject, reply_to, len] => (subject, Some(reply_to), len),
                    _ => {
                        state.send_to(id, err("Unknown Protocol Operation"));
                        continue;
                    }
                };
                let len: usize = len.parse().unwrap_or(0);

                let mut payload = vec![0u8; len + 2];
                reader.read_exact(&mut payload).await?;
                payload.truncate(len);

                if len > MAX_PAYLOAD {
                    state.send_to(id, err("Maximum Payload Violation"));
                    continue;
                }

                route(state, subject, reply_to, &payload);
                state.send_to(id, ok());
            }
            _ => state.send_to(id, err("Unknown Protocol Operation")),
        }
    }
}

fn route(state: &State, subject: &str, reply_to: Option<&str>, payload: &[u8]) {
    let targets: Vec<(u64, u64)> = state
        .routes
        .lock()
        .unwrap()
        .iter()
        .filter(|r| subject_matches(&r.pattern, subject))
        .map(|r| (r.client, r.sid))
        .collect();

    for (client, sid) in targets {
        let header = match reply_to {
            Some(reply_to) => format!("MSG {} {} {} {}\r\n", subject, sid, reply_to, payload.len()),
            None => format!("MSG {} {} {}\r\n", subject, sid, payload.len()),
        };
        let mut frame = header.into_bytes();
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        state.send_to(client, Bytes::from(frame));
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn ok() -> Bytes {
    Bytes::from_static(b"+OK\r\n")
}

fn err(message: &str) -> Bytes {
    Bytes::from(format!("-ERR '{}'\r\n", message))
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 2s");
}
