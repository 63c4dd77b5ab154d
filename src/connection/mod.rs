//! A single live connection to the broker.
//!
//! Each [`Connection`] owns one transport and two tasks:
//!
//! ```text
//!              ┌──────────── read loop ◄──── transport read half
//!              │   PING ─► queue PONG
//!              │   PONG ─► oldest pong waiter
//!              │   +OK/-ERR ─► ack slot (capacity 1)
//!              │   MSG ─► message queue ─► on_message handler
//!              │
//! callers ─► writer channel ─► writer task ─► transport write half
//! ```
//!
//! The ack slot holds one entry. An ack nobody has collected yet stalls the
//! read loop, so acks are matched to control frames strictly in order.
//!
//! Any read or write failure moves the connection to
//! [`ConnectionState::Failed`] exactly once; [`Connection::disconnected`]
//! resolves on that transition. A failed or closed connection is never
//! reused: the owner dials a new one.

mod config;
mod lifecycle;

pub use config::ConnectionConfig;
pub use lifecycle::{ConnectionState, Lifecycle};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde_json::json;
use tokio::io::BufReader;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::error::{NatwireError, Result};
use crate::logger::Logger;
use crate::protocol::{Frame, FrameReader};
use crate::transport::{self, split_stream, BoxedReader, Transport};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    /// Subscription the server routed this message to.
    pub subscriber_id: u64,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// `Ok` for `+OK`, the server's text for `-ERR`.
type Ack = std::result::Result<(), String>;

struct Shared {
    lifecycle: Lifecycle,
    writer: WriterHandle,
    acks: AsyncMutex<mpsc::Receiver<Ack>>,
    /// Acks owed to round-trips whose callers went away before collecting.
    abandoned_acks: AtomicUsize,
    pong_waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
    messages: Mutex<Option<mpsc::Receiver<Message>>>,
    round_trip: AsyncMutex<()>,
    config: ConnectionConfig,
    logger: Arc<dyn Logger>,
}

impl Shared {
    async fn send(&self, frame: &Frame) -> Result<()> {
        if !self.lifecycle.is_open() {
            return Err(NatwireError::Disconnected);
        }

        let outbound = OutboundFrame::from_frame(frame)?;
        tokio::select! {
            sent = self.writer.send(outbound) => sent,
            _ = self.lifecycle.terminated() => Err(NatwireError::Disconnected),
        }
    }
}

/// Armed while a round-trip waits for its ack. Dropping it armed records
/// that the ack will arrive with nobody to take it.
struct PendingAck<'a> {
    abandoned: &'a AtomicUsize,
    armed: bool,
}

impl<'a> PendingAck<'a> {
    fn new(abandoned: &'a AtomicUsize) -> Self {
        Self {
            abandoned,
            armed: true,
        }
    }

    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Closes the connection once the last user handle is dropped.
struct CloseOnDrop(Lifecycle);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Handle to one live connection.
///
/// Cloning is cheap; every clone refers to the same transport. The
/// connection closes when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    _guard: Arc<CloseOnDrop>,
}

impl Connection {
    /// Dial `addr` over TCP and start the connection's tasks.
    ///
    /// Nothing is spawned unless the dial succeeds.
    pub async fn dial(
        addr: &str,
        config: ConnectionConfig,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        logger.debugd(json!({ "addr": addr }), "connection.dial.start");

        let stream = match transport::dial(addr, config.dial_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                logger.warnd(
                    json!({ "addr": addr, "error": e.to_string() }),
                    "connection.dial.failed",
                );
                return Err(e);
            }
        };

        Ok(Self::from_stream(stream, config, logger))
    }

    /// Wrap an already connected stream and start the connection's tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S: Transport>(
        stream: S,
        config: ConnectionConfig,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let (read_half, write_half) = split_stream(stream);
        let lifecycle = Lifecycle::new(logger.clone());

        let (writer, _writer_task) =
            spawn_writer_task(write_half, config.write_channel_capacity, lifecycle.clone());
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let (message_tx, message_rx) = mpsc::channel(1);

        let reader = FrameReader::with_max_payload(
            BufReader::with_capacity(config.read_buffer_size, read_half),
            config.max_payload_size,
        );

        let shared = Arc::new(Shared {
            lifecycle: lifecycle.clone(),
            writer,
            acks: AsyncMutex::new(ack_rx),
            abandoned_acks: AtomicUsize::new(0),
            pong_waiters: Mutex::new(VecDeque::new()),
            messages: Mutex::new(Some(message_rx)),
            round_trip: AsyncMutex::new(()),
            config,
            logger,
        });

        let read_loop = ReadLoop {
            reader,
            ack_tx,
            message_tx,
            shared: shared.clone(),
        };
        tokio::spawn(read_loop.run());

        Self {
            shared,
            _guard: Arc::new(CloseOnDrop(lifecycle)),
        }
    }

    /// Exchange credentials. A rejection carries the server's text verbatim.
    ///
    /// A server that stays silent past `handshake_timeout` gets the
    /// connection closed and `HandshakeTimeout` returned.
    pub async fn handshake(&self, user: &str, pass: &str) -> Result<()> {
        let frame = Frame::Connect {
            user: user.to_string(),
            pass: pass.to_string(),
        };

        let result =
            match tokio::time::timeout(self.shared.config.handshake_timeout, self.request(&frame))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    self.close();
                    Err(NatwireError::HandshakeTimeout)
                }
            };

        result.map_err(|e| {
            self.shared.logger.warnd(
                json!({ "user": user, "error": e.to_string() }),
                "connection.handshake.failed",
            );
            e
        })
    }

    /// Queue a frame on the writer.
    ///
    /// Fails with `Disconnected` once the connection has left the open
    /// state. Completion means the frame was queued, not written.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.shared.send(frame).await
    }

    /// Wait for the next `+OK` or `-ERR`.
    ///
    /// Callers are served in arrival order. A `-ERR` becomes
    /// `NatwireError::Protocol` with the server's text.
    pub async fn ack_or_error(&self) -> Result<()> {
        let mut acks = self.shared.acks.lock().await;

        // Acks of abandoned round-trips come first; they belong to nobody.
        while self.shared.abandoned_acks.load(Ordering::SeqCst) > 0 {
            let stale = tokio::select! {
                biased;
                ack = acks.recv() => ack,
                _ = self.shared.lifecycle.terminated() => None,
            };
            if stale.is_none() {
                return Err(NatwireError::Disconnected);
            }
            self.shared.abandoned_acks.fetch_sub(1, Ordering::SeqCst);
            self.shared.logger.debug("connection.ack.discarded");
        }

        let ack = tokio::select! {
            biased;
            ack = acks.recv() => ack,
            _ = self.shared.lifecycle.terminated() => None,
        };

        match ack {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => {
                self.shared
                    .logger
                    .debugd(json!({ "message": message }), "connection.ack.negative");
                Err(NatwireError::Protocol(message))
            }
            None => Err(NatwireError::Disconnected),
        }
    }

    /// Send a control frame and wait for its ack.
    ///
    /// Round-trips on one connection are serialized, so concurrent callers
    /// never collect each other's acks. A round-trip dropped after its
    /// frame was queued leaves its ack to be discarded by the next one.
    pub async fn request(&self, frame: &Frame) -> Result<()> {
        let _round_trip = self.shared.round_trip.lock().await;
        self.send(frame).await?;

        let pending = PendingAck::new(&self.shared.abandoned_acks);
        let result = self.ack_or_error().await;
        pending.settle();
        result
    }

    /// Send `PING` and report whether a `PONG` came back in time.
    pub async fn ping(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pong_waiters).push_back(tx);

        if self.send(&Frame::Ping).await.is_err() {
            return false;
        }

        tokio::select! {
            pong = rx => pong.is_ok(),
            _ = tokio::time::sleep(self.shared.config.ping_timeout) => {
                self.shared.logger.debug("connection.ping.timeout");
                false
            }
            _ = self.shared.lifecycle.terminated() => false,
        }
    }

    /// Deliver inbound messages to `handler`, in arrival order.
    ///
    /// Messages received before this call are queued, not lost. Only the
    /// first registration takes effect.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + 'static,
    {
        let Some(mut messages) = lock(&self.shared.messages).take() else {
            self.shared
                .logger
                .warn("connection.on-message.already-registered");
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                handler(message);
            }
        });
    }

    /// Resolves once the connection is no longer open.
    pub async fn disconnected(&self) {
        self.shared.lifecycle.terminated().await
    }

    pub fn is_open(&self) -> bool {
        self.shared.lifecycle.is_open()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.state()
    }

    /// Stop the connection. The writer shuts the write half down and the
    /// read loop exits, which releases the transport.
    pub fn disconnect(&self) {
        if self.shared.lifecycle.close() {
            self.shared.logger.debug("connection.disconnect");
        }
    }

    /// Disconnect and release every pending waiter.
    pub fn close(&self) {
        self.disconnect();

        // A holder of the lock is an ack waiter; it sees the closed state.
        if let Ok(mut acks) = self.shared.acks.try_lock() {
            acks.close();
        }
        lock(&self.shared.pong_waiters).clear();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ReadLoop {
    reader: FrameReader<BufReader<BoxedReader>>,
    ack_tx: mpsc::Sender<Ack>,
    message_tx: mpsc::Sender<Message>,
    shared: Arc<Shared>,
}

impl ReadLoop {
    async fn run(mut self) {
        let lifecycle = self.shared.lifecycle.clone();

        loop {
            let frame = tokio::select! {
                biased;
                _ = lifecycle.terminated() => break,
                frame = self.reader.next_frame() => frame,
            };

            match frame {
                Ok(frame) => self.dispatch(frame).await,
                Err(e) => {
                    lifecycle.fail("connection.frame.read-error", &e);
                    break;
                }
            }
        }

        self.shared.logger.debug("connection.read-loop.stopped");
    }

    async fn dispatch(&mut self, frame: Frame) {
        let logger = self.shared.logger.clone();

        match frame {
            Frame::Ping => {
                if let Err(e) = self.shared.send(&Frame::Pong).await {
                    logger.debugd(json!({ "error": e.to_string() }), "connection.pong.not-sent");
                }
            }
            Frame::Pong => {
                let mut waiters = lock(&self.shared.pong_waiters);
                // Timed-out pingers leave dead senders behind; skip them.
                let delivered = std::iter::from_fn(|| waiters.pop_front())
                    .any(|waiter| waiter.send(()).is_ok());
                if !delivered {
                    logger.debug("connection.pong.unsolicited");
                }
            }
            Frame::Ack => self.deliver_ack(Ok(())).await,
            Frame::NegAck { message } => self.deliver_ack(Err(message)).await,
            Frame::Info { payload } => {
                logger.debugd(json!({ "info": payload }), "connection.info");
            }
            Frame::Message {
                subject,
                subscriber_id,
                reply_to,
                payload,
            } => {
                let message = Message {
                    subject,
                    subscriber_id,
                    reply_to,
                    payload,
                };
                let delivered = tokio::select! {
                    sent = self.message_tx.send(message) => sent.is_ok(),
                    _ = self.shared.lifecycle.terminated() => true,
                };
                if !delivered {
                    logger.warnd(json!({ "sid": subscriber_id }), "connection.message.dropped");
                }
            }
            Frame::Connect { .. }
            | Frame::Publish { .. }
            | Frame::Subscribe { .. }
            | Frame::Unsubscribe { .. } => {
                logger.warnd(
                    json!({ "keyword": frame.keyword() }),
                    "connection.frame.unexpected",
                );
            }
        }
    }

    /// Blocks until a waiter takes the ack or the connection stops.
    async fn deliver_ack(&mut self, ack: Ack) {
        let ack = match self.ack_tx.try_send(ack) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => return,
            Err(mpsc::error::TrySendError::Full(ack)) => ack,
        };

        // Nothing reads further frames, PINGs included, until the slot frees.
        self.shared.logger.warnd(
            json!({ "ack": format!("{:?}", ack) }),
            "connection.ack.unclaimed",
        );
        tokio::select! {
            _ = self.ack_tx.send(ack) => {}
            _ = self.shared.lifecycle.terminated() => {}
        }
    }
}
