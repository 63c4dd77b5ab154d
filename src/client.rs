//! Client builder and the reconnecting serve loop.
//!
//! The [`ClientBuilder`] collects settings and connects through a
//! [`ConnectionProvider`]. The [`Client`] keeps subscriptions alive across
//! transport failures:
//! 1. Serve the current connection to callers on request
//! 2. On a connection fault, ask the provider again until it succeeds
//! 3. Resubscribe every registered subscription on the new connection
//! 4. Resume serving
//!
//! # Example
//!
//! ```ignore
//! use natwire::{Client, ConnectionInfo};
//!
//! #[tokio::main]
//! async fn main() -> natwire::Result<()> {
//!     let client = Client::builder()
//!         .on_connected(|| println!("connected"))
//!         .connect(ConnectionInfo::new("127.0.0.1:4222", "nats", "nats"))
//!         .await?;
//!
//!     let id = client
//!         .subscribe("greet", |msg| println!("got {:?}", msg.payload))
//!         .await?;
//!     client.publish("greet", "hello").await?;
//!
//!     client.unsubscribe(id).await?;
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::{Connection, ConnectionConfig, Message};
use crate::error::{NatwireError, Result};
use crate::logger::{Logger, TracingLogger};
use crate::protocol::Frame;
use crate::provider::ConnectionProvider;

/// Default pause between failed reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Connection requests that may wait for the serve task.
const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Callback invoked for every message delivered to a subscription.
pub type SubscriptionCallback = Arc<dyn Fn(Message) + Send + Sync>;

type ConnectedCallback = Arc<dyn Fn() + Send + Sync>;

type ConnectionRequest = oneshot::Sender<Connection>;

/// Builder for configuring and connecting a [`Client`].
pub struct ClientBuilder {
    logger: Arc<dyn Logger>,
    reconnect_delay: Duration,
    ping_timeout: Duration,
    on_connected: Option<ConnectedCallback>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            logger: Arc::new(TracingLogger),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            ping_timeout: ConnectionConfig::DEFAULT_PING_TIMEOUT,
            on_connected: None,
        }
    }

    /// Set the logger used by the client's own tasks.
    ///
    /// Connections log through the logger their provider gives them.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Set the pause between failed reconnection attempts.
    ///
    /// Default: 500 ms
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Bound on obtaining a connection in [`Client::ping`].
    ///
    /// Default: 500 ms
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Run `callback` after the initial connect and after every successful
    /// reconnection, once subscriptions are restored.
    ///
    /// The callback runs on the task that hands out connections, before
    /// serving resumes. Keep it short: no caller gets a connection until it
    /// returns. Spawn from inside it for anything slow.
    pub fn on_connected<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connected = Some(Arc::new(callback));
        self
    }

    /// Obtain the first connection and start the client.
    ///
    /// The provider is called exactly once here; a failure is returned
    /// as is, without retrying.
    pub async fn connect<P>(self, provider: P) -> Result<Client>
    where
        P: ConnectionProvider + 'static,
    {
        self.logger.debug("client.connect.start");

        let conn = match provider.provide_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                self.logger
                    .warnd(json!({ "error": e.to_string() }), "client.connect.failed");
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);

        let inner = Arc::new(Inner {
            subscriptions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            disconnected: AtomicBool::new(false),
            shutdown,
            current: Mutex::new(None),
            on_connected: self.on_connected,
            reconnect_delay: self.reconnect_delay,
            ping_timeout: self.ping_timeout,
            logger: self.logger,
        });

        inner.install(&conn, &forward_tx);
        inner.fire_connected();

        let serve = ServeLoop {
            inner: inner.clone(),
            provider: Box::new(provider),
            requests: request_rx,
            forward: forward_tx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(serve.run(conn));
        tokio::spawn(dispatch(inner.clone(), forward_rx));

        inner.logger.info("client.connected");

        Ok(Client {
            inner,
            requests: request_tx,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscription {
    subject: String,
    callback: SubscriptionCallback,
}

struct Inner {
    /// Ordered by id, which is also subscription order.
    subscriptions: Mutex<BTreeMap<u64, Subscription>>,
    next_id: AtomicU64,
    disconnected: AtomicBool,
    shutdown: watch::Sender<bool>,
    /// Connection being served, kept so `disconnect` can close it.
    current: Mutex<Option<Connection>>,
    on_connected: Option<ConnectedCallback>,
    reconnect_delay: Duration,
    ping_timeout: Duration,
    logger: Arc<dyn Logger>,
}

impl Inner {
    fn install(&self, conn: &Connection, forward: &mpsc::UnboundedSender<Message>) {
        let forward = forward.clone();
        conn.on_message(move |message| {
            let _ = forward.send(message);
        });
        *lock(&self.current) = Some(conn.clone());
    }

    fn fire_connected(&self) {
        if let Some(callback) = &self.on_connected {
            callback();
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Restore every registered subscription on `conn`, in id order.
    async fn resubscribe(&self, conn: &Connection) {
        let subscriptions: Vec<(u64, String)> = lock(&self.subscriptions)
            .iter()
            .map(|(id, sub)| (*id, sub.subject.clone()))
            .collect();

        for (id, subject) in subscriptions {
            let frame = Frame::Subscribe {
                subject: subject.clone(),
                id,
            };
            if let Err(e) = conn.request(&frame).await {
                self.logger.warnd(
                    json!({ "sid": id, "subject": subject, "error": e.to_string() }),
                    "client.resubscribe.failed",
                );
            }
        }
    }
}

/// Owns the served connection and replaces it after faults.
struct ServeLoop {
    inner: Arc<Inner>,
    provider: Box<dyn ConnectionProvider>,
    requests: mpsc::Receiver<ConnectionRequest>,
    forward: mpsc::UnboundedSender<Message>,
    shutdown: watch::Receiver<bool>,
}

impl ServeLoop {
    async fn run(mut self, mut conn: Connection) {
        loop {
            let faulted = self.serve(&conn).await;
            conn.close();

            if !faulted || self.inner.shutdown_requested() {
                break;
            }
            self.inner.logger.warn("client.connection.lost");

            let Some(next) = self.reconnect().await else {
                break;
            };
            if self.inner.shutdown_requested() {
                next.close();
                break;
            }

            conn = next;
            self.inner.install(&conn, &self.forward);
            self.inner.resubscribe(&conn).await;
            self.inner.fire_connected();
            self.inner.logger.info("client.reconnected");
        }

        lock(&self.inner.current).take();
        self.inner.logger.debug("client.serve.stopped");
    }

    /// Hand out `conn` until it faults (`true`), or until shutdown or every
    /// client handle is gone (`false`).
    async fn serve(&mut self, conn: &Connection) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_signal(&mut self.shutdown) => return false,
                _ = conn.disconnected() => return true,
                request = self.requests.recv() => match request {
                    // The caller may have given up waiting.
                    Some(reply) => { let _ = reply.send(conn.clone()); }
                    None => return false,
                },
            }
        }
    }

    /// Call the provider until it succeeds. `None` on shutdown, which also
    /// abandons an attempt in flight.
    async fn reconnect(&mut self) -> Option<Connection> {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let provided = tokio::select! {
                biased;
                _ = shutdown_signal(&mut self.shutdown) => return None,
                provided = self.provider.provide_connection() => provided,
            };

            match provided {
                Ok(conn) => {
                    self.inner
                        .logger
                        .infod(json!({ "attempt": attempt }), "client.reconnect.succeeded");
                    return Some(conn);
                }
                Err(e) => {
                    self.inner.logger.warnd(
                        json!({ "attempt": attempt, "error": e.to_string() }),
                        "client.reconnect.failed",
                    );
                }
            }

            tokio::select! {
                _ = shutdown_signal(&mut self.shutdown) => return None,
                _ = tokio::time::sleep(self.inner.reconnect_delay) => {}
            }
        }
    }
}

async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|requested| *requested).await;
}

/// Route forwarded messages to their subscription callbacks.
async fn dispatch(inner: Arc<Inner>, mut messages: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = messages.recv().await {
        let callback = lock(&inner.subscriptions)
            .get(&message.subscriber_id)
            .map(|sub| sub.callback.clone());

        match callback {
            Some(callback) => {
                tokio::spawn(async move { callback(message) });
            }
            None => {
                inner.logger.warnd(
                    json!({ "sid": message.subscriber_id, "subject": message.subject }),
                    "client.message.unknown-subscriber",
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connected client.
///
/// Cloning is cheap and every clone drives the same connection. Once every
/// clone is dropped the client closes its connection and stops.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
    requests: mpsc::Sender<ConnectionRequest>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Ask the serve task for the current connection.
    ///
    /// Waits while a reconnection is in progress.
    async fn connection(&self) -> Result<Connection> {
        if self.is_disconnected() {
            return Err(NatwireError::Disconnected);
        }

        let (tx, rx) = oneshot::channel();
        self.requests
            .send(tx)
            .await
            .map_err(|_| NatwireError::Disconnected)?;
        rx.await.map_err(|_| NatwireError::Disconnected)
    }

    async fn request(&self, frame: Frame) -> Result<()> {
        self.connection().await?.request(&frame).await
    }

    /// Stop the client for good.
    ///
    /// Idempotent. Every later operation fails with `Disconnected`.
    pub fn disconnect(&self) {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.logger.info("client.disconnect");
        self.inner.shutdown.send_replace(true);
        if let Some(conn) = lock(&self.inner.current).take() {
            conn.close();
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.request(Frame::Publish {
            subject: subject.to_string(),
            reply_to: None,
            payload: payload.into(),
        })
        .await
    }

    /// Publish with a subject the receiver should answer on.
    pub async fn publish_with_reply_to(
        &self,
        subject: &str,
        reply_to: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.request(Frame::Publish {
            subject: subject.to_string(),
            reply_to: Some(reply_to.to_string()),
            payload: payload.into(),
        })
        .await
    }

    /// Register `callback` for `subject` and return the subscription id.
    ///
    /// The subscription is registered before the server is asked, so a
    /// reconnection in between still restores it. On error the id must be
    /// treated as invalid.
    pub async fn subscribe<F>(&self, subject: &str, callback: F) -> Result<u64>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        if self.is_disconnected() {
            return Err(NatwireError::Disconnected);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscriptions).insert(
            id,
            Subscription {
                subject: subject.to_string(),
                callback: Arc::new(callback),
            },
        );

        let frame = Frame::Subscribe {
            subject: subject.to_string(),
            id,
        };
        if let Err(e) = self.request(frame).await {
            self.inner.logger.warnd(
                json!({ "sid": id, "subject": subject, "error": e.to_string() }),
                "client.subscribe.failed",
            );
            return Err(e);
        }

        Ok(id)
    }

    /// Drop one subscription. The entry stays registered if the server
    /// refuses.
    pub async fn unsubscribe(&self, id: u64) -> Result<()> {
        self.request(Frame::Unsubscribe { id }).await?;
        lock(&self.inner.subscriptions).remove(&id);
        Ok(())
    }

    /// Drop every subscription on `subject`, stopping at the first error.
    pub async fn unsubscribe_all(&self, subject: &str) -> Result<()> {
        let ids: Vec<u64> = lock(&self.inner.subscriptions)
            .iter()
            .filter(|(_, sub)| sub.subject == subject)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            self.unsubscribe(id).await?;
        }
        Ok(())
    }

    /// Round-trip a `PING` on the current connection.
    pub async fn ping(&self) -> bool {
        match tokio::time::timeout(self.inner.ping_timeout, self.connection()).await {
            Ok(Ok(conn)) => conn.ping().await,
            _ => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("subscriptions", &self.subscription_count())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
