//! # natwire
//!
//! Auto-reconnecting client for a text-framed pub/sub wire protocol.
//!
//! The broker speaks CRLF-terminated control lines (`PUB`, `SUB`, `MSG`,
//! `PING`, ...) and, in verbose mode, acknowledges every control frame with
//! `+OK` or `-ERR`. This crate provides:
//!
//! - **Frame codec** ([`protocol`]): byte-exact decode and encode of every frame
//! - **Connection** ([`connection`]): one transport with its read loop,
//!   writer task, heartbeat answers and in-order ack matching
//! - **Client** ([`Client`]): keeps subscriptions alive while the transport
//!   underneath is replaced after failures
//!
//! ## Example
//!
//! ```ignore
//! use natwire::{Client, ConnectionCluster, ConnectionInfo};
//!
//! #[tokio::main]
//! async fn main() -> natwire::Result<()> {
//!     let cluster = ConnectionCluster::from_infos(vec![
//!         ConnectionInfo::new("10.0.0.1:4222", "nats", "nats"),
//!         ConnectionInfo::new("10.0.0.2:4222", "nats", "nats"),
//!     ]);
//!
//!     let client = Client::builder().connect(cluster).await?;
//!     client
//!         .subscribe("events.>", |msg| println!("{}: {:?}", msg.subject, msg.payload))
//!         .await?;
//!     client.publish("events.start", "ready").await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod logger;
pub mod protocol;
pub mod provider;
pub mod transport;
pub mod writer;

mod client;

pub use client::{Client, ClientBuilder, SubscriptionCallback, DEFAULT_RECONNECT_DELAY};
pub use connection::{Connection, ConnectionConfig, ConnectionState, Message};
pub use error::{NatwireError, Result};
pub use logger::{Logger, NoopLogger, TracingLogger};
pub use provider::{ConnectionCluster, ConnectionInfo, ConnectionProvider};
