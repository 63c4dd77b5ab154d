//! Sources of fresh connections.
//!
//! The client never dials by itself; it asks a [`ConnectionProvider`] for
//! a connected, authenticated [`Connection`] on startup and after every
//! transport failure.
//!
//! - [`ConnectionInfo`]: one endpoint with credentials.
//! - [`ConnectionCluster`]: several providers tried in random order.
//!
//! # Example
//!
//! ```
//! use natwire::provider::{ConnectionCluster, ConnectionInfo};
//!
//! let infos: Vec<ConnectionInfo> = serde_json::from_str(r#"[
//!     {"addr": "10.0.0.1:4222", "username": "nats", "password": "nats"},
//!     {"addr": "10.0.0.2:4222", "username": "nats", "password": "nats"}
//! ]"#).unwrap();
//!
//! let cluster = ConnectionCluster::from_infos(infos);
//! assert_eq!(cluster.len(), 2);
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::json;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{NatwireError, Result};
use crate::logger::{Logger, TracingLogger};

/// Boxed future type for provider calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces ready-to-use connections.
///
/// A returned connection has completed its handshake. Implementations are
/// called again after every failure, so they must not cache a dead
/// connection.
pub trait ConnectionProvider: Send + Sync {
    fn provide_connection(&self) -> BoxFuture<'_, Result<Connection>>;
}

impl<P: ConnectionProvider + ?Sized> ConnectionProvider for Arc<P> {
    fn provide_connection(&self) -> BoxFuture<'_, Result<Connection>> {
        (**self).provide_connection()
    }
}

fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}

/// A single broker endpoint with credentials.
///
/// Deserializes from `{"addr", "username", "password"}`; the connection
/// config and logger take their defaults.
#[derive(Clone, Deserialize)]
pub struct ConnectionInfo {
    pub addr: String,
    pub username: String,
    pub password: String,
    #[serde(skip)]
    pub config: ConnectionConfig,
    #[serde(skip, default = "default_logger")]
    pub logger: Arc<dyn Logger>,
}

impl ConnectionInfo {
    pub fn new(
        addr: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            addr: addr.into(),
            username: username.into(),
            password: password.into(),
            config: ConnectionConfig::default(),
            logger: default_logger(),
        }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("addr", &self.addr)
            .field("username", &self.username)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionProvider for ConnectionInfo {
    fn provide_connection(&self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            let conn =
                Connection::dial(&self.addr, self.config.clone(), self.logger.clone()).await?;

            if let Err(e) = conn.handshake(&self.username, &self.password).await {
                conn.close();
                return Err(e);
            }

            self.logger
                .debugd(json!({ "addr": self.addr }), "provider.connection.ready");
            Ok(conn)
        })
    }
}

/// Several candidate providers, tried in a fresh random order per call.
pub struct ConnectionCluster {
    members: Vec<Arc<dyn ConnectionProvider>>,
    logger: Arc<dyn Logger>,
}

impl ConnectionCluster {
    pub fn new(members: Vec<Arc<dyn ConnectionProvider>>) -> Self {
        Self {
            members,
            logger: default_logger(),
        }
    }

    /// Build a cluster with one member per endpoint.
    pub fn from_infos(infos: impl IntoIterator<Item = ConnectionInfo>) -> Self {
        Self::new(
            infos
                .into_iter()
                .map(|info| Arc::new(info) as Arc<dyn ConnectionProvider>)
                .collect(),
        )
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl ConnectionProvider for ConnectionCluster {
    /// First member to succeed wins; if all fail, the last error is
    /// returned.
    fn provide_connection(&self) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(async move {
            let mut order: Vec<usize> = (0..self.members.len()).collect();
            order.shuffle(&mut rand::thread_rng());

            let mut last_error = NatwireError::NoCandidates;
            for index in order {
                match self.members[index].provide_connection().await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        self.logger.warnd(
                            json!({ "member": index, "error": e.to_string() }),
                            "provider.cluster.member-failed",
                        );
                        last_error = e;
                    }
                }
            }

            Err(last_error)
        })
    }
}
