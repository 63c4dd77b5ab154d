//! Connection lifecycle state and the fault signal.
//!
//! A connection starts `Open`. The first read or write failure moves it to
//! `Failed`, which is the fault signal observed by the client; an explicit
//! disconnect moves it to `Closed`. Neither transition is ever undone.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;

use crate::error::NatwireError;
use crate::logger::Logger;

/// Observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport up, read loop running.
    Open,
    /// A transport or framing error ended the connection.
    Failed,
    /// The owner closed the connection.
    Closed,
}

impl ConnectionState {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

/// Shared handle to a connection's state, cloned into its tasks.
#[derive(Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<ConnectionState>>,
    logger: Arc<dyn Logger>,
}

impl Lifecycle {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Open);
        Self {
            state: Arc::new(state),
            logger,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Receiver for state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Raise the fault signal.
    ///
    /// Only the first call on an open connection has an effect; it returns
    /// `true`. Later calls (a read and a write failing together, or a
    /// failure racing a close) are logged and ignored.
    pub fn fail(&self, tag: &str, reason: &NatwireError) -> bool {
        let raised = self.state.send_if_modified(|state| {
            if state.is_open() {
                *state = ConnectionState::Failed;
                true
            } else {
                false
            }
        });

        if raised {
            self.logger
                .errord(json!({ "error": reason.to_string() }), tag);
        } else {
            self.logger.debugd(
                json!({ "error": reason.to_string(), "state": format!("{:?}", self.state()) }),
                "connection.fault.ignored",
            );
        }

        raised
    }

    /// Move to `Closed`. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        })
    }

    /// Resolve once the connection is no longer open.
    pub async fn terminated(&self) {
        let mut rx = self.watch();
        // The sender lives in `self`, so this only returns on a state change.
        let _ = rx.wait_for(|state| !state.is_open()).await;
    }
}
