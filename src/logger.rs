//! Pluggable leveled logger.
//!
//! The connection engine logs through the [`Logger`] trait: a level, a
//! message tag such as `"connection.frame.write-error"`, and an optional
//! structured context map. [`TracingLogger`] (the default) forwards to
//! `tracing`; [`NoopLogger`] discards everything.
//!
//! # Example
//!
//! ```
//! use natwire::logger::{Logger, TracingLogger};
//! use serde_json::json;
//!
//! let logger = TracingLogger;
//! logger.debug("client.connect.start");
//! logger.warnd(json!({"addr": "127.0.0.1:4222"}), "client.reconnect.failed");
//! ```

use serde_json::{Map, Value};

/// Structured context attached to a log call.
pub type LogData = Map<String, Value>;

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Leveled logging capability consumed by connections and clients.
pub trait Logger: Send + Sync + 'static {
    /// Record one entry.
    fn log(&self, level: Level, tag: &str, data: Option<&LogData>);

    fn debug(&self, tag: &str) {
        self.log(Level::Debug, tag, None);
    }

    fn info(&self, tag: &str) {
        self.log(Level::Info, tag, None);
    }

    fn warn(&self, tag: &str) {
        self.log(Level::Warn, tag, None);
    }

    fn error(&self, tag: &str) {
        self.log(Level::Error, tag, None);
    }

    fn debugd(&self, data: Value, tag: &str) {
        self.log(Level::Debug, tag, as_map(&data));
    }

    fn infod(&self, data: Value, tag: &str) {
        self.log(Level::Info, tag, as_map(&data));
    }

    fn warnd(&self, data: Value, tag: &str) {
        self.log(Level::Warn, tag, as_map(&data));
    }

    fn errord(&self, data: Value, tag: &str) {
        self.log(Level::Error, tag, as_map(&data));
    }
}

/// Non-object values carry no fields.
fn as_map(data: &Value) -> Option<&LogData> {
    data.as_object()
}

/// Forwards entries to the `tracing` macros.
///
/// The tag becomes the event message and the context map is rendered as a
/// single `data` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, tag: &str, data: Option<&LogData>) {
        let Some(data) = data else {
            match level {
                Level::Debug => tracing::debug!("{}", tag),
                Level::Info => tracing::info!("{}", tag),
                Level::Warn => tracing::warn!("{}", tag),
                Level::Error => tracing::error!("{}", tag),
            }
            return;
        };

        let data = Value::Object(data.clone());
        match level {
            Level::Debug => tracing::debug!(data = %data, "{}", tag),
            Level::Info => tracing::info!(data = %data, "{}", tag),
            Level::Warn => tracing::warn!(data = %data, "{}", tag),
            Level::Error => tracing::error!(data = %data, "{}", tag),
        }
    }
}

/// Discards every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _tag: &str, _data: Option<&LogData>) {}
}
