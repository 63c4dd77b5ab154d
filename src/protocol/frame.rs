//! Frame enum and encoder.
//!
//! Represents every frame the protocol carries, inbound and outbound.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use natwire::protocol::Frame;
//! use bytes::Bytes;
//!
//! let frame = Frame::Publish {
//!     subject: "greet".to_string(),
//!     reply_to: None,
//!     payload: Bytes::from_static(b"hi"),
//! };
//!
//! assert_eq!(&frame.encode().unwrap()[..], b"PUB greet 2\r\nhi\r\n");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{keywords, ConnectOptions, CRLF};
use crate::error::Result;

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Heartbeat probe (both directions).
    Ping,
    /// Heartbeat answer (both directions).
    Pong,
    /// `+OK`: the previous control frame was accepted.
    Ack,
    /// `-ERR`: the previous control frame was rejected.
    NegAck { message: String },
    /// Server information line.
    Info { payload: String },
    /// Message delivered to a subscription.
    Message {
        subject: String,
        subscriber_id: u64,
        reply_to: Option<String>,
        payload: Bytes,
    },
    /// Credential exchange.
    Connect { user: String, pass: String },
    /// Publish a payload on a subject.
    Publish {
        subject: String,
        reply_to: Option<String>,
        payload: Bytes,
    },
    /// Register interest in a subject under a subscriber id.
    Subscribe { subject: String, id: u64 },
    /// Drop a subscriber id.
    Unsubscribe { id: u64 },
}

impl Frame {
    /// Keyword that starts this frame's control line.
    pub fn keyword(&self) -> &'static str {
        match self {
            Frame::Ping => keywords::PING,
            Frame::Pong => keywords::PONG,
            Frame::Ack => keywords::OK,
            Frame::NegAck { .. } => keywords::ERR,
            Frame::Info { .. } => keywords::INFO,
            Frame::Message { .. } => keywords::MSG,
            Frame::Connect { .. } => keywords::CONNECT,
            Frame::Publish { .. } => keywords::PUB,
            Frame::Subscribe { .. } => keywords::SUB,
            Frame::Unsubscribe { .. } => keywords::UNSUB,
        }
    }

    /// Check if the server may send this frame.
    #[inline]
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            Frame::Ping
                | Frame::Pong
                | Frame::Ack
                | Frame::NegAck { .. }
                | Frame::Info { .. }
                | Frame::Message { .. }
        )
    }

    /// Check if the server answers this frame with `+OK`/`-ERR`.
    #[inline]
    pub fn expects_ack(&self) -> bool {
        matches!(
            self,
            Frame::Connect { .. }
                | Frame::Publish { .. }
                | Frame::Subscribe { .. }
                | Frame::Unsubscribe { .. }
        )
    }

    /// Payload that follows the control line, if the frame carries one.
    #[inline]
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            Frame::Message { payload, .. } | Frame::Publish { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Control line including its CRLF terminator.
    pub fn control_line(&self) -> Result<String> {
        let line = match self {
            Frame::Ping | Frame::Pong | Frame::Ack => self.keyword().to_string(),
            Frame::NegAck { message } => format!("{} '{}'", keywords::ERR, message),
            Frame::Info { payload } => format!("{} {}", keywords::INFO, payload),
            Frame::Message {
                subject,
                subscriber_id,
                reply_to,
                payload,
            } => match reply_to {
                Some(reply_to) => format!(
                    "{} {} {} {} {}",
                    keywords::MSG,
                    subject,
                    subscriber_id,
                    reply_to,
                    payload.len()
                ),
                None => format!(
                    "{} {} {} {}",
                    keywords::MSG,
                    subject,
                    subscriber_id,
                    payload.len()
                ),
            },
            Frame::Connect { user, pass } => format!(
                "{} {}",
                keywords::CONNECT,
                ConnectOptions::new(user, pass).to_json()?
            ),
            Frame::Publish {
                subject,
                reply_to,
                payload,
            } => match reply_to {
                Some(reply_to) => format!(
                    "{} {} {} {}",
                    keywords::PUB,
                    subject,
                    reply_to,
                    payload.len()
                ),
                None => format!("{} {} {}", keywords::PUB, subject, payload.len()),
            },
            Frame::Subscribe { subject, id } => format!("{} {} {}", keywords::SUB, subject, id),
            Frame::Unsubscribe { id } => format!("{} {}", keywords::UNSUB, id),
        };

        Ok(line + "\r\n")
    }

    /// Encode the whole frame into one contiguous buffer.
    ///
    /// Payload bytes are copied verbatim; the writer uses
    /// [`OutboundFrame`](crate::writer::OutboundFrame) instead to avoid
    /// the copy.
    pub fn encode(&self) -> Result<Bytes> {
        let line = self.control_line()?;
        let body_len = self.body().map_or(0, |b| b.len() + CRLF.len());

        let mut buf = BytesMut::with_capacity(line.len() + body_len);
        buf.put_slice(line.as_bytes());
        if let Some(body) = self.body() {
            buf.put_slice(body);
            buf.put_slice(CRLF);
        }

        Ok(buf.freeze())
    }
}
