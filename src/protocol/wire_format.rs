//! Wire format constants and control-line helpers.
//!
//! Every frame starts with an ASCII control line terminated by CRLF:
//! ```text
//! ┌─────────┬───┬──────────────────────────────┬──────┐
//! │ KEYWORD │ ␠ │ arguments (space separated)  │ \r\n │
//! └─────────┴───┴──────────────────────────────┴──────┘
//! ```
//!
//! `MSG` and `PUB` control lines end with a byte length; exactly that many
//! raw bytes follow, then a trailing CRLF. The payload is never
//! line-delimited and may contain any byte value.

use serde::Serialize;

use crate::error::{NatwireError, Result};

/// Line terminator for control lines and payload trailers.
pub const CRLF: &[u8] = b"\r\n";

/// Longest control line the reader accepts, terminator included.
pub const MAX_CONTROL_LINE: usize = 4096;

/// Default maximum inbound payload size (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Frame keywords as they appear on the wire.
pub mod keywords {
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const OK: &str = "+OK";
    pub const ERR: &str = "-ERR";
    pub const INFO: &str = "INFO";
    pub const MSG: &str = "MSG";
    pub const CONNECT: &str = "CONNECT";
    pub const PUB: &str = "PUB";
    pub const SUB: &str = "SUB";
    pub const UNSUB: &str = "UNSUB";
}

/// Whether `byte` ends a keyword token.
#[inline]
pub fn is_delimiter(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n')
}

/// Length of the keyword token at the start of `line`.
///
/// Zero means the line has no keyword.
pub fn keyword_len(line: &[u8]) -> usize {
    line.iter()
        .position(|b| is_delimiter(*b))
        .unwrap_or(line.len())
}

/// JSON body of the `CONNECT` frame.
///
/// `verbose` is always on: the acknowledgment protocol relies on the server
/// answering every control frame with `+OK` or `-ERR`.
#[derive(Debug, Serialize)]
pub struct ConnectOptions<'a> {
    pub verbose: bool,
    pub pedantic: bool,
    pub user: &'a str,
    pub pass: &'a str,
}

impl<'a> ConnectOptions<'a> {
    pub fn new(user: &'a str, pass: &'a str) -> Self {
        Self {
            verbose: true,
            pedantic: true,
            user,
            pass,
        }
    }

    /// Serialize to the compact JSON carried on the control line.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Arguments of a `MSG` control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    pub subject: String,
    pub subscriber_id: u64,
    pub reply_to: Option<String>,
    pub payload_length: usize,
}

/// Parse `<subject> <sid> [<reply-to>] <length>`.
pub fn parse_msg_args(args: &[u8]) -> Result<MsgHeader> {
    let args = std::str::from_utf8(args)
        .map_err(|_| NatwireError::MalformedFrame("MSG arguments are not UTF-8".to_string()))?;
    let tokens: Vec<&str> = args.split_ascii_whitespace().collect();

    let (subject, sid, reply_to, length) = match tokens.as_slice() {
        [subject, sid, length] => (*subject, *sid, None, *length),
        [subject, sid, reply_to, length] => (*subject, *sid, Some(*reply_to), *length),
        _ => {
            return Err(NatwireError::MalformedFrame(format!(
                "MSG expects 3 or 4 arguments, got {}",
                tokens.len()
            )))
        }
    };

    let subscriber_id = sid
        .parse::<u64>()
        .map_err(|_| NatwireError::MalformedFrame(format!("invalid subscriber id {:?}", sid)))?;
    let payload_length = length
        .parse::<usize>()
        .map_err(|_| NatwireError::MalformedFrame(format!("invalid payload length {:?}", length)))?;

    Ok(MsgHeader {
        subject: subject.to_string(),
        subscriber_id,
        reply_to: reply_to.map(str::to_string),
        payload_length,
    })
}

/// Extract the single-quoted message of a `-ERR` line.
pub fn parse_err_args(args: &[u8]) -> Result<String> {
    let args = String::from_utf8_lossy(args);
    let text = args.trim();

    match (text.find('\''), text.rfind('\'')) {
        (Some(start), Some(end)) if start < end => Ok(text[start + 1..end].to_string()),
        _ => Err(NatwireError::MalformedFrame(format!(
            "-ERR without quoted message: {:?}",
            text
        ))),
    }
}

/// First whitespace-delimited token of an `INFO` line.
pub fn parse_info_args(args: &[u8]) -> Result<String> {
    let args = std::str::from_utf8(args)
        .map_err(|_| NatwireError::MalformedFrame("INFO payload is not UTF-8".to_string()))?;

    args.split_ascii_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| NatwireError::MalformedFrame("INFO without payload".to_string()))
}
