//! Frame reader for buffered byte streams.
//!
//! Reads exactly one frame per call. The control line is read up to LF and
//! its keyword selects the per-frame parser; `MSG` payloads are then read
//! by length, never by line, so they may contain CR/LF or any other byte.
//!
//! # Example
//!
//! ```
//! # tokio_test_block_on(async {
//! use natwire::protocol::{read_frame, Frame};
//!
//! let mut input: &[u8] = b"MSG greet 1 2\r\nhi\r\n";
//! match read_frame(&mut input).await.unwrap() {
//!     Frame::Message { payload, .. } => assert_eq!(&payload[..], b"hi"),
//!     other => panic!("unexpected frame {:?}", other),
//! }
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::wire_format::{
    keyword_len, keywords, parse_err_args, parse_info_args, parse_msg_args,
    DEFAULT_MAX_PAYLOAD_SIZE, MAX_CONTROL_LINE,
};
use super::Frame;
use crate::error::{NatwireError, Result};

/// Decodes frames from a buffered reader.
///
/// Keeps a reusable line buffer and enforces a maximum payload size for
/// inbound messages.
pub struct FrameReader<R> {
    /// Buffered byte source.
    reader: R,
    /// Scratch buffer for the current control line.
    line: Vec<u8>,
    /// Maximum allowed `MSG` payload size.
    max_payload_size: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    /// Create a frame reader with the default payload limit (64 MiB).
    pub fn new(reader: R) -> Self {
        Self::with_max_payload(reader, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a frame reader with a custom payload limit.
    pub fn with_max_payload(reader: R, max_payload_size: usize) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(256),
            max_payload_size,
        }
    }

    /// Get the payload limit.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next frame.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` on EOF before any byte of a frame
    /// - `MalformedHeader` if the control line has no keyword or is cut short
    /// - `UnknownFrameKind` if the keyword is not recognised
    /// - `MalformedFrame` if the frame's arguments or payload framing are bad
    /// - `Io` on transport errors
    pub async fn next_frame(&mut self) -> Result<Frame> {
        self.line.clear();

        let n = (&mut self.reader)
            .take(MAX_CONTROL_LINE as u64)
            .read_until(b'\n', &mut self.line)
            .await?;

        if n == 0 {
            return Err(NatwireError::ConnectionClosed);
        }

        // Cut short by EOF or by the line limit.
        if self.line.last() != Some(&b'\n') {
            return Err(NatwireError::MalformedHeader);
        }

        let keyword_end = keyword_len(&self.line);
        if keyword_end == 0 {
            return Err(NatwireError::MalformedHeader);
        }

        let (keyword, args) = self.line.split_at(keyword_end);
        let keyword = std::str::from_utf8(keyword)
            .map_err(|_| NatwireError::UnknownFrameKind(String::from_utf8_lossy(keyword).into()))?;

        match keyword {
            keywords::PING => Ok(Frame::Ping),
            keywords::PONG => Ok(Frame::Pong),
            keywords::OK => Ok(Frame::Ack),
            keywords::ERR => Ok(Frame::NegAck {
                message: parse_err_args(args)?,
            }),
            keywords::INFO => Ok(Frame::Info {
                payload: parse_info_args(args)?,
            }),
            keywords::MSG => {
                let header = parse_msg_args(args)?;
                let payload =
                    read_payload(&mut self.reader, header.payload_length, self.max_payload_size)
                        .await?;
                Ok(Frame::Message {
                    subject: header.subject,
                    subscriber_id: header.subscriber_id,
                    reply_to: header.reply_to,
                    payload,
                })
            }
            other => Err(NatwireError::UnknownFrameKind(other.to_string())),
        }
    }
}

/// Read exactly `len` payload bytes plus the mandatory CRLF trailer.
async fn read_payload<R>(reader: &mut R, len: usize, max_payload_size: usize) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    if len > max_payload_size {
        return Err(NatwireError::MalformedFrame(format!(
            "Payload size {} exceeds maximum {}",
            len, max_payload_size
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let mut trailer = [0u8; 2];
    reader.read_exact(&mut trailer).await?;
    if &trailer != b"\r\n" {
        return Err(NatwireError::MalformedFrame(
            "payload not terminated by CRLF".to_string(),
        ));
    }

    Ok(Bytes::from(payload))
}

/// Read a single frame from `reader` with the default payload limit.
///
/// Convenience for one-off decoding; long-lived readers should keep a
/// [`FrameReader`] to reuse its line buffer.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    FrameReader::new(reader).next_frame().await
}
