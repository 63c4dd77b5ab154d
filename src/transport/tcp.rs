//! TCP dialing and stream splitting.
//!
//! # Example
//!
//! ```ignore
//! use natwire::transport::{dial, split_stream};
//! use std::time::Duration;
//!
//! let stream = dial("127.0.0.1:4222", Duration::from_secs(5)).await?;
//! let (reader, writer) = split_stream(stream);
//! ```

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{NatwireError, Result};

/// Any stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + 'static {}

/// Type-erased read half.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Open a TCP stream to `addr`, giving up after `timeout`.
///
/// Nagle is disabled: control lines are small and every round-trip waits
/// on the server's acknowledgment.
pub async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NatwireError::DialTimeout(addr.to_string()))??;

    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Split a stream into independently owned, type-erased halves.
pub fn split_stream<S>(stream: S) -> (BoxedReader, BoxedWriter)
where
    S: Transport,
{
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}
