//! Dedicated writer task for a connection's write half.
//!
//! Every frame sent on a connection goes through one mpsc channel to a
//! single writer task, so frames from concurrent callers can never
//! interleave on the wire. The task batches whatever is queued into one
//! vectored write.
//!
//! # Architecture
//!
//! ```text
//! Publisher  ─┐
//! Subscriber ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Transport
//! Read loop  ─┘        (PONG replies)
//! ```
//!
//! A write error marks the connection failed (the fault signal) and ends
//! the task; closing the connection shuts the write half down.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::Lifecycle;
use crate::error::{NatwireError, Result};
use crate::protocol::{Frame, CRLF};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Control line including CRLF.
    pub header: Bytes,
    /// Payload for `PUB`/`MSG`; followed on the wire by CRLF.
    pub body: Option<Bytes>,
}

impl OutboundFrame {
    /// Encode a frame without copying its payload.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(Self {
            header: Bytes::from(frame.control_line()?),
            body: frame.body().cloned(),
        })
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.header.len() + self.body.as_ref().map_or(0, |b| b.len() + CRLF.len())
    }

    /// Wire segments in order: header, then payload and trailer if present.
    fn segments(&self) -> impl Iterator<Item = &[u8]> {
        let body = self
            .body
            .as_ref()
            .map(|b| [&b[..], CRLF])
            .into_iter()
            .flatten();
        std::iter::once(&self.header[..]).chain(body)
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame for writing.
    ///
    /// Waits only while the channel is full. Fails with `Disconnected`
    /// once the writer task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| NatwireError::Disconnected)
    }

    /// Check whether the writer task is gone.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task runs until the connection leaves the open state, every handle
/// is dropped, or a write fails. A failed write raises the connection's
/// fault signal.
pub fn spawn_writer_task<W>(
    writer: W,
    capacity: usize,
    lifecycle: Lifecycle,
) -> (WriterHandle, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let task = tokio::spawn(async move {
        if let Err(e) = writer_loop(rx, writer, &lifecycle).await {
            lifecycle.fail("connection.frame.write-error", &e);
        }
    });

    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them to the transport.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    lifecycle: &Lifecycle,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut state = lifecycle.watch();

    loop {
        let first = tokio::select! {
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
            _ = state.wait_for(|s| !s.is_open()) => break,
        };

        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        tokio::select! {
            written = write_batch(&mut writer, &batch) => written?,
            _ = state.wait_for(|s| !s.is_open()) => break,
        }
    }

    // Closing the write half is best effort; the peer may already be gone.
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(NatwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for segment in batch.iter().flat_map(|f| f.segments()) {
        let end = offset + segment.len();
        if skip_bytes < end && !segment.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&segment[start..]));
        }
        offset = end;
    }

    slices
}
