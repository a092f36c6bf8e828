//! Outbound byte path: coalescing buffer and dedicated writer task.
//!
//! Publish, subscribe, and control frames are formatted into an
//! [`OutboundBuffer`] owned by the connection task. The buffer is handed
//! to the writer task once per connection wake-up — so frames produced in
//! the same burst coalesce into one channel send — or immediately when it
//! grows past a configured threshold, bounding latency and memory.
//!
//! The writer task drains its channel in batches and writes them with
//! vectored I/O, so many small frames cost one syscall instead of one
//! each. It exits when the channel closes (connection dropped the handle)
//! or the socket errors; the connection notices the latter on its next
//! send and starts reconnecting.
//!
//! ```text
//! publish/subscribe ─► OutboundBuffer ─► mpsc::Sender<Bytes> ─► Writer Task ─► socket
//! ```

use std::io::IoSlice;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Channel capacity for buffers queued to the writer task.
const CHANNEL_CAPACITY: usize = 128;

/// Maximum buffers merged into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Coalescing buffer for formatted outbound frames.
#[derive(Debug)]
pub(crate) struct OutboundBuffer {
    buf: BytesMut,
    flush_threshold: usize,
}

impl OutboundBuffer {
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            flush_threshold,
        }
    }

    /// Mutable access for the frame encoders to append into.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// True once the buffer passed the size threshold and should be
    /// flushed without waiting for the end of the wake-up.
    pub fn over_threshold(&self) -> bool {
        self.buf.len() >= self.flush_threshold
    }

    /// Take everything buffered so far.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Handle for queuing byte buffers to the writer task.
#[derive(Debug, Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue a buffer for writing.
    ///
    /// Fails when the writer task has exited, which means the socket died;
    /// the caller treats that as a disconnect.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        self.tx
            .send(bytes)
            .await
            .map_err(|_| Error::Disconnected)
    }
}

/// Spawn the writer task over a socket write half.
pub(crate) fn spawn_writer<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

/// Receive buffers and write them out, batching whatever is ready.
async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(b) => b,
            None => {
                // Channel closed, clean shutdown.
                let _ = writer.flush().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(bytes) => batch.push(bytes),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::debug!("writer task stopping: {e}");
            return Err(Error::Io(e));
        }
    }
}

/// Write a batch with vectored I/O, finishing partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(Bytes::len).sum();
    let mut written = 0;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        written += n;
    }

    writer.flush().await
}

/// Slices covering everything past the first `skip` bytes of the batch.
fn remaining_slices(batch: &[Bytes], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;
    for bytes in batch {
        let end = offset + bytes.len();
        if skip < end && !bytes.is_empty() {
            let start = skip.saturating_sub(offset);
            slices.push(IoSlice::new(&bytes[start..]));
        }
        offset = end;
    }
    slices
}
