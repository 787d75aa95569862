//! Dedicated writer task for outbound frames.
//!
//! Every public call that writes to the server (commands, data request
//! descriptors, key events, channel control) goes through a cloneable
//! [`WriterHandle`] into one task that owns the write half of the stream.
//! Frames queued by concurrent callers are batched into single vectored
//! writes.
//!
//! ```text
//! Caller 1 ──┐
//! Caller 2 ──┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Pipe
//! Dispatch ──┘
//! ```

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{Result, WasimError};
use crate::protocol::{flags, Channel, Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the pipe.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for CLOSE and QUIT control frames).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Frame carrying an encoded header and payload.
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Record write on `channel`.
    pub fn record(channel: Channel, client_id: u32, key: u32, payload: Bytes) -> Self {
        let header = Header::record(channel, client_id, key, payload.len() as u32);
        Self::new(&header, payload)
    }

    /// Open the channel `(channel, key)` with the given record size.
    pub fn open(channel: Channel, client_id: u32, key: u32, record_size: u32) -> Self {
        let payload = Bytes::copy_from_slice(&record_size.to_le_bytes());
        let header = Header::new(channel, flags::OPEN, client_id, key, payload.len() as u32);
        Self::new(&header, payload)
    }

    /// Close the channel `(channel, key)`.
    pub fn close(channel: Channel, client_id: u32, key: u32) -> Self {
        let header = Header::new(channel, flags::CLOSE, client_id, key, 0);
        Self::new(&header, Bytes::new())
    }

    /// Announce that this side is closing the whole link.
    pub fn quit(client_id: u32) -> Self {
        let header = Header::new(Channel::Link, flags::QUIT, client_id, 0, 0);
        Self::new(&header, Bytes::new())
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(with = "crate::config::millis")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Pending count shared between handles and the task.
#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    drained: Notify,
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; every clone feeds the same task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<Pending>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting while backpressure is active.
    ///
    /// Fails with [`WasimError::BackpressureTimeout`] if the queue does not
    /// drain in time, or [`WasimError::ConnectionClosed`] if the writer task
    /// has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            self.wait_for_backpressure().await?;
        }

        self.pending.count.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.count.fetch_sub(1, Ordering::Release);
            WasimError::ConnectionClosed
        })
    }

    /// Queue a frame without waiting.
    ///
    /// The pending-frame limit is not enforced here; the frame only needs a
    /// free slot in the channel. Fails with
    /// [`WasimError::BackpressureTimeout`] when the channel is full and
    /// [`WasimError::ConnectionClosed`] when the writer task has stopped.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.count.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => WasimError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => WasimError::ConnectionClosed,
            }
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let wait = async {
            loop {
                let drained = self.pending.drained.notified();
                if !self.is_backpressure_active() {
                    return;
                }
                drained.await;
            }
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| WasimError::BackpressureTimeout)
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.count.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly when every handle is dropped, or with an error when
/// a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(Pending::default());

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_frames.max(1),
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<Pending>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        while let Some(first) = rx.recv().await {
            let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
            batch.push(first);
            while batch.len() < MAX_BATCH_SIZE {
                match rx.try_recv() {
                    Ok(frame) => batch.push(frame),
                    Err(_) => break,
                }
            }

            let batch_size = batch.len();
            write_batch(&mut writer, &batch).await?;

            pending.count.fetch_sub(batch_size, Ordering::Release);
            pending.drained.notify_waiters();
        }
        Ok::<(), WasimError>(())
    }
    .await;

    if let Err(e) = &result {
        tracing::debug!(target: "wasim_client::writer", error = %e, "writer task stopped");
    }
    // Best effort: the peer may already be gone.
    let _ = writer.shutdown().await;
    result
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
            return Err(WasimError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn value_frame(key: u32) -> OutboundFrame {
        OutboundFrame::record(Channel::Command, 1, key, Bytes::from_static(b"hello"))
    }

    #[test]
    fn test_outbound_record_frame() {
        let frame = value_frame(3);
        let header = Header::decode(&frame.header).unwrap();

        assert_eq!(header.channel(), Some(Channel::Command));
        assert_eq!(header.payload_length, 5);
        assert_eq!(frame.size(), HEADER_SIZE + 5);
    }

    #[test]
    fn test_outbound_control_frames() {
        let open = OutboundFrame::open(Channel::Value, 1, 7, 8);
        let header = Header::decode(&open.header).unwrap();
        assert!(header.is_open());
        assert_eq!(header.key, 7);
        assert_eq!(&open.payload[..], &8u32.to_le_bytes());

        let close = OutboundFrame::close(Channel::Value, 1, 7);
        assert!(Header::decode(&close.header).unwrap().is_close());
        assert_eq!(close.size(), HEADER_SIZE);
    }

    #[test]
    fn test_outbound_quit_frame() {
        let quit = OutboundFrame::quit(0xC0DE0001);
        let header = Header::decode(&quit.header).unwrap();
        assert!(header.is_quit());
        assert_eq!(header.client_id, 0xC0DE0001);
        assert!(quit.payload.is_empty());
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, &WriterConfig::default());

        handle.send(value_frame(1)).await.unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn test_writer_batching_preserves_order() {
        let (client, mut server) = duplex(8192);
        let (handle, _task) = spawn_writer_task(client, &WriterConfig::default());

        for i in 0..10u32 {
            handle.send(value_frame(i)).await.unwrap();
        }

        let mut buf = vec![0u8; 10 * (HEADER_SIZE + 5)];
        server.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(HEADER_SIZE + 5).enumerate() {
            assert_eq!(Header::decode(chunk).unwrap().key, i as u32);
        }
    }

    #[tokio::test]
    async fn test_backpressure_times_out_when_not_drained() {
        // Nobody reads the duplex, so the writer stalls once its buffer fills.
        let (client, _server) = duplex(HEADER_SIZE);
        let config = WriterConfig {
            max_pending_frames: 1,
            channel_capacity: 4,
            backpressure_timeout: Duration::from_millis(50),
        };
        let (handle, _task) = spawn_writer_task(client, &config);

        handle.send(value_frame(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = handle.send(value_frame(2)).await;
        assert!(matches!(result, Err(WasimError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_try_send_never_waits() {
        let (client, _server) = duplex(HEADER_SIZE);
        let config = WriterConfig {
            max_pending_frames: 1,
            channel_capacity: 1,
            backpressure_timeout: Duration::from_secs(30),
        };
        let (handle, _task) = spawn_writer_task(client, &config);

        handle.send(value_frame(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_backpressure_active());

        // Over the pending limit, but the channel still has room.
        handle.try_send(value_frame(2)).unwrap();
        let full = handle.try_send(value_frame(3));
        assert!(matches!(full, Err(WasimError::BackpressureTimeout)));
        assert_eq!(handle.pending_count(), 2);
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![value_frame(1)];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, HEADER_SIZE + 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(value_frame).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 5));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
