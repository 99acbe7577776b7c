//! Bidirectional stream splicing
//!
//! Joins two established duplex streams so each one's output feeds the
//! other's input. Both streams are owned by the splice and are always closed
//! together: when the splice ends, every half of both streams is dropped.
//!
//! End-of-stream on one side is propagated as a half-close (write shutdown)
//! to the other side. The splice then waits for the opposite direction to
//! finish, for at most the drain timeout. Any I/O error ends the splice
//! immediately.

use super::{ForwardError, DEFAULT_BUFFER_SIZE, DEFAULT_DRAIN_TIMEOUT};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Splice configuration
#[derive(Debug, Clone)]
pub struct SpliceOptions {
    /// Copy buffer size per direction
    pub buffer_size: usize,
    /// How long the open direction may keep running after the other one
    /// reached end-of-stream
    pub drain_timeout: Duration,
}

impl Default for SpliceOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Byte counters of a finished splice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    /// Bytes relayed from the source stream to the destination stream
    pub bytes_to_destination: u64,
    /// Bytes relayed from the destination stream to the source stream
    pub bytes_to_source: u64,
    /// Time between the splice starting and both streams closing
    pub duration: Duration,
}

/// Completion notification of a spawned splice
#[derive(Debug)]
pub struct SpliceReport {
    /// Splice ID given to [`join`]
    pub id: u64,
    /// Final counters, or the I/O error that ended the splice
    pub result: Result<SpliceStats, ForwardError>,
}

/// Handle to a spawned splice.
///
/// The two streams live inside the splice task and cannot be reached through
/// the handle; it can only ask the splice to close and wait for it.
#[derive(Debug)]
pub struct SpliceHandle {
    id: u64,
    started_at: Instant,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SpliceHandle {
    /// Get splice ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the splice was started
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Request termination; both streams are closed without draining
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Check if the splice task has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until both streams are closed and the task has exited
    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            debug!("Splice {} task ended abnormally: {}", self.id, e);
        }
    }
}

/// Spawn a splice of `source` and `destination`.
///
/// The outcome is sent as a [`SpliceReport`] on `done` once both streams are
/// closed. Cancelling `cancel` (or calling [`SpliceHandle::close`]) tears the
/// splice down promptly.
pub fn join<S, D>(
    id: u64,
    source: S,
    destination: D,
    options: SpliceOptions,
    cancel: CancellationToken,
    done: mpsc::UnboundedSender<SpliceReport>,
) -> SpliceHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    D: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        let result = splice(source, destination, &options, task_cancel).await;
        // The receiver is gone once the owning session has torn down
        let _ = done.send(SpliceReport { id, result });
    });

    SpliceHandle {
        id,
        started_at: Instant::now(),
        cancel,
        task,
    }
}

/// Relay bytes between `source` and `destination` until both directions
/// finish, an error occurs, or `cancel` fires.
///
/// Both streams are closed when this returns.
pub async fn splice<S, D>(
    source: S,
    destination: D,
    options: &SpliceOptions,
    cancel: CancellationToken,
) -> Result<SpliceStats, ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let to_destination = AtomicU64::new(0);
    let to_source = AtomicU64::new(0);

    let (source_read, source_write) = tokio::io::split(source);
    let (destination_read, destination_write) = tokio::io::split(destination);

    let upstream = pump(
        source_read,
        destination_write,
        options.buffer_size,
        &to_destination,
    );
    let downstream = pump(
        destination_read,
        source_write,
        options.buffer_size,
        &to_source,
    );
    tokio::pin!(upstream);
    tokio::pin!(downstream);

    let drain = tokio::time::sleep(options.drain_timeout);
    tokio::pin!(drain);

    let mut upstream_done = false;
    let mut downstream_done = false;
    let mut draining = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Splice cancelled");
                break;
            }
            result = &mut upstream, if !upstream_done => {
                result?;
                upstream_done = true;
            }
            result = &mut downstream, if !downstream_done => {
                result?;
                downstream_done = true;
            }
            _ = &mut drain, if draining => {
                debug!("Splice drain timeout elapsed, closing both sides");
                break;
            }
        }

        if upstream_done && downstream_done {
            break;
        }

        // One direction reached end-of-stream
        if !draining {
            drain
                .as_mut()
                .reset(tokio::time::Instant::now() + options.drain_timeout);
            draining = true;
        }
    }

    Ok(SpliceStats {
        bytes_to_destination: to_destination.load(Ordering::Relaxed),
        bytes_to_source: to_source.load(Ordering::Relaxed),
        duration: started.elapsed(),
    })
}

/// Copy one direction until end-of-stream, then half-close the writer
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    counter: &AtomicU64,
) -> Result<(), ForwardError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await.map_err(ForwardError::Stream)?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(ForwardError::Stream)?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    // The peer may already be gone; the read side decides the outcome
    writer.shutdown().await.ok();
    Ok(())
}
