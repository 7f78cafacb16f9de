//! Serialized, append-only write pipeline.
//!
//! Fragments may arrive from the network faster than they can be written.
//! [`OrderedWriteQueue`] hands them to a single consumer task that owns the
//! destination, so exactly one write is in flight at a time and fragments land
//! on disk in the order they were enqueued. Each enqueue returns a
//! [`WriteHandle`] that resolves once that fragment is committed.
//!
//! After a failed write the queue is halted: later fragments are rejected
//! without touching the file, so the file never receives bytes out of order.
//! [`OrderedWriteQueue::truncate`] clears the halt.
use crate::error::{DownloadError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Invoked with the fragment length after each successful write.
pub type CommitCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Destination the queue appends to.
#[async_trait]
pub trait FragmentSink: Send + 'static {
    /// Appends the whole payload.
    async fn append(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Cuts the destination back to `len` bytes.
    async fn truncate(&mut self, len: u64) -> io::Result<()>;
}

#[async_trait]
impl FragmentSink for Box<dyn FragmentSink> {
    async fn append(&mut self, payload: &[u8]) -> io::Result<()> {
        (**self).append(payload).await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        (**self).truncate(len).await
    }
}

/// Opens the sink a download appends to.
#[async_trait]
pub trait SinkOpener: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Box<dyn FragmentSink>>;
}

/// Appends straight to the destination file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSinkOpener;

#[async_trait]
impl SinkOpener for FileSinkOpener {
    async fn open(&self, path: &Path) -> Result<Box<dyn FragmentSink>> {
        Ok(Box::new(AppendFile::open(path).await?))
    }
}

/// A file opened in append mode, created if absent.
pub struct AppendFile {
    file: File,
}

impl AppendFile {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file })
    }
}

#[async_trait]
impl FragmentSink for AppendFile {
    async fn append(&mut self, payload: &[u8]) -> io::Result<()> {
        self.file.write_all(payload).await?;
        // Ensure the bytes reach the file before the commit is reported
        self.file.flush().await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.flush().await?;
        self.file.set_len(len).await
    }
}

/// One fragment waiting to be written.
struct WriteTask {
    payload: Bytes,
    /// Enqueue index, only used in log lines. Ordering comes from the channel.
    order: u64,
    done: oneshot::Sender<Result<()>>,
}

enum WriteOp {
    Append(WriteTask),
    Truncate {
        len: u64,
        done: oneshot::Sender<io::Result<()>>,
    },
}

pub struct OrderedWriteQueue {
    tx: mpsc::UnboundedSender<WriteOp>,
    next_order: AtomicU64,
    worker: JoinHandle<()>,
}

impl OrderedWriteQueue {
    /// Spawns the consumer task that owns `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S: FragmentSink>(sink: S, on_committed: CommitCallback) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain(sink, rx, on_committed));
        Self {
            tx,
            next_order: AtomicU64::new(0),
            worker,
        }
    }

    /// Opens `path` through `opener` and wraps the sink in a queue.
    pub async fn open(
        opener: &dyn SinkOpener,
        path: &Path,
        on_committed: CommitCallback,
    ) -> Result<Self> {
        let sink = opener.open(path).await?;
        Ok(Self::new(sink, on_committed))
    }

    /// Queues `payload` behind every fragment enqueued before it.
    ///
    /// The write starts as soon as all earlier writes have completed; the
    /// returned handle resolves after the payload is written and the commit
    /// callback has run.
    pub fn enqueue(&self, payload: Bytes) -> WriteHandle {
        let (done, rx) = oneshot::channel();
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        let task = WriteTask {
            payload,
            order,
            done,
        };
        // If the worker is gone the sender is dropped and the handle reports it
        let _ = self.tx.send(WriteOp::Append(task));
        WriteHandle { rx }
    }

    /// Truncates the destination to `len` bytes once pending writes finish.
    pub async fn truncate(&self, len: u64) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Truncate { len, done })
            .map_err(|_| queue_stopped())?;
        rx.await.map_err(|_| queue_stopped())??;
        Ok(())
    }

    /// Waits for every queued write to finish, then stops the consumer.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            warn!("write queue worker ended abnormally: {}", e);
        }
    }
}

/// Resolves when the corresponding fragment has been committed.
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for WriteHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(queue_stopped())))
    }
}

fn queue_stopped() -> DownloadError {
    DownloadError::WriteFailed(io::Error::other("write queue stopped"))
}

async fn drain<S: FragmentSink>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    on_committed: CommitCallback,
) {
    let mut halted = false;

    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Append(task) => {
                if halted {
                    let _ = task.done.send(Err(DownloadError::WriteFailed(io::Error::other(
                        "write queue halted after an earlier failure",
                    ))));
                    continue;
                }

                let len = task.payload.len() as u64;
                match sink.append(&task.payload).await {
                    Ok(()) => {
                        trace!("committed fragment #{} ({} bytes)", task.order, len);
                        on_committed(len);
                        let _ = task.done.send(Ok(()));
                    }
                    Err(e) => {
                        warn!("write of fragment #{} failed: {}", task.order, e);
                        halted = true;
                        let _ = task.done.send(Err(DownloadError::WriteFailed(e)));
                    }
                }
            }
            WriteOp::Truncate { len, done } => {
                let result = sink.truncate(len).await;
                if result.is_ok() {
                    halted = false;
                }
                let _ = done.send(result);
            }
        }
    }
}
