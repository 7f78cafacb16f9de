//! The download engine: lifecycle state machine and sequential fetch loop.
//!
//! One engine downloads one URL. Ranges are requested strictly one after
//! another; the fragments of each response go through an
//! [`OrderedWriteQueue`] and every commit advances the session's downloaded
//! length. The next range is only planned once all writes of the previous one
//! have landed, so ranges always start at the end of the file on disk.
use crate::error::{DownloadError, Result};
use crate::fetcher;
use crate::observer::DownloadObserver;
use crate::planner::{self, ByteRange};
use crate::probe;
use crate::queue::{CommitCallback, FileSinkOpener, OrderedWriteQueue, SinkOpener};
use crate::state::{self, DownloadSession, DownloadStatus, SessionRecord};
use crate::transport::Transport;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default range request size (5 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Resumable single-file downloader.
///
/// Cloning is cheap and every clone drives the same session, so one task can
/// run [`start`](Self::start) while another calls [`pause`](Self::pause).
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    save_dir: PathBuf,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn DownloadObserver>,
    sink_opener: Mutex<Arc<dyn SinkOpener>>,
    session: Mutex<SessionState>,
    /// Held by whichever call is currently probing or looping.
    run_lock: tokio::sync::Mutex<()>,
}

struct SessionState {
    session: DownloadSession,
    /// Bumped by every accepted `start`/`resume`. The latest one owns the session.
    generation: u64,
    /// The owning call has a metadata probe pending or in flight.
    probing: bool,
    cancel: CancellationToken,
}

impl SessionState {
    /// Hands the session to a new `start`/`resume` call.
    fn claim(&mut self, status: DownloadStatus, probing: bool) -> (u64, CancellationToken) {
        self.generation += 1;
        self.probing = probing;
        self.session.status = status;
        self.cancel = CancellationToken::new();
        (self.generation, self.cancel.clone())
    }

    fn owned_by(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Clears `probing`, unless a later call has taken over the session.
    fn end_probe(&mut self, generation: u64) {
        if self.owned_by(generation) {
            self.probing = false;
        }
    }
}

impl DownloadEngine {
    pub fn new(
        url: impl Into<String>,
        save_dir: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn DownloadObserver>,
    ) -> Self {
        let session = DownloadSession::new(url.into(), DEFAULT_CHUNK_SIZE);
        observer.on_status(session.status);

        Self {
            inner: Arc::new(EngineInner {
                save_dir: save_dir.into(),
                transport,
                observer,
                sink_opener: Mutex::new(Arc::new(FileSinkOpener)),
                session: Mutex::new(SessionState {
                    session,
                    generation: 0,
                    probing: false,
                    cancel: CancellationToken::new(),
                }),
                run_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Sets the size of each range request. Zero is treated as one byte.
    pub fn with_chunk_size(self, chunk_size: u64) -> Self {
        self.inner.session.lock().session.chunk_size = chunk_size.max(1);
        self
    }

    /// Replaces where downloaded bytes are written. Defaults to appending to
    /// the destination file.
    pub fn with_sink_opener(self, opener: Arc<dyn SinkOpener>) -> Self {
        *self.inner.sink_opener.lock() = opener;
        self
    }

    pub fn status(&self) -> DownloadStatus {
        self.inner.session.lock().session.status
    }

    /// A snapshot of the current session.
    pub fn session(&self) -> DownloadSession {
        self.inner.session.lock().session.clone()
    }

    /// Probes the URL, then downloads until the file is complete or paused.
    ///
    /// Allowed from `Idle`, `Error` and `Ended`, and from `Preparing` after a
    /// failed probe. Resolves with the status the fetch loop stopped in
    /// (`Ended` or `Paused`). A start that is paused and then superseded by
    /// [`resume`](Self::resume) resolves with `Paused`.
    ///
    /// # Errors
    ///
    /// * [`DownloadError::AlreadyActive`] if a probe or fetch loop is running.
    ///   Nothing else happens in that case.
    /// * Any probe, fetch or write failure. These are also reported to the
    ///   observer; probe failures leave the status at `Preparing`, the rest
    ///   move it to `Error`.
    pub async fn start(&self) -> Result<DownloadStatus> {
        let (generation, token) = {
            let mut state = self.inner.session.lock();
            let status = state.session.status;
            let restartable = matches!(
                status,
                DownloadStatus::Idle | DownloadStatus::Error | DownloadStatus::Ended
            ) || (status == DownloadStatus::Preparing && !state.probing);
            if !restartable {
                return Err(DownloadError::AlreadyActive(status));
            }

            state.claim(DownloadStatus::Preparing, true)
        };
        self.inner.notify_status(DownloadStatus::Preparing);

        let _running = self.inner.run_lock.lock().await;
        if !self.inner.session.lock().owned_by(generation) {
            // Paused and resumed before we got to run; the resume owns it now
            return Ok(DownloadStatus::Paused);
        }
        self.inner.prepare(generation).await?;
        self.inner.run(token).await
    }

    /// Stops scheduling new ranges.
    ///
    /// Only acts while `Downloading` or `Preparing`; otherwise a no-op. The
    /// range currently in flight is still fetched and written.
    pub fn pause(&self) {
        {
            let mut state = self.inner.session.lock();
            if !matches!(
                state.session.status,
                DownloadStatus::Downloading | DownloadStatus::Preparing
            ) {
                return;
            }
            state.cancel.cancel();
            state.session.status = DownloadStatus::Paused;
        }
        info!("pause requested; in-flight range will complete");
        self.inner.notify_status(DownloadStatus::Paused);
    }

    /// Continues a paused download from the bytes already committed.
    ///
    /// Outside `Paused` this is a no-op returning the current status. If the
    /// pause landed before preparation finished, the probe runs again first.
    ///
    /// When the paused loop is still writing its last range, this waits for
    /// it. If that range completes the file or fails, the session stays
    /// `Ended` or `Error` and that status is returned.
    pub async fn resume(&self) -> Result<DownloadStatus> {
        let (generation, token, prepared, status) = {
            let mut state = self.inner.session.lock();
            if state.session.status != DownloadStatus::Paused {
                return Ok(state.session.status);
            }

            let prepared = state.session.total_length.is_some();
            let status = if prepared {
                DownloadStatus::Downloading
            } else {
                DownloadStatus::Preparing
            };
            let (generation, token) = state.claim(status, !prepared);
            (generation, token, prepared, status)
        };
        self.inner.notify_status(status);

        let _running = self.inner.run_lock.lock().await;
        {
            let state = self.inner.session.lock();
            let current = state.session.status;
            if !state.owned_by(generation)
                || matches!(current, DownloadStatus::Ended | DownloadStatus::Error)
            {
                debug!("resume superseded; session is {}", current);
                return Ok(current);
            }
        }
        if !prepared {
            self.inner.prepare(generation).await?;
        }
        self.inner.run(token).await
    }
}

impl EngineInner {
    fn notify_status(&self, status: DownloadStatus) {
        debug!("status -> {}", status);
        self.observer.on_status(status);
    }

    /// Moves to `Error` and reports `error`.
    fn fail(&self, error: DownloadError) -> DownloadError {
        self.session.lock().session.status = DownloadStatus::Error;
        warn!("download failed: {}", error);
        self.notify_status(DownloadStatus::Error);
        self.observer.on_error(&error);
        error
    }

    /// Probes the remote file and restores any progress kept on disk.
    async fn prepare(&self, generation: u64) -> Result<()> {
        let url = self.session.lock().session.url.clone();
        info!("Fetching metadata for: {}", url);

        let metadata = match probe::probe(self.transport.as_ref(), &url).await {
            Ok(metadata) => metadata,
            Err(e) => {
                self.session.lock().end_probe(generation);
                warn!("probe failed: {}", e);
                self.observer.on_error(&e);
                return Err(e);
            }
        };
        let total_length = metadata.total_length;

        let destination = self
            .session
            .lock()
            .session
            .destination
            .clone()
            .unwrap_or_else(|| self.save_dir.join(&metadata.suggested_name));

        let restored = async {
            let offset = state::restore_offset(&destination, &url, total_length).await?;
            let record = SessionRecord {
                url: url.clone(),
                total_length,
            };
            state::save_state(&record, &state::state_path(&destination)).await?;
            Ok::<u64, io::Error>(offset)
        }
        .await;

        let offset = match restored {
            Ok(offset) => offset,
            Err(e) => {
                self.session.lock().end_probe(generation);
                return Err(self.fail(e.into()));
            }
        };

        info!(
            "File Size: {} bytes, saving to {} (resuming at byte {})",
            total_length,
            destination.display(),
            offset
        );
        let progress = {
            let mut state = self.session.lock();
            state.end_probe(generation);
            state.session.destination = Some(destination);
            state.session.total_length = Some(total_length);
            state.session.downloaded_length = offset;
            state.session.progress()
        };
        self.observer.on_progress(progress);
        Ok(())
    }

    /// Runs the fetch loop until the file is complete, paused or failed.
    async fn run(self: &Arc<Self>, token: CancellationToken) -> Result<DownloadStatus> {
        let (url, destination, announce) = {
            let mut state = self.session.lock();
            if token.is_cancelled() {
                return Ok(DownloadStatus::Paused);
            }
            let Some(destination) = state.session.destination.clone() else {
                return Ok(state.session.status);
            };
            let announce = state.session.status != DownloadStatus::Downloading;
            state.session.status = DownloadStatus::Downloading;
            (state.session.url.clone(), destination, announce)
        };
        if announce {
            self.notify_status(DownloadStatus::Downloading);
        }

        let opener = Arc::clone(&*self.sink_opener.lock());
        let inner = Arc::clone(self);
        let on_committed: CommitCallback = Arc::new(move |n| inner.record_commit(n));
        let opened = OrderedWriteQueue::open(opener.as_ref(), &destination, on_committed).await;
        let queue = match opened {
            Ok(queue) => queue,
            Err(e) => return Err(self.fail(e)),
        };

        let outcome = self.fetch_loop(&queue, &url, &token).await;
        queue.close().await;

        match outcome {
            Ok(()) => Ok(self.finish(&destination).await),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn fetch_loop(
        &self,
        queue: &OrderedWriteQueue,
        url: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        loop {
            let (range, total) = {
                let state = self.session.lock();
                let session = &state.session;
                let total = session.total_length.unwrap_or(0);
                if token.is_cancelled() || session.downloaded_length >= total {
                    return Ok(());
                }
                let range = planner::next_range(session.downloaded_length, total, session.chunk_size);
                (range, total)
            };
            if range.is_final(total) {
                debug!("requesting last range {}", range);
            }

            if let Err(e) = self.transfer_range(queue, url, range).await {
                self.rollback(queue, range.start).await;
                return Err(e);
            }
        }
    }

    /// Streams one range into the queue and waits until all of it is written.
    async fn transfer_range(
        &self,
        queue: &OrderedWriteQueue,
        url: &str,
        range: ByteRange,
    ) -> Result<()> {
        let mut fragments = fetcher::fetch(self.transport.as_ref(), url, range).await?;
        let mut pending = Vec::new();
        let mut received = 0u64;

        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            received += fragment.len() as u64;
            pending.push(queue.enqueue(fragment));
        }

        // Handles resolve in enqueue order, so the first error is the root cause
        for handle in pending {
            handle.await?;
        }

        if received == 0 {
            return Err(DownloadError::fetch(range, "empty response body"));
        }
        Ok(())
    }

    /// Cuts the file back to `offset`, the start of the range that failed.
    async fn rollback(&self, queue: &OrderedWriteQueue, offset: u64) {
        match queue.truncate(offset).await {
            Ok(()) => {
                let progress = {
                    let mut state = self.session.lock();
                    state.session.downloaded_length = offset;
                    state.session.progress()
                };
                self.observer.on_progress(progress);
            }
            Err(e) => warn!("could not roll back to byte {}: {}", offset, e),
        }
    }

    /// Commit callback for the write queue.
    fn record_commit(&self, written: u64) {
        let progress = {
            let mut state = self.session.lock();
            let session = &mut state.session;
            session.downloaded_length += written;
            debug_assert!(
                session
                    .total_length
                    .is_none_or(|total| session.downloaded_length <= total)
            );
            session.progress()
        };
        self.observer.on_progress(progress);
    }

    /// Settles the status after the loop exits without an error.
    async fn finish(&self, destination: &Path) -> DownloadStatus {
        {
            let mut state = self.session.lock();
            if !state.session.is_complete() {
                // The loop only stops short of the end when paused
                return DownloadStatus::Paused;
            }
            state.session.status = DownloadStatus::Ended;
        }

        if let Err(e) = state::remove_state(&state::state_path(destination)).await {
            warn!("failed to remove session record: {}", e);
        }
        info!("Download completed: {}", destination.display());
        self.notify_status(DownloadStatus::Ended);
        DownloadStatus::Ended
    }
}
