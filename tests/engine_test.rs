use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue};
use rget::error::Result;
use rget::observer::{ChannelObserver, DownloadEvent};
use rget::queue::AppendFile;
use rget::transport::{FragmentStream, ProbeResponse, Transport};
use rget::{
    ByteRange, DownloadEngine, DownloadError, DownloadStatus, FileSinkOpener, FragmentSink,
    SinkOpener,
};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::{TempDir, tempdir};
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

const TOTAL: usize = 10_000;
const CHUNK: u64 = 5120;

/// Serves an in-memory file and records every range it is asked for.
struct ScriptedTransport {
    content: Bytes,
    report_length: bool,
    /// Appended to every range response, like a server that over-delivers.
    surplus: &'static [u8],
    hold_probe: bool,
    hold_first_range: bool,
    /// The first range breaks off after its first fragment.
    fail_first_range: bool,
    started: Notify,
    release: Notify,
    ranges: Mutex<Vec<ByteRange>>,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self {
            content: (0..TOTAL).map(|i| (i * 7 % 256) as u8).collect::<Vec<u8>>().into(),
            report_length: true,
            surplus: b"",
            hold_probe: false,
            hold_first_range: false,
            fail_first_range: false,
            started: Notify::new(),
            release: Notify::new(),
            ranges: Mutex::new(Vec::new()),
        }
    }

    async fn hold(&self) {
        self.started.notify_one();
        self.release.notified().await;
    }

    fn ranges(&self) -> Vec<String> {
        self.ranges.lock().iter().map(|r| r.header_value()).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn head(&self, _url: &str) -> Result<ProbeResponse> {
        if self.hold_probe {
            self.hold().await;
        }
        let mut headers = HeaderMap::new();
        if self.report_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(self.content.len()));
        }
        Ok(ProbeResponse {
            headers,
            resolved_url: Url::parse("https://files.example/files/report.pdf?x=1").unwrap(),
        })
    }

    async fn get_range(&self, _url: &str, range: ByteRange) -> Result<FragmentStream> {
        let first = {
            let mut ranges = self.ranges.lock();
            ranges.push(range);
            ranges.len() == 1
        };
        if first && self.hold_first_range {
            self.hold().await;
        }

        let mut body = self.content.slice(range.start as usize..=range.end as usize).to_vec();
        body.extend_from_slice(self.surplus);

        // Uneven fragment sizes, unrelated to the chunk size
        let sizes = [1usize, 700, 333, 4096, 17];
        let mut fragments = Vec::new();
        let mut offset = 0;
        let mut i = 0;
        while offset < body.len() {
            let end = (offset + sizes[i % sizes.len()]).min(body.len());
            fragments.push(Ok(Bytes::copy_from_slice(&body[offset..end])));
            offset = end;
            i += 1;
        }
        if first && self.fail_first_range {
            fragments.truncate(1);
            fragments.push(Err(DownloadError::fetch(range, "connection reset")));
        }
        Ok(stream::iter(fragments).boxed())
    }
}

/// Appends to the real file but fails the n-th append across all opens.
struct FlakyDisk {
    appends: Arc<AtomicUsize>,
    fail_at: usize,
}

struct FlakyFile {
    file: AppendFile,
    appends: Arc<AtomicUsize>,
    fail_at: usize,
}

#[async_trait]
impl SinkOpener for FlakyDisk {
    async fn open(&self, path: &Path) -> Result<Box<dyn FragmentSink>> {
        Ok(Box::new(FlakyFile {
            file: AppendFile::open(path).await?,
            appends: self.appends.clone(),
            fail_at: self.fail_at,
        }))
    }
}

#[async_trait]
impl FragmentSink for FlakyFile {
    async fn append(&mut self, payload: &[u8]) -> io::Result<()> {
        if self.appends.fetch_add(1, Ordering::SeqCst) == self.fail_at {
            return Err(io::Error::other("disk full"));
        }
        self.file.append(payload).await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.truncate(len).await
    }
}

struct Harness {
    engine: DownloadEngine,
    transport: Arc<ScriptedTransport>,
    events: UnboundedReceiver<DownloadEvent>,
    dir: TempDir,
}

impl Harness {
    fn new(transport: ScriptedTransport) -> Self {
        Self::with_options(transport, CHUNK, Arc::new(FileSinkOpener))
    }

    fn with_options(transport: ScriptedTransport, chunk_size: u64, opener: Arc<dyn SinkOpener>) -> Self {
        let transport = Arc::new(transport);
        let (observer, events) = ChannelObserver::channel();
        let dir = tempdir().unwrap();
        let engine = DownloadEngine::new(
            "https://files.example/files/report.pdf?x=1",
            dir.path(),
            transport.clone(),
            Arc::new(observer),
        )
        .with_chunk_size(chunk_size)
        .with_sink_opener(opener);
        Self {
            engine,
            transport,
            events,
            dir,
        }
    }

    async fn saved(&self) -> Vec<u8> {
        tokio::fs::read(self.dir.path().join("report.pdf")).await.unwrap()
    }

    async fn wait_for(&self, status: DownloadStatus) {
        while self.engine.status() != status {
            tokio::task::yield_now().await;
        }
    }

    fn statuses(&mut self) -> Vec<DownloadStatus> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let DownloadEvent::Status(status) = event {
                out.push(status);
            }
        }
        out
    }
}

#[tokio::test]
async fn test_uninterrupted_download() {
    let mut h = Harness::new(ScriptedTransport::new());

    assert_eq!(h.engine.start().await.unwrap(), DownloadStatus::Ended);
    assert_eq!(h.saved().await, h.transport.content);
    assert_eq!(h.transport.ranges(), vec!["bytes=0-5119", "bytes=5120-9999"]);
    assert_eq!(h.engine.session().downloaded_length, TOTAL as u64);
    assert_eq!(h.statuses().last(), Some(&DownloadStatus::Ended));
}

#[tokio::test]
async fn test_missing_length_stays_preparing() {
    let mut transport = ScriptedTransport::new();
    transport.report_length = false;
    let mut h = Harness::new(transport);

    let err = h.engine.start().await.unwrap_err();
    assert!(matches!(err, DownloadError::LengthUnavailable));
    assert_eq!(h.engine.status(), DownloadStatus::Preparing);

    let mut saw_error = false;
    let mut statuses = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        match event {
            DownloadEvent::Status(s) => statuses.push(s),
            DownloadEvent::Error(msg) => saw_error = !msg.is_empty(),
            DownloadEvent::Progress(_) => {}
        }
    }
    assert!(saw_error);
    assert_eq!(statuses, vec![DownloadStatus::Idle, DownloadStatus::Preparing]);
    assert!(h.transport.ranges().is_empty());

    // No probe is in flight, so another attempt is allowed
    let again = h.engine.start().await.unwrap_err();
    assert!(matches!(again, DownloadError::LengthUnavailable));
}

#[tokio::test]
async fn test_pause_is_noop_when_idle_or_ended() {
    let mut h = Harness::new(ScriptedTransport::new());

    h.engine.pause();
    assert_eq!(h.engine.status(), DownloadStatus::Idle);
    assert_eq!(h.engine.resume().await.unwrap(), DownloadStatus::Idle);

    h.engine.start().await.unwrap();
    h.engine.pause();
    assert_eq!(h.engine.status(), DownloadStatus::Ended);
    assert!(!h.statuses().contains(&DownloadStatus::Paused));
}

#[tokio::test]
async fn test_pause_then_resume_matches_uninterrupted_download() {
    let mut transport = ScriptedTransport::new();
    transport.hold_first_range = true;
    let mut h = Harness::new(transport);

    let runner = h.engine.clone();
    let task = tokio::spawn(async move { runner.start().await });

    h.transport.started.notified().await;
    assert_eq!(h.engine.status(), DownloadStatus::Downloading);
    h.engine.pause();
    assert_eq!(h.engine.status(), DownloadStatus::Paused);
    h.transport.release.notify_one();

    // The in-flight range completes, nothing further is requested
    assert_eq!(task.await.unwrap().unwrap(), DownloadStatus::Paused);
    assert_eq!(h.engine.session().downloaded_length, CHUNK);
    assert_eq!(h.transport.ranges(), vec!["bytes=0-5119"]);
    assert_eq!(h.saved().await, &h.transport.content[..CHUNK as usize]);

    assert_eq!(h.engine.resume().await.unwrap(), DownloadStatus::Ended);
    assert_eq!(h.saved().await, h.transport.content);
    assert_eq!(h.transport.ranges(), vec!["bytes=0-5119", "bytes=5120-9999"]);
    assert_eq!(
        h.statuses(),
        vec![
            DownloadStatus::Idle,
            DownloadStatus::Preparing,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
            DownloadStatus::Downloading,
            DownloadStatus::Ended,
        ]
    );
}

#[tokio::test]
async fn test_pause_during_preparing_never_downloads() {
    let mut transport = ScriptedTransport::new();
    transport.hold_probe = true;
    let mut h = Harness::new(transport);

    let runner = h.engine.clone();
    let task = tokio::spawn(async move { runner.start().await });

    h.transport.started.notified().await;
    assert_eq!(h.engine.status(), DownloadStatus::Preparing);
    h.engine.pause();
    h.transport.release.notify_one();

    assert_eq!(task.await.unwrap().unwrap(), DownloadStatus::Paused);
    assert!(h.transport.ranges().is_empty());
    assert!(!h.statuses().contains(&DownloadStatus::Downloading));
    assert_eq!(h.engine.session().total_length, Some(TOTAL as u64));

    assert_eq!(h.engine.resume().await.unwrap(), DownloadStatus::Ended);
    assert_eq!(h.saved().await, h.transport.content);
}

#[tokio::test]
async fn test_second_start_is_rejected_while_active() {
    let mut transport = ScriptedTransport::new();
    transport.hold_first_range = true;
    let h = Harness::new(transport);

    let runner = h.engine.clone();
    let task = tokio::spawn(async move { runner.start().await });
    h.transport.started.notified().await;

    let err = h.engine.start().await.unwrap_err();
    assert!(matches!(
        err,
        DownloadError::AlreadyActive(DownloadStatus::Downloading)
    ));

    h.transport.release.notify_one();
    assert_eq!(task.await.unwrap().unwrap(), DownloadStatus::Ended);
    assert_eq!(h.transport.ranges().len(), 2);
}

#[tokio::test]
async fn test_download_never_exceeds_total() {
    let mut transport = ScriptedTransport::new();
    transport.surplus = b"GARBAGE";
    let h = Harness::new(transport);

    assert_eq!(h.engine.start().await.unwrap(), DownloadStatus::Ended);
    let session = h.engine.session();
    assert_eq!(session.downloaded_length, TOTAL as u64);
    assert_eq!(h.saved().await, h.transport.content);
}

#[tokio::test]
async fn test_resume_keeps_ended_when_last_range_completes() {
    let mut transport = ScriptedTransport::new();
    transport.hold_first_range = true;
    // one range covers the whole file
    let mut h = Harness::with_options(transport, TOTAL as u64, Arc::new(FileSinkOpener));

    let runner = h.engine.clone();
    let task = tokio::spawn(async move { runner.start().await });
    h.transport.started.notified().await;
    h.engine.pause();

    let resumer = h.engine.clone();
    let resumed = tokio::spawn(async move { resumer.resume().await });
    h.wait_for(DownloadStatus::Downloading).await;
    h.transport.release.notify_one();

    assert_eq!(task.await.unwrap().unwrap(), DownloadStatus::Ended);
    assert_eq!(resumed.await.unwrap().unwrap(), DownloadStatus::Ended);
    assert_eq!(h.engine.status(), DownloadStatus::Ended);
    assert_eq!(h.transport.ranges(), vec!["bytes=0-9999"]);
    assert_eq!(h.saved().await, h.transport.content);
    assert_eq!(
        h.statuses(),
        vec![
            DownloadStatus::Idle,
            DownloadStatus::Preparing,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
            DownloadStatus::Downloading,
            DownloadStatus::Ended,
        ]
    );
}

#[tokio::test]
async fn test_resume_keeps_error_when_last_range_fails() {
    let mut transport = ScriptedTransport::new();
    transport.hold_first_range = true;
    transport.fail_first_range = true;
    let mut h = Harness::new(transport);

    let runner = h.engine.clone();
    let task = tokio::spawn(async move { runner.start().await });
    h.transport.started.notified().await;
    h.engine.pause();

    let resumer = h.engine.clone();
    let resumed = tokio::spawn(async move { resumer.resume().await });
    h.wait_for(DownloadStatus::Downloading).await;
    h.transport.release.notify_one();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, DownloadError::FetchFailed { .. }));
    assert_eq!(resumed.await.unwrap().unwrap(), DownloadStatus::Error);
    assert_eq!(h.engine.status(), DownloadStatus::Error);
    assert_eq!(h.engine.session().downloaded_length, 0);
    assert_eq!(h.transport.ranges(), vec!["bytes=0-5119"]);
    assert_eq!(
        h.statuses(),
        vec![
            DownloadStatus::Idle,
            DownloadStatus::Preparing,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
            DownloadStatus::Downloading,
            DownloadStatus::Error,
        ]
    );
}

#[tokio::test]
async fn test_start_stays_rejected_while_resume_owns_preparation() {
    let mut transport = ScriptedTransport::new();
    transport.hold_probe = true;
    let h = Harness::new(transport);

    let runner = h.engine.clone();
    let task = tokio::spawn(async move { runner.start().await });
    h.transport.started.notified().await;
    h.engine.pause();

    let resumer = h.engine.clone();
    let resumed = tokio::spawn(async move { resumer.resume().await });
    h.wait_for(DownloadStatus::Preparing).await;

    // The first HEAD finishes, but the paused start no longer owns the session
    h.transport.release.notify_one();
    assert_eq!(task.await.unwrap().unwrap(), DownloadStatus::Paused);

    let err = h.engine.start().await.unwrap_err();
    assert!(matches!(
        err,
        DownloadError::AlreadyActive(DownloadStatus::Preparing)
    ));

    // Let the HEAD issued by resume through
    h.transport.release.notify_one();
    assert_eq!(resumed.await.unwrap().unwrap(), DownloadStatus::Ended);
    assert_eq!(h.transport.ranges(), vec!["bytes=0-5119", "bytes=5120-9999"]);
    assert_eq!(h.saved().await, h.transport.content);
}

#[tokio::test]
async fn test_write_failure_mid_range_rolls_back_then_restarts() {
    // Fragments of the first range are appends 0..=3; fail the second one of the next range
    let opener = Arc::new(FlakyDisk {
        appends: Arc::new(AtomicUsize::new(0)),
        fail_at: 5,
    });
    let mut h = Harness::with_options(ScriptedTransport::new(), CHUNK, opener);

    let err = h.engine.start().await.unwrap_err();
    assert!(matches!(err, DownloadError::WriteFailed(_)));
    assert_eq!(h.engine.status(), DownloadStatus::Error);
    assert_eq!(h.engine.session().downloaded_length, CHUNK);
    assert_eq!(h.saved().await, &h.transport.content[..CHUNK as usize]);

    let mut saw_write_error = false;
    let mut statuses = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        match event {
            DownloadEvent::Status(s) => statuses.push(s),
            DownloadEvent::Error(msg) => saw_write_error = msg.contains("disk full"),
            DownloadEvent::Progress(_) => {}
        }
    }
    assert!(saw_write_error);
    assert_eq!(statuses.last(), Some(&DownloadStatus::Error));

    assert_eq!(h.engine.start().await.unwrap(), DownloadStatus::Ended);
    assert_eq!(h.saved().await, h.transport.content);
    assert_eq!(
        h.transport.ranges(),
        vec!["bytes=0-5119", "bytes=5120-9999", "bytes=5120-9999"]
    );
}
