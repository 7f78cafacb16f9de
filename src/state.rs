//! Download lifecycle state and the persisted session record.
//!
//! The session record is serialized next to the destination file as JSON so
//! that a later process can resume a partially downloaded file instead of
//! appending to it blindly.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Lifecycle of a download session.
///
/// `Idle -> Preparing -> Downloading -> {Paused, Error, Ended}`, with
/// `Paused -> Downloading` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Idle,
    Preparing,
    Downloading,
    Paused,
    Error,
    Ended,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DownloadStatus::Idle => "idle",
            DownloadStatus::Preparing => "preparing",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Error => "error",
            DownloadStatus::Ended => "ended",
        };
        f.write_str(label)
    }
}

/// Snapshot of a download session as tracked by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSession {
    /// The source URL of the file.
    pub url: String,
    /// Where the bytes are written. Unknown until preparation completes.
    pub destination: Option<PathBuf>,
    /// Total size reported by the server. Unknown until preparation completes.
    pub total_length: Option<u64>,
    /// Bytes committed to the destination file.
    pub downloaded_length: u64,
    /// Size of each range request in bytes.
    pub chunk_size: u64,
    pub status: DownloadStatus,
}

impl DownloadSession {
    pub fn new(url: String, chunk_size: u64) -> Self {
        Self {
            url,
            destination: None,
            total_length: None,
            downloaded_length: 0,
            chunk_size: chunk_size.max(1),
            status: DownloadStatus::Idle,
        }
    }

    /// Percentage of the file committed to disk, in `0.0..=100.0`.
    pub fn progress(&self) -> f64 {
        match self.total_length {
            Some(0) => 100.0,
            Some(total) => self.downloaded_length as f64 * 100.0 / total as f64,
            None => 0.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_length
            .is_some_and(|total| self.downloaded_length >= total)
    }
}

/// What is persisted alongside a partial download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub url: String,
    pub total_length: u64,
}

/// Path of the session record for a destination file.
pub fn state_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".state.json");
    PathBuf::from(name)
}

/// Saves the session record as pretty JSON.
///
/// # Errors
///
/// Returns an error if the record cannot be serialized or written.
pub async fn save_state(record: &SessionRecord, path: &Path) -> io::Result<()> {
    let json = serde_json::to_string_pretty(record)?;
    fs::write(path, json).await
}

/// Loads a session record, treating a missing or unreadable record as absent.
pub async fn load_state(path: &Path) -> Option<SessionRecord> {
    let json = fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&json) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("ignoring corrupt session record {}: {}", path.display(), e);
            None
        }
    }
}

pub async fn remove_state(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Works out how many bytes of `destination` can be kept for `url`.
///
/// A partial file is only trusted when its session record names the same URL
/// and total length and the file is no longer than that length. Anything else
/// is truncated so the download starts over from byte zero.
pub async fn restore_offset(destination: &Path, url: &str, total_length: u64) -> io::Result<u64> {
    let on_disk = match fs::metadata(destination).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    if let Some(record) = load_state(&state_path(destination)).await
        && record.url == url
        && record.total_length == total_length
        && on_disk <= total_length
    {
        debug!("resuming {} from byte {}", destination.display(), on_disk);
        return Ok(on_disk);
    }

    if on_disk > 0 {
        warn!(
            "{} exists without a matching session record; starting over",
            destination.display()
        );
        let file = fs::OpenOptions::new().write(true).open(destination).await?;
        file.set_len(0).await?;
    }
    Ok(0)
}
