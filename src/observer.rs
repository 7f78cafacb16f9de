//! Event sinks for download status, progress and errors.
use crate::error::DownloadError;
use crate::state::DownloadStatus;
use indicatif::ProgressBar;
use tokio::sync::mpsc;

/// Receives lifecycle events from a [`DownloadEngine`](crate::DownloadEngine).
///
/// Callbacks run on the engine's tasks and must not block. They are never
/// invoked while the engine holds its session lock, so an observer may call
/// back into the engine.
pub trait DownloadObserver: Send + Sync {
    /// Called on every state transition.
    fn on_status(&self, _status: DownloadStatus) {}
    /// Called after every committed write with a value in `0.0..=100.0`.
    fn on_progress(&self, _percent: f64) {}
    fn on_error(&self, _error: &DownloadError) {}
}

/// Drives an `indicatif` bar scaled to 100.
pub struct ConsoleObserver {
    pub pb: ProgressBar,
}

impl DownloadObserver for ConsoleObserver {
    fn on_status(&self, status: DownloadStatus) {
        match status {
            DownloadStatus::Ended => self.pb.finish_with_message("Done!"),
            DownloadStatus::Paused => self.pb.set_message("Paused"),
            DownloadStatus::Error => self.pb.abandon_with_message("Failed"),
            other => self.pb.set_message(other.to_string()),
        }
    }

    fn on_progress(&self, percent: f64) {
        self.pb.set_position(percent.floor() as u64);
    }

    fn on_error(&self, error: &DownloadError) {
        self.pb.println(format!("Error: {}", error));
    }
}

/// An event as delivered by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Status(DownloadStatus),
    Progress(f64),
    Error(String),
}

/// Forwards events into an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: DownloadEvent) {
        // Nobody listening is fine
        let _ = self.tx.send(event);
    }
}

impl DownloadObserver for ChannelObserver {
    fn on_status(&self, status: DownloadStatus) {
        self.send(DownloadEvent::Status(status));
    }

    fn on_progress(&self, percent: f64) {
        self.send(DownloadEvent::Progress(percent));
    }

    fn on_error(&self, error: &DownloadError) {
        self.send(DownloadEvent::Error(error.to_string()));
    }
}
