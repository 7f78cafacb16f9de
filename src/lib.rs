//! # rget Download Library
//!
//! `rget` downloads a single remote file over HTTP(S) in fixed-size byte
//! ranges. It supports:
//! - Pausing and resuming, including across process restarts
//! - Strictly ordered, append-only writes to the destination file
//! - Status, progress and error events through an observer
//!
//! ## Example Usage
//!
//! ```no_run
//! use rget::{ChannelObserver, DownloadEngine, HttpTransport};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(HttpTransport::new(reqwest::Client::new()));
//! let (observer, mut events) = ChannelObserver::channel();
//! let engine = DownloadEngine::new(
//!     "https://example.com/files/report.pdf",
//!     ".",
//!     transport,
//!     Arc::new(observer),
//! );
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//! let status = engine.start().await?;
//! println!("finished as {}", status);
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod observer;
pub mod planner;
pub mod probe;
pub mod queue;
pub mod state;
pub mod transport;
pub mod utils;

pub use args::Args;
pub use config::Settings;
pub use downloader::DownloadEngine;
pub use error::DownloadError;
pub use observer::{ChannelObserver, ConsoleObserver, DownloadEvent, DownloadObserver};
pub use planner::ByteRange;
pub use queue::{FileSinkOpener, FragmentSink, SinkOpener};
pub use state::{DownloadSession, DownloadStatus};
pub use transport::{HttpTransport, Transport};
