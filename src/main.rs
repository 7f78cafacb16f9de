use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rget::{
    Args, ConsoleObserver, DownloadEngine, DownloadStatus, HttpTransport, Settings,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let settings = Settings::load().unwrap_or_default();

    let dir = args
        .dir
        .or_else(|| settings.default_dir.clone())
        .unwrap_or_else(|| ".".to_string());
    let chunk_size = args
        .chunk_size_kb
        .map(|kb| kb.max(1) * 1024)
        .unwrap_or_else(|| settings.chunk_size_bytes());

    if dir != "." {
        tokio::fs::create_dir_all(&dir).await?;
    }

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}%")?
            .progress_chars("=>-"),
    );
    let observer = Arc::new(ConsoleObserver { pb });
    let transport = Arc::new(HttpTransport::from_settings(&settings)?);

    let engine = DownloadEngine::new(args.url.clone(), dir, transport, observer)
        .with_chunk_size(chunk_size);

    let signal_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n🛑 Received Ctrl+C. Pausing after the current chunk...");
            signal_engine.pause();
        }
    });

    println!("Starting download for: {}", args.url);
    let status = engine.start().await?;
    let session = engine.session();
    let target = session
        .destination
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    match status {
        DownloadStatus::Ended => println!("✅ Download completed: {}", target),
        DownloadStatus::Paused => println!(
            "⏸  Paused at {} of {} bytes. Run the same command again to resume.",
            session.downloaded_length,
            session.total_length.unwrap_or(0)
        ),
        other => println!("Stopped while {}", other),
    }

    Ok(())
}
