use clap::Parser;

/// A resumable, chunked file downloader.
///
/// Downloads the file in fixed-size range requests. Press Ctrl+C to pause;
/// running the same command again resumes where it stopped.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The URL of the file to download.
    #[arg(short, long)]
    pub url: String,

    /// The directory to save the file in. Defaults to the current directory.
    #[arg(short, long)]
    pub dir: Option<String>,

    /// Size of each range request in KiB (default 5120).
    #[arg(short, long)]
    pub chunk_size_kb: Option<u64>,
}
