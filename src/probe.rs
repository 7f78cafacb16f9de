//! Metadata probe: total length and suggested filename.
use crate::error::{DownloadError, Result};
use crate::transport::{ProbeResponse, Transport};
use crate::utils;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub total_length: u64,
    pub suggested_name: String,
}

/// Probes `url` with a HEAD request.
///
/// # Errors
///
/// * [`DownloadError::ProbeFailed`] if the request fails or is unsuccessful.
/// * [`DownloadError::LengthUnavailable`] if the server does not report a
///   numeric `Content-Length`.
pub async fn probe(transport: &dyn Transport, url: &str) -> Result<FileMetadata> {
    let response = transport.head(url).await?;
    let metadata = metadata_from_response(&response)?;
    debug!(
        "probed {}: {} bytes, name={}",
        url, metadata.total_length, metadata.suggested_name
    );
    Ok(metadata)
}

pub fn metadata_from_response(response: &ProbeResponse) -> Result<FileMetadata> {
    let total_length = response
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or(DownloadError::LengthUnavailable)?;

    let disposition = response
        .headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok());
    let suggested_name = utils::suggest_filename(disposition, response.resolved_url.path());

    Ok(FileMetadata {
        total_length,
        suggested_name,
    })
}
