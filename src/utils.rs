//! Utility helpers used across the crate.
//!
//! Filename extraction from response headers and request paths.
use percent_encoding::percent_decode_str;
use sanitize_filename::sanitize;

/// Name used when neither the headers nor the path yield a filename.
pub const FALLBACK_FILENAME: &str = "unnamed";

/// Extracts a filename from a `Content-Disposition` header value.
///
/// Looks at each `;`-separated attribute. `filename*=charset''name` (RFC 5987)
/// is percent-decoded; a plain `filename=` value has surrounding quotes
/// trimmed. The last matching attribute wins.
pub fn filename_from_disposition(disposition: &str) -> Option<String> {
    let mut found = None;

    for part in disposition.split(';').map(str::trim) {
        if let Some(encoded) = part.strip_prefix("filename*=") {
            let value = encoded.rsplit('\'').next().unwrap_or(encoded);
            let decoded = percent_decode_str(value).decode_utf8_lossy();
            found = Some(decoded.trim_matches('"').to_string());
        } else if let Some(value) = part.strip_prefix("filename=") {
            found = Some(value.trim().trim_matches('"').trim_matches('\'').to_string());
        }
    }

    found.map(sanitize).filter(|s| !s.is_empty())
}

/// Extracts a clean filename from a request path.
///
/// 1. Strips any query string.
/// 2. Takes the last segment of the path.
/// 3. URL-decodes it (converts %20 to space, etc.).
/// 4. Sanitizes it to remove characters invalid for the OS.
pub fn filename_from_path(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let segment = path.rsplit('/').next().unwrap_or("");

    Some(percent_decode_str(segment).decode_utf8_lossy().to_string())
        .map(sanitize)
        .filter(|s| !s.is_empty())
}

/// Picks the local filename for a download.
///
/// The `Content-Disposition` header takes precedence over the resolved
/// request path; [`FALLBACK_FILENAME`] is used when both come up empty.
pub fn suggest_filename(disposition: Option<&str>, resolved_path: &str) -> String {
    disposition
        .and_then(filename_from_disposition)
        .or_else(|| filename_from_path(resolved_path))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}
