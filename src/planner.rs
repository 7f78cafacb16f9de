//! Range planning for sequential chunked downloads.
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive span of bytes requested from the remote file.
///
/// Both `start` and `end` are part of the range, matching the semantics of
/// the HTTP `Range: bytes=start-end` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// The first byte offset (0-based).
    pub start: u64,
    /// The last byte offset, inclusive.
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range. Never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether this range reaches the last byte of a file of `total` bytes.
    pub fn is_final(&self, total: u64) -> bool {
        self.end + 1 == total
    }

    /// The value for the `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Computes the next range to request after `downloaded` bytes are committed.
///
/// The range starts at `downloaded` and spans at most `chunk_size` bytes; the
/// end is clamped to the last byte of the file. Callers must only plan while
/// `downloaded < total`. A zero `chunk_size` is treated as one byte.
pub fn next_range(downloaded: u64, total: u64, chunk_size: u64) -> ByteRange {
    debug_assert!(downloaded < total, "nothing left to plan");

    let chunk_size = chunk_size.max(1);
    let end = downloaded
        .saturating_add(chunk_size - 1)
        .min(total.saturating_sub(1));

    ByteRange {
        start: downloaded,
        end,
    }
}
