//! Fetches one planned range as a stream of body fragments.
use crate::error::Result;
use crate::planner::ByteRange;
use crate::transport::{FragmentStream, Transport};
use futures_util::{StreamExt, future};
use tracing::{debug, warn};

/// Requests `range` from `url` and streams the response body.
///
/// Fragments arrive in network order with transport-determined sizes. The
/// stream never yields more than `range.len()` bytes in total: a server that
/// over-delivers has its surplus dropped and the stream ends early.
pub async fn fetch(transport: &dyn Transport, url: &str, range: ByteRange) -> Result<FragmentStream> {
    debug!("requesting range {}", range.header_value());
    let body = transport.get_range(url, range).await?;
    Ok(cap_to_range(body, range))
}

fn cap_to_range(body: FragmentStream, range: ByteRange) -> FragmentStream {
    body.scan(range.len(), move |remaining, fragment| {
        let item = match fragment {
            Ok(_) if *remaining == 0 => None,
            Ok(mut bytes) => {
                if bytes.len() as u64 > *remaining {
                    warn!(
                        "server sent more than requested for {}; dropping {} bytes",
                        range,
                        bytes.len() as u64 - *remaining
                    );
                    bytes.truncate(*remaining as usize);
                }
                *remaining -= bytes.len() as u64;
                Some(Ok(bytes))
            }
            Err(e) => Some(Err(e)),
        };
        future::ready(item)
    })
    .boxed()
}
