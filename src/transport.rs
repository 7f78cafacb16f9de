//! HTTP transport used by the prober and the chunk fetcher.
use crate::config::Settings;
use crate::error::{DownloadError, Result};
use crate::planner::ByteRange;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::{HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Body fragments of one ranged response, in network arrival order.
pub type FragmentStream = BoxStream<'static, Result<Bytes>>;

/// Headers of a metadata-only probe plus the URL the request resolved to.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub headers: HeaderMap,
    /// Final URL after redirects.
    pub resolved_url: Url,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues a HEAD request for `url`.
    async fn head(&self, url: &str) -> Result<ProbeResponse>;

    /// Issues a GET restricted to `range` and streams the body.
    async fn get_range(&self, url: &str, range: ByteRange) -> Result<FragmentStream>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client with the user agent and timeouts from `settings`.
    ///
    /// There is no overall request deadline: a range body may take as long as
    /// it needs, as long as it never stalls for longer than the read timeout.
    pub fn from_settings(settings: &Settings) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(settings.user_agent())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs()))
            .read_timeout(Duration::from_secs(settings.read_timeout_secs()))
            .build()?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn head(&self, url: &str) -> Result<ProbeResponse> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(DownloadError::probe)?;

        let status = response.status();
        debug!("http probe status={} url={}", status.as_u16(), response.url());
        if !status.is_success() {
            warn!("http probe failed status={}", status.as_u16());
            return Err(DownloadError::probe(format!(
                "Request failed. Status Code: {}",
                status
            )));
        }

        Ok(ProbeResponse {
            headers: response.headers().clone(),
            resolved_url: response.url().clone(),
        })
    }

    async fn get_range(&self, url: &str, range: ByteRange) -> Result<FragmentStream> {
        let response = self
            .client
            .get(url)
            .header(RANGE, range.header_value())
            .send()
            .await
            .map_err(|e| DownloadError::fetch(range, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("http fetch failed status={} range={}", status.as_u16(), range);
            return Err(DownloadError::fetch(
                range,
                format!("Request failed. Status Code: {}", status),
            ));
        }
        // A full-body 200 is only usable when we asked for the file from byte 0.
        if status != StatusCode::PARTIAL_CONTENT && range.start > 0 {
            warn!("server ignored range request status={} range={}", status.as_u16(), range);
            return Err(DownloadError::fetch(
                range,
                format!("server ignored range request (status {})", status),
            ));
        }

        let body = response
            .bytes_stream()
            .map(move |fragment| fragment.map_err(|e| DownloadError::fetch(range, e)));
        Ok(body.boxed())
    }
}
