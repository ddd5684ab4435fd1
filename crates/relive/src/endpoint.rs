//! Segment endpoint capability: existence probes and payload fetches by
//! sequence number. The HTTP implementation talks to the CDN; tests swap in
//! scripted fakes behind the same trait.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::trace;
use url::Url;

use crate::error::FetchError;

/// Result of a lightweight existence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Exists,
    Absent,
}

/// Result of a full segment fetch. Transient failures are `Err`; a definite
/// not-found is a successful answer the caller must interpret (expired
/// content behind the edge, or an end-of-stream candidate at the edge).
#[derive(Debug)]
pub enum FetchOutcome {
    Payload(Bytes),
    NotFound,
}

#[async_trait]
pub trait SegmentEndpoint: Send + Sync {
    /// Check whether the segment exists without downloading its payload.
    async fn probe(&self, sequence: u64) -> Result<Probe, FetchError>;

    /// Download the segment payload.
    async fn fetch(&self, sequence: u64) -> Result<FetchOutcome, FetchError>;
}

/// HTTP segment endpoint: segments live at `<base>/<sequence>` with the
/// quality/format selector passed as query parameters.
pub struct HttpSegmentEndpoint {
    client: Client,
    base: Url,
    params: Vec<(String, String)>,
    request_timeout: Duration,
}

impl HttpSegmentEndpoint {
    pub fn new(client: Client, base: Url, request_timeout: Duration) -> Self {
        Self {
            client,
            base,
            params: Vec::new(),
            request_timeout,
        }
    }

    /// Attach a quality/format selector forwarded on every request.
    pub fn with_quality(mut self, quality: &str) -> Self {
        self.params.push(("quality".to_owned(), quality.to_owned()));
        self
    }

    fn segment_url(&self, sequence: u64) -> Result<Url, FetchError> {
        self.base
            .join(&sequence.to_string())
            .map_err(|e| FetchError::InvalidUrl {
                sequence,
                reason: e.to_string(),
            })
    }

    fn classify_status(sequence: u64, status: StatusCode) -> Option<FetchError> {
        // 404 and 410 both mean "not here": 410 is how CDNs report content
        // that has aged out of retention.
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return None;
        }
        Some(FetchError::http_status(sequence, status))
    }
}

#[async_trait]
impl SegmentEndpoint for HttpSegmentEndpoint {
    async fn probe(&self, sequence: u64) -> Result<Probe, FetchError> {
        let url = self.segment_url(sequence)?;
        let response = self
            .client
            .head(url.clone())
            .query(&self.params)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        trace!(sequence, %status, "Existence probe");
        if status.is_success() {
            return Ok(Probe::Exists);
        }
        match Self::classify_status(sequence, status) {
            None => Ok(Probe::Absent),
            Some(err) => Err(err),
        }
    }

    async fn fetch(&self, sequence: u64) -> Result<FetchOutcome, FetchError> {
        let url = self.segment_url(sequence)?;
        let response = self
            .client
            .get(url)
            .query(&self.params)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await?;
            trace!(sequence, size = bytes.len(), "Fetched segment payload");
            return Ok(FetchOutcome::Payload(bytes));
        }
        match Self::classify_status(sequence, status) {
            None => Ok(FetchOutcome::NotFound),
            Some(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(base: &str) -> HttpSegmentEndpoint {
        HttpSegmentEndpoint::new(
            Client::new(),
            Url::parse(base).unwrap(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn segment_url_appends_sequence_to_base() {
        let ep = endpoint("https://cdn.example/live/abc/");
        let url = ep.segment_url(1234).unwrap();
        assert_eq!(url.as_str(), "https://cdn.example/live/abc/1234");
    }

    #[test]
    fn not_found_and_gone_classify_as_absent() {
        assert!(HttpSegmentEndpoint::classify_status(1, StatusCode::NOT_FOUND).is_none());
        assert!(HttpSegmentEndpoint::classify_status(1, StatusCode::GONE).is_none());
    }

    #[test]
    fn server_errors_classify_as_retryable_errors() {
        let err =
            HttpSegmentEndpoint::classify_status(1, StatusCode::INTERNAL_SERVER_ERROR).unwrap();
        assert!(err.is_retryable());
        let err = HttpSegmentEndpoint::classify_status(1, StatusCode::FORBIDDEN).unwrap();
        assert!(!err.is_retryable());
    }
}
