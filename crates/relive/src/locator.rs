//! Stream locator: resolves a broadcast reference to the segment base
//! endpoint and the current head sequence number.
//!
//! Resolution failure is terminal for the session; there are deliberately no
//! retries here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::error::ResolutionError;

/// Everything the rest of the session needs to know about the broadcast.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub segment_base: Url,
    /// Highest sequence number published at resolution time (the live edge).
    pub head_sequence: u64,
    pub segment_duration: Duration,
}

#[async_trait]
pub trait BroadcastLocator: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<StreamInfo, ResolutionError>;
}

/// Wire format of the broadcast metadata document.
#[derive(Debug, Deserialize)]
struct BroadcastDocument {
    live: bool,
    segment_base: String,
    head_sequence: u64,
    #[serde(default = "default_segment_secs")]
    segment_duration_secs: f64,
}

fn default_segment_secs() -> f64 {
    5.0
}

/// HTTP locator: the broadcast reference is the URL of a JSON metadata
/// document describing the live session.
pub struct HttpLocator {
    client: Client,
    request_timeout: Duration,
}

impl HttpLocator {
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }
}

#[async_trait]
impl BroadcastLocator for HttpLocator {
    async fn resolve(&self, reference: &str) -> Result<StreamInfo, ResolutionError> {
        let url = Url::parse(reference)
            .map_err(|e| ResolutionError::invalid_reference(reference, e.to_string()))?;

        let response = self
            .client
            .get(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolutionError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        let document: BroadcastDocument = response
            .json()
            .await
            .map_err(|e| ResolutionError::metadata(url.as_str(), e.to_string()))?;

        let info = stream_info_from_document(reference, &url, document)?;
        info!(
            head = info.head_sequence,
            segment_base = %info.segment_base,
            segment_secs = info.segment_duration.as_secs_f64(),
            "Resolved broadcast"
        );
        Ok(info)
    }
}

fn stream_info_from_document(
    reference: &str,
    document_url: &Url,
    document: BroadcastDocument,
) -> Result<StreamInfo, ResolutionError> {
    if !document.live {
        return Err(ResolutionError::NotLive {
            reference: reference.to_owned(),
        });
    }

    // The segment base may be relative to the metadata document.
    let segment_base = document_url
        .join(&document.segment_base)
        .map_err(|e| ResolutionError::metadata(document_url.as_str(), e.to_string()))?;

    if !document.segment_duration_secs.is_finite() || document.segment_duration_secs <= 0.0 {
        return Err(ResolutionError::metadata(
            document_url.as_str(),
            format!(
                "non-positive segment duration {}",
                document.segment_duration_secs
            ),
        ));
    }

    Ok(StreamInfo {
        segment_base,
        head_sequence: document.head_sequence,
        segment_duration: Duration::from_secs_f64(document.segment_duration_secs),
    })
}
