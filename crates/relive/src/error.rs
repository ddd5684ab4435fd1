use std::path::PathBuf;

use reqwest::StatusCode;

/// Broadcast resolution failures. These are terminal for the session:
/// the locator never retries.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("broadcast `{reference}` is not currently live")]
    NotLive { reference: String },

    #[error("invalid broadcast reference `{input}`: {reason}")]
    InvalidReference { input: String, reason: String },

    #[error("broadcast metadata at `{url}` could not be parsed: {reason}")]
    Metadata { url: String, reason: String },

    #[error("resolution request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("resolution request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },
}

impl ResolutionError {
    pub fn invalid_reference(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn metadata(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Metadata {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Rewind resolution failures. Fatal for the session.
#[derive(Debug, thiserror::Error)]
pub enum RewindError {
    #[error(
        "no segment within {window_segments} segments behind head {head} is retrievable"
    )]
    Exhausted { head: u64, window_segments: u64 },

    #[error("existence probe failed: {source}")]
    Probe {
        #[from]
        source: FetchError,
    },
}

/// Per-request failure classification used by the fetcher and the
/// rewind resolver's existence probes.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch cancelled")]
    Cancelled,

    #[error("invalid segment URL for sequence {sequence}: {reason}")]
    InvalidUrl { sequence: u64, reason: String },

    #[error("request for segment {sequence} failed with HTTP {status}")]
    HttpStatus { sequence: u64, status: StatusCode },

    #[error("network error: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn http_status(sequence: u64, status: StatusCode) -> Self {
        Self::HttpStatus { sequence, status }
    }

    /// Whether the fetcher should retry this failure with backoff.
    ///
    /// Server errors and 429 are transient; other HTTP statuses are not.
    /// Network and I/O failures are retried except for reqwest errors that
    /// cannot succeed on a second attempt (redirect loops, builder errors).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::InvalidUrl { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { source } => crate::retry::is_retryable_reqwest_error(source),
            Self::Io { .. } => true,
        }
    }
}

/// Manifest bookkeeping violations. The fetcher is the only writer, so any
/// of these indicates a scheduling bug rather than an environmental failure.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("sequence {sequence} is already tracked by the manifest")]
    AlreadyTracked { sequence: u64 },

    #[error("sequence {sequence} is not tracked by the manifest")]
    UnknownSequence { sequence: u64 },

    #[error("illegal transition for sequence {sequence}: {from} -> {to}")]
    IllegalTransition {
        sequence: u64,
        from: &'static str,
        to: &'static str,
    },

    #[error("manifest summary I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("manifest summary is malformed: {source}")]
    Malformed {
        #[from]
        source: serde_json::Error,
    },
}

/// Merge engine failures. An integrity mismatch is carried in the merge
/// report instead (the artifact is still produced); this enum covers the
/// cases where no usable artifact exists.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("nothing to merge: no downloaded segments under {dir}")]
    Empty { dir: PathBuf },

    #[error("multiplexer failed: {reason}")]
    Muxer { reason: String },

    #[error(
        "merged artifact failed integrity validation: expected ~{expected_secs:.1}s, \
         got {actual_secs:.1}s (tolerance {tolerance_secs:.1}s)"
    )]
    Integrity {
        expected_secs: f64,
        actual_secs: f64,
        tolerance_secs: f64,
    },

    #[error("I/O error during merge: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl MergeError {
    pub fn muxer(reason: impl Into<String>) -> Self {
        Self::Muxer {
            reason: reason.into(),
        }
    }
}

/// Session-level failures surfaced to the caller. Per-segment failures are
/// resolved inside the fetcher (retry or recorded gap) and never appear here.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Rewind(#[from] RewindError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to build HTTP client: {source}")]
    Client { source: reqwest::Error },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}
