//! Capture engine for in-progress live broadcasts.
//!
//! Given a broadcast reference, the engine resolves the stream, rewinds
//! through the provider's retention window to the oldest retrievable
//! segment, downloads the full segment range with a bounded worker pool,
//! detects the end of the stream, and merges the captured segments into a
//! single artifact through an external multiplexer.
//!
//! [`session::CaptureSession`] is the high-level entry point; the
//! individual stages ([`rewind`], [`fetcher`], [`merge`]) are usable on
//! their own, with the provider touchpoints abstracted behind
//! [`locator::BroadcastLocator`], [`endpoint::SegmentEndpoint`] and
//! [`merge::Concatenator`].

pub mod auth;
pub mod config;
pub mod edge;
pub mod endpoint;
pub mod error;
pub mod fetcher;
pub mod locator;
pub mod manifest;
pub mod merge;
pub mod muxer;
pub mod retry;
pub mod rewind;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::{AuthContext, AuthCookie};
pub use config::{CaptureConfig, HttpConfig};
pub use error::{
    FetchError, ManifestError, MergeError, ResolutionError, RewindError, SessionError,
};
pub use fetcher::CaptureTermination;
pub use locator::{BroadcastLocator, StreamInfo};
pub use manifest::{Manifest, ManifestSummary, SegmentState};
pub use merge::{Concatenator, IntegrityVerdict, MergeReport, MergeSettings};
pub use muxer::FfmpegConcatenator;
pub use retry::RetryPolicy;
pub use session::{Broadcast, CaptureSession, SessionOutcome, SessionState};
