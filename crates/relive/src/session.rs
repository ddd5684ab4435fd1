//! Session orchestration: wires the locator, rewind resolver, fetcher and
//! merge engine into the capture state machine.
//!
//! Initializing -> Resolving -> Rewinding -> Capturing ->
//! {Completed | Cancelled | Aborted} -> Merging -> Finished.
//! Aborted sessions (resolution or rewind failure) skip merging; a
//! cancelled capture still merges whatever it got.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::AuthContext;
use crate::config::CaptureConfig;
use crate::edge::EdgeTracker;
use crate::endpoint::{HttpSegmentEndpoint, SegmentEndpoint};
use crate::error::SessionError;
use crate::fetcher::{CaptureTermination, SegmentFetcher};
use crate::locator::{BroadcastLocator, HttpLocator};
use crate::manifest::{Manifest, ManifestSummary};
use crate::merge::{self, Concatenator, MergePlan, MergeReport, MergeSettings};
use crate::muxer::FfmpegConcatenator;
use crate::rewind;

/// Immutable description of the broadcast being captured. Created once at
/// session start.
#[derive(Debug, Clone, Default)]
pub struct Broadcast {
    /// Opaque broadcast reference handed to the locator. For the HTTP
    /// locator this is the metadata document URL.
    pub reference: String,
    /// Optional quality/format selector forwarded on segment requests.
    pub quality: Option<String>,
    /// Opaque pre-parsed cookie material; loading it is the caller's job.
    pub auth: Option<AuthContext>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Resolving,
    Rewinding,
    Capturing,
    Completed,
    Cancelled,
    Aborted,
    Merging,
    Finished,
}

/// Result of a session run.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Completed or Cancelled; aborted sessions surface as errors instead.
    pub termination: CaptureTermination,
    pub summary: ManifestSummary,
    /// `None` when merging was skipped (capture-only runs, or nothing was
    /// downloaded before cancellation).
    pub merge: Option<MergeReport>,
}

enum EndpointSource {
    /// Built per session from the resolved segment base.
    Http { client: reqwest::Client },
    /// Injected capability (tests, embedders).
    Fixed(Arc<dyn SegmentEndpoint>),
}

struct CaptureOutput {
    termination: CaptureTermination,
    manifest: Arc<Manifest>,
    segment_duration: Duration,
}

pub struct CaptureSession {
    broadcast: Broadcast,
    config: CaptureConfig,
    token: CancellationToken,
    locator: Arc<dyn BroadcastLocator>,
    endpoint_source: EndpointSource,
    concatenator: Arc<dyn Concatenator>,
    state: SessionState,
}

impl CaptureSession {
    /// Build a session with the production HTTP locator, HTTP segment
    /// endpoint and ffmpeg concatenator.
    pub fn new(broadcast: Broadcast, config: CaptureConfig) -> Result<Self, SessionError> {
        let client = config
            .http
            .build_client(broadcast.auth.as_ref())
            .map_err(|source| SessionError::Client { source })?;
        let locator = Arc::new(HttpLocator::new(
            client.clone(),
            config.http.request_timeout,
        ));
        Ok(Self {
            broadcast,
            config,
            token: CancellationToken::new(),
            locator,
            endpoint_source: EndpointSource::Http { client },
            concatenator: Arc::new(FfmpegConcatenator::default()),
            state: SessionState::Initializing,
        })
    }

    /// Build a session from injected capabilities.
    pub fn with_components(
        broadcast: Broadcast,
        config: CaptureConfig,
        locator: Arc<dyn BroadcastLocator>,
        endpoint: Arc<dyn SegmentEndpoint>,
        concatenator: Arc<dyn Concatenator>,
    ) -> Self {
        Self {
            broadcast,
            config,
            token: CancellationToken::new(),
            locator,
            endpoint_source: EndpointSource::Fixed(endpoint),
            concatenator,
            state: SessionState::Initializing,
        }
    }

    /// Token for cooperative cancellation. Cancelling takes effect at the
    /// next safe worker boundary; in-flight segment writes complete.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, next: SessionState) {
        self.state = next;
        info!(state = ?next, "Session state");
    }

    /// Run the full state machine: capture, then merge.
    pub async fn run(&mut self, output_dir: &Path) -> Result<SessionOutcome, SessionError> {
        let capture = self.run_capture(output_dir).await?;
        let summary = capture.manifest.summary();

        self.enter(SessionState::Merging);
        let merge = if summary.downloaded == 0 {
            warn!("Nothing was downloaded; skipping merge");
            None
        } else {
            let plan = MergePlan::from_manifest(&capture.manifest);
            let settings = MergeSettings {
                segment_duration: capture.segment_duration,
                duration_tolerance: self.config.duration_tolerance,
                remove_segments: self.config.remove_segments_after_merge,
            };
            let output = output_dir.join(&self.config.output_file_name);
            Some(merge::run(&plan, self.concatenator.as_ref(), &settings, &output).await?)
        };

        self.enter(SessionState::Finished);
        Ok(SessionOutcome {
            termination: capture.termination,
            summary,
            merge,
        })
    }

    /// Run the session through Capturing only, leaving the segment files
    /// and summary on disk for a later merge.
    pub async fn capture(&mut self, output_dir: &Path) -> Result<SessionOutcome, SessionError> {
        let capture = self.run_capture(output_dir).await?;
        Ok(SessionOutcome {
            termination: capture.termination,
            summary: capture.manifest.summary(),
            merge: None,
        })
    }

    async fn run_capture(&mut self, output_dir: &Path) -> Result<CaptureOutput, SessionError> {
        self.enter(SessionState::Resolving);
        let info = match self.locator.resolve(&self.broadcast.reference).await {
            Ok(info) => info,
            Err(e) => {
                self.enter(SessionState::Aborted);
                return Err(e.into());
            }
        };
        let segment_duration = self
            .config
            .segment_duration_override
            .unwrap_or(info.segment_duration);

        let endpoint: Arc<dyn SegmentEndpoint> = match &self.endpoint_source {
            EndpointSource::Fixed(endpoint) => Arc::clone(endpoint),
            EndpointSource::Http { client } => {
                let mut endpoint = HttpSegmentEndpoint::new(
                    client.clone(),
                    info.segment_base.clone(),
                    self.config.http.request_timeout,
                );
                if let Some(quality) = &self.broadcast.quality {
                    endpoint = endpoint.with_quality(quality);
                }
                Arc::new(endpoint)
            }
        };

        self.enter(SessionState::Rewinding);
        let window_segments = self.config.rewind_window_segments(segment_duration);
        let floor = match rewind::resolve_floor(
            endpoint.as_ref(),
            info.head_sequence,
            window_segments,
            self.config.start_sequence,
            &self.config.retry,
            self.config.max_attempts,
            &self.token,
        )
        .await
        {
            Ok(floor) => floor,
            Err(e) => {
                self.enter(SessionState::Aborted);
                return Err(e.into());
            }
        };

        self.enter(SessionState::Capturing);
        std::fs::create_dir_all(output_dir)?;
        let manifest = Arc::new(Manifest::new(floor));
        let edge = Arc::new(EdgeTracker::new(
            info.head_sequence,
            self.config.edge_miss_threshold,
        ));
        let fetcher = Arc::new(SegmentFetcher::new(
            Arc::clone(&endpoint),
            Arc::clone(&manifest),
            edge,
            self.token.clone(),
            output_dir.to_path_buf(),
            &self.config,
            segment_duration,
        ));
        let termination = fetcher.run().await;

        self.enter(match termination {
            CaptureTermination::Completed => SessionState::Completed,
            CaptureTermination::Cancelled => SessionState::Cancelled,
        });
        Ok(CaptureOutput {
            termination,
            manifest,
            segment_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ResolutionError, RewindError};
    use crate::manifest::segment_file_name;
    use crate::retry::RetryPolicy;
    use crate::test_support::{FakeConcatenator, FakeEndpoint, FakeLocator};

    const SEG: Duration = Duration::from_millis(5);

    fn config() -> CaptureConfig {
        CaptureConfig {
            max_concurrency: 3,
            segment_duration_override: Some(SEG),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            edge_miss_threshold: 3,
            ..Default::default()
        }
    }

    fn session(
        locator: FakeLocator,
        endpoint: Arc<FakeEndpoint>,
    ) -> (CaptureSession, Arc<FakeEndpoint>) {
        let session = CaptureSession::with_components(
            Broadcast {
                reference: "https://live.test/meta.json".into(),
                ..Default::default()
            },
            config(),
            Arc::new(locator),
            endpoint.clone() as Arc<dyn SegmentEndpoint>,
            Arc::new(FakeConcatenator::new(SEG)),
        );
        (session, endpoint)
    }

    #[tokio::test]
    async fn full_session_captures_and_merges() {
        let (mut session, _) = session(
            FakeLocator::live(20, SEG),
            Arc::new(FakeEndpoint::new(0..=30)),
        );
        let dir = tempfile::tempdir().unwrap();

        let outcome = session.run(dir.path()).await.unwrap();
        assert_eq!(outcome.termination, CaptureTermination::Completed);
        assert_eq!(session.state(), SessionState::Finished);

        // Rewind reached the actual start of the broadcast.
        assert_eq!(outcome.summary.floor, 0);
        assert_eq!(outcome.summary.downloaded, 31);
        assert!(outcome.summary.gaps.is_empty());

        let report = outcome.merge.unwrap();
        assert!(report.is_contiguous());
        assert_eq!((report.first_sequence, report.last_sequence), (0, 30));
        assert!(report.artifact.exists());
        assert!(dir.path().join(segment_file_name(15)).exists());
    }

    #[tokio::test]
    async fn offline_broadcast_aborts_before_capture() {
        let (mut session, _) = session(
            FakeLocator::offline(),
            Arc::new(FakeEndpoint::new(0..=10)),
        );
        let dir = tempfile::tempdir().unwrap();

        let err = session.run(dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Resolution(ResolutionError::NotLive { .. })
        ));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn exhausted_rewind_aborts_before_capture() {
        // Only the live edge is retrievable; no rewind is possible.
        let (mut session, _) = session(
            FakeLocator::live(1000, SEG),
            Arc::new(FakeEndpoint::new(1000..=1000)),
        );
        let dir = tempfile::tempdir().unwrap();

        let err = session.run(dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Rewind(RewindError::Exhausted { .. })
        ));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn cancelled_session_still_merges_partial_capture() {
        let endpoint = Arc::new(FakeEndpoint::new(0..=5000));
        let (mut session, endpoint) = session(FakeLocator::live(5000, SEG), endpoint);
        endpoint.cancel_after(20, session.cancellation_token());
        let dir = tempfile::tempdir().unwrap();

        let outcome = session.run(dir.path()).await.unwrap();
        assert_eq!(outcome.termination, CaptureTermination::Cancelled);
        assert_eq!(session.state(), SessionState::Finished);
        assert!(outcome.summary.downloaded >= 20);

        // Whatever was captured is merged and reported honestly.
        let report = outcome.merge.unwrap();
        assert_eq!(report.merged_segments + report.gaps.len() as u64,
            report.last_sequence - report.first_sequence + 1);
        assert!(report.artifact.exists());
    }

    #[tokio::test]
    async fn explicit_start_sequence_overrides_rewind() {
        let endpoint = Arc::new(FakeEndpoint::new(0..=40));
        let mut config = config();
        config.start_sequence = Some(35);
        let mut session = CaptureSession::with_components(
            Broadcast::default(),
            config,
            Arc::new(FakeLocator::live(40, SEG)),
            endpoint.clone() as Arc<dyn SegmentEndpoint>,
            Arc::new(FakeConcatenator::new(SEG)),
        );
        let dir = tempfile::tempdir().unwrap();

        let outcome = session.run(dir.path()).await.unwrap();
        assert_eq!(outcome.summary.floor, 35);
        assert_eq!(outcome.summary.downloaded, 6);
    }
}
