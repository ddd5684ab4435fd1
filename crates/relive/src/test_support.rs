//! Scripted fakes shared by component tests. No network, no ffmpeg.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::endpoint::{FetchOutcome, Probe, SegmentEndpoint};
use crate::error::{FetchError, MergeError, ResolutionError};
use crate::locator::{BroadcastLocator, StreamInfo};
use crate::merge::{Concatenator, MuxedArtifact};

/// Endpoint whose published segments form a contiguous sequence range, with
/// optional scripted transient failures per sequence.
pub(crate) struct FakeEndpoint {
    available: Mutex<RangeInclusive<u64>>,
    holes: Mutex<std::collections::HashSet<u64>>,
    transient_failures: Mutex<HashMap<u64, u32>>,
    pub probes: AtomicU64,
    pub fetches: AtomicU64,
    fetch_counts: Mutex<HashMap<u64, u64>>,
    /// When set, fires after this many successful fetches.
    cancel_after: Mutex<Option<(u64, CancellationToken)>>,
    successes: AtomicU64,
}

impl FakeEndpoint {
    pub fn new(available: RangeInclusive<u64>) -> Self {
        Self {
            available: Mutex::new(available),
            holes: Mutex::new(std::collections::HashSet::new()),
            transient_failures: Mutex::new(HashMap::new()),
            probes: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            fetch_counts: Mutex::new(HashMap::new()),
            cancel_after: Mutex::new(None),
            successes: AtomicU64::new(0),
        }
    }

    /// Inject `count` transient (HTTP 500) failures before `sequence`
    /// succeeds or definitively 404s.
    pub fn fail_transiently(&self, sequence: u64, count: u32) {
        self.transient_failures.lock().insert(sequence, count);
    }

    /// Make one sequence inside the available range definitively absent.
    pub fn punch_hole(&self, sequence: u64) {
        self.holes.lock().insert(sequence);
    }

    /// Extend the published range, simulating a broadcast that is still
    /// emitting new segments.
    pub fn publish_up_to(&self, sequence: u64) {
        let mut available = self.available.lock();
        *available = *available.start()..=sequence.max(*available.end());
    }

    pub fn cancel_after(&self, successes: u64, token: CancellationToken) {
        *self.cancel_after.lock() = Some((successes, token));
    }

    pub fn fetch_count(&self, sequence: u64) -> u64 {
        self.fetch_counts.lock().get(&sequence).copied().unwrap_or(0)
    }

    fn exists(&self, sequence: u64) -> bool {
        self.available.lock().contains(&sequence) && !self.holes.lock().contains(&sequence)
    }

    fn take_transient_failure(&self, sequence: u64) -> bool {
        let mut failures = self.transient_failures.lock();
        match failures.get_mut(&sequence) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl SegmentEndpoint for FakeEndpoint {
    async fn probe(&self, sequence: u64) -> Result<Probe, FetchError> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        if self.take_transient_failure(sequence) {
            return Err(FetchError::http_status(
                sequence,
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
        Ok(if self.exists(sequence) {
            Probe::Exists
        } else {
            Probe::Absent
        })
    }

    async fn fetch(&self, sequence: u64) -> Result<FetchOutcome, FetchError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        *self.fetch_counts.lock().entry(sequence).or_insert(0) += 1;
        if self.take_transient_failure(sequence) {
            return Err(FetchError::http_status(
                sequence,
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
        if !self.exists(sequence) {
            return Ok(FetchOutcome::NotFound);
        }
        let done = self.successes.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some((after, token)) = self.cancel_after.lock().as_ref()
            && done >= *after
        {
            token.cancel();
        }
        Ok(FetchOutcome::Payload(Bytes::from(format!(
            "segment-{sequence}"
        ))))
    }
}

pub(crate) struct FakeLocator {
    pub info: Result<StreamInfo, fn(&str) -> ResolutionError>,
}

impl FakeLocator {
    pub fn live(head_sequence: u64, segment_duration: Duration) -> Self {
        Self {
            info: Ok(StreamInfo {
                segment_base: url::Url::parse("https://cdn.test/live/").unwrap(),
                head_sequence,
                segment_duration,
            }),
        }
    }

    pub fn offline() -> Self {
        Self {
            info: Err(|reference| ResolutionError::NotLive {
                reference: reference.to_owned(),
            }),
        }
    }
}

#[async_trait]
impl BroadcastLocator for FakeLocator {
    async fn resolve(&self, reference: &str) -> Result<StreamInfo, ResolutionError> {
        match &self.info {
            Ok(info) => Ok(info.clone()),
            Err(make) => Err(make(reference)),
        }
    }
}

/// Concatenator that records its inputs and reports a synthetic duration of
/// `segment_duration * inputs.len()` unless overridden.
pub(crate) struct FakeConcatenator {
    pub segment_duration: Duration,
    pub duration_override: Option<Duration>,
    pub inputs_seen: Mutex<Vec<PathBuf>>,
}

impl FakeConcatenator {
    pub fn new(segment_duration: Duration) -> Self {
        Self {
            segment_duration,
            duration_override: None,
            inputs_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn reporting(segment_duration: Duration, reported: Duration) -> Self {
        Self {
            duration_override: Some(reported),
            ..Self::new(segment_duration)
        }
    }
}

#[async_trait]
impl Concatenator for FakeConcatenator {
    async fn concatenate(
        &self,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<MuxedArtifact, MergeError> {
        *self.inputs_seen.lock() = inputs.to_vec();
        std::fs::write(output, b"merged")?;
        let duration = self
            .duration_override
            .unwrap_or(self.segment_duration * inputs.len() as u32);
        Ok(MuxedArtifact {
            path: output.to_path_buf(),
            duration: Some(duration),
        })
    }
}
