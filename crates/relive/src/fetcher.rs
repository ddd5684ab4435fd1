//! Segment fetcher: a bounded pool of workers driving one shared monotonic
//! cursor from the rewind floor up through the live edge.
//!
//! Cursor assignment is an atomic fetch-and-increment, so every sequence is
//! claimed by exactly one worker and never regresses. Each worker holds at
//! most one claim at a time, which also bounds how far the pool can run
//! ahead of the live edge.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::CaptureConfig;
use crate::edge::EdgeTracker;
use crate::endpoint::{FetchOutcome, SegmentEndpoint};
use crate::error::FetchError;
use crate::manifest::{Manifest, SegmentState, segment_file_name};
use crate::retry::RetryPolicy;

/// How a capture run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTermination {
    /// The broadcast ended: end-of-stream was declared at the edge.
    Completed,
    /// The caller cancelled; whatever was captured stays on disk.
    Cancelled,
}

/// Outcome of one worker's handling of one claimed sequence.
enum SegmentFate {
    /// The sequence reached a terminal manifest state.
    Settled,
    /// Cancellation fired before the sequence settled; the claim was
    /// retracted at a safe boundary.
    Cancelled,
    /// The broadcast was declared ended; the claim was retracted.
    Ended,
}

pub struct SegmentFetcher {
    endpoint: Arc<dyn SegmentEndpoint>,
    manifest: Arc<Manifest>,
    edge: Arc<EdgeTracker>,
    token: CancellationToken,
    output_dir: PathBuf,
    max_concurrency: usize,
    max_attempts: u32,
    retry: RetryPolicy,
    /// Poll interval for a claim waiting at the live edge; normally the
    /// per-segment duration.
    edge_poll: Duration,
    cursor: AtomicU64,
}

impl SegmentFetcher {
    pub fn new(
        endpoint: Arc<dyn SegmentEndpoint>,
        manifest: Arc<Manifest>,
        edge: Arc<EdgeTracker>,
        token: CancellationToken,
        output_dir: PathBuf,
        config: &CaptureConfig,
        edge_poll: Duration,
    ) -> Self {
        let floor = manifest.floor();
        Self {
            endpoint,
            manifest,
            edge,
            token,
            output_dir,
            max_concurrency: config.max_concurrency.max(1),
            max_attempts: config.max_attempts.max(1),
            retry: config.retry.clone(),
            edge_poll,
            cursor: AtomicU64::new(floor),
        }
    }

    /// Run the worker pool to quiescence and settle the manifest.
    pub async fn run(self: Arc<Self>) -> CaptureTermination {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.max_concurrency {
            let fetcher = Arc::clone(&self);
            workers.spawn(async move { fetcher.worker(worker_id).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Fetch worker panicked");
            }
        }

        // All workers have quiesced; no concurrent manifest access from here.
        let termination = if let Some(end) = self.edge.ended_at() {
            self.manifest.retract_beyond(end);
            info!(end, "Capture completed at end of stream");
            CaptureTermination::Completed
        } else {
            self.manifest.finalize_interrupted();
            info!("Capture cancelled");
            CaptureTermination::Cancelled
        };
        if let Err(e) = self.manifest.persist(&self.output_dir) {
            warn!(error = %e, "Failed to persist manifest summary");
        }
        termination
    }

    async fn worker(&self, worker_id: usize) {
        debug!(worker_id, "Fetch worker started");
        loop {
            if self.token.is_cancelled() {
                break;
            }
            let sequence = self.cursor.fetch_add(1, Ordering::SeqCst);
            if let Some(end) = self.edge.ended_at()
                && sequence > end
            {
                break;
            }
            match self.capture_segment(sequence).await {
                SegmentFate::Settled => {
                    if let Err(e) = self.manifest.persist(&self.output_dir) {
                        warn!(error = %e, "Failed to persist manifest summary");
                    }
                }
                SegmentFate::Cancelled | SegmentFate::Ended => break,
            }
        }
        debug!(worker_id, "Fetch worker stopped");
    }

    /// Drive one sequence to a terminal state, or retract its claim when
    /// cancellation or end-of-stream interrupts it.
    #[instrument(skip(self), level = "debug")]
    async fn capture_segment(&self, sequence: u64) -> SegmentFate {
        if let Err(e) = self.manifest.claim(sequence) {
            // The cursor hands out each sequence exactly once.
            error!(sequence, error = %e, "Failed to claim sequence");
            return SegmentFate::Settled;
        }

        let mut attempts: u32 = 0;
        loop {
            if self.token.is_cancelled() {
                let _ = self.manifest.retract(sequence);
                return SegmentFate::Cancelled;
            }
            self.set_state(sequence, SegmentState::Downloading);

            match self.try_download(sequence).await {
                Ok(Some(path)) => {
                    self.set_state(sequence, SegmentState::Downloaded(path));
                    self.edge.record_published(sequence);
                    debug!(sequence, "Segment downloaded");
                    return SegmentFate::Settled;
                }
                Ok(None) if self.edge.is_at_edge(sequence) => {
                    // Either the broadcast ended or the segment has not been
                    // published yet. Edge polling does not consume the retry
                    // budget.
                    if self.edge.record_edge_miss(sequence) {
                        info!(sequence, "End of stream declared at the live edge");
                        let _ = self.manifest.retract(sequence);
                        return SegmentFate::Ended;
                    }
                    if let Some(end) = self.edge.ended_at()
                        && sequence > end
                    {
                        let _ = self.manifest.retract(sequence);
                        return SegmentFate::Ended;
                    }
                    self.set_state(sequence, SegmentState::Pending);
                    tokio::select! {
                        _ = self.token.cancelled() => {
                            let _ = self.manifest.retract(sequence);
                            return SegmentFate::Cancelled;
                        }
                        _ = tokio::time::sleep(self.edge_poll) => {}
                    }
                }
                Ok(None) => {
                    // Behind the edge: the content expired upstream. A gap,
                    // not a stream-end candidate.
                    warn!(sequence, "Segment expired upstream; recording gap");
                    self.set_state(sequence, SegmentState::Missing);
                    return SegmentFate::Settled;
                }
                Err(FetchError::Cancelled) => {
                    let _ = self.manifest.retract(sequence);
                    return SegmentFate::Cancelled;
                }
                Err(err) if err.is_retryable() => {
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        warn!(
                            sequence,
                            attempts,
                            error = %err,
                            "Retry ceiling reached; recording gap"
                        );
                        self.set_state(sequence, SegmentState::Missing);
                        return SegmentFate::Settled;
                    }
                    debug!(
                        sequence,
                        attempt = attempts,
                        max = self.max_attempts,
                        error = %err,
                        "Transient fetch failure; backing off"
                    );
                    self.set_state(sequence, SegmentState::Retrying(attempts));
                    if !self.retry.backoff(attempts - 1, &self.token).await {
                        let _ = self.manifest.retract(sequence);
                        return SegmentFate::Cancelled;
                    }
                }
                Err(err) => {
                    warn!(sequence, error = %err, "Unrecoverable fetch failure; recording gap");
                    self.set_state(sequence, SegmentState::Missing);
                    return SegmentFate::Settled;
                }
            }
        }
    }

    async fn try_download(&self, sequence: u64) -> Result<Option<PathBuf>, FetchError> {
        match self.endpoint.fetch(sequence).await? {
            FetchOutcome::NotFound => Ok(None),
            FetchOutcome::Payload(bytes) => {
                let path = self.write_segment(sequence, &bytes).await?;
                Ok(Some(path))
            }
        }
    }

    /// Atomic write: write-to-temp then rename-on-complete, so a crash or
    /// cancellation never leaves a readable-but-incomplete segment file.
    async fn write_segment(&self, sequence: u64, payload: &[u8]) -> Result<PathBuf, FetchError> {
        let final_path = self.output_dir.join(segment_file_name(sequence));
        let tmp_path = final_path.with_extension("ts.part");
        tokio::fs::write(&tmp_path, payload).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(final_path)
    }

    fn set_state(&self, sequence: u64, state: SegmentState) {
        if let Err(e) = self.manifest.transition(sequence, state) {
            error!(sequence, error = %e, "Manifest transition rejected");
        }
    }
}
