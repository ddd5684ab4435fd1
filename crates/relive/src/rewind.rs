//! Rewind resolver: finds the oldest segment still retrievable behind the
//! live edge, bounded by the rewind window.
//!
//! CDN retention is a contiguous suffix of the sequence space: once a
//! sequence has expired, everything older has too. The resolver exploits
//! this by stepping back exponentially over existence probes until it finds
//! the first absent sequence, then bisecting the boundary.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::{Probe, SegmentEndpoint};
use crate::error::{FetchError, RewindError};
use crate::retry::RetryPolicy;

/// One existence probe with the same transient-failure handling as segment
/// fetches: retryable errors back off and retry up to the attempt ceiling,
/// only an exhausted ceiling or a non-retryable error is fatal.
async fn probe_with_retry(
    endpoint: &dyn SegmentEndpoint,
    sequence: u64,
    retry: &RetryPolicy,
    max_attempts: u32,
    token: &CancellationToken,
) -> Result<Probe, RewindError> {
    let mut attempts: u32 = 0;
    loop {
        match endpoint.probe(sequence).await {
            Ok(probe) => return Ok(probe),
            Err(err) if err.is_retryable() => {
                attempts += 1;
                if attempts >= max_attempts.max(1) {
                    warn!(sequence, attempts, error = %err, "Probe retries exhausted");
                    return Err(RewindError::Probe { source: err });
                }
                debug!(
                    sequence,
                    attempt = attempts,
                    max = max_attempts,
                    error = %err,
                    "Transient probe failure; backing off"
                );
                if !retry.backoff(attempts - 1, token).await {
                    return Err(RewindError::Probe {
                        source: FetchError::Cancelled,
                    });
                }
            }
            Err(err) => return Err(RewindError::Probe { source: err }),
        }
    }
}

/// Resolve the capture floor.
///
/// `window_segments` bounds how far behind `head` probing may go. An
/// explicit `start_override` short-circuits probing when it is retrievable;
/// an unretrievable override falls back to probing with a warning.
pub async fn resolve_floor(
    endpoint: &dyn SegmentEndpoint,
    head: u64,
    window_segments: u64,
    start_override: Option<u64>,
    retry: &RetryPolicy,
    max_attempts: u32,
    token: &CancellationToken,
) -> Result<u64, RewindError> {
    if let Some(start) = start_override {
        if start >= head {
            warn!(start, head, "Start override is at or past the head; capturing from the head");
            return Ok(head);
        }
        if probe_with_retry(endpoint, start, retry, max_attempts, token).await? == Probe::Exists {
            info!(floor = start, "Using explicit start sequence");
            return Ok(start);
        }
        warn!(start, "Explicit start sequence is not retrievable; probing instead");
    }

    let target = head.saturating_sub(window_segments);
    if window_segments == 0 || head == 0 {
        return Ok(head);
    }

    // Exponential step-back. `oldest_exists` tracks the deepest confirmed
    // sequence; the first absent probe brackets the retention boundary.
    let mut oldest_exists: Option<u64> = None;
    let mut newest_absent: Option<u64> = None;
    let mut step: u64 = 1;
    loop {
        let candidate = head.saturating_sub(step).max(target);
        match probe_with_retry(endpoint, candidate, retry, max_attempts, token).await? {
            Probe::Exists => {
                debug!(candidate, "Rewind probe: exists");
                oldest_exists = Some(candidate);
                if candidate == target {
                    // The whole window is retrievable.
                    info!(floor = target, head, "Rewind window fully available");
                    return Ok(target);
                }
            }
            Probe::Absent => {
                debug!(candidate, "Rewind probe: absent");
                newest_absent = Some(candidate);
                break;
            }
        }
        step = step.saturating_mul(2);
    }

    let Some(mut exists_at) = oldest_exists else {
        // Not even head - 1 is retrievable: no rewind within the window.
        return Err(RewindError::Exhausted {
            head,
            window_segments,
        });
    };
    let mut absent_at = newest_absent.expect("loop exits via Absent when oldest_exists is set");

    // Bisect (absent_at, exists_at) for the oldest retrievable sequence.
    while exists_at - absent_at > 1 {
        let mid = absent_at + (exists_at - absent_at) / 2;
        match probe_with_retry(endpoint, mid, retry, max_attempts, token).await? {
            Probe::Exists => exists_at = mid,
            Probe::Absent => absent_at = mid,
        }
    }

    info!(floor = exists_at, head, "Resolved rewind floor");
    Ok(exists_at)
}
