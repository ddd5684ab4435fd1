//! End-of-stream detection at the advancing edge of the sequence.
//!
//! A not-found at the live edge is ambiguous: either the broadcast ended or
//! the next segment simply has not been published yet. The tracker declares
//! the broadcast ended only after a configured number of consecutive poll
//! rounds missing the boundary sequence, and any successful fetch resets
//! the count. Misses from workers parked further past the boundary are the
//! same poll round observed again, never independent evidence.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const LIVE: u64 = u64::MAX;

#[derive(Debug)]
pub struct EdgeTracker {
    /// Highest sequence number confirmed published.
    head_estimate: AtomicU64,
    /// Consecutive not-found results at or past the head estimate.
    consecutive_misses: AtomicU32,
    miss_threshold: u32,
    /// `LIVE` while the broadcast is live; once latched, the sequence number
    /// of the last published segment.
    ended_at: AtomicU64,
}

impl EdgeTracker {
    pub fn new(initial_head: u64, miss_threshold: u32) -> Self {
        Self {
            head_estimate: AtomicU64::new(initial_head),
            consecutive_misses: AtomicU32::new(0),
            miss_threshold: miss_threshold.max(1),
            ended_at: AtomicU64::new(LIVE),
        }
    }

    pub fn head_estimate(&self) -> u64 {
        self.head_estimate.load(Ordering::Acquire)
    }

    /// Whether a not-found for `sequence` should be treated as an edge race
    /// rather than expired content.
    pub fn is_at_edge(&self, sequence: u64) -> bool {
        sequence >= self.head_estimate()
    }

    /// Record that `sequence` was observed to exist. Advances the head
    /// estimate and resets the consecutive-miss count.
    pub fn record_published(&self, sequence: u64) {
        self.head_estimate.fetch_max(sequence, Ordering::AcqRel);
        self.consecutive_misses.store(0, Ordering::Release);
    }

    /// Record a not-found at the edge. Returns `true` when this miss crossed
    /// the threshold and the broadcast is now considered ended.
    ///
    /// Only a miss of the boundary sequence advances the counter. A full
    /// pool parked at `head+1..head+N` misses N times within one poll
    /// round; counting them all would let a single burst cross the
    /// threshold and cut off a still-publishing broadcast.
    pub fn record_edge_miss(&self, sequence: u64) -> bool {
        let head = self.head_estimate();
        // `head + 1` is the boundary once `head` is confirmed; `head`
        // itself still counts while the locator's initial estimate is
        // unconfirmed.
        if sequence > head.saturating_add(1) {
            return false;
        }
        let misses = self.consecutive_misses.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(sequence, misses, threshold = self.miss_threshold, "Edge miss");
        if misses >= self.miss_threshold {
            self.ended_at.fetch_min(head, Ordering::AcqRel);
            return true;
        }
        false
    }

    /// The last published sequence number once the broadcast has been
    /// declared ended, `None` while it is still considered live.
    pub fn ended_at(&self) -> Option<u64> {
        match self.ended_at.load(Ordering::Acquire) {
            LIVE => None,
            seq => Some(seq),
        }
    }
}
