//! Segment manifest: authoritative, session-scoped record of every attempted
//! segment's download state.
//!
//! The fetcher is the only writer; the end-of-stream detector and the merge
//! engine read concurrently through snapshot methods. Every mutation is a
//! single atomic state transition for one sequence, and terminal states
//! (Downloaded, Missing) are frozen.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// On-disk summary file name inside the output directory.
pub const SUMMARY_FILE: &str = "manifest.json";

const SEGMENT_EXT: &str = "ts";

/// Zero-padded on-disk name for a segment, e.g. `0000123.ts`.
pub fn segment_file_name(sequence: u64) -> String {
    format!("{sequence:07}.{SEGMENT_EXT}")
}

/// Parse a sequence number back out of a segment file name produced by
/// [`segment_file_name`]. Returns `None` for anything else (the summary
/// file, temp files, foreign files).
pub fn sequence_from_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(&format!(".{SEGMENT_EXT}"))?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Per-segment download state machine:
/// Pending -> Downloading -> Retrying(n) -> {Downloaded | Missing}.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    Downloading,
    Retrying(u32),
    Downloaded(PathBuf),
    Missing,
}

impl SegmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Downloaded(_) | Self::Missing)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Downloading => "Downloading",
            Self::Retrying(_) => "Retrying",
            Self::Downloaded(_) => "Downloaded",
            Self::Missing => "Missing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub state: SegmentState,
    /// Fetch attempts consumed so far (first try included).
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct ManifestInner {
    floor: u64,
    records: BTreeMap<u64, SegmentRecord>,
}

/// Read-only snapshot of the manifest's aggregate state, also the shape of
/// the on-disk summary file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub floor: u64,
    /// Highest attempted sequence, `None` before the first claim.
    pub head: Option<u64>,
    pub downloaded: u64,
    pub missing: u64,
    /// Every sequence recorded as Missing, in ascending order.
    pub gaps: Vec<u64>,
}

impl ManifestSummary {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }
}

pub struct Manifest {
    inner: Mutex<ManifestInner>,
}

impl Manifest {
    pub fn new(floor: u64) -> Self {
        Self {
            inner: Mutex::new(ManifestInner {
                floor,
                records: BTreeMap::new(),
            }),
        }
    }

    pub fn floor(&self) -> u64 {
        self.inner.lock().floor
    }

    /// Register a freshly claimed sequence as Pending. Each sequence may be
    /// claimed exactly once; the cursor guarantees this in production.
    pub fn claim(&self, sequence: u64) -> Result<(), ManifestError> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(&sequence) {
            return Err(ManifestError::AlreadyTracked { sequence });
        }
        inner.records.insert(
            sequence,
            SegmentRecord {
                state: SegmentState::Pending,
                attempts: 0,
            },
        );
        Ok(())
    }

    /// The single mutation entry point: move one sequence to a new state.
    ///
    /// Terminal states are frozen; any attempt to leave one is rejected so a
    /// sequence can never regress once Downloaded or Missing.
    pub fn transition(&self, sequence: u64, next: SegmentState) -> Result<(), ManifestError> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(&sequence)
            .ok_or(ManifestError::UnknownSequence { sequence })?;

        if record.state.is_terminal() {
            return Err(ManifestError::IllegalTransition {
                sequence,
                from: record.state.name(),
                to: next.name(),
            });
        }
        if let SegmentState::Retrying(attempt) = next {
            record.attempts = attempt;
        }
        record.state = next;
        Ok(())
    }

    /// Drop a claim that never reached a terminal state (cancelled mid-flight
    /// or claimed past the end of the broadcast). Terminal records stay.
    pub fn retract(&self, sequence: u64) -> Result<(), ManifestError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.get(&sequence) else {
            return Err(ManifestError::UnknownSequence { sequence });
        };
        if record.state.is_terminal() {
            return Err(ManifestError::IllegalTransition {
                sequence,
                from: record.state.name(),
                to: "retracted",
            });
        }
        inner.records.remove(&sequence);
        Ok(())
    }

    /// Drop every non-terminal claim above `end`. Used once the broadcast is
    /// declared ended: sequences past the last published one never existed.
    pub fn retract_beyond(&self, end: u64) {
        let mut inner = self.inner.lock();
        inner
            .records
            .retain(|&seq, record| seq <= end || record.state.is_terminal());
    }

    /// Settle leftover non-terminal entries after the workers have quiesced
    /// on cancellation: entries above the highest terminal sequence are
    /// dropped (never completed, nothing on disk), entries below it become
    /// Missing so the gap is recorded instead of silently hidden.
    pub fn finalize_interrupted(&self) {
        let mut inner = self.inner.lock();
        let highest_terminal = inner
            .records
            .iter()
            .rev()
            .find(|(_, r)| r.state.is_terminal())
            .map(|(&seq, _)| seq);

        let Some(highest_terminal) = highest_terminal else {
            inner.records.clear();
            return;
        };

        inner.records.retain(|&seq, record| {
            if record.state.is_terminal() {
                return true;
            }
            if seq > highest_terminal {
                return false;
            }
            record.state = SegmentState::Missing;
            true
        });
    }

    pub fn state_of(&self, sequence: u64) -> Option<SegmentState> {
        self.inner
            .lock()
            .records
            .get(&sequence)
            .map(|r| r.state.clone())
    }

    pub fn attempts_of(&self, sequence: u64) -> Option<u32> {
        self.inner.lock().records.get(&sequence).map(|r| r.attempts)
    }

    /// Ordered `(sequence, path)` list of every Downloaded segment.
    pub fn downloaded_paths(&self) -> Vec<(u64, PathBuf)> {
        self.inner
            .lock()
            .records
            .iter()
            .filter_map(|(&seq, record)| match &record.state {
                SegmentState::Downloaded(path) => Some((seq, path.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> ManifestSummary {
        let inner = self.inner.lock();
        let mut downloaded = 0;
        let mut gaps = Vec::new();
        for (&seq, record) in &inner.records {
            match record.state {
                SegmentState::Downloaded(_) => downloaded += 1,
                SegmentState::Missing => gaps.push(seq),
                _ => {}
            }
        }
        ManifestSummary {
            floor: inner.floor,
            head: inner.records.keys().next_back().copied(),
            downloaded,
            missing: gaps.len() as u64,
            gaps,
        }
    }

    /// Write the summary file atomically (write-to-temp, rename-on-complete)
    /// so a crash mid-write never leaves a truncated summary behind.
    pub fn persist(&self, dir: &Path) -> Result<(), ManifestError> {
        let summary = self.summary();
        let payload = serde_json::to_vec_pretty(&summary)?;
        let final_path = dir.join(SUMMARY_FILE);
        let tmp_path = dir.join(format!("{SUMMARY_FILE}.tmp"));
        std::fs::write(&tmp_path, payload)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Load a previously persisted summary, for merge-only resumption.
    pub fn load_summary(dir: &Path) -> Result<ManifestSummary, ManifestError> {
        let payload = std::fs::read(dir.join(SUMMARY_FILE))?;
        Ok(serde_json::from_slice(&payload)?)
    }
}
