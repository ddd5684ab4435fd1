//! Merge engine: post-capture concatenation of downloaded segments into one
//! artifact, through an external multiplexing capability.
//!
//! Runs single-threaded after the fetch workers have quiesced, against a
//! read-only snapshot of the manifest. A gapped range still produces an
//! artifact; the gaps are reported, never hidden.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::MergeError;
use crate::manifest::{Manifest, ManifestSummary, sequence_from_file_name};

/// What the external multiplexer produced.
#[derive(Debug)]
pub struct MuxedArtifact {
    pub path: PathBuf,
    /// Container-reported duration, when the muxer can determine it.
    pub duration: Option<Duration>,
}

/// Narrow capability interface over the external multiplexing process, so
/// the engine can be tested against a fake implementation.
#[async_trait]
pub trait Concatenator: Send + Sync {
    /// Losslessly concatenate `inputs` (ordered, duplicate-free, absolute
    /// paths) into `output`.
    async fn concatenate(
        &self,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<MuxedArtifact, MergeError>;
}

/// Duration validation result for the merged artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum IntegrityVerdict {
    Passed,
    /// The artifact exists but its reported duration deviates beyond the
    /// tolerance from segment count x per-segment duration.
    DurationMismatch {
        expected_secs: f64,
        actual_secs: f64,
        tolerance_secs: f64,
    },
    /// The muxer could not report a duration; nothing to validate against.
    Unverified,
}

#[derive(Debug, Serialize)]
pub struct MergeReport {
    pub artifact: PathBuf,
    pub merged_segments: u64,
    /// First and last merged sequence numbers.
    pub first_sequence: u64,
    pub last_sequence: u64,
    /// Sequences missing from the merged range, ascending. Empty means the
    /// recording is contiguous.
    pub gaps: Vec<u64>,
    pub integrity: IntegrityVerdict,
}

impl MergeReport {
    pub fn is_contiguous(&self) -> bool {
        self.gaps.is_empty()
    }

    /// The integrity mismatch as an error value, for callers that script on
    /// distinct outcomes. The artifact was still produced.
    pub fn integrity_error(&self) -> Option<MergeError> {
        match &self.integrity {
            IntegrityVerdict::DurationMismatch {
                expected_secs,
                actual_secs,
                tolerance_secs,
            } => Some(MergeError::Integrity {
                expected_secs: *expected_secs,
                actual_secs: *actual_secs,
                tolerance_secs: *tolerance_secs,
            }),
            _ => None,
        }
    }
}

/// Ordered, duplicate-free list of downloaded segments plus the holes in
/// their range. Borrowed from the manifest, never mutates capture state.
#[derive(Debug)]
pub struct MergePlan {
    /// `(sequence, path)`, strictly ascending by sequence.
    entries: Vec<(u64, PathBuf)>,
    gaps: Vec<u64>,
}

impl MergePlan {
    /// Snapshot a manifest after capture.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let entries = manifest.downloaded_paths();
        let gaps = manifest.summary().gaps;
        Self { entries, gaps }
    }

    /// Rebuild a plan by scanning a capture directory for segment files.
    /// Supports merging after a crash, independent of any live session; the
    /// summary file is not required. A bare scan can only see holes between
    /// existing files, so gaps at the edges of the captured range are
    /// invisible here.
    pub fn from_directory(dir: &Path) -> Result<Self, MergeError> {
        let entries = scan_segment_files(dir)?;
        let mut gaps = Vec::new();
        for pair in entries.windows(2) {
            let (prev, next) = (pair[0].0, pair[1].0);
            gaps.extend(prev + 1..next);
        }
        Ok(Self { entries, gaps })
    }

    /// Rebuild a plan from a capture directory, seeding the gap list from
    /// the persisted summary. The summary knows about gaps a directory scan
    /// cannot see: a Missing segment at the floor or past the last file on
    /// disk. Files present on disk always win over a stale gap entry.
    pub fn from_directory_with_summary(
        dir: &Path,
        summary: &ManifestSummary,
    ) -> Result<Self, MergeError> {
        let entries = scan_segment_files(dir)?;
        let present: HashSet<u64> = entries.iter().map(|(seq, _)| *seq).collect();

        let mut gaps: BTreeSet<u64> = summary.gaps.iter().copied().collect();
        for pair in entries.windows(2) {
            let (prev, next) = (pair[0].0, pair[1].0);
            gaps.extend(prev + 1..next);
        }
        if let Some((first, _)) = entries.first() {
            // Recorded range starts at the floor even when the first
            // segments never made it to disk.
            gaps.extend(summary.floor..*first);
        }
        let gaps: Vec<u64> = gaps.into_iter().filter(|seq| !present.contains(seq)).collect();
        Ok(Self { entries, gaps })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn segment_count(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// Ordered `(sequence, path)` list of the segment files present in `dir`.
fn scan_segment_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, MergeError> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(sequence) = sequence_from_file_name(name) {
            entries.push((sequence, entry.path()));
        }
    }
    entries.sort_unstable_by_key(|(seq, _)| *seq);
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub segment_duration: Duration,
    pub duration_tolerance: Duration,
    /// Remove the per-segment files once the artifact validates.
    pub remove_segments: bool,
}

/// Concatenate the plan into `output` and validate the result.
pub async fn run(
    plan: &MergePlan,
    concatenator: &dyn Concatenator,
    settings: &MergeSettings,
    output: &Path,
) -> Result<MergeReport, MergeError> {
    if plan.is_empty() {
        return Err(MergeError::Empty {
            dir: output.parent().unwrap_or(Path::new(".")).to_path_buf(),
        });
    }

    let inputs: Vec<PathBuf> = plan
        .entries
        .iter()
        .map(|(_, path)| std::path::absolute(path).map_err(MergeError::from))
        .collect::<Result<_, _>>()?;

    if !plan.gaps.is_empty() {
        warn!(
            gaps = plan.gaps.len(),
            first_gap = ?plan.gaps.first(),
            "Merging a non-contiguous range; the recording will have jumps"
        );
    }

    let artifact = concatenator.concatenate(&inputs, output).await?;

    let expected = settings.segment_duration * plan.segment_count() as u32;
    let integrity = match artifact.duration {
        None => IntegrityVerdict::Unverified,
        Some(actual) => {
            let deviation = if actual > expected {
                actual - expected
            } else {
                expected - actual
            };
            if deviation <= settings.duration_tolerance {
                IntegrityVerdict::Passed
            } else {
                IntegrityVerdict::DurationMismatch {
                    expected_secs: expected.as_secs_f64(),
                    actual_secs: actual.as_secs_f64(),
                    tolerance_secs: settings.duration_tolerance.as_secs_f64(),
                }
            }
        }
    };

    if settings.remove_segments {
        if matches!(integrity, IntegrityVerdict::DurationMismatch { .. }) {
            warn!("Keeping segment files: merged artifact failed validation");
        } else {
            for (_, path) in &plan.entries {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove segment file");
                }
            }
        }
    }

    let report = MergeReport {
        artifact: artifact.path,
        merged_segments: plan.segment_count(),
        first_sequence: plan.entries.first().map(|(s, _)| *s).unwrap_or(0),
        last_sequence: plan.entries.last().map(|(s, _)| *s).unwrap_or(0),
        gaps: plan.gaps.clone(),
        integrity,
    };
    info!(
        artifact = %report.artifact.display(),
        segments = report.merged_segments,
        gaps = report.gaps.len(),
        "Merge finished"
    );
    Ok(report)
}

/// Merge previously captured segments straight from a directory, without a
/// live session. Used by the standalone `merge` entry point. When the
/// capture's summary file is present its recorded gap list seeds the plan;
/// otherwise the plan falls back to what the directory scan can infer.
pub async fn merge_directory(
    dir: &Path,
    concatenator: &dyn Concatenator,
    settings: &MergeSettings,
    output: &Path,
) -> Result<MergeReport, MergeError> {
    let plan = match Manifest::load_summary(dir) {
        Ok(summary) => MergePlan::from_directory_with_summary(dir, &summary)?,
        Err(_) => MergePlan::from_directory(dir)?,
    };
    if plan.is_empty() {
        return Err(MergeError::Empty {
            dir: dir.to_path_buf(),
        });
    }
    run(&plan, concatenator, settings, output).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{SegmentState, segment_file_name};
    use crate::test_support::FakeConcatenator;

    const SEG: Duration = Duration::from_secs(2);

    fn settings() -> MergeSettings {
        MergeSettings {
            segment_duration: SEG,
            duration_tolerance: Duration::from_secs(5),
            remove_segments: false,
        }
    }

    /// Build a manifest with Downloaded entries for `sequences`, backed by
    /// real files in `dir`.
    fn downloaded_manifest(dir: &Path, floor: u64, sequences: &[u64]) -> Manifest {
        let manifest = Manifest::new(floor);
        for &seq in sequences {
            let path = dir.join(segment_file_name(seq));
            std::fs::write(&path, b"x").unwrap();
            manifest.claim(seq).unwrap();
            manifest
                .transition(seq, SegmentState::Downloaded(path))
                .unwrap();
        }
        manifest
    }

    #[tokio::test]
    async fn contiguous_range_merges_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let sequences: Vec<u64> = (0..=500).collect();
        let manifest = downloaded_manifest(dir.path(), 0, &sequences);

        let concatenator = FakeConcatenator::new(SEG);
        let plan = MergePlan::from_manifest(&manifest);
        let output = dir.path().join("recording.ts");
        let report = run(&plan, &concatenator, &settings(), &output).await.unwrap();

        assert!(report.is_contiguous());
        assert_eq!(report.merged_segments, 501);
        assert_eq!((report.first_sequence, report.last_sequence), (0, 500));
        assert_eq!(report.integrity, IntegrityVerdict::Passed);
        assert!(report.integrity_error().is_none());
        assert!(output.exists());

        // The muxer saw every input exactly once, in order.
        let inputs = concatenator.inputs_seen.lock();
        assert_eq!(inputs.len(), 501);
        assert!(inputs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn missing_sequence_is_reported_but_still_merged() {
        let dir = tempfile::tempdir().unwrap();
        let sequences: Vec<u64> = (0..=500).filter(|&s| s != 250).collect();
        let manifest = downloaded_manifest(dir.path(), 0, &sequences);
        manifest.claim(250).unwrap();
        manifest.transition(250, SegmentState::Missing).unwrap();

        let concatenator = FakeConcatenator::new(SEG);
        let plan = MergePlan::from_manifest(&manifest);
        let output = dir.path().join("recording.ts");
        let report = run(&plan, &concatenator, &settings(), &output).await.unwrap();

        assert!(!report.is_contiguous());
        assert_eq!(report.gaps, vec![250]);
        assert_eq!(report.merged_segments, 500);
        assert!(output.exists());
    }

    #[tokio::test]
    async fn duration_mismatch_is_reported_not_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let sequences: Vec<u64> = (0..10).collect();
        let manifest = downloaded_manifest(dir.path(), 0, &sequences);

        // Muxer reports 3s for what should be 20s of content.
        let concatenator = FakeConcatenator::reporting(SEG, Duration::from_secs(3));
        let plan = MergePlan::from_manifest(&manifest);
        let output = dir.path().join("recording.ts");
        let report = run(&plan, &concatenator, &settings(), &output).await.unwrap();

        assert!(matches!(
            report.integrity,
            IntegrityVerdict::DurationMismatch { .. }
        ));
        assert!(matches!(
            report.integrity_error(),
            Some(MergeError::Integrity { .. })
        ));
        // The artifact is still there.
        assert!(output.exists());
    }

    #[tokio::test]
    async fn truncated_capture_merges_from_directory_alone() {
        // A cancelled session left segments 0..=299 and no summary file.
        let dir = tempfile::tempdir().unwrap();
        for seq in 0..300u64 {
            std::fs::write(dir.path().join(segment_file_name(seq)), b"x").unwrap();
        }

        let concatenator = FakeConcatenator::new(SEG);
        let output = dir.path().join("recording.ts");
        let report = merge_directory(dir.path(), &concatenator, &settings(), &output)
            .await
            .unwrap();

        assert_eq!((report.first_sequence, report.last_sequence), (0, 299));
        assert!(report.is_contiguous());
        assert_eq!(report.integrity, IntegrityVerdict::Passed);
    }

    #[tokio::test]
    async fn summary_recovers_gaps_a_directory_scan_cannot_see() {
        let dir = tempfile::tempdir().unwrap();
        // Segment 0 went Missing during capture; 1..=10 made it to disk.
        let manifest = Manifest::new(0);
        manifest.claim(0).unwrap();
        manifest.transition(0, SegmentState::Missing).unwrap();
        for seq in 1..=10u64 {
            let path = dir.path().join(segment_file_name(seq));
            std::fs::write(&path, b"x").unwrap();
            manifest.claim(seq).unwrap();
            manifest
                .transition(seq, SegmentState::Downloaded(path))
                .unwrap();
        }
        manifest.persist(dir.path()).unwrap();

        let concatenator = FakeConcatenator::new(SEG);
        let output = dir.path().join("recording.ts");
        let report = merge_directory(dir.path(), &concatenator, &settings(), &output)
            .await
            .unwrap();

        // The scan alone would call [1..10] contiguous; the summary knows
        // the recorded range starts at 0 and that 0 is missing.
        assert!(!report.is_contiguous());
        assert_eq!(report.gaps, vec![0]);
        assert_eq!((report.first_sequence, report.last_sequence), (1, 10));
        assert_eq!(report.merged_segments, 10);
    }

    #[tokio::test]
    async fn directory_scan_detects_holes_and_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for seq in [10u64, 11, 14] {
            std::fs::write(dir.path().join(segment_file_name(seq)), b"x").unwrap();
        }
        std::fs::write(dir.path().join("manifest.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("0000012.ts.part"), b"x").unwrap();

        let plan = MergePlan::from_directory(dir.path()).unwrap();
        assert_eq!(plan.segment_count(), 3);
        assert_eq!(plan.gaps, vec![12, 13]);
    }

    #[tokio::test]
    async fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let concatenator = FakeConcatenator::new(SEG);
        let output = dir.path().join("recording.ts");
        let err = merge_directory(dir.path(), &concatenator, &settings(), &output)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Empty { .. }));
    }

    #[tokio::test]
    async fn segments_are_removed_only_after_validation() {
        let dir = tempfile::tempdir().unwrap();
        let sequences: Vec<u64> = (0..5).collect();
        let manifest = downloaded_manifest(dir.path(), 0, &sequences);

        let concatenator = FakeConcatenator::new(SEG);
        let plan = MergePlan::from_manifest(&manifest);
        let output = dir.path().join("recording.ts");
        let mut with_cleanup = settings();
        with_cleanup.remove_segments = true;
        run(&plan, &concatenator, &with_cleanup, &output).await.unwrap();

        for seq in 0..5u64 {
            assert!(!dir.path().join(segment_file_name(seq)).exists());
        }
        assert!(output.exists());
    }
}
