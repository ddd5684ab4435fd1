//! ffmpeg-backed implementation of the [`Concatenator`] capability.
//!
//! Uses the concat demuxer with stream copy: acquisition and ordering are
//! our job, transcoding is nobody's. The artifact duration is read back
//! through ffprobe when available.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::MergeError;
use crate::merge::{Concatenator, MuxedArtifact};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Build a child-process command without flashing a console window on
/// Windows. No-op elsewhere.
fn command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    #[allow(unused_mut)]
    let mut cmd = tokio::process::Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

pub struct FfmpegConcatenator {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegConcatenator {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl FfmpegConcatenator {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Read the container-reported duration. Any failure degrades to `None`;
    /// validation then reports the artifact as unverified instead of wrong.
    async fn probe_duration(&self, artifact: &Path) -> Option<Duration> {
        let output = command(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "csv=p=0",
            ])
            .arg(artifact)
            .output()
            .await;

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(status = %output.status, "ffprobe failed; skipping duration validation");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "ffprobe unavailable; skipping duration validation");
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let secs: f64 = stdout.trim().parse().ok()?;
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(secs))
    }
}

/// Render a concat-demuxer list file. Single quotes inside paths use the
/// ffmpeg escape form `'\''`.
fn render_concat_list(inputs: &[PathBuf]) -> String {
    let mut list = String::from("ffconcat version 1.0\n");
    for path in inputs {
        let escaped = path.display().to_string().replace('\'', "'\\''");
        list.push_str(&format!("file '{escaped}'\n"));
    }
    list
}

#[async_trait]
impl Concatenator for FfmpegConcatenator {
    async fn concatenate(
        &self,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<MuxedArtifact, MergeError> {
        let list_path = output.with_extension("ffconcat");
        tokio::fs::write(&list_path, render_concat_list(inputs)).await?;
        debug!(
            inputs = inputs.len(),
            list = %list_path.display(),
            "Invoking ffmpeg concat"
        );

        let result = command(&self.ffmpeg)
            .args(["-y", "-v", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(output)
            .output()
            .await;

        // The list file is scratch either way.
        let _ = tokio::fs::remove_file(&list_path).await;

        let result = result.map_err(|e| MergeError::muxer(format!("failed to run ffmpeg: {e}")))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(MergeError::muxer(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        let duration = self.probe_duration(output).await;
        Ok(MuxedArtifact {
            path: output.to_path_buf(),
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_list_is_ordered_and_escaped() {
        let inputs = vec![
            PathBuf::from("/cap/0000001.ts"),
            PathBuf::from("/cap/it's.ts"),
        ];
        let list = render_concat_list(&inputs);
        assert_eq!(
            list,
            "ffconcat version 1.0\nfile '/cap/0000001.ts'\nfile '/cap/it'\\''s.ts'\n"
        );
    }

    #[test]
    fn concat_list_for_no_inputs_is_header_only() {
        assert_eq!(render_concat_list(&[]), "ffconcat version 1.0\n");
    }
}
