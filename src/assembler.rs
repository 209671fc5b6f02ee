//! Merges a chapter's audio parts into its final artifact.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use crate::config::AudioFormat;
use crate::error::MergeError;
use crate::fsutil::{remove_if_exists, verify_audio_file, TEMP_MARKER};

/// Lossless concatenation of audio files, in the order given.
#[async_trait]
pub trait AudioConcat: Send + Sync {
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError>;
}

/// ffmpeg's concat demuxer with stream copy.
pub struct FfmpegConcat {
    program: String,
    timeout: Duration,
}

impl FfmpegConcat {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn write_list(&self, inputs: &[PathBuf], dir: &Path) -> Result<tempfile::NamedTempFile, MergeError> {
        let mut list = tempfile::Builder::new()
            .prefix(TEMP_MARKER)
            .suffix(".txt")
            .tempfile_in(dir)?;
        for input in inputs {
            let absolute = std::fs::canonicalize(input)?;
            let escaped = absolute.to_string_lossy().replace('\'', r"'\''");
            writeln!(list, "file '{escaped}'")?;
        }
        list.flush()?;
        Ok(list)
    }
}

#[async_trait]
impl AudioConcat for FfmpegConcat {
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        let list = self.write_list(inputs, dir)?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(list.path())
            .arg("-c")
            .arg("copy")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| MergeError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // Dropping the child on timeout kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| MergeError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(MergeError::ToolFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Temp path the merge writes to before the rename:
/// `chapter_01_x.mp3` becomes `chapter_01_x.tmp.mp3`.
pub fn temp_output_path(artifact: &Path, format: AudioFormat) -> PathBuf {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    artifact.with_file_name(format!("{stem}{TEMP_MARKER}.{}", format.extension()))
}

pub struct AudioAssembler<'a> {
    concat: &'a dyn AudioConcat,
    format: AudioFormat,
}

impl<'a> AudioAssembler<'a> {
    pub fn new(concat: &'a dyn AudioConcat, format: AudioFormat) -> Self {
        Self { concat, format }
    }

    /// Merges `parts` (keyed by 1-based index) into `artifact`.
    ///
    /// The parts must be exactly `1..=total`. The artifact only ever appears
    /// complete: the merge goes to a temp file that is validated and then
    /// renamed over it. Parts are deleted after the rename and kept on any
    /// failure.
    pub async fn assemble(
        &self,
        parts: &BTreeMap<usize, PathBuf>,
        total: usize,
        artifact: &Path,
    ) -> Result<(), MergeError> {
        if parts.is_empty() || total == 0 {
            return Err(MergeError::NoParts);
        }
        for (position, &index) in parts.keys().enumerate() {
            if index != position + 1 {
                return Err(MergeError::NonContiguous {
                    expected: position + 1,
                    found: index,
                });
            }
        }
        if parts.len() != total {
            return Err(MergeError::MissingParts {
                expected: total,
                found: parts.len(),
            });
        }

        let inputs: Vec<PathBuf> = parts.values().cloned().collect();
        let temp = temp_output_path(artifact, self.format);
        remove_if_exists(&temp)?;

        if let Err(e) = self.merge_into(&inputs, &temp).await {
            let _ = remove_if_exists(&temp);
            return Err(e);
        }

        if !verify_audio_file(&temp, self.format) {
            let _ = remove_if_exists(&temp);
            return Err(MergeError::InvalidOutput(temp));
        }
        File::open(&temp)?.sync_all()?;
        tokio::fs::rename(&temp, artifact).await?;
        info!("Assembled {} part(s) into {}", inputs.len(), artifact.display());

        for input in &inputs {
            if let Err(e) = remove_if_exists(input) {
                warn!("Failed to remove part {}: {}", input.display(), e);
            }
        }
        Ok(())
    }

    async fn merge_into(&self, inputs: &[PathBuf], temp: &Path) -> Result<(), MergeError> {
        if let [single] = inputs {
            debug!("Single part, copying {} instead of merging", single.display());
            tokio::fs::copy(single, temp).await?;
            return Ok(());
        }
        self.concat.concat(inputs, temp).await
    }
}
