//! Durable checkpoints for resuming an interrupted build.
//!
//! Layout under the checkpoint directory:
//!
//! ```text
//! checkpoint.json            metadata record (the commit point)
//! phases/00-analysis.json    one snapshot per finished phase
//! phases/01-task_breakdown.json
//! ```
//!
//! Every file is written to a temporary sibling, fsynced and renamed into
//! place. A phase snapshot is written before the metadata that references
//! it, so a crash between the two leaves the previous checkpoint intact.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::CheckpointError;
use crate::orchestrator::state::{BuildMetrics, BuildStatus};
use crate::phase::{PhaseResult, PhaseStatus};
use crate::spec::BuildSpecification;

pub const CHECKPOINT_VERSION: u32 = 1;
pub const METADATA_FILE: &str = "checkpoint.json";
pub const PHASES_DIR: &str = "phases";

/// Terminal status of one phase, in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub status: PhaseStatus,
}

/// The metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub version: u32,
    /// Monotonic write counter; each save supersedes the previous one
    pub sequence: u64,
    pub project_name: String,
    pub spec_path: PathBuf,
    pub spec_hash: String,
    /// Finished phases: a completed/skipped prefix, optionally followed by
    /// the phase that failed
    pub progress: Vec<PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_index: Option<usize>,
    pub status: BuildStatus,
    pub metrics: BuildMetrics,
    pub written_at: DateTime<Utc>,
}

impl CheckpointMetadata {
    /// Length of the completed/skipped prefix.
    pub fn completed_prefix_len(&self) -> usize {
        self.progress
            .iter()
            .take_while(|r| r.status.unblocks_successors())
            .count()
    }
}

/// Output of one finished phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub index: usize,
    pub phase: String,
    pub status: PhaseStatus,
    pub output: String,
    pub result: PhaseResult,
    pub written_at: DateTime<Utc>,
}

impl PhaseSnapshot {
    pub fn new(index: usize, result: &PhaseResult) -> Self {
        Self {
            index,
            phase: result.phase.clone(),
            status: result.status,
            output: result.output.clone(),
            result: result.clone(),
            written_at: Utc::now(),
        }
    }

    fn file_name(index: usize, phase: &str) -> String {
        format!("{index:02}-{phase}.json")
    }
}

/// A validated checkpoint: metadata plus the snapshots of its completed prefix.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub snapshots: Vec<PhaseSnapshot>,
}

impl Checkpoint {
    /// Index of the first phase still to run.
    pub fn resume_index(&self) -> usize {
        self.snapshots.len()
    }

    /// Outputs of completed phases, in order, for later phases to consume.
    pub fn prior_outputs(&self) -> Vec<(String, String)> {
        self.snapshots
            .iter()
            .filter(|s| s.status == PhaseStatus::Completed)
            .map(|s| (s.phase.clone(), s.output.clone()))
            .collect()
    }

    /// Reject a specification whose content differs from the recorded hash.
    pub fn verify_spec(&self, spec: &BuildSpecification) -> Result<(), CheckpointError> {
        if spec.hash() != self.metadata.spec_hash {
            return Err(CheckpointError::SpecMismatch {
                recorded: self.metadata.spec_hash.clone(),
                current: spec.hash().to_string(),
            });
        }
        Ok(())
    }
}

/// Reads and writes checkpoints in one directory. Writes are serialized.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    sequence: Mutex<u64>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: Mutex::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    fn snapshot_path(&self, index: usize, phase: &str) -> PathBuf {
        self.dir
            .join(PHASES_DIR)
            .join(PhaseSnapshot::file_name(index, phase))
    }

    /// Persist a new checkpoint. `snapshot` is the phase that just finished,
    /// if any; it lands on disk before the metadata that references it.
    pub fn save(
        &self,
        metrics: &BuildMetrics,
        spec: &BuildSpecification,
        progress: &[PhaseRecord],
        snapshot: Option<&PhaseSnapshot>,
    ) -> Result<CheckpointMetadata, CheckpointError> {
        let mut sequence = self
            .sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(snapshot) = snapshot {
            let path = self.snapshot_path(snapshot.index, &snapshot.phase);
            write_json_atomic(&path, snapshot)
                .map_err(|source| CheckpointError::WriteFailed { path, source })?;
        }

        let completed = progress
            .iter()
            .take_while(|r| r.status.unblocks_successors())
            .count();
        let metadata = CheckpointMetadata {
            version: CHECKPOINT_VERSION,
            sequence: *sequence + 1,
            project_name: metrics.project_name.clone(),
            spec_path: spec.source_path().to_path_buf(),
            spec_hash: spec.hash().to_string(),
            progress: progress.to_vec(),
            last_completed_phase: completed.checked_sub(1).map(|i| progress[i].name.clone()),
            last_completed_index: completed.checked_sub(1),
            status: metrics.status,
            metrics: metrics.clone(),
            written_at: Utc::now(),
        };

        let path = self.metadata_path();
        write_json_atomic(&path, &metadata)
            .map_err(|source| CheckpointError::WriteFailed { path, source })?;
        *sequence = metadata.sequence;

        debug!(
            dir = %self.dir.display(),
            sequence = metadata.sequence,
            last_completed = metadata.last_completed_phase.as_deref().unwrap_or("-"),
            "checkpoint written"
        );
        Ok(metadata)
    }

    /// Read the metadata record without validating it against a phase list.
    pub fn load_metadata(&self) -> Result<CheckpointMetadata, CheckpointError> {
        let path = self.metadata_path();
        if !path.is_file() {
            return Err(CheckpointError::NotFound {
                dir: self.dir.clone(),
            });
        }
        let metadata: CheckpointMetadata = read_json(&path)?;
        if metadata.version != CHECKPOINT_VERSION {
            return Err(invalid(
                &path,
                format!(
                    "unsupported version {} (expected {CHECKPOINT_VERSION})",
                    metadata.version
                ),
            ));
        }
        Ok(metadata)
    }

    /// Load the latest checkpoint and validate it against `expected_phases`.
    ///
    /// The recorded progress must be a positional prefix of the phase list
    /// and every completed phase must have a matching snapshot. Anything
    /// else is rejected, never repaired.
    pub fn load(&self, expected_phases: &[String]) -> Result<Checkpoint, CheckpointError> {
        let metadata = self.load_metadata()?;
        let path = self.metadata_path();

        if metadata.progress.len() > expected_phases.len() {
            return Err(invalid(
                &path,
                format!(
                    "records {} phases but the pipeline has {}",
                    metadata.progress.len(),
                    expected_phases.len()
                ),
            ));
        }
        for (i, (record, expected)) in metadata.progress.iter().zip(expected_phases).enumerate() {
            if &record.name != expected {
                return Err(invalid(
                    &path,
                    format!("phase {i} is '{}', expected '{expected}'", record.name),
                ));
            }
        }

        let prefix = metadata.completed_prefix_len();
        let tail = &metadata.progress[prefix..];
        let tail_ok = match tail {
            [] => true,
            [last] => last.status == PhaseStatus::Failed,
            _ => false,
        };
        if !tail_ok {
            return Err(invalid(
                &path,
                "progress is not a completed prefix followed by at most one failed phase",
            ));
        }
        if metadata.last_completed_index != prefix.checked_sub(1) {
            return Err(invalid(&path, "last completed index disagrees with progress"));
        }

        let mut snapshots = Vec::with_capacity(prefix);
        for (index, record) in metadata.progress[..prefix].iter().enumerate() {
            let snap_path = self.snapshot_path(index, &record.name);
            if !snap_path.is_file() {
                return Err(invalid(&snap_path, "snapshot missing"));
            }
            let snapshot: PhaseSnapshot = read_json(&snap_path)?;
            if snapshot.index != index
                || snapshot.phase != record.name
                || snapshot.status != record.status
            {
                return Err(invalid(&snap_path, "snapshot does not match metadata"));
            }
            snapshots.push(snapshot);
        }

        *self
            .sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = metadata.sequence;

        Ok(Checkpoint {
            metadata,
            snapshots,
        })
    }

    /// Load a checkpoint and the specification it was recorded against,
    /// rejecting it if the specification is gone or has changed.
    pub fn load_verified(
        &self,
        expected_phases: &[String],
    ) -> Result<(Checkpoint, BuildSpecification), CheckpointError> {
        let checkpoint = self.load(expected_phases)?;
        let spec_path = checkpoint.metadata.spec_path.clone();
        let spec = BuildSpecification::load(&spec_path).map_err(|source| {
            CheckpointError::SpecUnreadable {
                path: spec_path,
                source,
            }
        })?;
        checkpoint.verify_spec(&spec)?;
        Ok((checkpoint, spec))
    }

    /// Remove any existing checkpoint so a fresh build starts clean.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        let remove = || -> anyhow::Result<()> {
            let metadata = self.metadata_path();
            if metadata.exists() {
                std::fs::remove_file(&metadata)
                    .with_context(|| format!("Failed to remove {}", metadata.display()))?;
            }
            let phases = self.dir.join(PHASES_DIR);
            if phases.exists() {
                std::fs::remove_dir_all(&phases)
                    .with_context(|| format!("Failed to remove {}", phases.display()))?;
            }
            Ok(())
        };
        remove().map_err(|source| CheckpointError::WriteFailed {
            path: self.dir.clone(),
            source,
        })?;
        *self
            .sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = 0;
        Ok(())
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> CheckpointError {
    CheckpointError::Invalid {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let content = std::fs::read_to_string(path).map_err(|e| invalid(path, e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| invalid(path, e.to_string()))
}

/// Write JSON through a temp file + fsync + rename in the target directory.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let json = serde_json::to_vec_pretty(value).context("Failed to serialize checkpoint")?;
    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;
    temp.write_all(&json)
        .context("Failed to write temporary checkpoint file")?;
    temp.as_file()
        .sync_all()
        .context("Failed to fsync temporary checkpoint file")?;
    temp.persist(path)
        .with_context(|| format!("Failed to rename checkpoint into {}", path.display()))?;

    // Make the rename itself durable.
    sync_dir(parent)
        .with_context(|| format!("Failed to fsync directory {}", parent.display()))?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
