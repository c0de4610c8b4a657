//! Per-trial sampler checkpoints for resume.
//!
//! After every trial registration the manager writes the sampler's full
//! state to `{dir}/{trial_id}.json`. Resuming at trial `R` loads exactly that
//! file; a missing or unreadable checkpoint is fatal, since starting a fresh
//! simplex against an existing ledger would silently break the search.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sampler::Sampler;

/// Layout version written into every checkpoint file.
pub const CHECKPOINT_VERSION: u32 = 1;

/// One checkpoint file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Layout version, checked on load.
    pub version: u32,
    /// The trial whose registration this state follows.
    pub trial_id: u64,
    /// [`Sampler::name`] of the sampler that wrote the state.
    pub sampler: String,
    pub saved_at: DateTime<Utc>,
    /// Opaque sampler state from [`Sampler::snapshot`].
    pub state: serde_json::Value,
}

/// A directory of checkpoints keyed by trial id.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Uses `dir` for checkpoint files. The directory is created on the first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds the checkpoint for `trial_id`.
    #[must_use]
    pub fn path(&self, trial_id: u64) -> PathBuf {
        self.dir.join(format!("{trial_id}.json"))
    }

    /// Writes the sampler state for `trial_id`, replacing any older file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the state cannot be serialized or written.
    pub fn save(&self, trial_id: u64, sampler: &dyn Sampler) -> Result<PathBuf> {
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            trial_id,
            sampler: sampler.name().to_string(),
            saved_at: Utc::now(),
            state: sampler.snapshot()?,
        };

        fs::create_dir_all(&self.dir).map_err(|e| Error::Storage(e.to_string()))?;
        let path = self.path(trial_id);
        // Write next to the target and rename so a crash never leaves a torn file.
        let tmp_path = self.dir.join(format!(".{trial_id}.json.tmp"));
        let write = || -> std::io::Result<()> {
            let file = fs::File::create(&tmp_path)?;
            serde_json::to_writer_pretty(file, &checkpoint).map_err(std::io::Error::other)?;
            fs::rename(&tmp_path, &path)
        };
        write().map_err(|e| Error::Storage(format!("{}: {e}", path.display())))?;

        trace_debug!(trial_id, path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    /// Reads and validates the checkpoint for `trial_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Checkpoint`] if the file is missing, corrupt, written
    /// by another layout version, or labelled with a different trial id.
    pub fn load(&self, trial_id: u64) -> Result<Checkpoint> {
        let fail = |reason: String| Error::Checkpoint { trial_id, reason };
        let path = self.path(trial_id);

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(fail(format!("{} does not exist", path.display())));
            }
            Err(e) => return Err(fail(format!("{}: {e}", path.display()))),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&text)
            .map_err(|e| fail(format!("{} is corrupt: {e}", path.display())))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(fail(format!(
                "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                checkpoint.version
            )));
        }
        if checkpoint.trial_id != trial_id {
            return Err(fail(format!(
                "file is labelled with trial {}",
                checkpoint.trial_id
            )));
        }
        Ok(checkpoint)
    }

    /// Loads the checkpoint for `trial_id` into `sampler`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Checkpoint`] for any load failure, a sampler name
    /// mismatch, or state the sampler rejects.
    pub fn restore(&self, trial_id: u64, sampler: &mut dyn Sampler) -> Result<()> {
        let checkpoint = self.load(trial_id)?;
        if checkpoint.sampler != sampler.name() {
            return Err(Error::Checkpoint {
                trial_id,
                reason: format!(
                    "written by sampler '{}', cannot restore into '{}'",
                    checkpoint.sampler,
                    sampler.name()
                ),
            });
        }
        sampler
            .restore(checkpoint.state)
            .map_err(|e| Error::Checkpoint {
                trial_id,
                reason: e.to_string(),
            })
    }

    /// Trial ids that have a checkpoint, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory cannot be listed. A
    /// missing directory has no checkpoints.
    pub fn trial_ids(&self) -> Result<Vec<u64>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Storage(e.to_string())),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| Error::Storage(e.to_string()))?.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// The newest checkpointed trial id, if any.
    ///
    /// # Errors
    ///
    /// See [`trial_ids`](Self::trial_ids).
    pub fn latest(&self) -> Result<Option<u64>> {
        Ok(self.trial_ids()?.last().copied())
    }

    /// Deletes checkpoints newer than `trial_id` and returns how many went.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if a file cannot be removed.
    pub fn prune_after(&self, trial_id: u64) -> Result<usize> {
        let stale: Vec<u64> = self
            .trial_ids()?
            .into_iter()
            .filter(|&id| id > trial_id)
            .collect();
        for &id in &stale {
            fs::remove_file(self.path(id)).map_err(|e| Error::Storage(e.to_string()))?;
        }
        Ok(stale.len())
    }
}
