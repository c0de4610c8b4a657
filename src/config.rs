//! Run settings loaded from a JSON file.
//!
//! ```json
//! {
//!   "direction": "minimize",
//!   "n_trials": 60,
//!   "max_workers": 4,
//!   "job_timeout_secs": 600,
//!   "seed": 7,
//!   "workspace": "runs/lr-sweep",
//!   "parameters": [
//!     { "name": "lr", "type": "float", "low": 1e-5, "high": 1e-1, "log": true },
//!     { "name": "layers", "type": "int", "low": 1, "high": 8, "initial": [2, 4] }
//!   ],
//!   "backend": { "kind": "local", "invocation": { "command": ["python", "train.py"] } }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{BatchBackend, BatchOptions, Invocation, LocalBackend};
use crate::error::{Error, Result};
use crate::manager::{Manager, ManagerBuilder};
use crate::parameter::{ParamSpec, ParameterSpace};
use crate::sampler::NelderMeadSampler;
use crate::storage::JournalLedger;
use crate::types::Direction;

fn default_max_workers() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_workspace() -> PathBuf {
    PathBuf::from("tuner-workspace")
}

/// Where and how trials run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSettings {
    /// One OS subprocess per trial.
    Local { invocation: Invocation },
    /// One batch-queue job per trial.
    Batch {
        invocation: Invocation,
        options: BatchOptions,
    },
    /// In-process evaluation. The evaluator is supplied in code.
    Pool {
        #[serde(default)]
        workers: Option<usize>,
    },
}

/// Everything a run needs besides the objective itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub direction: Direction,
    pub n_trials: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub job_timeout_secs: Option<f64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
    pub parameters: Vec<ParamSpec>,
    pub backend: BackendSettings,
    /// Holds `trials.jsonl`, `checkpoints/`, and `jobs/`.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
}

impl Settings {
    /// Reads, parses, and validates a settings file.
    ///
    /// The file path is threaded through to every job as its config file
    /// unless the invocation names one already.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] if the file cannot be read or
    /// parsed, and any validation error.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::InvalidSettings(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut settings = Self::from_json(&text)?;
        match &mut settings.backend {
            BackendSettings::Local { invocation } | BackendSettings::Batch { invocation, .. } => {
                if invocation.config_file.is_none() {
                    invocation.config_file = Some(path.to_path_buf());
                }
            }
            BackendSettings::Pool { .. } => {}
        }
        Ok(settings)
    }

    /// Parses and validates settings from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] for malformed JSON and any
    /// validation error.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidSettings(format!("failed to parse settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every setting before any trial is created.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting, parameter, or backend option.
    pub fn validate(&self) -> Result<()> {
        if self.n_trials == 0 {
            return Err(Error::InvalidSettings("n_trials must be positive".to_string()));
        }
        if self.max_workers == 0 {
            return Err(Error::InvalidSettings(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if let Some(secs) = self.job_timeout_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(Error::InvalidSettings(format!(
                    "job_timeout_secs must be a positive number, got {secs}"
                )));
            }
        }
        let space = self.space()?;
        space.require_numeric("nelder-mead")?;
        let required = space.len() + 1;
        if self.n_trials < required {
            return Err(Error::BudgetTooSmall {
                n_trials: self.n_trials,
                required,
            });
        }
        match &self.backend {
            BackendSettings::Local { invocation } => invocation.validate(),
            BackendSettings::Batch {
                invocation,
                options,
            } => {
                invocation.validate()?;
                options.validate()
            }
            BackendSettings::Pool { workers } => match workers {
                Some(0) => Err(Error::InvalidSettings(
                    "pool workers must be at least 1".to_string(),
                )),
                _ => Ok(()),
            },
        }
    }

    /// The validated parameter space.
    ///
    /// # Errors
    ///
    /// Returns the first invalid parameter.
    pub fn space(&self) -> Result<ParameterSpace> {
        ParameterSpace::new(self.parameters.clone())
    }

    #[must_use]
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs_f64)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Worker count for a pool backend, falling back to `max_workers`.
    #[must_use]
    pub fn pool_workers(&self) -> usize {
        match self.backend {
            BackendSettings::Pool { workers: Some(n) } => n,
            _ => self.max_workers,
        }
    }

    /// Builds the Nelder-Mead sampler these settings describe.
    ///
    /// # Errors
    ///
    /// Propagates parameter-space and engine configuration errors.
    pub fn sampler(&self) -> Result<NelderMeadSampler> {
        let mut builder = NelderMeadSampler::builder(self.space()?).direction(self.direction);
        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        if let Some(max) = self.max_iterations {
            builder = builder.max_iterations(max);
        }
        builder.build()
    }

    /// A [`ManagerBuilder`] wired to a journal ledger and checkpoint
    /// directory inside the workspace.
    ///
    /// For [`BackendSettings::Pool`] the caller still has to attach a
    /// [`WorkerPool`](crate::backend::WorkerPool) with
    /// [`ManagerBuilder::pool`].
    ///
    /// # Errors
    ///
    /// Fails if the workspace cannot be created, the journal cannot be
    /// replayed, or the sampler cannot be built.
    pub fn manager_builder(&self) -> Result<ManagerBuilder> {
        fs::create_dir_all(&self.workspace).map_err(|e| {
            Error::Storage(format!("failed to create {}: {e}", self.workspace.display()))
        })?;
        let ledger = JournalLedger::open(self.workspace.join("trials.jsonl"))?;

        let mut builder = Manager::builder()
            .direction(self.direction)
            .sampler(self.sampler()?)
            .ledger(Arc::new(ledger))
            .checkpoint_dir(self.workspace.join("checkpoints"))
            .n_trials(self.n_trials)
            .max_workers(self.max_workers)
            .poll_interval(self.poll_interval());
        if let Some(timeout) = self.job_timeout() {
            builder = builder.job_timeout(timeout);
        }
        builder = match &self.backend {
            BackendSettings::Local { invocation } => {
                builder.backend(LocalBackend::new(invocation.clone(), &self.workspace))
            }
            BackendSettings::Batch {
                invocation,
                options,
            } => builder.backend(BatchBackend::new(
                options.clone(),
                invocation.clone(),
                &self.workspace,
            )),
            BackendSettings::Pool { .. } => builder,
        };
        Ok(builder)
    }
}
