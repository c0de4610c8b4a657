use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{Executor, Manager};
#[cfg(feature = "pool")]
use crate::backend::WorkerPool;
use crate::backend::ExecutionBackend;
use crate::checkpoint::CheckpointStore;
use crate::error::{Error, Result};
use crate::sampler::Sampler;
use crate::storage::{MemoryLedger, TrialLedger};
use crate::types::Direction;

/// A builder for [`Manager`] instances.
///
/// Created via [`Manager::builder()`]. A sampler and an executor (either a
/// [`backend`](Self::backend) or a [`pool`](Self::pool)) are required.
///
/// # Defaults
///
/// - Direction: taken from the sampler
/// - Ledger: [`MemoryLedger`]
/// - Trial budget: 100
/// - Workers: 1
/// - Job timeout: none
/// - Poll interval: 1 second
/// - Checkpoints: disabled
pub struct ManagerBuilder {
    direction: Option<Direction>,
    sampler: Option<Box<dyn Sampler>>,
    ledger: Option<Arc<dyn TrialLedger>>,
    executor: Option<Executor>,
    checkpoints: Option<CheckpointStore>,
    n_trials: usize,
    max_workers: usize,
    job_timeout: Option<Duration>,
    poll_interval: Duration,
    resume_from: Option<u64>,
}

impl ManagerBuilder {
    pub(super) fn new() -> Self {
        Self {
            direction: None,
            sampler: None,
            ledger: None,
            executor: None,
            checkpoints: None,
            n_trials: 100,
            max_workers: 1,
            job_timeout: None,
            poll_interval: Duration::from_secs(1),
            resume_from: None,
        }
    }

    /// Expected direction; [`build`](Self::build) rejects a sampler that
    /// optimizes the other way.
    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    #[must_use]
    pub fn minimize(self) -> Self {
        self.direction(Direction::Minimize)
    }

    #[must_use]
    pub fn maximize(self) -> Self {
        self.direction(Direction::Maximize)
    }

    /// Sets the sampler that proposes trials.
    #[must_use]
    pub fn sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// Shares an existing ledger, for example a [`JournalLedger`](crate::storage::JournalLedger).
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn TrialLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Runs every trial as a [`Job`](crate::job::Job) on `backend`.
    #[must_use]
    pub fn backend(mut self, backend: impl ExecutionBackend + 'static) -> Self {
        self.executor = Some(Executor::Jobs {
            backend: Box::new(backend),
            jobs: BTreeMap::new(),
        });
        self
    }

    /// Evaluates trials in-process on `pool`.
    #[cfg(feature = "pool")]
    #[must_use]
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.executor = Some(Executor::Pool(pool));
        self
    }

    #[must_use]
    pub fn checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Saves a checkpoint into `dir` after every registration.
    #[must_use]
    pub fn checkpoint_dir(self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoints(CheckpointStore::new(dir))
    }

    /// Total number of trials to run, including earlier runs on a resumed ledger.
    #[must_use]
    pub fn n_trials(mut self, n_trials: usize) -> Self {
        self.n_trials = n_trials;
        self
    }

    #[must_use]
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Wall-clock limit per trial, measured from job creation.
    #[must_use]
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Resumes from the checkpoint of trial `trial_id` while building.
    #[must_use]
    pub fn resume_from(mut self, trial_id: u64) -> Self {
        self.resume_from = Some(trial_id);
        self
    }

    /// Validates the settings and builds the manager.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSettings`] when the sampler or executor is missing,
    ///   `max_workers` is zero, the requested direction differs from the
    ///   sampler's, or the ledger holds ready or active trials and no resume
    ///   point was given.
    /// - [`Error::BudgetTooSmall`] when `n_trials` cannot fill the first simplex.
    /// - Any checkpoint error raised by the resume.
    pub fn build(self) -> Result<Manager> {
        let sampler = self
            .sampler
            .ok_or_else(|| Error::InvalidSettings("a sampler is required".to_string()))?;
        let executor = self.executor.ok_or_else(|| {
            Error::InvalidSettings("an execution backend or worker pool is required".to_string())
        })?;
        if self.max_workers == 0 {
            return Err(Error::InvalidSettings(
                "max_workers must be at least 1".to_string(),
            ));
        }
        let direction = sampler.direction();
        if let Some(requested) = self.direction.filter(|&d| d != direction) {
            return Err(Error::InvalidSettings(format!(
                "manager direction {requested:?} does not match the sampler's {direction:?}"
            )));
        }
        let required = sampler.min_trials();
        if self.n_trials < required {
            return Err(Error::BudgetTooSmall {
                n_trials: self.n_trials,
                required,
            });
        }
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(MemoryLedger::new()));

        let mut manager = Manager {
            sampler,
            ledger,
            executor,
            checkpoints: self.checkpoints,
            direction,
            n_trials: self.n_trials,
            max_workers: self.max_workers,
            job_timeout: self.job_timeout,
            poll_interval: self.poll_interval,
            completed: 0,
            exhausted: false,
            aborted: false,
            ticks: 0,
        };

        match self.resume_from {
            Some(trial_id) => manager.resume(trial_id)?,
            None => {
                let mut orphans = manager.ledger.get_ready()?;
                orphans.extend(manager.ledger.get_running()?);
                if !orphans.is_empty() {
                    return Err(Error::InvalidSettings(format!(
                        "ledger holds {} unfinished trial(s) from an earlier run; resume from a checkpoint",
                        orphans.len()
                    )));
                }
                manager.completed = manager.ledger.get_finished()?.len();
            }
        }
        Ok(manager)
    }
}
