//! The scheduling loop.
//!
//! A [`Manager`] owns the sampler, the ledger handle, and the executor, and
//! advances all of them from one thread. Each [`tick`](Manager::tick):
//!
//! 1. feeds newly terminal trials back into the sampler;
//! 2. computes free capacity from the ledger counts
//!    (`min(max_workers - running - ready, n_trials - finished - running - ready)`);
//! 3. asks the sampler for that many trials, checkpointing after each one;
//! 4. starts a [`Job`] for every new `ready` trial and steps it once;
//! 5. steps every other in-flight job once and retires terminal ones.
//!
//! The loop is done when the completed count reaches the budget, or the
//! sampler is exhausted and nothing is ready or running.

mod builder;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use builder::ManagerBuilder;
#[cfg(feature = "pool")]
use chrono::Utc;

#[cfg(feature = "pool")]
use crate::backend::{PoolCompletion, WorkerPool};
use crate::backend::ExecutionBackend;
use crate::checkpoint::CheckpointStore;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::sampler::{Generation, Sampler};
use crate::storage::{TrialLedger, TrialRecord};
use crate::types::{Direction, TrialState};

/// Result of one [`Manager::tick`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Done,
}

/// What [`Manager::run`] reports when the loop ends.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    /// Trials that reached a terminal state, including earlier runs.
    pub completed: usize,
    pub best: Option<TrialRecord>,
}

/// Where trials are executed.
pub(crate) enum Executor {
    /// One [`Job`] state machine per trial over a pluggable backend.
    Jobs {
        backend: Box<dyn ExecutionBackend>,
        jobs: BTreeMap<u64, Job>,
    },
    /// In-process evaluation that bypasses the job state machine.
    #[cfg(feature = "pool")]
    Pool(WorkerPool),
}

/// Drives a sampler and its trials to completion.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use tuner::backend::{Invocation, LocalBackend};
/// use tuner::parameter::{ParamSpec, ParameterSpace};
/// use tuner::sampler::NelderMeadSampler;
/// use tuner::Manager;
///
/// let space = ParameterSpace::new(vec![
///     ParamSpec::float("lr", 1e-4, 1e-1).log_scale(),
///     ParamSpec::int("layers", 1, 6),
/// ])
/// .unwrap();
///
/// let mut manager = Manager::builder()
///     .sampler(NelderMeadSampler::builder(space).seed(7).build().unwrap())
///     .backend(LocalBackend::new(Invocation::new(["python", "train.py"]), "work"))
///     .n_trials(40)
///     .max_workers(4)
///     .checkpoint_dir("work/checkpoints")
///     .build()
///     .unwrap();
///
/// let summary = manager.run().unwrap();
/// println!("best: {:?}", summary.best);
/// ```
pub struct Manager {
    sampler: Box<dyn Sampler>,
    ledger: Arc<dyn TrialLedger>,
    executor: Executor,
    checkpoints: Option<CheckpointStore>,
    direction: Direction,
    n_trials: usize,
    max_workers: usize,
    job_timeout: Option<Duration>,
    poll_interval: Duration,
    completed: usize,
    exhausted: bool,
    aborted: bool,
    ticks: u64,
}

impl Manager {
    /// Starts a [`ManagerBuilder`].
    #[must_use]
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::new()
    }

    /// The shared trial ledger.
    #[must_use]
    pub fn ledger(&self) -> &dyn TrialLedger {
        &*self.ledger
    }

    #[must_use]
    pub fn sampler(&self) -> &dyn Sampler {
        &*self.sampler
    }

    /// Trials that reached a terminal state.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed
    }

    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Trials currently owned by the executor.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        match &self.executor {
            Executor::Jobs { jobs, .. } => jobs.len(),
            #[cfg(feature = "pool")]
            Executor::Pool(pool) => pool.active(),
        }
    }

    /// Runs one scheduling step.
    ///
    /// # Errors
    ///
    /// Ledger, checkpoint, and internal search errors are fatal and
    /// propagate. Evaluation failures never do.
    pub fn tick(&mut self) -> Result<Tick> {
        self.ticks += 1;
        if self.aborted {
            return Ok(Tick::Done);
        }
        let ledger = Arc::clone(&self.ledger);

        self.sampler.check_result(&*ledger)?;
        self.propose(&*ledger)?;
        self.advance(&*ledger)?;

        if self.completed >= self.n_trials {
            return Ok(Tick::Done);
        }
        if self.exhausted
            && ledger.get_ready()?.is_empty()
            && ledger.get_running()?.is_empty()
        {
            return Ok(Tick::Done);
        }
        Ok(Tick::Continue)
    }

    fn propose(&mut self, ledger: &dyn TrialLedger) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }
        let ready = ledger.get_ready()?.len();
        let running = ledger.get_running()?.len();
        let finished = ledger.get_finished()?.len();
        let capacity = self
            .max_workers
            .saturating_sub(running + ready)
            .min(self.n_trials.saturating_sub(finished + running + ready));

        for _ in 0..capacity {
            match self.sampler.generate(ledger)? {
                Generation::Registered(trial_id) => {
                    if let Some(store) = &self.checkpoints {
                        store.save(trial_id, &*self.sampler)?;
                    }
                    trace_info!(trial_id, "trial registered");
                }
                Generation::Waiting => break,
                Generation::Exhausted => {
                    trace_info!(sampler = self.sampler.name(), "sampler exhausted");
                    self.exhausted = true;
                    break;
                }
            }
        }
        Ok(())
    }

    fn advance(&mut self, ledger: &dyn TrialLedger) -> Result<()> {
        let timeout = self.job_timeout;
        match &mut self.executor {
            Executor::Jobs { backend, jobs } => {
                let mut started = Vec::new();
                for trial_id in ledger.get_ready()? {
                    if jobs.contains_key(&trial_id) {
                        continue;
                    }
                    let mut job = Job::new(trial_id, timeout);
                    job.main(backend.as_mut(), ledger)?;
                    jobs.insert(trial_id, job);
                    started.push(trial_id);
                }
                for (trial_id, job) in jobs.iter_mut() {
                    if !started.contains(trial_id) {
                        job.main(backend.as_mut(), ledger)?;
                    }
                }
                let before = jobs.len();
                jobs.retain(|_, job| !job.is_terminal());
                self.completed += before - jobs.len();
            }
            #[cfg(feature = "pool")]
            Executor::Pool(pool) => {
                for trial_id in ledger.get_ready()? {
                    if !pool.has_capacity() {
                        break;
                    }
                    let params = ledger.get_params(trial_id)?.unwrap_or_default();
                    ledger.set_start_time(trial_id, Utc::now())?;
                    ledger.set_state(trial_id, TrialState::Running)?;
                    pool.dispatch(trial_id, params)?;
                }
                for (trial_id, completion) in pool.harvest(timeout)? {
                    ledger.set_end_time(trial_id, Utc::now())?;
                    match completion {
                        PoolCompletion::Success(objective) => {
                            ledger.set_objective(trial_id, &objective)?;
                            ledger.set_state(trial_id, TrialState::Finished)?;
                            ledger.set_state(trial_id, TrialState::Success)?;
                        }
                        PoolCompletion::Failure(message) => {
                            ledger.set_error(trial_id, &message)?;
                            ledger.set_state(trial_id, TrialState::Failure)?;
                        }
                        PoolCompletion::Timeout => {
                            ledger.set_error(trial_id, "evaluation timed out")?;
                            ledger.set_state(trial_id, TrialState::Timeout)?;
                        }
                    }
                    trace_debug!(trial_id, "pooled evaluation harvested");
                    self.completed += 1;
                }
            }
        }
        Ok(())
    }

    /// Ticks until done, sleeping the poll interval between ticks.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error from [`tick`](Self::tick).
    pub fn run(&mut self) -> Result<RunSummary> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "run",
            sampler = self.sampler.name(),
            n_trials = self.n_trials,
            max_workers = self.max_workers
        )
        .entered();

        while self.tick()? == Tick::Continue {
            std::thread::sleep(self.poll_interval);
        }
        let best = self.best_trial()?;
        trace_info!(
            ticks = self.ticks,
            completed = self.completed,
            best_trial = best.as_ref().map(|t| t.trial_id),
            "run finished"
        );
        Ok(RunSummary {
            ticks: self.ticks,
            completed: self.completed,
            best,
        })
    }

    /// The successful trial with the best first objective.
    ///
    /// # Errors
    ///
    /// Propagates ledger read errors.
    pub fn best_trial(&self) -> Result<Option<TrialRecord>> {
        let mut best: Option<(f64, TrialRecord)> = None;
        for trial in self.ledger.trials()? {
            if trial.state != TrialState::Success {
                continue;
            }
            let Some(value) = trial.objective.as_deref().and_then(<[f64]>::first).copied() else {
                continue;
            };
            if value.is_nan() {
                continue;
            }
            let improves = best
                .as_ref()
                .is_none_or(|(incumbent, _)| self.direction.is_better(value, *incumbent));
            if improves {
                best = Some((value, trial));
            }
        }
        Ok(best.map(|(_, trial)| trial))
    }

    /// Fails every trial that is waiting or in flight and stops the loop.
    ///
    /// Returns how many trials were expired.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn abort(&mut self) -> Result<usize> {
        let ledger = Arc::clone(&self.ledger);
        let mut expired = 0;
        match &mut self.executor {
            Executor::Jobs { backend, jobs } => {
                for job in jobs.values_mut() {
                    job.expire(backend.as_mut(), &*ledger, "aborted")?;
                    expired += 1;
                }
                jobs.clear();
            }
            #[cfg(feature = "pool")]
            Executor::Pool(pool) => {
                for trial_id in pool.abandon() {
                    ledger.set_error(trial_id, "aborted")?;
                    ledger.set_end_time(trial_id, Utc::now())?;
                    ledger.set_state(trial_id, TrialState::Failure)?;
                    expired += 1;
                }
            }
        }
        for trial_id in ledger.get_ready()? {
            ledger.set_error(trial_id, "aborted")?;
            ledger.set_state(trial_id, TrialState::Failure)?;
            expired += 1;
        }
        self.completed += expired;
        self.aborted = true;
        trace_warn!(expired, "run aborted");
        Ok(expired)
    }

    /// Rolls the run back to just after trial `trial_id` was registered.
    ///
    /// Restores the sampler from that trial's checkpoint, deletes every
    /// newer ledger row and checkpoint, and moves trials that were still
    /// active back to `ready` so they run again.
    ///
    /// # Errors
    ///
    /// A missing or corrupt checkpoint is fatal and is reported before the
    /// ledger is touched.
    pub fn resume(&mut self, trial_id: u64) -> Result<()> {
        let Some(store) = &self.checkpoints else {
            return Err(Error::Checkpoint {
                trial_id,
                reason: "no checkpoint directory is configured".to_string(),
            });
        };
        store.restore(trial_id, &mut *self.sampler)?;

        let removed = self.ledger.delete_after(trial_id)?;
        let requeued = self.ledger.get_running()?;
        for &id in &requeued {
            self.ledger.set_state(id, TrialState::Ready)?;
        }
        let pruned = store.prune_after(trial_id)?;

        if let Executor::Jobs { jobs, .. } = &mut self.executor {
            jobs.clear();
        }
        self.completed = self.ledger.get_finished()?.len();
        self.exhausted = false;
        self.aborted = false;

        trace_info!(
            trial_id,
            removed,
            requeued = requeued.len(),
            pruned,
            completed = self.completed,
            "resumed from checkpoint"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = (removed, pruned);
        Ok(())
    }
}
