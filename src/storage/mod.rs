//! Trial ledger backends.
//!
//! The [`TrialLedger`] trait is the single shared, durable record of every
//! trial: its state, parameters, objective, timestamps, and error text. The
//! sampler, the job lifecycle, and the manager all talk to it through
//! discrete calls; each call is atomic on its own, so no cross-component
//! locking is needed above this layer.
//!
//! # Available backends
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`MemoryLedger`] | `BTreeMap` behind a read-write lock (the default) |
//! | [`JournalLedger`] | JSONL journal with `fs2` file locking, replayed on open |
//!
//! # Implementing a custom backend
//!
//! Implement the four primitives [`update`](TrialLedger::update),
//! [`trial`](TrialLedger::trial), [`trials`](TrialLedger::trials) and
//! [`delete_after`](TrialLedger::delete_after); every per-field operation
//! has a default implementation layered on top of them.

mod journal;
mod memory;

use chrono::{DateTime, Utc};
pub use journal::JournalLedger;
pub use memory::MemoryLedger;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::param::Params;
use crate::types::TrialState;

/// One row of the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_id: u64,
    pub state: TrialState,
    pub params: Params,
    /// One value per objective, `None` until the trial succeeds.
    pub objective: Option<Vec<f64>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TrialRecord {
    /// An empty `ready` row.
    #[must_use]
    pub fn new(trial_id: u64) -> Self {
        Self {
            trial_id,
            state: TrialState::Ready,
            params: Params::new(),
            objective: None,
            start_time: None,
            end_time: None,
            error: None,
        }
    }
}

/// Durable mapping `trial_id -> TrialRecord`.
///
/// Implementations must be `Send + Sync`; every method is one atomic
/// operation. Writes to an id that does not exist yet create the row.
pub trait TrialLedger: Send + Sync {
    /// Applies `f` to the row for `trial_id`, creating it first if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) when persisting fails.
    fn update(&self, trial_id: u64, f: &mut dyn FnMut(&mut TrialRecord)) -> Result<()>;

    /// Returns a copy of one row.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend cannot be read.
    fn trial(&self, trial_id: u64) -> Result<Option<TrialRecord>>;

    /// Returns a copy of every row in ascending id order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend cannot be read.
    fn trials(&self) -> Result<Vec<TrialRecord>>;

    /// Deletes every row with an id greater than `trial_id` and returns how
    /// many were removed. Used only by resume/rollback.
    ///
    /// # Errors
    ///
    /// Returns a storage error when persisting fails.
    fn delete_after(&self, trial_id: u64) -> Result<usize>;

    /// Ids in a given state.
    ///
    /// # Errors
    ///
    /// Propagates read errors.
    fn ids_where(&self, pred: &dyn Fn(TrialState) -> bool) -> Result<Vec<u64>> {
        Ok(self
            .trials()?
            .into_iter()
            .filter(|t| pred(t.state))
            .map(|t| t.trial_id)
            .collect())
    }

    /// Ids waiting for a worker.
    ///
    /// # Errors
    ///
    /// Propagates read errors.
    fn get_ready(&self) -> Result<Vec<u64>> {
        self.ids_where(&|s| s == TrialState::Ready)
    }

    /// Ids occupying a worker (`running` or the intermediate `finished`).
    ///
    /// # Errors
    ///
    /// Propagates read errors.
    fn get_running(&self) -> Result<Vec<u64>> {
        self.ids_where(&TrialState::is_active)
    }

    /// Ids in a terminal state.
    ///
    /// # Errors
    ///
    /// Propagates read errors.
    fn get_finished(&self) -> Result<Vec<u64>> {
        self.ids_where(&TrialState::is_terminal)
    }

    /// One past the highest id in the ledger.
    ///
    /// # Errors
    ///
    /// Propagates read errors.
    fn next_trial_id(&self) -> Result<u64> {
        Ok(self.trials()?.last().map_or(0, |t| t.trial_id + 1))
    }

    /// Creates a `ready` row carrying `params`.
    ///
    /// # Errors
    ///
    /// Propagates write errors.
    fn register(&self, trial_id: u64, params: &Params) -> Result<()> {
        self.update(trial_id, &mut |t| {
            t.state = TrialState::Ready;
            t.params = params.clone();
        })
    }

    /// # Errors
    ///
    /// Propagates read errors.
    fn get_state(&self, trial_id: u64) -> Result<Option<TrialState>> {
        Ok(self.trial(trial_id)?.map(|t| t.state))
    }

    /// Overwrites the state without checking the lifecycle table; the job
    /// state machine performs that check before writing.
    ///
    /// # Errors
    ///
    /// Propagates write errors.
    fn set_state(&self, trial_id: u64, state: TrialState) -> Result<()> {
        self.update(trial_id, &mut |t| t.state = state)
    }

    /// # Errors
    ///
    /// Propagates write errors.
    fn set_params(&self, trial_id: u64, params: &Params) -> Result<()> {
        self.update(trial_id, &mut |t| t.params = params.clone())
    }

    /// # Errors
    ///
    /// Propagates read errors.
    fn get_params(&self, trial_id: u64) -> Result<Option<Params>> {
        Ok(self.trial(trial_id)?.map(|t| t.params))
    }

    /// # Errors
    ///
    /// Propagates write errors.
    fn set_objective(&self, trial_id: u64, objective: &[f64]) -> Result<()> {
        self.update(trial_id, &mut |t| t.objective = Some(objective.to_vec()))
    }

    /// # Errors
    ///
    /// Propagates read errors.
    fn get_objective(&self, trial_id: u64) -> Result<Option<Vec<f64>>> {
        Ok(self.trial(trial_id)?.and_then(|t| t.objective))
    }

    /// # Errors
    ///
    /// Propagates write errors.
    fn set_error(&self, trial_id: u64, error: &str) -> Result<()> {
        self.update(trial_id, &mut |t| t.error = Some(error.to_string()))
    }

    /// # Errors
    ///
    /// Propagates write errors.
    fn set_start_time(&self, trial_id: u64, at: DateTime<Utc>) -> Result<()> {
        self.update(trial_id, &mut |t| t.start_time = Some(at))
    }

    /// # Errors
    ///
    /// Propagates write errors.
    fn set_end_time(&self, trial_id: u64, at: DateTime<Utc>) -> Result<()> {
        self.update(trial_id, &mut |t| t.end_time = Some(at))
    }
}
