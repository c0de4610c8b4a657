//! Proposal strategies that turn ledger results into new trials.
//!
//! A [`Sampler`] sits between the [`Manager`](crate::Manager) and the
//! [`TrialLedger`]: on every tick the manager asks it to
//! [`generate`](Sampler::generate) trials to fill free worker slots, and it
//! pulls finished objectives back out of the ledger in
//! [`check_result`](Sampler::check_result).

pub mod nelder_mead;

pub use nelder_mead::NelderMeadSampler;

use crate::error::Result;
use crate::storage::TrialLedger;
use crate::types::Direction;

/// Outcome of one [`Sampler::generate`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Generation {
    /// A new `ready` trial was registered under this id.
    Registered(u64),
    /// Nothing to propose until outstanding trials report back.
    Waiting,
    /// The sampler will never propose another trial.
    Exhausted,
}

/// A pluggable proposal strategy.
///
/// Samplers own their search state exclusively; the manager drives them from
/// a single thread. State must survive a [`snapshot`](Sampler::snapshot) /
/// [`restore`](Sampler::restore) round trip with identical future behaviour,
/// which is what checkpoint-based resume relies on.
pub trait Sampler: Send {
    /// Short identifier stored in checkpoints.
    fn name(&self) -> &'static str;

    /// Direction the search optimizes in.
    fn direction(&self) -> Direction;

    /// Smallest trial budget the sampler can work with.
    fn min_trials(&self) -> usize;

    /// Proposes at most one trial and registers it in `ledger`.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures and internal search errors.
    fn generate(&mut self, ledger: &dyn TrialLedger) -> Result<Generation>;

    /// Feeds every newly terminal trial this sampler proposed back into the
    /// search. Trials that are still in flight are left for a later call.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    fn check_result(&mut self, ledger: &dyn TrialLedger) -> Result<()>;

    /// Serializes the complete search state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized.
    fn snapshot(&self) -> Result<serde_json::Value>;

    /// Replaces the search state with one produced by [`snapshot`](Sampler::snapshot).
    ///
    /// # Errors
    ///
    /// Returns an error if the state is malformed or from an incompatible
    /// version.
    fn restore(&mut self, state: serde_json::Value) -> Result<()>;
}
