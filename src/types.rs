//! Core types shared by the search engine, the job lifecycle, and the ledger.

use serde::{Deserialize, Serialize};

/// The direction of optimization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Minimize the objective value.
    #[default]
    Minimize,
    /// Maximize the objective value.
    Maximize,
}

impl Direction {
    /// Returns `true` if `candidate` is strictly better than `incumbent`.
    #[must_use]
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Direction::Minimize => candidate < incumbent,
            Direction::Maximize => candidate > incumbent,
        }
    }
}

/// The state of a trial in its lifecycle.
///
/// ```text
/// ready ──> running ──> finished ──> success
///   │          │            │    └──> failure
///   └──────────┴────────────┴──> timeout / failure (expire)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    /// Registered and waiting for a worker.
    Ready,
    /// Handed to an execution backend.
    Running,
    /// The backend reports the job is gone; the outcome is not classified yet.
    Finished,
    /// The job exited cleanly and reported an objective.
    Success,
    /// The job failed, could not be submitted, or was expired.
    Failure,
    /// The job exceeded its wall-clock limit and was stopped.
    Timeout,
}

impl TrialState {
    /// Returns `true` for `success`, `failure`, and `timeout`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrialState::Success | TrialState::Failure | TrialState::Timeout
        )
    }

    /// Returns `true` while the trial occupies a worker.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, TrialState::Running | TrialState::Finished)
    }

    /// Transition table of the lifecycle.
    ///
    /// Re-entering `ready` is not an edge: only an explicit resume/rollback
    /// rewrites a trial back to `ready`.
    #[must_use]
    pub fn can_transition_to(self, next: TrialState) -> bool {
        use TrialState::{Failure, Finished, Ready, Running, Success, Timeout};

        match (self, next) {
            (Ready, Running)
            | (Running, Finished)
            | (Finished, Success)
            | (Ready | Running | Finished, Failure | Timeout) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for TrialState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            TrialState::Ready => "ready",
            TrialState::Running => "running",
            TrialState::Finished => "finished",
            TrialState::Success => "success",
            TrialState::Failure => "failure",
            TrialState::Timeout => "timeout",
        };
        f.write_str(name)
    }
}
