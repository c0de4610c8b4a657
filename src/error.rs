use crate::types::TrialState;

/// Errors produced while configuring, searching, executing, or persisting trials.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when the lower bound is greater than the upper bound.
    #[error("invalid bounds for '{name}': low ({low}) must be less than or equal to high ({high})")]
    InvalidBounds {
        /// The parameter name.
        name: String,
        /// The lower bound value.
        low: f64,
        /// The upper bound value.
        high: f64,
    },

    /// Returned when log scale is used with non-positive bounds.
    #[error("invalid log bounds for '{0}': low must be positive for log scale")]
    InvalidLogBounds(String),

    /// Returned when categorical choices or an ordinal sequence are empty.
    #[error("choices for '{0}' cannot be empty")]
    EmptyChoices(String),

    /// Returned when two parameters share a name.
    #[error("duplicate parameter name '{0}'")]
    DuplicateParameter(String),

    /// Returned when a parameter space has no dimensions.
    #[error("parameter space must contain at least one parameter")]
    EmptySpace,

    /// Returned when a value refers to a parameter that is not in the space.
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    /// Returned when a value cannot be cast to its parameter's type.
    #[error("cannot cast value for '{name}': {reason}")]
    InvalidValue {
        /// The parameter name.
        name: String,
        /// Why the cast failed.
        reason: String,
    },

    /// Returned when a sampler cannot encode a parameter kind.
    #[error("parameter '{name}' of kind {kind} is not supported by {sampler}")]
    UnsupportedParameter {
        /// The parameter name.
        name: String,
        /// The parameter kind.
        kind: &'static str,
        /// The sampler that rejected it.
        sampler: &'static str,
    },

    /// Returned when the trial budget cannot even fill the initial simplex.
    #[error("trial budget {n_trials} is smaller than the minimum of {required} trials")]
    BudgetTooSmall {
        /// The configured number of trials.
        n_trials: usize,
        /// The minimum the sampler needs.
        required: usize,
    },

    /// Returned when settings fail validation.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Returned when a trial is asked to move along an edge the lifecycle does not have.
    #[error("illegal transition for trial {trial_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// The trial whose state was changed.
        trial_id: u64,
        /// The current state.
        from: TrialState,
        /// The requested state.
        to: TrialState,
    },

    /// Returned when a shrink candidate falls outside the search bounds.
    #[error("shrink candidate {vertex_id} lies outside the search bounds")]
    ShrinkOutOfBounds {
        /// Correlation id of the offending vertex.
        vertex_id: String,
    },

    /// Returned when a storage operation fails after retries.
    #[error("storage error: {0}")]
    Storage(String),

    /// Returned when a checkpoint is missing, unreadable, or incompatible.
    #[error("checkpoint error for trial {trial_id}: {reason}")]
    Checkpoint {
        /// The resume point that was requested.
        trial_id: u64,
        /// What went wrong.
        reason: String,
    },

    /// Returned when saved sampler state was written by an incompatible layout.
    #[error("sampler state version {found} is not supported (expected {expected})")]
    StateVersion {
        /// The version found in the saved state.
        found: u32,
        /// The version this build writes.
        expected: u32,
    },

    /// Returned when an execution backend fails to submit, poll, or stop a job.
    #[error("backend error: {0}")]
    Backend(String),

    /// Returned when an internal invariant is violated.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
