#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]

//! Black-box hyperparameter tuning driven by an asynchronous Nelder-Mead
//! simplex search. Trials are proposed by a sampler, executed as local
//! processes, batch-queue jobs, or in-process pool evaluations, tracked
//! through a small lifecycle state machine, and recorded in a durable
//! ledger with per-trial checkpoints so an interrupted run can resume.
//!
//! # Getting Started
//!
//! ```
//! use tuner::prelude::*;
//!
//! let space = ParameterSpace::new(vec![
//!     ParamSpec::float("x", -5.0, 5.0),
//!     ParamSpec::float("y", -5.0, 5.0),
//! ])
//! .unwrap();
//! let sampler = NelderMeadSampler::builder(space).seed(3).build().unwrap();
//!
//! let pool = WorkerPool::new(
//!     |p: &Params| -> Result<f64> {
//!         let x = p.get("x").and_then(ParamValue::as_f64).unwrap_or_default();
//!         let y = p.get("y").and_then(ParamValue::as_f64).unwrap_or_default();
//!         Ok((x - 1.0).powi(2) + (y + 2.0).powi(2))
//!     },
//!     2,
//! )
//! .unwrap();
//!
//! let mut manager = Manager::builder()
//!     .sampler(sampler)
//!     .pool(pool)
//!     .n_trials(40)
//!     .max_workers(2)
//!     .poll_interval(std::time::Duration::from_millis(1))
//!     .build()
//!     .unwrap();
//!
//! let summary = manager.run().unwrap();
//! assert_eq!(summary.completed, 40);
//! assert!(summary.best.is_some());
//! ```
//!
//! # Core Concepts
//!
//! | Type | Role |
//! |------|------|
//! | [`Manager`] | The single-threaded scheduling loop: propose, dispatch, poll, record. |
//! | [`NelderMeadEngine`](sampler::nelder_mead::NelderMeadEngine) | Pull-based simplex search that never blocks on evaluations. |
//! | [`Sampler`](sampler::Sampler) | Turns engine candidates into ledger trials and feeds results back. |
//! | [`Job`](job::Job) | Per-trial lifecycle: `ready -> running -> finished -> success / failure / timeout`. |
//! | [`ExecutionBackend`](backend::ExecutionBackend) | Submit, poll, and force-stop for local processes or batch queues. |
//! | [`TrialLedger`](storage::TrialLedger) | The shared, durable trial record. |
//! | [`CheckpointStore`](checkpoint::CheckpointStore) | Sampler snapshots keyed by trial id, used by resume. |
//!
//! # Feature Flags
//!
//! | Flag | What it enables | Default |
//! |------|----------------|---------|
//! | `tracing` | Structured log events via [`tracing`](https://docs.rs/tracing) | on |
//! | `pool` | [`WorkerPool`](backend::WorkerPool), in-process evaluation on tokio's blocking threads | on |

/// Emit a `tracing::info!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_info {
    ($($arg:tt)*) => {};
}

/// Emit a `tracing::debug!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug {
    ($($arg:tt)*) => {};
}

/// Emit a `tracing::warn!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn {
    ($($arg:tt)*) => {};
}

pub mod backend;
pub mod checkpoint;
pub mod config;
mod error;
pub mod job;
mod manager;
pub mod param;
pub mod parameter;
mod rng_util;
pub mod sampler;
pub mod storage;
mod types;

pub use config::{BackendSettings, Settings};
pub use error::{Error, Result};
pub use manager::{Manager, ManagerBuilder, RunSummary, Tick};
pub use types::{Direction, TrialState};

/// Convenient wildcard import for the most common types.
///
/// ```
/// use tuner::prelude::*;
/// ```
pub mod prelude {
    #[cfg(feature = "pool")]
    pub use crate::backend::{Evaluator, WorkerPool};
    pub use crate::backend::{
        ArgStyle, BatchBackend, BatchOptions, ExecutionBackend, Invocation, LocalBackend,
    };
    pub use crate::checkpoint::CheckpointStore;
    pub use crate::config::{BackendSettings, Settings};
    pub use crate::error::{Error, Result};
    pub use crate::manager::{Manager, ManagerBuilder, RunSummary, Tick};
    pub use crate::param::{ParamValue, Params};
    pub use crate::parameter::{ParamSpec, ParameterSpace};
    pub use crate::sampler::{NelderMeadSampler, Sampler};
    pub use crate::storage::{JournalLedger, MemoryLedger, TrialLedger, TrialRecord};
    pub use crate::types::{Direction, TrialState};
}
