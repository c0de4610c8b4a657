//! Nelder-Mead simplex sampler.
//!
//! [`NelderMeadEngine`] does the numerical work on a real vector;
//! [`NelderMeadSampler`] adapts it to a [`ParameterSpace`] and a
//! [`TrialLedger`]. Each candidate vertex becomes one trial, and the trial id
//! is mapped back to the vertex's correlation id when its result lands.
//!
//! Failed and timed-out trials score as the worst possible value, the same
//! as out-of-bounds vertices.
//!
//! # Examples
//!
//! ```
//! use tuner::parameter::{ParamSpec, ParameterSpace};
//! use tuner::sampler::{Generation, NelderMeadSampler, Sampler};
//! use tuner::storage::MemoryLedger;
//!
//! let space = ParameterSpace::new(vec![
//!     ParamSpec::float("x", -5.0, 5.0),
//!     ParamSpec::int("n", 1, 10),
//! ])
//! .unwrap();
//! let mut sampler = NelderMeadSampler::builder(space).seed(1).build().unwrap();
//!
//! let ledger = MemoryLedger::new();
//! assert_eq!(sampler.generate(&ledger).unwrap(), Generation::Registered(0));
//! ```

mod engine;

use std::collections::{BTreeMap, VecDeque};

pub use engine::{
    EXPAND, INSIDE_CONTRACT, NelderMeadEngine, NelderMeadEngineBuilder, OUTSIDE_CONTRACT,
    Operation, REFLECT, SHRINK, Stage, Step, Vertex,
};
use serde::{Deserialize, Serialize};

use super::{Generation, Sampler};
use crate::error::{Error, Result};
use crate::parameter::ParameterSpace;
use crate::storage::TrialLedger;
use crate::types::{Direction, TrialState};

/// Layout version of [`NelderMeadSampler::snapshot`].
const STATE_VERSION: u32 = 1;

/// Builder for [`NelderMeadSampler`].
pub struct NelderMeadSamplerBuilder {
    space: ParameterSpace,
    direction: Direction,
    seed: Option<u64>,
    max_iterations: Option<usize>,
}

impl NelderMeadSamplerBuilder {
    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Stop proposing after this many simplex iterations.
    #[must_use]
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Builds the sampler.
    ///
    /// # Errors
    ///
    /// Fails if the space holds a categorical dimension or carries more
    /// initial points than the simplex has vertices.
    pub fn build(self) -> Result<NelderMeadSampler> {
        self.space.require_numeric("nelder-mead")?;
        let mut engine = NelderMeadEngine::builder(self.space.internal_bounds()?)
            .direction(self.direction)
            .initial_points(self.space.initial_points()?);
        if let Some(seed) = self.seed {
            engine = engine.seed(seed);
        }
        if let Some(max) = self.max_iterations {
            engine = engine.max_iterations(max);
        }
        Ok(NelderMeadSampler {
            space: self.space,
            state: State {
                version: STATE_VERSION,
                engine: engine.build()?,
                queue: VecDeque::new(),
                in_flight: BTreeMap::new(),
            },
        })
    }
}

/// Everything that has to survive a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct State {
    version: u32,
    engine: NelderMeadEngine,
    /// Candidates handed out by the engine but not yet registered as trials.
    queue: VecDeque<Vertex>,
    /// Registered trials whose result the engine is still waiting for.
    in_flight: BTreeMap<u64, String>,
}

/// Nelder-Mead proposal strategy over a numeric [`ParameterSpace`].
pub struct NelderMeadSampler {
    space: ParameterSpace,
    state: State,
}

impl NelderMeadSampler {
    /// Starts a builder; defaults to minimizing with a random seed.
    #[must_use]
    pub fn builder(space: ParameterSpace) -> NelderMeadSamplerBuilder {
        NelderMeadSamplerBuilder {
            space,
            direction: Direction::Minimize,
            seed: None,
            max_iterations: None,
        }
    }

    #[must_use]
    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    /// The underlying engine, for introspection.
    #[must_use]
    pub fn engine(&self) -> &NelderMeadEngine {
        &self.state.engine
    }

    /// Trial ids proposed by this sampler whose results are outstanding.
    pub fn in_flight(&self) -> impl Iterator<Item = u64> + '_ {
        self.state.in_flight.keys().copied()
    }
}

impl Sampler for NelderMeadSampler {
    fn name(&self) -> &'static str {
        "nelder-mead"
    }

    fn direction(&self) -> Direction {
        self.state.engine.direction()
    }

    fn min_trials(&self) -> usize {
        self.space.len() + 1
    }

    fn generate(&mut self, ledger: &dyn TrialLedger) -> Result<Generation> {
        if self.state.queue.is_empty() {
            let candidates = self.state.engine.search()?;
            self.state.queue.extend(candidates);
        }
        let Some(vertex) = self.state.queue.pop_front() else {
            return Ok(if self.state.engine.is_finished() {
                Generation::Exhausted
            } else {
                Generation::Waiting
            });
        };

        let params = self.space.from_internal(&vertex.coordinates)?;
        let trial_id = ledger.next_trial_id()?;
        ledger.register(trial_id, &params)?;
        self.state.in_flight.insert(trial_id, vertex.id);

        trace_debug!(trial_id, stage = ?self.state.engine.stage(), "trial registered");
        Ok(Generation::Registered(trial_id))
    }

    fn check_result(&mut self, ledger: &dyn TrialLedger) -> Result<()> {
        let mut done = Vec::new();
        for (&trial_id, vertex_id) in &self.state.in_flight {
            let Some(record) = ledger.trial(trial_id)? else {
                continue;
            };
            match record.state {
                TrialState::Success => {
                    match record.objective.as_deref().and_then(<[f64]>::first) {
                        Some(&value) => self.state.engine.add_result(vertex_id, value),
                        None => self.state.engine.add_failure(vertex_id),
                    };
                }
                TrialState::Failure | TrialState::Timeout => {
                    self.state.engine.add_failure(vertex_id);
                }
                TrialState::Ready | TrialState::Running | TrialState::Finished => continue,
            }
            done.push(trial_id);
        }
        for trial_id in done {
            self.state.in_flight.remove(&trial_id);
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, state: serde_json::Value) -> Result<()> {
        let state: State = serde_json::from_value(state)?;
        if state.version != STATE_VERSION {
            return Err(Error::StateVersion {
                found: state.version,
                expected: STATE_VERSION,
            });
        }
        if state.engine.dimension() != self.space.len() {
            return Err(Error::InvalidSettings(format!(
                "saved simplex has {} dimensions but the space has {}",
                state.engine.dimension(),
                self.space.len()
            )));
        }
        self.state = state;
        Ok(())
    }
}
