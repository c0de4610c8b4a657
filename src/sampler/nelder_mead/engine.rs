//! Pull-based Nelder-Mead simplex engine.
//!
//! The engine never evaluates anything itself. Each call to
//! [`search`](NelderMeadEngine::search) either hands out candidate vertices
//! that the caller must evaluate and report back through
//! [`add_result`](NelderMeadEngine::add_result), or returns an empty list
//! because results it already asked for are still outstanding. Results are
//! matched to vertices by correlation id, so they may arrive in any order.
//!
//! Values are always minimized internally; a maximizing engine negates
//! every incoming value.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rng_util::{self, SeededRng};
use crate::types::Direction;

/// Reflection coefficient.
pub const REFLECT: f64 = 1.0;
/// Expansion coefficient.
pub const EXPAND: f64 = 2.0;
/// Outside-contraction coefficient.
pub const OUTSIDE_CONTRACT: f64 = 0.5;
/// Inside-contraction coefficient.
pub const INSIDE_CONTRACT: f64 = -0.5;
/// Shrink coefficient.
pub const SHRINK: f64 = 0.5;

/// A point of the search plus its correlation id and, once known, its
/// internal (minimized) value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: String,
    pub coordinates: Vec<f64>,
    pub value: Option<f64>,
}

impl Vertex {
    /// The value, or `+inf` while unknown.
    fn score(&self) -> f64 {
        self.value.unwrap_or(f64::INFINITY)
    }
}

/// The active state of the engine.
///
/// Request stages emit candidates and move to their `Wait*` stage; wait
/// stages advance only once every pending vertex has a value; branch
/// stages decide where the iteration goes next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialize,
    WaitInitialize,
    Reflect,
    WaitReflect,
    ReflectBranch,
    Expand,
    WaitExpand,
    ExpandBranch,
    OutsideContract,
    WaitOutsideContract,
    OutsideContractBranch,
    InsideContract,
    WaitInsideContract,
    InsideContractBranch,
    Shrink,
    WaitShrink,
    /// The iteration limit was reached.
    Done,
}

/// The operation that closed an iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Initialize,
    Reflect,
    Expand,
    OutsideContract,
    InsideContract,
    Shrink,
}

/// One history entry per completed iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub iteration: usize,
    pub operation: Operation,
    /// Best internal value after the iteration.
    pub best: f64,
}

/// Builder for [`NelderMeadEngine`].
///
/// # Examples
///
/// ```
/// use tuner::sampler::nelder_mead::NelderMeadEngine;
///
/// let mut engine = NelderMeadEngine::builder(vec![(-5.0, 5.0), (-5.0, 5.0)])
///     .seed(42)
///     .initial_point(vec![Some(0.0), None])
///     .build()
///     .unwrap();
///
/// let candidates = engine.search().unwrap();
/// assert_eq!(candidates.len(), 3);
/// ```
#[derive(Clone, Debug)]
pub struct NelderMeadEngineBuilder {
    bounds: Vec<(f64, f64)>,
    direction: Direction,
    max_iterations: Option<usize>,
    seed: Option<u64>,
    initial_points: Vec<Vec<Option<f64>>>,
}

impl NelderMeadEngineBuilder {
    /// Maximize instead of minimize.
    #[must_use]
    pub fn maximize(mut self) -> Self {
        self.direction = Direction::Maximize;
        self
    }

    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Stop after this many completed iterations.
    #[must_use]
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Seed for random initial vertices and correlation ids.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Seeds the next simplex vertex; `None` coordinates are sampled.
    #[must_use]
    pub fn initial_point(mut self, point: Vec<Option<f64>>) -> Self {
        self.initial_points.push(point);
        self
    }

    #[must_use]
    pub fn initial_points(mut self, points: Vec<Vec<Option<f64>>>) -> Self {
        self.initial_points.extend(points);
        self
    }

    /// Validates the configuration and builds the engine.
    ///
    /// # Errors
    ///
    /// Fails on empty or inverted bounds, more initial points than simplex
    /// vertices, or an initial point of the wrong length or out of bounds.
    pub fn build(self) -> Result<NelderMeadEngine> {
        if self.bounds.is_empty() {
            return Err(Error::EmptySpace);
        }
        for (i, &(low, high)) in self.bounds.iter().enumerate() {
            if !(low <= high) || !low.is_finite() || !high.is_finite() {
                return Err(Error::InvalidBounds {
                    name: format!("x{i}"),
                    low,
                    high,
                });
            }
        }
        let n = self.bounds.len();
        if self.initial_points.len() > n + 1 {
            return Err(Error::InvalidSettings(format!(
                "{} initial points given for a simplex of {} vertices",
                self.initial_points.len(),
                n + 1
            )));
        }
        for point in &self.initial_points {
            let inside = point.len() == n
                && point
                    .iter()
                    .zip(&self.bounds)
                    .all(|(x, &(low, high))| x.is_none_or(|x| (low..=high).contains(&x)));
            if !inside {
                return Err(Error::InvalidSettings(format!(
                    "initial point {point:?} does not fit the bounds"
                )));
            }
        }

        Ok(NelderMeadEngine {
            bounds: self.bounds,
            maximize: self.direction == Direction::Maximize,
            max_iterations: self.max_iterations,
            initial_points: self.initial_points,
            stage: Stage::Initialize,
            simplex: Vec::new(),
            centroid: Vec::new(),
            reflected: None,
            pending: Vec::new(),
            iteration: 0,
            history: Vec::new(),
            rng: SeededRng::new(self.seed),
        })
    }
}

/// Nelder-Mead over a box-bounded real vector space.
///
/// The whole state serializes, so an engine can be checkpointed and
/// restored to continue with identical output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NelderMeadEngine {
    bounds: Vec<(f64, f64)>,
    maximize: bool,
    max_iterations: Option<usize>,
    initial_points: Vec<Vec<Option<f64>>>,
    stage: Stage,
    /// Sorted best-first after every completed iteration.
    simplex: Vec<Vertex>,
    centroid: Vec<f64>,
    reflected: Option<Vertex>,
    /// Vertices requested in the current stage, in request order.
    pending: Vec<Vertex>,
    iteration: usize,
    history: Vec<Step>,
    rng: SeededRng,
}

impl NelderMeadEngine {
    /// Starts a builder for an engine over `bounds` (one pair per dimension).
    #[must_use]
    pub fn builder(bounds: Vec<(f64, f64)>) -> NelderMeadEngineBuilder {
        NelderMeadEngineBuilder {
            bounds,
            direction: Direction::Minimize,
            max_iterations: None,
            seed: None,
            initial_points: Vec::new(),
        }
    }

    /// Number of dimensions.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.bounds.len()
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        if self.maximize {
            Direction::Maximize
        } else {
            Direction::Minimize
        }
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Completed iterations (initialization not included).
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The current simplex, best first. Empty until initialization completes.
    #[must_use]
    pub fn simplex(&self) -> &[Vertex] {
        &self.simplex
    }

    /// Vertices of the current request, with values attached as they arrive.
    #[must_use]
    pub fn pending(&self) -> &[Vertex] {
        &self.pending
    }

    #[must_use]
    pub fn history(&self) -> &[Step] {
        &self.history
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Reports the objective of a pending vertex.
    ///
    /// Returns `false` and changes nothing when `id` is not pending or
    /// already has a value, which absorbs late results from probes that
    /// were already decided.
    pub fn add_result(&mut self, id: &str, value: f64) -> bool {
        let value = if self.maximize { -value } else { value };
        self.attach(id, if value.is_nan() { f64::INFINITY } else { value })
    }

    /// Reports that evaluating a pending vertex failed; it scores as the
    /// worst possible value.
    pub fn add_failure(&mut self, id: &str) -> bool {
        self.attach(id, f64::INFINITY)
    }

    fn attach(&mut self, id: &str, value: f64) -> bool {
        match self
            .pending
            .iter_mut()
            .find(|v| v.id == id && v.value.is_none())
        {
            Some(vertex) => {
                vertex.value = Some(value);
                true
            }
            None => {
                trace_debug!(vertex_id = id, "ignoring result for a vertex that is not pending");
                false
            }
        }
    }

    /// Advances the state machine as far as the available results allow.
    ///
    /// Returns the vertices that must be evaluated now. An empty list means
    /// the engine is waiting for results it already requested (or is done);
    /// calling again without new results returns empty again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShrinkOutOfBounds`] if a shrink vertex leaves the
    /// bounds, which signals corrupted state.
    pub fn search(&mut self) -> Result<Vec<Vertex>> {
        loop {
            match self.stage {
                Stage::Initialize => {
                    let points = (0..=self.dimension())
                        .map(|k| self.initial_coordinates(k))
                        .collect();
                    let emitted = self.request(points, false)?;
                    self.stage = Stage::WaitInitialize;
                    if !emitted.is_empty() {
                        return Ok(emitted);
                    }
                }
                Stage::WaitInitialize => {
                    if !self.pending_complete() {
                        return Ok(Vec::new());
                    }
                    self.simplex = core::mem::take(&mut self.pending);
                    self.sort_simplex();
                    self.history.push(Step {
                        iteration: 0,
                        operation: Operation::Initialize,
                        best: self.simplex[0].score(),
                    });
                    self.stage = self.next_iteration_stage();
                }
                Stage::Reflect => {
                    self.centroid = self.compute_centroid();
                    let emitted = self.request_towards(REFLECT)?;
                    self.stage = Stage::WaitReflect;
                    if !emitted.is_empty() {
                        return Ok(emitted);
                    }
                }
                Stage::WaitReflect => {
                    if !self.pending_complete() {
                        return Ok(Vec::new());
                    }
                    self.reflected = self.pending.pop();
                    self.stage = Stage::ReflectBranch;
                }
                Stage::ReflectBranch => {
                    let n = self.dimension();
                    let fr = self.reflected_score();
                    let best = self.simplex[0].score();
                    let second_worst = self.simplex[n - 1].score();
                    let worst = self.simplex[n].score();

                    if best <= fr && fr < second_worst {
                        self.accept_reflected(Operation::Reflect)?;
                    } else if fr < best {
                        self.stage = Stage::Expand;
                    } else if fr < worst {
                        self.stage = Stage::OutsideContract;
                    } else {
                        self.stage = Stage::InsideContract;
                    }
                }
                Stage::Expand => {
                    let emitted = self.request_towards(EXPAND)?;
                    self.stage = Stage::WaitExpand;
                    if !emitted.is_empty() {
                        return Ok(emitted);
                    }
                }
                Stage::WaitExpand => {
                    if !self.pending_complete() {
                        return Ok(Vec::new());
                    }
                    self.stage = Stage::ExpandBranch;
                }
                Stage::ExpandBranch => {
                    let expanded = self.take_probe()?;
                    if expanded.score() < self.reflected_score() {
                        self.accept(expanded, Operation::Expand);
                    } else {
                        self.accept_reflected(Operation::Reflect)?;
                    }
                }
                Stage::OutsideContract => {
                    let emitted = self.request_towards(OUTSIDE_CONTRACT)?;
                    self.stage = Stage::WaitOutsideContract;
                    if !emitted.is_empty() {
                        return Ok(emitted);
                    }
                }
                Stage::WaitOutsideContract => {
                    if !self.pending_complete() {
                        return Ok(Vec::new());
                    }
                    self.stage = Stage::OutsideContractBranch;
                }
                Stage::OutsideContractBranch => {
                    let contracted = self.take_probe()?;
                    if contracted.score() <= self.reflected_score() {
                        self.accept(contracted, Operation::OutsideContract);
                    } else {
                        self.stage = Stage::Shrink;
                    }
                }
                Stage::InsideContract => {
                    let emitted = self.request_towards(INSIDE_CONTRACT)?;
                    self.stage = Stage::WaitInsideContract;
                    if !emitted.is_empty() {
                        return Ok(emitted);
                    }
                }
                Stage::WaitInsideContract => {
                    if !self.pending_complete() {
                        return Ok(Vec::new());
                    }
                    self.stage = Stage::InsideContractBranch;
                }
                Stage::InsideContractBranch => {
                    let contracted = self.take_probe()?;
                    let worst = self.simplex[self.dimension()].score();
                    if contracted.score() < worst {
                        self.accept(contracted, Operation::InsideContract);
                    } else {
                        self.stage = Stage::Shrink;
                    }
                }
                Stage::Shrink => {
                    self.reflected = None;
                    let best = self.simplex[0].coordinates.clone();
                    let points = self.simplex[1..]
                        .iter()
                        .map(|v| {
                            best.iter()
                                .zip(&v.coordinates)
                                .map(|(b, x)| b + SHRINK * (x - b))
                                .collect()
                        })
                        .collect();
                    let emitted = self.request(points, true)?;
                    self.stage = Stage::WaitShrink;
                    trace_debug!(iteration = self.iteration, "shrinking simplex");
                    if !emitted.is_empty() {
                        return Ok(emitted);
                    }
                }
                Stage::WaitShrink => {
                    if !self.pending_complete() {
                        return Ok(Vec::new());
                    }
                    let shrunk = core::mem::take(&mut self.pending);
                    self.simplex.truncate(1);
                    self.simplex.extend(shrunk);
                    self.finish_iteration(Operation::Shrink);
                }
                Stage::Done => return Ok(Vec::new()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn initial_coordinates(&mut self, k: usize) -> Vec<f64> {
        let seeded = self.initial_points.get(k).cloned();
        let rng = self.rng.get();
        self.bounds
            .iter()
            .enumerate()
            .map(|(i, &(low, high))| {
                seeded
                    .as_ref()
                    .and_then(|p| p[i])
                    .unwrap_or_else(|| rng_util::f64_range(rng, low, high))
            })
            .collect()
    }

    /// Registers new pending vertices and returns the ones to evaluate.
    ///
    /// Out-of-bounds vertices score `+inf` without being emitted; during a
    /// shrink they are an error instead.
    fn request(&mut self, points: Vec<Vec<f64>>, shrinking: bool) -> Result<Vec<Vertex>> {
        let mut emitted = Vec::with_capacity(points.len());
        for coordinates in points {
            let mut vertex = Vertex {
                id: self.rng.token(),
                coordinates,
                value: None,
            };
            if self.in_bounds(&vertex.coordinates) {
                emitted.push(vertex.clone());
            } else if shrinking {
                return Err(Error::ShrinkOutOfBounds {
                    vertex_id: vertex.id,
                });
            } else {
                trace_debug!(vertex_id = %vertex.id, stage = ?self.stage, "vertex out of bounds");
                vertex.value = Some(f64::INFINITY);
            }
            self.pending.push(vertex);
        }
        Ok(emitted)
    }

    /// Requests `centroid + coefficient * (centroid - worst)`.
    fn request_towards(&mut self, coefficient: f64) -> Result<Vec<Vertex>> {
        let worst = &self.simplex[self.dimension()].coordinates;
        let point = self
            .centroid
            .iter()
            .zip(worst)
            .map(|(c, w)| c + coefficient * (c - w))
            .collect();
        self.request(vec![point], false)
    }

    fn in_bounds(&self, x: &[f64]) -> bool {
        x.iter()
            .zip(&self.bounds)
            .all(|(x, &(low, high))| (low..=high).contains(x))
    }

    fn pending_complete(&self) -> bool {
        self.pending.iter().all(|v| v.value.is_some())
    }

    /// Mean of every vertex except the worst.
    #[allow(clippy::cast_precision_loss)]
    fn compute_centroid(&self) -> Vec<f64> {
        let n = self.dimension();
        let mut centroid = vec![0.0; n];
        for vertex in &self.simplex[..n] {
            for (c, x) in centroid.iter_mut().zip(&vertex.coordinates) {
                *c += x;
            }
        }
        for c in &mut centroid {
            *c /= n as f64;
        }
        centroid
    }

    fn reflected_score(&self) -> f64 {
        self.reflected.as_ref().map_or(f64::INFINITY, Vertex::score)
    }

    fn take_probe(&mut self) -> Result<Vertex> {
        self.pending
            .pop()
            .ok_or(Error::Internal("branch stage without a pending probe"))
    }

    fn accept_reflected(&mut self, operation: Operation) -> Result<()> {
        let reflected = self
            .reflected
            .take()
            .ok_or(Error::Internal("no reflected vertex to accept"))?;
        self.accept(reflected, operation);
        Ok(())
    }

    /// Replaces the worst vertex and closes the iteration.
    fn accept(&mut self, vertex: Vertex, operation: Operation) {
        let n = self.dimension();
        self.simplex[n] = vertex;
        self.reflected = None;
        self.pending.clear();
        self.finish_iteration(operation);
    }

    fn finish_iteration(&mut self, operation: Operation) {
        self.sort_simplex();
        self.iteration += 1;
        let best = self.simplex[0].score();
        self.history.push(Step {
            iteration: self.iteration,
            operation,
            best,
        });
        trace_debug!(iteration = self.iteration, ?operation, best, "simplex iteration accepted");
        self.stage = self.next_iteration_stage();
    }

    fn next_iteration_stage(&self) -> Stage {
        match self.max_iterations {
            Some(max) if self.iteration >= max => Stage::Done,
            _ => Stage::Reflect,
        }
    }

    fn sort_simplex(&mut self) {
        self.simplex.sort_by(|a, b| a.score().total_cmp(&b.score()));
    }
}
