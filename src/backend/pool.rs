use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::param::Params;

/// An objective evaluated in-process by a [`WorkerPool`].
///
/// Implemented for every `Fn(&Params) -> Result<f64, E>` closure whose error
/// type implements `Display`.
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluates one parameter set. An `Err` marks the trial failed.
    ///
    /// # Errors
    ///
    /// Returns the failure message for the trial.
    fn evaluate(&self, params: &Params) -> core::result::Result<f64, String>;
}

impl<F, E> Evaluator for F
where
    F: Fn(&Params) -> core::result::Result<f64, E> + Send + Sync + 'static,
    E: core::fmt::Display,
{
    fn evaluate(&self, params: &Params) -> core::result::Result<f64, String> {
        self(params).map_err(|e| e.to_string())
    }
}

/// How a pooled evaluation ended.
#[derive(Clone, Debug, PartialEq)]
pub enum PoolCompletion {
    Success(Vec<f64>),
    Failure(String),
    /// The evaluation outlived the timeout; its late result is discarded.
    Timeout,
}

type Evaluation = JoinHandle<core::result::Result<f64, String>>;

struct Task {
    handle: Evaluation,
    /// Set by the worker thread when the evaluation actually begins.
    started: Arc<OnceLock<Instant>>,
}

impl Task {
    fn timed_out(&self, timeout: Option<Duration>) -> bool {
        match (timeout, self.started.get()) {
            (Some(limit), Some(started)) => started.elapsed() > limit,
            _ => false,
        }
    }
}

/// Fixed-size pool that evaluates trials on tokio's blocking threads.
///
/// Trials bypass the per-job state machine: [`dispatch`](Self::dispatch)
/// hands one to a worker, [`harvest`](Self::harvest) collects whatever has
/// completed without waiting for the rest.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    evaluator: Arc<dyn Evaluator>,
    workers: usize,
    tasks: BTreeMap<u64, Task>,
    /// Timed-out evaluations whose threads are still running.
    stranded: Vec<Evaluation>,
}

impl WorkerPool {
    /// Starts a pool of `workers` blocking threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the runtime cannot be created.
    pub fn new(evaluator: impl Evaluator, workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("tuner-pool")
            .build()
            .map_err(|e| Error::Backend(format!("failed to start worker pool: {e}")))?;
        Ok(Self {
            runtime: Some(runtime),
            evaluator: Arc::new(evaluator),
            workers,
            tasks: BTreeMap::new(),
            stranded: Vec::new(),
        })
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Evaluations dispatched and not yet harvested.
    #[must_use]
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Whether a worker is free. Threads still stuck in a timed-out
    /// evaluation count as busy until they return.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        let stranded = self.stranded.iter().filter(|h| !h.is_finished()).count();
        self.tasks.len() + stranded < self.workers
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime
            .as_ref()
            .ok_or(Error::Internal("worker pool runtime already shut down"))
    }

    /// Hands `params` to a worker.
    ///
    /// # Errors
    ///
    /// Fails only if the pool has been shut down.
    pub fn dispatch(&mut self, trial_id: u64, params: Params) -> Result<()> {
        let evaluator = Arc::clone(&self.evaluator);
        let started = Arc::new(OnceLock::new());
        let clock = Arc::clone(&started);
        let handle = self.runtime()?.spawn_blocking(move || {
            let _ = clock.set(Instant::now());
            evaluator.evaluate(&params)
        });
        self.tasks.insert(trial_id, Task { handle, started });
        Ok(())
    }

    /// Collects completed and timed-out evaluations without blocking on
    /// running ones.
    ///
    /// # Errors
    ///
    /// Fails only if the pool has been shut down.
    pub fn harvest(&mut self, timeout: Option<Duration>) -> Result<Vec<(u64, PoolCompletion)>> {
        self.stranded.retain(|h| !h.is_finished());
        let ready: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.handle.is_finished() || task.timed_out(timeout))
            .map(|(&id, _)| id)
            .collect();

        let mut completions = Vec::with_capacity(ready.len());
        for trial_id in ready {
            let Some(task) = self.tasks.remove(&trial_id) else {
                continue;
            };
            if !task.handle.is_finished() {
                // Blocking work cannot be interrupted; the thread runs on and
                // its result is dropped.
                task.handle.abort();
                self.stranded.push(task.handle);
                completions.push((trial_id, PoolCompletion::Timeout));
                continue;
            }
            let completion = match self.runtime()?.block_on(task.handle) {
                Ok(Ok(value)) => PoolCompletion::Success(vec![value]),
                Ok(Err(message)) => PoolCompletion::Failure(message),
                Err(e) => PoolCompletion::Failure(format!("evaluation panicked: {e}")),
            };
            completions.push((trial_id, completion));
        }
        Ok(completions)
    }

    /// Forgets every in-flight evaluation and returns their trial ids.
    pub fn abandon(&mut self) -> Vec<u64> {
        let tasks = core::mem::take(&mut self.tasks);
        tasks
            .into_iter()
            .map(|(id, task)| {
                task.handle.abort();
                id
            })
            .collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamValue;

    fn harvest_all(pool: &mut WorkerPool, timeout: Option<Duration>) -> Vec<(u64, PoolCompletion)> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut done = Vec::new();
        while pool.active() > 0 && Instant::now() < deadline {
            done.extend(pool.harvest(timeout).unwrap());
            std::thread::sleep(Duration::from_millis(5));
        }
        done.sort_by_key(|(id, _)| *id);
        done
    }

    fn x(value: f64) -> Params {
        [("x", ParamValue::Float(value))].into_iter().collect()
    }

    #[test]
    fn evaluates_in_parallel_and_harvests() {
        let mut pool = WorkerPool::new(
            |p: &Params| -> core::result::Result<f64, String> {
                let x = p.get("x").and_then(ParamValue::as_f64).ok_or("missing x")?;
                if x < 0.0 {
                    return Err(format!("negative x {x}"));
                }
                Ok(x * 2.0)
            },
            2,
        )
        .unwrap();

        pool.dispatch(0, x(1.5)).unwrap();
        pool.dispatch(1, x(-1.0)).unwrap();
        assert!(!pool.has_capacity());

        let done = harvest_all(&mut pool, None);
        assert_eq!(
            done,
            vec![
                (0, PoolCompletion::Success(vec![3.0])),
                (1, PoolCompletion::Failure("negative x -1".to_string())),
            ]
        );
        assert!(pool.has_capacity());
    }

    #[test]
    fn slow_evaluations_time_out() {
        let mut pool = WorkerPool::new(
            |_: &Params| -> core::result::Result<f64, String> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(0.0)
            },
            1,
        )
        .unwrap();

        pool.dispatch(5, x(0.0)).unwrap();
        let done = harvest_all(&mut pool, Some(Duration::from_millis(20)));
        assert_eq!(done, vec![(5, PoolCompletion::Timeout)]);
    }

    fn sleepy(p: &Params) -> core::result::Result<f64, String> {
        let millis = p.get("x").and_then(ParamValue::as_f64).ok_or("missing x")?;
        std::thread::sleep(Duration::from_secs_f64(millis / 1000.0));
        Ok(millis)
    }

    #[test]
    fn queued_evaluations_are_timed_from_their_start() {
        let mut pool = WorkerPool::new(sleepy, 1).unwrap();
        pool.dispatch(0, x(600.0)).unwrap();
        pool.dispatch(1, x(5.0)).unwrap();

        let done = harvest_all(&mut pool, Some(Duration::from_millis(100)));
        assert_eq!(
            done,
            vec![(0, PoolCompletion::Timeout), (1, PoolCompletion::Success(vec![5.0]))]
        );
    }

    #[test]
    fn stuck_threads_hold_their_worker() {
        let mut pool = WorkerPool::new(sleepy, 1).unwrap();
        pool.dispatch(0, x(400.0)).unwrap();
        let done = harvest_all(&mut pool, Some(Duration::from_millis(50)));
        assert_eq!(done, vec![(0, PoolCompletion::Timeout)]);
        assert_eq!(pool.active(), 0);
        assert!(!pool.has_capacity());

        let deadline = Instant::now() + Duration::from_secs(10);
        while !pool.has_capacity() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(pool.has_capacity());
        pool.dispatch(1, x(5.0)).unwrap();
        let done = harvest_all(&mut pool, Some(Duration::from_millis(50)));
        assert_eq!(done, vec![(1, PoolCompletion::Success(vec![5.0]))]);
    }

    #[test]
    fn panics_become_failures() {
        let mut pool = WorkerPool::new(
            |_: &Params| -> core::result::Result<f64, String> { panic!("boom") },
            1,
        )
        .unwrap();
        pool.dispatch(0, x(0.0)).unwrap();
        let done = harvest_all(&mut pool, None);
        assert!(matches!(&done[0].1, PoolCompletion::Failure(m) if m.contains("panicked")));
    }
}
