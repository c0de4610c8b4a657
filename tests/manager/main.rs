#![allow(clippy::cast_precision_loss)]

mod abort;
mod backends;
mod builder;
#[cfg(feature = "pool")]
mod pool;
mod resume;
mod scheduling;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tuner::backend::{ExecutionBackend, JobHandle, JobStatus, Outcome};
use tuner::param::{ParamValue, Params};
use tuner::parameter::{ParamSpec, ParameterSpace};
use tuner::{Error, Result};

fn temp_dir(label: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    std::env::temp_dir().join(format!(
        "tuner_{label}_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

fn line() -> ParameterSpace {
    ParameterSpace::new(vec![ParamSpec::float("x", -2.0, 2.0)]).unwrap()
}

fn plane() -> ParameterSpace {
    ParameterSpace::new(vec![
        ParamSpec::float("x", -5.0, 5.0),
        ParamSpec::float("y", -5.0, 5.0),
    ])
    .unwrap()
}

fn value(params: &Params, name: &str) -> f64 {
    params.get(name).and_then(ParamValue::as_f64).unwrap()
}

fn bowl(params: &Params) -> Option<f64> {
    let x = params.get("x").and_then(ParamValue::as_f64)?;
    let y = params.get("y").and_then(ParamValue::as_f64).unwrap_or(0.0);
    Some((x - 0.3).powi(2) + (y + 1.0).powi(2))
}

/// Backend whose jobs finish the moment they are first polled.
struct InstantBackend {
    objective: fn(&Params) -> Option<f64>,
    submitted: HashMap<u64, Params>,
}

impl InstantBackend {
    fn new(objective: fn(&Params) -> Option<f64>) -> Self {
        Self {
            objective,
            submitted: HashMap::new(),
        }
    }
}

impl ExecutionBackend for InstantBackend {
    fn name(&self) -> &'static str {
        "instant"
    }

    fn submit(&mut self, trial_id: u64, params: &Params) -> Result<JobHandle> {
        self.submitted.insert(trial_id, params.clone());
        Ok(JobHandle {
            trial_id,
            id: format!("instant-{trial_id}"),
        })
    }

    fn poll(&mut self, handle: &JobHandle) -> Result<JobStatus> {
        let params = self
            .submitted
            .get(&handle.trial_id)
            .ok_or_else(|| Error::Backend(format!("unknown job {}", handle.id)))?;
        let objective = (self.objective)(params);
        Ok(JobStatus::Exited(Outcome {
            exit_code: Some(if objective.is_some() { 0 } else { 1 }),
            objective: objective.map(|v| vec![v]),
            ..Outcome::default()
        }))
    }

    fn force_stop(&mut self, _handle: &JobHandle) -> Result<()> {
        Ok(())
    }
}
