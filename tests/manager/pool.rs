use std::sync::Arc;
use std::time::Duration;

use tuner::backend::WorkerPool;
use tuner::param::Params;
use tuner::sampler::NelderMeadSampler;
use tuner::storage::{MemoryLedger, TrialLedger};
use tuner::{Manager, TrialState};

use crate::{bowl, line, plane, value};

#[test]
fn pooled_evaluation_converges_on_a_bowl() {
    let pool = WorkerPool::new(
        |p: &Params| -> Result<f64, String> { bowl(p).ok_or_else(|| "missing x".to_string()) },
        3,
    )
    .unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let mut manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).seed(17).build().unwrap())
        .ledger(ledger.clone())
        .pool(pool)
        .n_trials(80)
        .max_workers(3)
        .poll_interval(Duration::from_millis(1))
        .build()
        .unwrap();

    let summary = manager.run().unwrap();

    assert_eq!(summary.completed, 80);
    let trials = ledger.trials().unwrap();
    assert_eq!(trials.len(), 80);
    assert!(trials.iter().all(|t| t.state == TrialState::Success));

    let first = trials[..3]
        .iter()
        .map(|t| t.objective.as_ref().unwrap()[0])
        .fold(f64::INFINITY, f64::min);
    let best = summary.best.unwrap().objective.unwrap()[0];
    assert!(best <= first);
    assert!(best < 1.0, "best objective {best}");
}

#[test]
fn pooled_failures_and_timeouts_are_recorded() {
    let pool = WorkerPool::new(
        |p: &Params| -> Result<f64, String> {
            let x = value(p, "x");
            if x < -1.0 {
                std::thread::sleep(Duration::from_millis(300));
            }
            if x < 0.0 {
                return Err(format!("negative x {x}"));
            }
            Ok(x)
        },
        2,
    )
    .unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let mut manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(line()).seed(2).build().unwrap())
        .ledger(ledger.clone())
        .pool(pool)
        .n_trials(12)
        .max_workers(2)
        .job_timeout(Duration::from_millis(100))
        .poll_interval(Duration::from_millis(2))
        .build()
        .unwrap();

    let summary = manager.run().unwrap();
    assert_eq!(summary.completed, 12);

    for trial in ledger.trials().unwrap() {
        let x = value(&trial.params, "x");
        match trial.state {
            TrialState::Success => assert_eq!(trial.objective.unwrap(), vec![x]),
            TrialState::Failure => {
                assert!(trial.error.unwrap().starts_with("negative x"));
            }
            TrialState::Timeout => {
                // Only the slow evaluations; waiting for a worker is not charged.
                assert!(x < -1.0, "fast trial {} timed out", trial.trial_id);
                assert_eq!(trial.error.as_deref(), Some("evaluation timed out"));
            }
            other => panic!("trial {} left in {other}", trial.trial_id),
        }
    }
}
