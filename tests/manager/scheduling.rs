use std::sync::Arc;
use std::time::Duration;

use tuner::sampler::NelderMeadSampler;
use tuner::storage::{MemoryLedger, TrialLedger};
use tuner::{Manager, Tick, TrialState};

use crate::{InstantBackend, bowl, line, plane};

#[test]
fn runs_to_budget_without_overshooting() {
    let ledger = Arc::new(MemoryLedger::new());
    let mut manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).seed(1).build().unwrap())
        .ledger(ledger.clone())
        .backend(InstantBackend::new(bowl))
        .n_trials(30)
        .max_workers(3)
        .poll_interval(Duration::ZERO)
        .build()
        .unwrap();

    let summary = manager.run().unwrap();

    assert_eq!(summary.completed, 30);
    let trials = ledger.trials().unwrap();
    assert_eq!(trials.len(), 30);
    for (expected, trial) in trials.iter().enumerate() {
        assert_eq!(trial.trial_id, expected as u64);
        assert_eq!(trial.state, TrialState::Success);
        assert!(trial.start_time.is_some() && trial.end_time.is_some());
    }

    let best = summary.best.unwrap();
    let lowest = trials
        .iter()
        .filter_map(|t| t.objective.as_ref().map(|o| o[0]))
        .fold(f64::INFINITY, f64::min);
    assert_eq!(best.objective.unwrap()[0], lowest);
}

#[test]
fn never_exceeds_worker_capacity() {
    let ledger = Arc::new(MemoryLedger::new());
    let mut manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).seed(2).build().unwrap())
        .ledger(ledger.clone())
        .backend(InstantBackend::new(bowl))
        .n_trials(20)
        .max_workers(2)
        .build()
        .unwrap();

    for _ in 0..500 {
        let tick = manager.tick().unwrap();
        let occupied = ledger.get_ready().unwrap().len() + ledger.get_running().unwrap().len();
        assert!(occupied <= 2, "{occupied} trials occupy workers");
        assert!(manager.in_flight() <= 2);
        if tick == Tick::Done {
            break;
        }
    }
    assert_eq!(manager.completed(), 20);
}

#[test]
fn failed_trials_do_not_stop_the_loop() {
    fn positive_only(params: &tuner::param::Params) -> Option<f64> {
        let x = crate::value(params, "x");
        (x >= 0.0).then_some((x - 1.0).powi(2))
    }

    let ledger = Arc::new(MemoryLedger::new());
    let mut manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(line()).seed(9).build().unwrap())
        .ledger(ledger.clone())
        .backend(InstantBackend::new(positive_only))
        .n_trials(25)
        .max_workers(2)
        .poll_interval(Duration::ZERO)
        .build()
        .unwrap();

    let summary = manager.run().unwrap();
    assert_eq!(summary.completed, 25);

    for trial in ledger.trials().unwrap() {
        let x = crate::value(&trial.params, "x");
        if x < 0.0 {
            assert_eq!(trial.state, TrialState::Failure);
            assert!(trial.objective.is_none());
            assert_eq!(trial.error.as_deref(), Some("exit code 1"));
        } else {
            assert_eq!(trial.state, TrialState::Success);
        }
    }
    if let Some(best) = summary.best {
        assert_eq!(best.state, TrialState::Success);
    }
}

#[test]
fn stops_when_the_search_is_exhausted() {
    let ledger = Arc::new(MemoryLedger::new());
    let sampler = NelderMeadSampler::builder(plane())
        .seed(4)
        .max_iterations(2)
        .build()
        .unwrap();
    let mut manager = Manager::builder()
        .sampler(sampler)
        .ledger(ledger.clone())
        .backend(InstantBackend::new(bowl))
        .n_trials(1000)
        .max_workers(4)
        .poll_interval(Duration::ZERO)
        .build()
        .unwrap();

    let summary = manager.run().unwrap();

    assert!(summary.completed < 1000);
    assert_eq!(summary.completed, ledger.trials().unwrap().len());
    assert!(ledger.get_ready().unwrap().is_empty());
    assert!(ledger.get_running().unwrap().is_empty());
    assert!(manager.sampler().min_trials() <= summary.completed);
}

#[test]
fn maximize_picks_the_largest_objective() {
    fn hill(params: &tuner::param::Params) -> Option<f64> {
        bowl(params).map(|v| -v)
    }

    let sampler = NelderMeadSampler::builder(plane())
        .seed(5)
        .direction(tuner::Direction::Maximize)
        .build()
        .unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    let mut manager = Manager::builder()
        .maximize()
        .sampler(sampler)
        .ledger(ledger.clone())
        .backend(InstantBackend::new(hill))
        .n_trials(40)
        .max_workers(3)
        .poll_interval(Duration::ZERO)
        .build()
        .unwrap();

    let best = manager.run().unwrap().best.unwrap().objective.unwrap()[0];
    let highest = ledger
        .trials()
        .unwrap()
        .iter()
        .filter_map(|t| t.objective.as_ref().map(|o| o[0]))
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(best, highest);

    let first_three = ledger.trials().unwrap()[..3]
        .iter()
        .filter_map(|t| t.objective.as_ref().map(|o| o[0]))
        .fold(f64::NEG_INFINITY, f64::max);
    assert!(best >= first_three);
}
