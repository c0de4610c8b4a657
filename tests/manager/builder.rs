use std::sync::Arc;

use tuner::sampler::NelderMeadSampler;
use tuner::storage::{MemoryLedger, TrialLedger};
use tuner::{Direction, Error, Manager, TrialState};

use crate::{InstantBackend, bowl, plane};

#[test]
fn budget_must_cover_the_first_simplex() {
    let result = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).build().unwrap())
        .backend(InstantBackend::new(bowl))
        .n_trials(2)
        .build();
    assert!(matches!(
        result,
        Err(Error::BudgetTooSmall {
            n_trials: 2,
            required: 3
        })
    ));
}

#[test]
fn sampler_and_executor_are_required() {
    let no_sampler = Manager::builder().backend(InstantBackend::new(bowl)).build();
    assert!(matches!(no_sampler, Err(Error::InvalidSettings(_))));

    let no_backend = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).build().unwrap())
        .build();
    assert!(matches!(no_backend, Err(Error::InvalidSettings(_))));

    let no_workers = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).build().unwrap())
        .backend(InstantBackend::new(bowl))
        .max_workers(0)
        .build();
    assert!(matches!(no_workers, Err(Error::InvalidSettings(_))));
}

#[test]
fn active_rows_without_a_resume_point_are_rejected() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_state(0, TrialState::Success).unwrap();
    ledger.set_state(1, TrialState::Running).unwrap();

    let result = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).build().unwrap())
        .ledger(ledger)
        .backend(InstantBackend::new(bowl))
        .build();
    assert!(matches!(result, Err(Error::InvalidSettings(_))));
}

#[test]
fn ready_rows_without_a_resume_point_are_rejected() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_state(0, TrialState::Success).unwrap();
    ledger.set_state(1, TrialState::Ready).unwrap();

    let result = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).build().unwrap())
        .ledger(ledger)
        .backend(InstantBackend::new(bowl))
        .build();
    assert!(matches!(result, Err(Error::InvalidSettings(_))));
}

#[test]
fn direction_comes_from_the_sampler() {
    let maximizing = || {
        NelderMeadSampler::builder(plane())
            .direction(Direction::Maximize)
            .build()
            .unwrap()
    };

    let mismatched = Manager::builder()
        .minimize()
        .sampler(maximizing())
        .backend(InstantBackend::new(bowl))
        .build();
    assert!(matches!(mismatched, Err(Error::InvalidSettings(_))));

    let ledger = Arc::new(MemoryLedger::new());
    for (id, value) in [(0, 1.0), (1, 5.0), (2, 3.0)] {
        ledger.set_objective(id, &[value]).unwrap();
        ledger.set_state(id, TrialState::Success).unwrap();
    }
    let manager = Manager::builder()
        .sampler(maximizing())
        .ledger(ledger)
        .backend(InstantBackend::new(bowl))
        .build()
        .unwrap();
    assert_eq!(manager.best_trial().unwrap().unwrap().trial_id, 1);
}

#[test]
fn finished_rows_count_towards_the_budget() {
    let ledger = Arc::new(MemoryLedger::new());
    for id in 0..3 {
        ledger.set_state(id, TrialState::Failure).unwrap();
    }

    let manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).build().unwrap())
        .ledger(ledger)
        .backend(InstantBackend::new(bowl))
        .n_trials(5)
        .build()
        .unwrap();
    assert_eq!(manager.completed(), 3);
    assert_eq!(manager.ledger().next_trial_id().unwrap(), 3);
}
