use std::sync::Arc;

use tuner::checkpoint::CheckpointStore;
use tuner::sampler::{Generation, NelderMeadSampler, Sampler};
use tuner::storage::{MemoryLedger, TrialLedger};
use tuner::{Error, Manager, TrialState};

use crate::{InstantBackend, bowl, plane, temp_dir};

fn sampler() -> NelderMeadSampler {
    NelderMeadSampler::builder(plane()).seed(21).build().unwrap()
}

/// Registers `n` trials one at a time, checkpointing after each
/// registration and completing each trial before the next proposal.
fn crashed_run(n: u64, ledger: &MemoryLedger, store: &CheckpointStore) {
    let mut sampler = sampler();
    let mut registered = 0;
    while registered < n {
        match sampler.generate(ledger).unwrap() {
            Generation::Registered(trial_id) => {
                store.save(trial_id, &sampler).unwrap();
                let params = ledger.get_params(trial_id).unwrap().unwrap();
                ledger.set_state(trial_id, TrialState::Running).unwrap();
                ledger.set_state(trial_id, TrialState::Finished).unwrap();
                ledger.set_objective(trial_id, &[bowl(&params).unwrap()]).unwrap();
                ledger.set_state(trial_id, TrialState::Success).unwrap();
                registered += 1;
            }
            Generation::Waiting => sampler.check_result(ledger).unwrap(),
            Generation::Exhausted => panic!("search ended early"),
        }
    }
}

#[test]
fn resume_rolls_back_and_reproposes() {
    let dir = temp_dir("resume");
    let store = CheckpointStore::new(&dir);
    let ledger = Arc::new(MemoryLedger::new());
    crashed_run(10, &ledger, &store);

    // Trial 5 was still running when the process died.
    ledger.set_state(5, TrialState::Running).unwrap();
    let original_5 = ledger.get_params(5).unwrap().unwrap();
    let before: Vec<_> = ledger.trials().unwrap()[..5].to_vec();

    let mut manager = Manager::builder()
        .sampler(sampler())
        .ledger(ledger.clone())
        .backend(InstantBackend::new(bowl))
        .checkpoints(store.clone())
        .n_trials(20)
        .max_workers(1)
        .resume_from(4)
        .build()
        .unwrap();

    assert_eq!(ledger.trials().unwrap(), before);
    assert_eq!(store.trial_ids().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(manager.completed(), 5);

    manager.tick().unwrap();
    let replayed = ledger.trial(5).unwrap().unwrap();
    assert_eq!(replayed.params, original_5);
    assert_eq!(replayed.state, TrialState::Running);
    assert_eq!(store.latest().unwrap(), Some(5));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn active_rows_at_the_resume_point_run_again() {
    let dir = temp_dir("resume_requeue");
    let store = CheckpointStore::new(&dir);
    let ledger = Arc::new(MemoryLedger::new());
    crashed_run(6, &ledger, &store);
    ledger.set_state(2, TrialState::Running).unwrap();
    ledger.set_state(3, TrialState::Finished).unwrap();

    let mut manager = Manager::builder()
        .sampler(sampler())
        .ledger(ledger.clone())
        .backend(InstantBackend::new(bowl))
        .checkpoints(store)
        .n_trials(10)
        .max_workers(3)
        .resume_from(5)
        .build()
        .unwrap();

    assert_eq!(ledger.get_ready().unwrap(), vec![2, 3]);
    assert_eq!(manager.completed(), 4);

    let summary = manager.run_until_idle();
    assert_eq!(summary, 10);
    for trial in ledger.trials().unwrap() {
        assert_eq!(trial.state, TrialState::Success, "trial {}", trial.trial_id);
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_checkpoint_is_fatal_and_leaves_the_ledger_alone() {
    let dir = temp_dir("resume_missing");
    let store = CheckpointStore::new(&dir);
    let ledger = Arc::new(MemoryLedger::new());
    crashed_run(5, &ledger, &store);
    let before = ledger.trials().unwrap();

    let result = Manager::builder()
        .sampler(sampler())
        .ledger(ledger.clone())
        .backend(InstantBackend::new(bowl))
        .checkpoints(store)
        .n_trials(10)
        .resume_from(8)
        .build();

    assert!(matches!(result, Err(Error::Checkpoint { trial_id: 8, .. })));
    assert_eq!(ledger.trials().unwrap(), before);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn corrupt_checkpoint_is_fatal() {
    let dir = temp_dir("resume_corrupt");
    let store = CheckpointStore::new(&dir);
    let ledger = Arc::new(MemoryLedger::new());
    crashed_run(4, &ledger, &store);
    std::fs::write(store.path(3), "{ not json").unwrap();

    let result = Manager::builder()
        .sampler(sampler())
        .ledger(ledger.clone())
        .backend(InstantBackend::new(bowl))
        .checkpoints(store)
        .n_trials(10)
        .resume_from(3)
        .build();

    assert!(matches!(result, Err(Error::Checkpoint { trial_id: 3, .. })));
    assert_eq!(ledger.trials().unwrap().len(), 4);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn resume_needs_a_checkpoint_directory() {
    let result = Manager::builder()
        .sampler(sampler())
        .backend(InstantBackend::new(bowl))
        .n_trials(10)
        .resume_from(0)
        .build();
    assert!(matches!(result, Err(Error::Checkpoint { trial_id: 0, .. })));
}

trait RunUntilIdle {
    fn run_until_idle(&mut self) -> usize;
}

impl RunUntilIdle for Manager {
    fn run_until_idle(&mut self) -> usize {
        while self.tick().unwrap() == tuner::Tick::Continue {}
        self.completed()
    }
}
