use std::sync::Arc;
use std::time::Duration;

use tuner::backend::{ArgStyle, Invocation, LocalBackend};
use tuner::sampler::NelderMeadSampler;
use tuner::storage::{MemoryLedger, TrialLedger};
use tuner::{Manager, Tick, TrialState};

use crate::{plane, temp_dir};

#[test]
fn abort_fails_everything_in_flight() {
    let dir = temp_dir("abort");
    let ledger = Arc::new(MemoryLedger::new());
    let invocation = Invocation::new(["sh", "-c", "exec sleep 30"]).arg_style(ArgStyle::Positional);
    let mut manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(plane()).seed(3).build().unwrap())
        .ledger(ledger.clone())
        .backend(LocalBackend::new(invocation, &dir))
        .n_trials(10)
        .max_workers(3)
        .build()
        .unwrap();

    assert_eq!(manager.tick().unwrap(), Tick::Continue);
    assert_eq!(ledger.get_running().unwrap().len(), 3);

    assert_eq!(manager.abort().unwrap(), 3);
    assert_eq!(manager.in_flight(), 0);
    for trial in ledger.trials().unwrap() {
        assert_eq!(trial.state, TrialState::Failure);
        assert_eq!(trial.error.as_deref(), Some("aborted"));
    }
    assert_eq!(manager.tick().unwrap(), Tick::Done);

    std::thread::sleep(Duration::from_millis(10));
    let _ = std::fs::remove_dir_all(&dir);
}
