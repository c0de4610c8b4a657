use std::sync::Arc;
use std::time::Duration;

use tuner::backend::{ArgStyle, BatchBackend, BatchOptions, Invocation, LocalBackend};
use tuner::sampler::NelderMeadSampler;
use tuner::storage::{MemoryLedger, TrialLedger};
use tuner::{Manager, TrialState};

use crate::{line, temp_dir, value};

#[test]
fn local_processes_report_objectives_on_stdout() {
    let dir = temp_dir("local_e2e");
    let ledger = Arc::new(MemoryLedger::new());
    // Positional style: the value of x arrives as $0.
    let invocation = Invocation::new([
        "sh",
        "-c",
        "echo \"progress: starting\"; awk -v x=\"$0\" 'BEGIN { print (x - 0.5) * (x - 0.5) }'",
    ])
    .arg_style(ArgStyle::Positional);
    let mut manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(line()).seed(8).build().unwrap())
        .ledger(ledger.clone())
        .backend(LocalBackend::new(invocation, &dir))
        .n_trials(8)
        .max_workers(2)
        .poll_interval(Duration::from_millis(5))
        .build()
        .unwrap();

    let summary = manager.run().unwrap();
    assert_eq!(summary.completed, 8);

    for trial in ledger.trials().unwrap() {
        assert_eq!(trial.state, TrialState::Success, "{:?}", trial.error);
        let x = value(&trial.params, "x");
        let reported = trial.objective.unwrap()[0];
        assert!((reported - (x - 0.5).powi(2)).abs() < 1e-4);
        assert!(dir.join("jobs").join(trial.trial_id.to_string()).join("stdout.txt").exists());
    }
    assert!(summary.best.is_some());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn local_jobs_past_the_deadline_time_out() {
    let dir = temp_dir("local_timeout");
    let ledger = Arc::new(MemoryLedger::new());
    let invocation = Invocation::new(["sh", "-c", "exec sleep 5"]).arg_style(ArgStyle::Positional);
    let mut manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(line()).seed(8).build().unwrap())
        .ledger(ledger.clone())
        .backend(LocalBackend::new(invocation, &dir))
        .n_trials(2)
        .max_workers(2)
        .job_timeout(Duration::from_millis(50))
        .poll_interval(Duration::from_millis(10))
        .build()
        .unwrap();

    let summary = manager.run().unwrap();

    assert_eq!(summary.completed, 2);
    assert!(summary.best.is_none());
    for trial in ledger.trials().unwrap() {
        assert_eq!(trial.state, TrialState::Timeout);
        assert!(trial.error.unwrap().starts_with("timed out"));
        assert!(trial.end_time.is_some());
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn batch_jobs_run_through_a_synchronous_queue() {
    // `sh` as the submitter runs each script to completion on submission,
    // and `true` as the status command never lists a job.
    let dir = temp_dir("batch_e2e");
    let ledger = Arc::new(MemoryLedger::new());
    let invocation = Invocation::new(["sh", "-c", "echo \"$0\""]).arg_style(ArgStyle::Positional);
    let options = BatchOptions::new(["sh"], ["true"]).preamble("# queue: test");
    let mut manager = Manager::builder()
        .sampler(NelderMeadSampler::builder(line()).seed(13).build().unwrap())
        .ledger(ledger.clone())
        .backend(BatchBackend::new(options, invocation, &dir))
        .n_trials(6)
        .max_workers(2)
        .poll_interval(Duration::ZERO)
        .build()
        .unwrap();

    let summary = manager.run().unwrap();
    assert_eq!(summary.completed, 6);

    for trial in ledger.trials().unwrap() {
        assert_eq!(trial.state, TrialState::Success, "{:?}", trial.error);
        assert_eq!(trial.objective.unwrap(), vec![value(&trial.params, "x")]);

        let job = dir.join("jobs").join(trial.trial_id.to_string());
        let script =
            std::fs::read_to_string(job.join(format!("tuner_{}", trial.trial_id))).unwrap();
        assert!(script.contains(&format!("# job-name: tuner_{}", trial.trial_id)));
        assert!(script.contains("# queue: test"));
        let result = std::fs::read_to_string(job.join("result.txt")).unwrap();
        assert!(result.starts_with("exitcode=0"));
    }
    let best = summary.best.unwrap();
    assert_eq!(best.objective.unwrap()[0], value(&best.params, "x"));

    let _ = std::fs::remove_dir_all(&dir);
}
