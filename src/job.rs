//! Per-trial job lifecycle.
//!
//! ```text
//! ready ──submit──> running ──backend idle──> finished ──clean──> success
//!   │                  │                          └──dirty──> failure
//!   └──────────────────┴──── deadline ──> timeout (force-stop)
//!                            expire   ──> failure (force-stop)
//! ```
//!
//! [`Job::main`] is called once per manager tick, never blocks, and makes at
//! most one transition. Every transition is checked against
//! [`TrialState::can_transition_to`] before it is written to the ledger.

use std::time::{Duration, Instant};

use chrono::Utc;

use crate::backend::{ExecutionBackend, JobHandle, JobStatus, Outcome};
use crate::error::{Error, Result};
use crate::storage::TrialLedger;
use crate::types::TrialState;

/// One trial's passage through an [`ExecutionBackend`].
#[derive(Debug)]
pub struct Job {
    trial_id: u64,
    state: TrialState,
    handle: Option<JobHandle>,
    outcome: Option<Outcome>,
    created: Instant,
    timeout: Option<Duration>,
}

impl Job {
    /// A job for a `ready` trial. The timeout clock starts now.
    #[must_use]
    pub fn new(trial_id: u64, timeout: Option<Duration>) -> Self {
        Self {
            trial_id,
            state: TrialState::Ready,
            handle: None,
            outcome: None,
            created: Instant::now(),
            timeout,
        }
    }

    #[must_use]
    pub fn trial_id(&self) -> u64 {
        self.trial_id
    }

    #[must_use]
    pub fn state(&self) -> TrialState {
        self.state
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The backend handle once submitted.
    #[must_use]
    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    fn deadline_passed(&self) -> bool {
        self.timeout.is_some_and(|t| self.created.elapsed() >= t)
    }

    /// Advances the job by at most one transition and returns the new state.
    ///
    /// A no-op for terminal jobs. Backend submit failures end the trial as
    /// `failure`; poll failures are logged and retried on the next call.
    ///
    /// # Errors
    ///
    /// Only ledger failures and illegal transitions propagate; both are
    /// fatal to the run.
    pub fn main(
        &mut self,
        backend: &mut dyn ExecutionBackend,
        ledger: &dyn TrialLedger,
    ) -> Result<TrialState> {
        if self.is_terminal() {
            return Ok(self.state);
        }
        if self.deadline_passed() {
            self.stop(backend);
            let limit = self.timeout.unwrap_or_default();
            ledger.set_error(
                self.trial_id,
                &format!("timed out after {:.1}s", limit.as_secs_f64()),
            )?;
            ledger.set_end_time(self.trial_id, Utc::now())?;
            self.transition(ledger, TrialState::Timeout)?;
            trace_info!(trial_id = self.trial_id, "trial timed out");
            return Ok(self.state);
        }

        match self.state {
            TrialState::Ready => self.start(backend, ledger)?,
            TrialState::Running => self.check(backend, ledger)?,
            TrialState::Finished => self.classify(ledger)?,
            TrialState::Success | TrialState::Failure | TrialState::Timeout => {}
        }
        Ok(self.state)
    }

    fn start(&mut self, backend: &mut dyn ExecutionBackend, ledger: &dyn TrialLedger) -> Result<()> {
        let params = ledger.get_params(self.trial_id)?.unwrap_or_default();
        match backend.submit(self.trial_id, &params) {
            Ok(handle) => {
                self.handle = Some(handle);
                ledger.set_start_time(self.trial_id, Utc::now())?;
                self.transition(ledger, TrialState::Running)?;
                trace_debug!(trial_id = self.trial_id, backend = backend.name(), "job submitted");
            }
            Err(e) => {
                ledger.set_error(self.trial_id, &e.to_string())?;
                ledger.set_end_time(self.trial_id, Utc::now())?;
                self.transition(ledger, TrialState::Failure)?;
                trace_warn!(trial_id = self.trial_id, error = %e, "job submission failed");
            }
        }
        Ok(())
    }

    fn check(&mut self, backend: &mut dyn ExecutionBackend, ledger: &dyn TrialLedger) -> Result<()> {
        let Some(handle) = &self.handle else {
            return Err(Error::Internal("running job without a backend handle"));
        };
        match backend.poll(handle) {
            Ok(JobStatus::Active) => {}
            Ok(JobStatus::Exited(outcome)) => {
                ledger.set_end_time(self.trial_id, Utc::now())?;
                self.outcome = Some(outcome);
                self.transition(ledger, TrialState::Finished)?;
            }
            Err(e) => {
                trace_warn!(trial_id = self.trial_id, error = %e, "backend poll failed; retrying next tick");
            }
        }
        Ok(())
    }

    fn classify(&mut self, ledger: &dyn TrialLedger) -> Result<()> {
        let outcome = self.outcome.take().unwrap_or_default();
        match (outcome.failure(), outcome.objective) {
            (None, Some(objective)) => {
                ledger.set_objective(self.trial_id, &objective)?;
                self.transition(ledger, TrialState::Success)?;
                trace_info!(trial_id = self.trial_id, ?objective, "trial succeeded");
            }
            (failure, _) => {
                let message = failure.unwrap_or_else(|| "no objective reported".to_string());
                ledger.set_error(self.trial_id, &message)?;
                self.transition(ledger, TrialState::Failure)?;
                trace_info!(trial_id = self.trial_id, error = %message, "trial failed");
            }
        }
        Ok(())
    }

    /// Administratively fails the job, stopping any backend work first.
    ///
    /// # Errors
    ///
    /// Propagates ledger failures.
    pub fn expire(
        &mut self,
        backend: &mut dyn ExecutionBackend,
        ledger: &dyn TrialLedger,
        reason: &str,
    ) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        self.stop(backend);
        ledger.set_error(self.trial_id, reason)?;
        ledger.set_end_time(self.trial_id, Utc::now())?;
        self.transition(ledger, TrialState::Failure)
    }

    /// Best-effort force-stop; a failure here must not block the transition.
    fn stop(&mut self, backend: &mut dyn ExecutionBackend) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = backend.force_stop(&handle) {
            trace_warn!(trial_id = self.trial_id, error = %e, "force-stop failed");
        }
    }

    fn transition(&mut self, ledger: &dyn TrialLedger, next: TrialState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                trial_id: self.trial_id,
                from: self.state,
                to: next,
            });
        }
        ledger.set_state(self.trial_id, next)?;
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::Params;
    use crate::storage::MemoryLedger;

    /// Scripted backend: the job stays active for `active_polls` polls, then
    /// exits with `outcome`.
    struct Scripted {
        active_polls: usize,
        outcome: Outcome,
        fail_submit: bool,
        fail_polls: usize,
        stopped: Vec<u64>,
    }

    impl Scripted {
        fn exits_with(outcome: Outcome) -> Self {
            Self {
                active_polls: 0,
                outcome,
                fail_submit: false,
                fail_polls: 0,
                stopped: Vec::new(),
            }
        }
    }

    impl ExecutionBackend for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn submit(&mut self, trial_id: u64, _: &Params) -> Result<JobHandle> {
            if self.fail_submit {
                return Err(Error::Backend("queue rejected the job".to_string()));
            }
            Ok(JobHandle {
                trial_id,
                id: format!("job{trial_id}"),
            })
        }

        fn poll(&mut self, _: &JobHandle) -> Result<JobStatus> {
            if self.fail_polls > 0 {
                self.fail_polls -= 1;
                return Err(Error::Backend("status command failed".to_string()));
            }
            if self.active_polls > 0 {
                self.active_polls -= 1;
                return Ok(JobStatus::Active);
            }
            Ok(JobStatus::Exited(self.outcome.clone()))
        }

        fn force_stop(&mut self, handle: &JobHandle) -> Result<()> {
            self.stopped.push(handle.trial_id);
            Ok(())
        }
    }

    fn clean(value: f64) -> Outcome {
        Outcome {
            exit_code: Some(0),
            objective: Some(vec![value]),
            ..Outcome::default()
        }
    }

    #[test]
    fn happy_path_one_transition_per_call() {
        let ledger = MemoryLedger::new();
        ledger.register(0, &Params::new()).unwrap();
        let mut backend = Scripted::exits_with(clean(1.25));
        backend.active_polls = 1;
        let mut job = Job::new(0, None);

        assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Running);
        assert!(ledger.trial(0).unwrap().unwrap().start_time.is_some());
        assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Running);
        assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Finished);
        assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Success);
        assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Success);

        let row = ledger.trial(0).unwrap().unwrap();
        assert_eq!(row.state, TrialState::Success);
        assert_eq!(row.objective, Some(vec![1.25]));
        assert!(row.end_time.is_some());
    }

    #[test]
    fn nonzero_exit_fails_the_trial() {
        let ledger = MemoryLedger::new();
        let mut backend = Scripted::exits_with(Outcome {
            exit_code: Some(1),
            ..Outcome::default()
        });
        let mut job = Job::new(0, None);
        for _ in 0..3 {
            job.main(&mut backend, &ledger).unwrap();
        }
        let row = ledger.trial(0).unwrap().unwrap();
        assert_eq!(row.state, TrialState::Failure);
        assert_eq!(row.error.as_deref(), Some("exit code 1"));
        assert_eq!(row.objective, None);
    }

    #[test]
    fn submit_failure_is_recorded_not_raised() {
        let ledger = MemoryLedger::new();
        let mut backend = Scripted::exits_with(clean(0.0));
        backend.fail_submit = true;
        let mut job = Job::new(2, None);

        assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Failure);
        let error = ledger.trial(2).unwrap().unwrap().error.unwrap();
        assert!(error.contains("queue rejected the job"));
    }

    #[test]
    fn poll_errors_are_retried() {
        let ledger = MemoryLedger::new();
        let mut backend = Scripted::exits_with(clean(3.0));
        backend.fail_polls = 2;
        let mut job = Job::new(0, None);

        job.main(&mut backend, &ledger).unwrap();
        assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Running);
        assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Running);
        assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Finished);
    }

    #[test]
    fn deadline_times_out_from_any_active_state() {
        for steps in 0..3 {
            let ledger = MemoryLedger::new();
            let mut backend = Scripted::exits_with(clean(0.0));
            let mut job = Job::new(0, Some(Duration::from_millis(30)));
            for _ in 0..steps {
                job.main(&mut backend, &ledger).unwrap();
            }
            let before = job.state();
            assert!(!before.is_terminal());

            std::thread::sleep(Duration::from_millis(40));
            assert_eq!(job.main(&mut backend, &ledger).unwrap(), TrialState::Timeout);
            assert_eq!(ledger.get_state(0).unwrap(), Some(TrialState::Timeout));
            if before == TrialState::Ready {
                assert!(backend.stopped.is_empty());
            } else {
                assert_eq!(backend.stopped, vec![0]);
            }
        }
    }

    #[test]
    fn expire_force_stops_and_fails() {
        let ledger = MemoryLedger::new();
        let mut backend = Scripted::exits_with(clean(0.0));
        backend.active_polls = usize::MAX;
        let mut job = Job::new(0, None);
        job.main(&mut backend, &ledger).unwrap();

        job.expire(&mut backend, &ledger, "aborted").unwrap();
        assert_eq!(job.state(), TrialState::Failure);
        assert_eq!(backend.stopped, vec![0]);
        assert_eq!(ledger.trial(0).unwrap().unwrap().error.as_deref(), Some("aborted"));

        job.expire(&mut backend, &ledger, "again").unwrap();
        assert_eq!(ledger.trial(0).unwrap().unwrap().error.as_deref(), Some("aborted"));
    }
}
