use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use super::{ExecutionBackend, Invocation, JobHandle, JobPaths, JobStatus, Outcome, backend_io};
use crate::error::{Error, Result};
use crate::param::Params;

/// Runs each trial as a child process of the tuner.
///
/// Stdout and stderr go straight to the job's files, so nothing has to
/// drain pipes while the child runs. Liveness is `try_wait`.
///
/// # Examples
///
/// ```no_run
/// use tuner::backend::{Invocation, LocalBackend};
///
/// let backend = LocalBackend::new(Invocation::new(["python", "train.py"]), "work");
/// ```
pub struct LocalBackend {
    invocation: Invocation,
    workspace: PathBuf,
    children: HashMap<u64, Running>,
}

struct Running {
    child: Child,
    paths: JobPaths,
}

impl LocalBackend {
    #[must_use]
    pub fn new(invocation: Invocation, workspace: impl Into<PathBuf>) -> Self {
        Self {
            invocation,
            workspace: workspace.into(),
            children: HashMap::new(),
        }
    }

    /// Number of children that have not been reaped yet.
    #[must_use]
    pub fn active(&self) -> usize {
        self.children.len()
    }

    fn spawn(&self, trial_id: u64, params: &Params, paths: &JobPaths) -> Result<Child> {
        let argv = self.invocation.argv(trial_id, params);
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::Backend("empty objective command".to_string()));
        };
        let stdout = File::create(&paths.stdout).map_err(|e| backend_io(&paths.stdout, &e))?;
        let stderr = File::create(&paths.stderr).map_err(|e| backend_io(&paths.stderr, &e))?;

        Command::new(program)
            .args(args)
            .envs(self.invocation.environment(trial_id, paths))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| Error::Backend(format!("failed to spawn '{program}': {e}")))
    }
}

impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&mut self, trial_id: u64, params: &Params) -> Result<JobHandle> {
        let paths = JobPaths::new(&self.workspace, trial_id);
        paths.prepare()?;
        let child = self.spawn(trial_id, params, &paths)?;
        let handle = JobHandle {
            trial_id,
            id: child.id().to_string(),
        };
        trace_debug!(trial_id, pid = %handle.id, "process started");
        self.children.insert(trial_id, Running { child, paths });
        Ok(handle)
    }

    fn poll(&mut self, handle: &JobHandle) -> Result<JobStatus> {
        let Some(running) = self.children.get_mut(&handle.trial_id) else {
            return Err(Error::Backend(format!(
                "no process is tracked for trial {}",
                handle.trial_id
            )));
        };
        let status = running
            .child
            .try_wait()
            .map_err(|e| Error::Backend(e.to_string()))?;
        let Some(status) = status else {
            return Ok(JobStatus::Active);
        };

        let paths = running.paths.clone();
        self.children.remove(&handle.trial_id);
        Ok(JobStatus::Exited(Outcome {
            exit_code: status.code(),
            objective: paths.stdout_objective(),
            error: paths.read_error(),
            stderr_tail: paths.stderr_tail(),
        }))
    }

    fn force_stop(&mut self, handle: &JobHandle) -> Result<()> {
        let Some(mut running) = self.children.remove(&handle.trial_id) else {
            return Ok(());
        };
        if running
            .child
            .try_wait()
            .map_err(|e| Error::Backend(e.to_string()))?
            .is_none()
        {
            running
                .child
                .kill()
                .map_err(|e| Error::Backend(format!("failed to kill pid {}: {e}", handle.id)))?;
        }
        running
            .child
            .wait()
            .map(|_| ())
            .map_err(|e| Error::Backend(e.to_string()))
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        for running in self.children.values_mut() {
            let _ = running.child.kill();
            let _ = running.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::backend::ArgStyle;
    use crate::param::ParamValue;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn workspace() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("tuner_local_{}_{n}", std::process::id()))
    }

    fn wait_for_exit(backend: &mut LocalBackend, handle: &JobHandle) -> Outcome {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let JobStatus::Exited(outcome) = backend.poll(handle).unwrap() {
                return outcome;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("process did not exit");
    }

    #[test]
    fn captures_objective_and_exit_code() {
        let dir = workspace();
        let invocation = Invocation::new(["sh", "-c", "echo warming up; echo \"$TRIAL_ID.5\""]);
        let mut backend = LocalBackend::new(invocation, &dir);
        let params: Params = [("x", ParamValue::Float(1.0))].into_iter().collect();

        let handle = backend.submit(3, &params).unwrap();
        let outcome = wait_for_exit(&mut backend, &handle);

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.objective, Some(vec![3.5]));
        assert_eq!(outcome.failure(), None);
        assert_eq!(backend.active(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn error_file_marks_failure() {
        let dir = workspace();
        let invocation = Invocation::new(["sh", "-c", "echo 1.0; echo diverged > \"$ERROR_FILE\""]);
        let mut backend = LocalBackend::new(invocation, &dir);

        let handle = backend.submit(0, &Params::new()).unwrap();
        let outcome = wait_for_exit(&mut backend, &handle);

        assert_eq!(outcome.failure().as_deref(), Some("diverged"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn spawn_failure_is_a_backend_error() {
        let dir = workspace();
        let invocation = Invocation::new(["/definitely/not/a/program"]);
        let mut backend = LocalBackend::new(invocation, &dir);

        assert!(matches!(
            backend.submit(0, &Params::new()),
            Err(Error::Backend(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn force_stop_kills_the_process() {
        let dir = workspace();
        let invocation = Invocation::new(["sleep", "30"]).arg_style(ArgStyle::Positional);
        let mut backend = LocalBackend::new(invocation, &dir);

        let handle = backend.submit(0, &Params::new()).unwrap();
        assert_eq!(backend.poll(&handle).unwrap(), JobStatus::Active);
        backend.force_stop(&handle).unwrap();
        assert_eq!(backend.active(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
