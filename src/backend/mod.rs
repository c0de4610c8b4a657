//! Execution backends that run the user's objective program.
//!
//! A [`Job`](crate::job::Job) only ever talks to the [`ExecutionBackend`]
//! capability set: [`submit`](ExecutionBackend::submit),
//! [`poll`](ExecutionBackend::poll) and
//! [`force_stop`](ExecutionBackend::force_stop). How liveness is decided
//! (a child process, a batch queue listing) stays behind the trait.
//!
//! | Backend | Liveness | Module |
//! |---------|----------|--------|
//! | [`LocalBackend`] | child process still running | `local` |
//! | [`BatchBackend`] | job name still listed by the status command | `batch` |
//! | `WorkerPool` | in-process evaluation, no job state machine | `pool` (feature `pool`) |
//!
//! # Job protocol
//!
//! Every job gets a directory `{workspace}/jobs/{trial_id}/` and the
//! environment variables `TRIAL_ID`, `CONFIG_FILE` (when configured) and
//! `ERROR_FILE`. The program reports its objective as the last non-empty
//! line of stdout and signals failure with a non-zero exit code or by
//! writing a message to `$ERROR_FILE`.

mod batch;
mod local;
#[cfg(feature = "pool")]
mod pool;
mod script;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub use batch::{BatchBackend, BatchOptions};
pub use local::LocalBackend;
#[cfg(feature = "pool")]
pub use pool::{Evaluator, PoolCompletion, WorkerPool};
pub use script::render_script;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::param::Params;

/// Identifies a submitted job to the backend that launched it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub trial_id: u64,
    /// Backend-specific id: a pid, a queue job id, or a job name.
    pub id: String,
}

/// What a finished job left behind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outcome {
    /// `None` when the process was killed by a signal or never reported one.
    pub exit_code: Option<i32>,
    pub objective: Option<Vec<f64>>,
    /// Message the program wrote to `$ERROR_FILE`, or a backend diagnosis.
    pub error: Option<String>,
    /// Last non-empty stderr line, used to annotate failures.
    pub stderr_tail: Option<String>,
}

impl Outcome {
    /// The failure message for this outcome, or `None` for a clean success.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        let tail = self
            .stderr_tail
            .as_ref()
            .map_or_else(String::new, |t| format!(": {t}"));
        match self.exit_code {
            Some(0) => {}
            Some(code) => return Some(format!("exit code {code}{tail}")),
            None => return Some(format!("terminated without an exit code{tail}")),
        }
        if self.objective.is_none() {
            return Some("no objective reported on stdout".to_string());
        }
        None
    }
}

/// Result of polling a job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    /// Still running or still queued.
    Active,
    /// No longer active; the outcome is ready to classify.
    Exited(Outcome),
}

/// Launch, poll, and stop jobs for trials.
///
/// Implementations never block for the lifetime of a job: `poll` reports the
/// current state and returns.
pub trait ExecutionBackend: Send {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Starts evaluating `params` for `trial_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the job cannot be started. The job
    /// lifecycle records this as a trial failure; submissions are not retried.
    fn submit(&mut self, trial_id: u64, params: &Params) -> Result<JobHandle>;

    /// Reports whether the job is still active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if liveness cannot be determined; callers
    /// retry on their next tick.
    fn poll(&mut self, handle: &JobHandle) -> Result<JobStatus>;

    /// Stops the job if it is still running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the stop request fails.
    fn force_stop(&mut self, handle: &JobHandle) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// How parameters are passed on the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgStyle {
    /// `--name=value` per parameter, then `--trial_id=N` and `--config=PATH`.
    #[default]
    Named,
    /// Parameter values in declaration order; ids only through the environment.
    Positional,
}

/// The user's objective program and how to call it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Program followed by fixed leading arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub arg_style: ArgStyle,
    /// Settings file threaded through to every job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

impl Invocation {
    /// An invocation of `command` with named arguments.
    #[must_use]
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            arg_style: ArgStyle::Named,
            config_file: None,
        }
    }

    #[must_use]
    pub fn arg_style(mut self, style: ArgStyle) -> Self {
        self.arg_style = style;
        self
    }

    #[must_use]
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Checks that a program is named.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] for an empty command.
    pub fn validate(&self) -> Result<()> {
        match self.command.first() {
            Some(program) if !program.is_empty() => Ok(()),
            _ => Err(Error::InvalidSettings(
                "the objective command must name a program".to_string(),
            )),
        }
    }

    /// The full argument vector, program first.
    #[must_use]
    pub fn argv(&self, trial_id: u64, params: &Params) -> Vec<String> {
        let mut argv = self.command.clone();
        match self.arg_style {
            ArgStyle::Named => {
                argv.extend(params.iter().map(|(name, value)| format!("--{name}={value}")));
                argv.push(format!("--trial_id={trial_id}"));
                if let Some(config) = &self.config_file {
                    argv.push(format!("--config={}", config.display()));
                }
            }
            ArgStyle::Positional => {
                argv.extend(params.iter().map(|(_, value)| value.to_string()));
            }
        }
        argv
    }

    /// Environment exported to every job.
    #[must_use]
    pub fn environment(&self, trial_id: u64, paths: &JobPaths) -> Vec<(String, String)> {
        let mut env = vec![("TRIAL_ID".to_string(), trial_id.to_string())];
        if let Some(config) = &self.config_file {
            env.push(("CONFIG_FILE".to_string(), config.display().to_string()));
        }
        env.push(("ERROR_FILE".to_string(), paths.error.display().to_string()));
        env
    }
}

// ---------------------------------------------------------------------------
// Per-job files
// ---------------------------------------------------------------------------

/// File layout of one job under the workspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobPaths {
    pub dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Written by the program to report a failure.
    pub error: PathBuf,
    /// Written by the batch trailer.
    pub result: PathBuf,
    /// Rendered batch script, `job.sh` unless renamed with
    /// [`script_named`](Self::script_named).
    pub script: PathBuf,
}

impl JobPaths {
    #[must_use]
    pub fn new(workspace: &Path, trial_id: u64) -> Self {
        let dir = workspace.join("jobs").join(trial_id.to_string());
        Self {
            stdout: dir.join("stdout.txt"),
            stderr: dir.join("stderr.txt"),
            error: dir.join("error.txt"),
            result: dir.join("result.txt"),
            script: dir.join("job.sh"),
            dir,
        }
    }

    /// Names the script file after the job. PBS and Slurm fall back to the
    /// script file name when no name directive is given.
    #[must_use]
    pub fn script_named(mut self, job_name: &str) -> Self {
        self.script = self.dir.join(job_name);
        self
    }

    /// Creates the directory and clears leftovers of an earlier attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] on I/O failure.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| backend_io(&self.dir, &e))?;
        for stale in [&self.stdout, &self.stderr, &self.error, &self.result] {
            match fs::remove_file(stale) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(backend_io(stale, &e)),
            }
        }
        Ok(())
    }

    /// Trimmed contents of `$ERROR_FILE`, if the program wrote anything.
    #[must_use]
    pub fn read_error(&self) -> Option<String> {
        read_trimmed(&self.error)
    }

    /// Last non-empty stderr line.
    #[must_use]
    pub fn stderr_tail(&self) -> Option<String> {
        read_trimmed(&self.stderr)
            .and_then(|s| last_line(&s).map(str::to_string))
    }

    /// Objective parsed from the captured stdout.
    #[must_use]
    pub fn stdout_objective(&self) -> Option<Vec<f64>> {
        fs::read_to_string(&self.stdout)
            .ok()
            .and_then(|s| parse_objective(&s))
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|l| !l.is_empty())
}

pub(crate) fn backend_io(path: &Path, e: &std::io::Error) -> Error {
    Error::Backend(format!("{}: {e}", path.display()))
}

/// Parses the objective from program output.
///
/// Only the last non-empty line counts. It may hold one number or several
/// separated by whitespace or commas, optionally wrapped in brackets.
///
/// ```
/// use tuner::backend::parse_objective;
///
/// assert_eq!(parse_objective("epoch 1\nloss: ...\n0.25\n"), Some(vec![0.25]));
/// assert_eq!(parse_objective("[1.0, 2.5]"), Some(vec![1.0, 2.5]));
/// assert_eq!(parse_objective("done"), None);
/// ```
#[must_use]
pub fn parse_objective(output: &str) -> Option<Vec<f64>> {
    let line = last_line(output)?;
    let line = line.trim_start_matches('[').trim_end_matches(']');
    let values = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<f64>().ok())
        .collect::<Option<Vec<_>>>()?;
    (!values.is_empty()).then_some(values)
}

/// Quotes `s` for a POSIX shell, leaving plain words untouched.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
