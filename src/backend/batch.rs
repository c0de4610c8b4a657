use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use serde::{Deserialize, Serialize};

use super::{
    ExecutionBackend, Invocation, JobHandle, JobPaths, JobStatus, Outcome, backend_io,
    parse_objective, render_script,
};
use crate::error::{Error, Result};
use crate::param::Params;

fn default_job_prefix() -> String {
    "tuner_".to_string()
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Batch scheduler commands and script options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Submission command; the script path is appended (`["qsub"]`, `["sbatch"]`).
    pub submit: Vec<String>,
    /// Queue listing command (`["qstat"]`, `["squeue", "-h", "-o", "%j"]`).
    pub status: Vec<String>,
    /// Cancel command; the job id is appended. Empty disables force-stop.
    #[serde(default)]
    pub cancel: Vec<String>,
    /// Scheduler directives placed after the shebang.
    #[serde(default)]
    pub preamble: String,
    /// Job names are `{job_prefix}{trial_id}`.
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl BatchOptions {
    #[must_use]
    pub fn new<S: Into<String>, T: Into<String>>(
        submit: impl IntoIterator<Item = S>,
        status: impl IntoIterator<Item = T>,
    ) -> Self {
        Self {
            submit: submit.into_iter().map(Into::into).collect(),
            status: status.into_iter().map(Into::into).collect(),
            cancel: Vec::new(),
            preamble: String::new(),
            job_prefix: default_job_prefix(),
            shell: default_shell(),
        }
    }

    #[must_use]
    pub fn cancel<S: Into<String>>(mut self, cancel: impl IntoIterator<Item = S>) -> Self {
        self.cancel = cancel.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = preamble.into();
        self
    }

    #[must_use]
    pub fn job_name(&self, trial_id: u64) -> String {
        format!("{}{trial_id}", self.job_prefix)
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidSettings`] when the submit or status command is empty.
    pub fn validate(&self) -> Result<()> {
        if self.submit.is_empty() || self.status.is_empty() {
            return Err(Error::InvalidSettings(
                "batch backend needs both a submit and a status command".to_string(),
            ));
        }
        Ok(())
    }
}

/// Submits each trial as a script to a batch queue.
///
/// A job counts as active while the status command lists its job name or
/// its queue id as a whitespace-separated token. The script file carries the
/// job name, so schedulers that name jobs after the script list it even
/// without a name directive in the preamble. Once the job is gone the result
/// file written by the script trailer decides the outcome.
pub struct BatchBackend {
    options: BatchOptions,
    invocation: Invocation,
    workspace: PathBuf,
}

impl BatchBackend {
    #[must_use]
    pub fn new(options: BatchOptions, invocation: Invocation, workspace: impl Into<PathBuf>) -> Self {
        Self {
            options,
            invocation,
            workspace: workspace.into(),
        }
    }

    fn read_outcome(paths: &JobPaths) -> Outcome {
        let mut outcome = Outcome {
            error: paths.read_error(),
            stderr_tail: paths.stderr_tail(),
            ..Outcome::default()
        };
        let Ok(result) = fs::read_to_string(&paths.result) else {
            outcome.error.get_or_insert_with(|| {
                format!(
                    "job left the queue without writing {}",
                    paths.result.display()
                )
            });
            return outcome;
        };
        for line in result.lines() {
            if let Some(code) = line.strip_prefix("exitcode=") {
                outcome.exit_code = code.trim().parse().ok();
            } else if let Some(objective) = line.strip_prefix("objective=") {
                outcome.objective = parse_objective(objective);
            }
        }
        if outcome.objective.is_none() {
            outcome.objective = paths.stdout_objective();
        }
        outcome
    }
}

/// Queue id from the submit command's output: the last token of the last
/// non-empty line, without a `;cluster` suffix. Covers `1.srv` (PBS),
/// `Submitted batch job 4242` and `4242;cluster` (Slurm).
pub(crate) fn job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let token = line.split_whitespace().next_back()?;
    token
        .split(';')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Returns `true` if `listing` mentions `job_name` as a whole token.
#[must_use]
pub(crate) fn listed(listing: &str, job_name: &str) -> bool {
    listing.split_whitespace().any(|token| token == job_name)
}

fn run(argv: &[String], extra: &str) -> Result<Output> {
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Backend("empty batch command".to_string()));
    };
    let output = Command::new(program)
        .args(args)
        .arg(extra)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::Backend(format!("failed to run '{program}': {e}")))?;
    if !output.status.success() {
        return Err(Error::Backend(format!(
            "'{program}' exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output)
}

impl ExecutionBackend for BatchBackend {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn submit(&mut self, trial_id: u64, params: &Params) -> Result<JobHandle> {
        let job_name = self.options.job_name(trial_id);
        let paths = JobPaths::new(&self.workspace, trial_id).script_named(&job_name);
        paths.prepare()?;
        let script = render_script(&self.options, &self.invocation, trial_id, params, &paths);
        fs::write(&paths.script, script).map_err(|e| backend_io(&paths.script, &e))?;

        let output = run(&self.options.submit, &paths.script.display().to_string())?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = job_id(&stdout).unwrap_or(job_name);

        trace_debug!(trial_id, job_id = %id, "batch job submitted");
        Ok(JobHandle { trial_id, id })
    }

    fn poll(&mut self, handle: &JobHandle) -> Result<JobStatus> {
        let Some((program, args)) = self.options.status.split_first() else {
            return Err(Error::Backend("empty status command".to_string()));
        };
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::Backend(format!("failed to run '{program}': {e}")))?;
        if !output.status.success() {
            return Err(Error::Backend(format!(
                "'{program}' exited with {}",
                output.status
            )));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let job_name = self.options.job_name(handle.trial_id);
        if listed(&listing, &job_name) || listed(&listing, &handle.id) {
            return Ok(JobStatus::Active);
        }
        let paths = JobPaths::new(&self.workspace, handle.trial_id);
        Ok(JobStatus::Exited(Self::read_outcome(&paths)))
    }

    fn force_stop(&mut self, handle: &JobHandle) -> Result<()> {
        if self.options.cancel.is_empty() {
            trace_warn!(trial_id = handle.trial_id, "no cancel command configured; job left running");
            return Ok(());
        }
        run(&self.options.cancel, &handle.id).map(|_| ())
    }
}
