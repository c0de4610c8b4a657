//! Batch job script rendering.
//!
//! The rendered layout is read by external batch systems and by the result
//! parser in `batch`, so it has to stay stable:
//!
//! ```text
//! #!/bin/sh
//! # job-name: tuner_7
//! <preamble, with {job_name} and {trial_id} substituted>
//! export TRIAL_ID=7
//! export CONFIG_FILE=...          (when configured)
//! export ERROR_FILE=...
//! x=0.5                           (one assignment per parameter)
//! <program> <args> > stdout.txt 2> stderr.txt
//! code=$?
//! { echo "exitcode=$code"; echo "objective=<last stdout line>"; } > result.txt
//! exit $code
//! ```

use core::fmt::Write as _;

use super::{BatchOptions, Invocation, JobPaths, shell_quote};
use crate::param::Params;

/// Renders the submission script for one trial.
#[must_use]
pub fn render_script(
    options: &BatchOptions,
    invocation: &Invocation,
    trial_id: u64,
    params: &Params,
    paths: &JobPaths,
) -> String {
    let job_name = options.job_name(trial_id);
    let mut script = String::new();

    let _ = writeln!(script, "#!{}", options.shell);
    let _ = writeln!(script, "# job-name: {job_name}");
    if !options.preamble.is_empty() {
        let preamble = options
            .preamble
            .replace("{job_name}", &job_name)
            .replace("{trial_id}", &trial_id.to_string());
        let _ = writeln!(script, "{}", preamble.trim_end());
    }

    for (key, value) in invocation.environment(trial_id, paths) {
        let _ = writeln!(script, "export {key}={}", shell_quote(&value));
    }
    for (name, value) in params.iter() {
        let _ = writeln!(
            script,
            "{}={}",
            shell_variable(name),
            shell_quote(&value.to_string())
        );
    }

    let command = invocation
        .argv(trial_id, params)
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = shell_quote(&paths.stdout.display().to_string());
    let stderr = shell_quote(&paths.stderr.display().to_string());
    let result = shell_quote(&paths.result.display().to_string());

    let _ = writeln!(script, "{command} > {stdout} 2> {stderr}");
    let _ = writeln!(script, "code=$?");
    let _ = writeln!(script, "{{");
    let _ = writeln!(script, "  echo \"exitcode=$code\"");
    let _ = writeln!(
        script,
        "  echo \"objective=$(grep -v '^[[:space:]]*$' {stdout} | tail -n 1)\""
    );
    let _ = writeln!(script, "}} > {result}");
    let _ = writeln!(script, "exit $code");
    script
}

/// Parameter names as shell identifiers.
fn shell_variable(name: &str) -> String {
    let mut var: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if var.starts_with(|c: char| c.is_ascii_digit()) {
        var.insert(0, '_');
    }
    var
}
