//! Subprocess execution with a hard timeout and captured output.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::FlowError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Both streams, labelled, for job records.
    pub fn combined(&self) -> String {
        format!("Stdout:\n{}\n\nStderr:\n{}", self.stdout, self.stderr)
    }
}

/// Runs `argv` in `cwd`, killing it once `timeout` elapses.
///
/// A missing program is a collaborator failure naming the program, an expired
/// budget is a [`FlowError::Timeout`]. A non-zero exit is not an error here;
/// callers inspect [`CommandOutput::code`].
pub async fn run_with_timeout(
    argv: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, FlowError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| FlowError::Config("empty command".into()))?;

    debug!(program = %program, cwd = %cwd.display(), "spawning command");
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FlowError::Collaborator(format!("command not found: {program}"))
            } else {
                FlowError::collaborator(&format!("failed to run {program}"), e)
            }
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Err(_) => {
            warn!(program = %program, secs = timeout.as_secs(), "command timed out, killed");
            Err(FlowError::Timeout(format!(
                "{program} timed out after {} seconds",
                timeout.as_secs()
            )))
        }
    }
}
