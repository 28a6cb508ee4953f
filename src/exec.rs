//! Local process execution for command and script operations
//!
//! - Execute a program with arguments and extra environment
//! - Capture stdout/stderr
//! - Report exit code and pass/fail status

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Process execution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

/// Result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// Exit code, -1 when the process was killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `program` with `args`
pub async fn run(program: &str, args: &[&str]) -> Result<RunResult, ExecError> {
    run_with_env(program, args, &BTreeMap::new(), None).await
}

/// Run `program` with `args`, extra environment and an optional working directory
///
/// The child is killed if the returned future is dropped, so callers can
/// bound execution with `tokio::time::timeout`.
pub async fn run_with_env(
    program: &str,
    args: &[&str],
    env: &BTreeMap<String, String>,
    workdir: Option<&Path>,
) -> Result<RunResult, ExecError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    debug!(program = %program, args = ?args, "Running command");

    let output = cmd.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExecError::CommandNotFound(program.to_string())
        } else {
            ExecError::ExecutionFailed(format!("{program}: {e}"))
        }
    })?;

    let result = RunResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    debug!(program = %program, exit_code = result.exit_code, "Command finished");
    Ok(result)
}
