//! External process execution with a deadline, cancellation and one retry.
//!
//! Flashing and command-driven testing shell out to vendor tools that can
//! take hours. Each attempt races the child against the caller's
//! `CancellationToken` and a per-attempt deadline; the child is killed when
//! the race is lost.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use firstfail_async_utils::OrCancelExt;
use tokio_util::sync::CancellationToken;

use crate::error::{FirstFailError, Result};
use crate::retry::retry_once;

/// A fully rendered command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub deadline: Duration,
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            deadline: crate::DEFAULT_DEADLINE,
        }
    }

    /// Build a command from a template, substituting `{key}` placeholders in
    /// the program and every argument.
    pub fn from_template(program: &str, args: &[String], vars: &[(&str, &str)]) -> Self {
        Self::new(
            render(program, vars),
            args.iter().map(|arg| render(arg, vars)).collect(),
        )
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

/// Run `spec`, retrying once on a non-zero exit or spawn failure.
pub async fn run_command(spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
    let label = spec.display();
    retry_once(&label, || run_attempt(spec, cancel)).await
}

/// Run `spec` and report the exit status instead of failing on it.
///
/// Used by testers, where a non-zero exit is a test verdict rather than a
/// transport failure. Only a failure to run the command is retried.
pub async fn run_for_status(spec: &CommandSpec, cancel: &CancellationToken) -> Result<bool> {
    let label = spec.display();
    let (status, _) = retry_once(&label, || spawn_and_wait(spec, cancel)).await?;
    Ok(status.success())
}

async fn run_attempt(spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
    let (status, output) = spawn_and_wait(spec, cancel).await?;
    if !status.success() {
        let lines: Vec<&str> = output.stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(5)..].join("\n");
        return Err(FirstFailError::Transport(format!(
            "`{}` exited with {status}: {tail}",
            spec.display()
        )));
    }
    Ok(output)
}

async fn spawn_and_wait(
    spec: &CommandSpec,
    cancel: &CancellationToken,
) -> Result<(std::process::ExitStatus, CommandOutput)> {
    if cancel.is_cancelled() {
        return Err(FirstFailError::Cancelled);
    }

    tracing::info!("cmd: {}", spec.display());
    let mut command = tokio::process::Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let child = command
        .spawn()
        .map_err(|e| FirstFailError::Transport(format!("failed to spawn {}: {e}", spec.program)))?;

    let output = child
        .wait_with_output()
        .or_cancel_within(cancel, spec.deadline)
        .await?
        .map_err(|e| FirstFailError::Transport(format!("waiting on {}: {e}", spec.program)))?;

    let captured = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    tracing::debug!(
        "`{}` finished with {} ({} bytes stdout)",
        spec.display(),
        output.status,
        captured.stdout.len()
    );
    Ok((output.status, captured))
}
