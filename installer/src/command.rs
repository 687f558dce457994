// SPDX-License-Identifier: AGPL-3.0-or-later
//! External command execution
//!
//! Every package manager, git, maven, unzip, systemctl and ss invocation goes
//! through a [`CommandRunner`], so dry-run mode and tests can intercept them.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{InstallError, Result};

/// Default per-command timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// A command to execute, without a shell
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Kill the command after this long
    pub timeout: Duration,
}

impl CommandSpec {
    /// Start building a command for `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Split a configured command line on whitespace
    ///
    /// Returns `None` for a blank line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.program)?;
        for arg in &self.args {
            write!(formatter, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Whether the command exited with status zero
    pub success: bool,
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Wall-clock duration
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Short failure description for error messages
    pub fn failure_summary(&self) -> String {
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let last_lines: Vec<&str> = detail.lines().rev().take(5).collect();
        let detail = last_lines.into_iter().rev().collect::<Vec<_>>().join("\n");

        match self.code {
            Some(code) => format!("exit status {}: {}", code, detail),
            None => format!("terminated by signal: {}", detail),
        }
    }
}

/// Executes external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion
    ///
    /// A non-zero exit is reported through [`CommandOutput::success`], not as
    /// an error. Errors are reserved for spawn failures and timeouts.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Whether commands are only being logged
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Run a command and turn a non-zero exit into [`InstallError::CommandFailed`]
pub async fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(spec).await?;
    if output.success {
        Ok(output)
    } else {
        Err(InstallError::CommandFailed {
            command: spec.to_string(),
            message: output.failure_summary(),
        })
    }
}

/// Runner backed by real processes
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    /// Whether to run in dry-run mode (no actual execution)
    dry_run: bool,
}

impl SystemRunner {
    /// Create a new runner
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        info!(command = %spec, "Executing command");

        if self.dry_run {
            return Ok(CommandOutput::ok(format!("[DRY RUN] Would execute: {}", spec)));
        }

        let start_time = Instant::now();
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);

        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InstallError::CommandNotFound {
                    command: spec.program.clone(),
                }
            } else {
                InstallError::CommandFailed {
                    command: spec.to_string(),
                    message: format!("Failed to spawn: {}", e),
                }
            }
        })?;

        match timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let duration_ms = start_time.elapsed().as_millis() as u64;
                debug!(
                    command = %spec,
                    status = %output.status,
                    duration_ms = duration_ms,
                    "Command finished"
                );
                Ok(CommandOutput {
                    success: output.status.success(),
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    duration_ms,
                })
            }
            Ok(Err(e)) => Err(InstallError::CommandFailed {
                command: spec.to_string(),
                message: format!("Failed to execute command: {}", e),
            }),
            Err(_) => Err(InstallError::CommandFailed {
                command: spec.to_string(),
                message: format!("Command timed out after {} seconds", spec.timeout.as_secs()),
            }),
        }
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}
