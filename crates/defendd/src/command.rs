//! Command runner abstraction
//!
//! Every external process the daemon starts (firewall, service manager,
//! solver) goes through `CommandRunner`. Production code uses
//! `SystemCommandRunner`; tests use `FakeCommandRunner`, which records each
//! call and answers from scripted responses without touching the host.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// A program and its arguments, never passed through a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(program: S, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build a command that needs root, prefixed with sudo when requested
    pub fn privileged(use_sudo: bool, program: &str, args: &[&str]) -> Self {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        if use_sudo {
            let mut sudo_args = Vec::with_capacity(args.len() + 1);
            sudo_args.push(program.to_string());
            sudo_args.extend(args);
            Self::new("sudo", sudo_args)
        } else {
            Self::new(program, args)
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turn a non-zero exit into `CommandError::NonZeroExit`
    pub fn check(self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandError::NonZeroExit {
                command: spec.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("'{command}' did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' exited with status {status:?}: {stderr}")]
    NonZeroExit {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

/// Runs external commands.
///
/// `run` returns `Ok` for any process that finished, whatever its exit
/// status; callers decide whether a non-zero exit matters via
/// `CommandOutput::check`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs real processes with tokio
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        debug!("Executing: {}", spec);

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandError::Spawn {
                command: spec.to_string(),
                reason: e.to_string(),
            })?;

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| CommandError::Timeout {
                    command: spec.to_string(),
                    timeout: limit,
                })?,
            None => child.wait_with_output().await,
        };

        let output = waited.map_err(|e| CommandError::Spawn {
            command: spec.to_string(),
            reason: e.to_string(),
        })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ============================================================================
// Fake Command Runner (Testing)
// ============================================================================

/// Scripted reply for `FakeCommandRunner`
#[derive(Debug, Clone)]
pub enum FakeReply {
    Output(CommandOutput),
    Timeout,
    SpawnFailure(String),
}

impl FakeReply {
    pub fn ok(stdout: &str) -> Self {
        Self::Output(CommandOutput {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    pub fn exit(status: i32, stdout: &str, stderr: &str) -> Self {
        Self::Output(CommandOutput {
            status: Some(status),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        })
    }
}

/// Fake runner that records command lines and replies from a script.
///
/// A reply is chosen by the first registered pattern contained in the
/// rendered command line. Unmatched commands succeed with empty output.
#[derive(Debug, Clone, Default)]
pub struct FakeCommandRunner {
    replies: Vec<(String, FakeReply)>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(mut self, pattern: &str, reply: FakeReply) -> Self {
        self.replies.push((pattern.to_string(), reply));
        self
    }

    /// Every command line run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of recorded command lines containing `pattern`
    pub fn call_count(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        let line = spec.to_string();
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.clone());

        let reply = self
            .replies
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| FakeReply::ok(""));

        match reply {
            FakeReply::Output(output) => Ok(output),
            FakeReply::Timeout => Err(CommandError::Timeout {
                command: line,
                timeout: timeout.unwrap_or_default(),
            }),
            FakeReply::SpawnFailure(reason) => Err(CommandError::Spawn {
                command: line,
                reason,
            }),
        }
    }
}
