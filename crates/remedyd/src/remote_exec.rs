//! Remote command execution.
//!
//! [`CommandExecutor`] only accepts a [`VettedCommand`], and the only way to
//! build one is through the whitelist. An unvetted string cannot reach a host.

use crate::config::RemoteConfig;
use async_trait::async_trait;
use remedy_common::command_whitelist::{is_command_allowed, CommandEffect};
use remedy_common::error::{RemedyError, RemedyResult};
use serde::Serialize;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// A command string that passed the whitelist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VettedCommand {
    command: String,
    effect: CommandEffect,
}

impl VettedCommand {
    pub fn vet(command: &str) -> RemedyResult<Self> {
        let check = is_command_allowed(command);
        match (check.allowed, check.command) {
            (true, Some(entry)) => Ok(Self {
                command: command.trim().to_string(),
                effect: entry.effect,
            }),
            _ => Err(RemedyError::CommandRejected {
                command: command.to_string(),
                reason: check.reason.unwrap_or_else(|| "not whitelisted".to_string()),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.command
    }

    pub fn is_mutating(&self) -> bool {
        self.effect == CommandEffect::Mutating
    }

    fn argv(&self) -> Vec<&str> {
        self.command.split_whitespace().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn execute(&self, command: &VettedCommand) -> RemedyResult<CommandOutput>;
}

/// Runs vetted commands over `ssh` in batch mode
pub struct SshCommandExecutor {
    host: Option<String>,
    user: String,
    timeout: Duration,
}

impl SshCommandExecutor {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            host: config.host.clone(),
            user: config.user.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl CommandExecutor for SshCommandExecutor {
    fn is_configured(&self) -> bool {
        self.host.is_some()
    }

    async fn execute(&self, command: &VettedCommand) -> RemedyResult<CommandOutput> {
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| RemedyError::Config("remote.host is not set".to_string()))?;
        let target = format!("{}@{}", self.user, host);

        info!("[REMOTE] {} on {}", command.as_str(), target);
        let child = Command::new("ssh")
            .args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10", &target, "--"])
            .args(command.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("[REMOTE] {} timed out after {:?}", command.as_str(), self.timeout);
                return Err(RemedyError::Timeout(self.timeout.as_millis() as u64));
            }
        };

        let result = CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success {
            warn!(
                "[REMOTE] {} exited with {:?}: {}",
                command.as_str(),
                result.exit_code,
                result.stderr.trim()
            );
        }
        Ok(result)
    }
}

/// Records commands instead of running them
#[derive(Default)]
pub struct FakeCommandExecutor {
    executed: Mutex<Vec<String>>,
    failing: bool,
}

impl FakeCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command exits non-zero
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CommandExecutor for FakeCommandExecutor {
    fn is_configured(&self) -> bool {
        true
    }

    async fn execute(&self, command: &VettedCommand) -> RemedyResult<CommandOutput> {
        self.executed
            .lock()
            .map_err(|_| RemedyError::remote("fake executor", "poisoned"))?
            .push(command.as_str().to_string());
        Ok(CommandOutput {
            success: !self.failing,
            exit_code: Some(if self.failing { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if self.failing { "failed".to_string() } else { String::new() },
        })
    }
}
