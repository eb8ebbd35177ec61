//! Host-side collaborators the locator hands out to units.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// A program invocation. Arguments are passed as argv, never through a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl CommandRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Self::default() }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Captured result of a finished program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes programs on behalf of units.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: CommandRequest) -> BridgeResult<CommandOutput>;
}

/// Runs programs as child processes with captured output.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    default_timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self { default_timeout: Duration::from_secs(120) }
    }
}

impl ProcessRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, request: CommandRequest) -> BridgeResult<CommandOutput> {
        if request.program.trim().is_empty() {
            return Err(BridgeError::Validation("empty program name".to_string()));
        }

        let mut cmd = tokio::process::Command::new(&request.program);
        cmd.args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        let budget = request.timeout_ms.map_or(self.default_timeout, Duration::from_millis);
        let start = Instant::now();
        let output = tokio::time::timeout(budget, cmd.output()).await.map_err(|_| {
            BridgeError::Timeout {
                operation: format!("command '{}'", request.program),
                unit: "host".to_string(),
                after_ms: budget.as_millis() as u64,
            }
        })??;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// One analysis snapshot from the host's history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub summary: serde_json::Value,
}

/// Read access to the host's snapshot history.
pub trait HistoryProvider: Send + Sync {
    /// Most recent snapshots first.
    fn recent(&self, limit: usize) -> Vec<HistorySnapshot>;

    fn get(&self, snapshot_id: &str) -> Option<HistorySnapshot>;
}

/// History provider for hosts without a history store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHistory;

impl HistoryProvider for NullHistory {
    fn recent(&self, _limit: usize) -> Vec<HistorySnapshot> {
        Vec::new()
    }

    fn get(&self, _snapshot_id: &str) -> Option<HistorySnapshot> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_program_rejected() {
        let err = ProcessRunner::default().run(CommandRequest::new("  ")).await.unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_arguments_are_not_shell_expanded() {
        let output = ProcessRunner::default()
            .run(CommandRequest::new("echo").arg("$HOME; rm -rf /"))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "$HOME; rm -rf /");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let err = ProcessRunner::default()
            .run(CommandRequest::new("sleep").arg("5").timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
    }

    #[test]
    fn test_null_history() {
        assert!(NullHistory.recent(10).is_empty());
        assert!(NullHistory.get("latest").is_none());
    }
}
