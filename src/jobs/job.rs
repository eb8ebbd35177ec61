//! Job records, filters, and the context handed to job handlers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a concurrency slot.
    Pending,
    /// Handler is executing.
    Running,
    /// Handler returned a value.
    Completed,
    /// Handler returned an error, panicked, or timed out.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl JobStatus {
    /// Check if the job has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    pub name: String,
    pub status: JobStatus,
    /// Percent complete, 0..=100.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(id: String, unit_id: Option<&str>, name: &str, params: serde_json::Value) -> Self {
        Self {
            id,
            unit_id: unit_id.map(str::to_string),
            name: name.to_string(),
            status: JobStatus::Pending,
            progress: 0,
            progress_message: None,
            params,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Wall-clock run time, if the job started.
    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds())
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub unit_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn for_unit(unit_id: &str) -> Self {
        Self { unit_id: Some(unit_id.to_string()), ..Default::default() }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn matches(&self, job: &Job) -> bool {
        if let Some(unit) = &self.unit_id {
            if job.unit_id.as_deref() != Some(unit.as_str()) {
                return false;
            }
        }
        self.status.map_or(true, |status| job.status == status)
    }
}

/// Cooperative cancellation flag shared between the manager and a handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) type ProgressFn = Arc<dyn Fn(u8, Option<String>) + Send + Sync>;

/// Handed to every job handler. Handlers poll `is_cancelled` (or await
/// `cancelled`) at safe points; nothing stops a handler that never does.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    unit_id: Option<String>,
    params: serde_json::Value,
    cancel: CancelToken,
    progress: ProgressFn,
}

impl JobContext {
    pub(crate) fn new(
        job_id: String,
        unit_id: Option<String>,
        params: serde_json::Value,
        cancel: CancelToken,
        progress: ProgressFn,
    ) -> Self {
        Self { job_id, unit_id, params, cancel, progress }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn unit_id(&self) -> Option<&str> {
        self.unit_id.as_deref()
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Report progress (clamped to 100) with an optional message.
    pub fn report_progress(&self, percent: u8, message: Option<&str>) {
        (self.progress)(percent.min(100), message.map(str::to_string));
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("unit_id", &self.unit_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!(JobStatus::parse("canceled"), Some(JobStatus::Cancelled));
    }

    #[test]
    fn test_filter() {
        let job = Job::new("1".to_string(), Some("acme.lint"), "scan", serde_json::Value::Null);
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::for_unit("acme.lint").matches(&job));
        assert!(!JobFilter::for_unit("acme.other").matches(&job));
        assert!(!JobFilter::for_unit("acme.lint").with_status(JobStatus::Running).matches(&job));
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(token.is_cancelled());
    }
}
