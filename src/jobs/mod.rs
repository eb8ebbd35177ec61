//! Asynchronous, cancellable jobs run on behalf of units.
//!
//! Each job runs on its own tokio task. Concurrency is bounded per unit by a
//! semaphore; excess submissions either wait as `Pending` or are rejected,
//! depending on [`QueuePolicy`]. Outcomes feed the unit's circuit breaker.
//!
//! Cancellation is cooperative. A running handler that does not return
//! within the grace period after `cancel` is dropped and the job is marked
//! `Cancelled`; anything the handler spawned itself keeps running.

mod circuit;
mod job;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

pub use circuit::{BreakerStats, CircuitBreaker, CircuitBreakers, CircuitState};
pub use job::{CancelToken, Job, JobContext, JobFilter, JobStatus};

use crate::error::{BridgeError, BridgeResult};
use crate::events::EventBus;
use crate::monitoring::{AuditEventType, AuditLog, OperationClass, RateLimiter, TimeoutPolicy};
use crate::types::topics;

/// Semaphore and counter key for jobs without an owning unit.
const HOST_KEY: &str = "host";

/// What to do when a unit already runs `max_concurrent` jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Keep the job `Pending` until a slot frees up.
    #[default]
    Queue,
    /// Refuse the submission with `ConcurrencyLimit`.
    Reject,
}

/// Job manager settings.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// Default per-unit concurrency when the manifest sets none.
    pub max_concurrent: usize,
    /// Terminal jobs kept before the oldest are pruned.
    pub max_history: usize,
    pub queue_policy: QueuePolicy,
    /// How long a cancelled running handler may take to notice.
    pub cancel_grace: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_history: 200,
            queue_policy: QueuePolicy::Queue,
            cancel_grace: Duration::from_secs(2),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

/// Job statistics, overall or for one unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub open_circuits: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breakers: Vec<BreakerStats>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    total: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    rejected: u64,
}

#[derive(Debug)]
enum Outcome {
    Completed(serde_json::Value),
    Failed(String),
    Cancelled(Option<String>),
}

struct JobEntry {
    job: Job,
    cancel: CancelToken,
}

struct Inner {
    config: JobManagerConfig,
    jobs: RwLock<HashMap<String, JobEntry>>,
    semaphores: Mutex<HashMap<String, (usize, Arc<Semaphore>)>>,
    limits: RwLock<HashMap<String, usize>>,
    counters: Mutex<HashMap<String, Counters>>,
    breakers: CircuitBreakers,
    rate_limiter: Arc<RateLimiter>,
    timeouts: Arc<TimeoutPolicy>,
    events: Arc<EventBus>,
    audit: Arc<AuditLog>,
    finished: Notify,
}

/// Runs and tracks jobs.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.inner.config)
            .field("jobs", &self.inner.jobs.read().len())
            .finish()
    }
}

impl JobManager {
    /// Create a manager. Rate limiting is off and timeouts use defaults
    /// until set with the `with_*` methods.
    pub fn new(config: JobManagerConfig, events: Arc<EventBus>, audit: Arc<AuditLog>) -> Self {
        Self::with_parts(
            config,
            events,
            audit,
            Arc::new(RateLimiter::disabled()),
            Arc::new(TimeoutPolicy::default()),
        )
    }

    pub fn with_parts(
        config: JobManagerConfig,
        events: Arc<EventBus>,
        audit: Arc<AuditLog>,
        rate_limiter: Arc<RateLimiter>,
        timeouts: Arc<TimeoutPolicy>,
    ) -> Self {
        let breakers = CircuitBreakers::new(config.breaker_threshold, config.breaker_cooldown);
        Self {
            inner: Arc::new(Inner {
                config,
                jobs: RwLock::new(HashMap::new()),
                semaphores: Mutex::new(HashMap::new()),
                limits: RwLock::new(HashMap::new()),
                counters: Mutex::new(HashMap::new()),
                breakers,
                rate_limiter,
                timeouts,
                events,
                audit,
                finished: Notify::new(),
            }),
        }
    }

    /// Set a unit's concurrency limit, usually from its manifest.
    pub fn set_unit_limit(&self, unit_id: &str, max_concurrent: usize) {
        self.inner.limits.write().insert(unit_id.to_string(), max_concurrent.max(1));
    }

    /// Concurrency limit in force for a unit.
    pub fn unit_limit(&self, unit_id: &str) -> usize {
        self.inner.limit_for(unit_id)
    }

    /// Submit a job. See [`JobManager::submit_named`].
    pub fn submit<F, Fut>(
        &self,
        unit_id: Option<&str>,
        handler: F,
        params: serde_json::Value,
    ) -> BridgeResult<String>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        self.submit_named(unit_id, "job", handler, params)
    }

    /// Submit a named job and return its id.
    ///
    /// Fails with `CircuitOpen` when the unit's breaker refuses work,
    /// `RateLimited` when the unit exhausted its token bucket, and
    /// `ConcurrencyLimit` when all slots are taken under
    /// [`QueuePolicy::Reject`]. Must be called within a tokio runtime.
    pub fn submit_named<F, Fut>(
        &self,
        unit_id: Option<&str>,
        name: &str,
        handler: F,
        params: serde_json::Value,
    ) -> BridgeResult<String>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let inner = &self.inner;
        let key = unit_id.unwrap_or(HOST_KEY).to_string();
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BridgeError::Validation("job submission requires a tokio runtime".to_string())
        })?;

        if let Some(unit) = unit_id {
            if let Err(e) = inner.breakers.check(unit) {
                inner.count(&key, |c| c.rejected += 1);
                tracing::warn!(unit = %unit, "Job rejected, circuit open");
                return Err(e);
            }
            if let Err(e) = inner.rate_limiter.acquire(unit) {
                inner.breakers.release_probe(unit);
                inner.count(&key, |c| c.rejected += 1);
                inner.audit.record(AuditEventType::RateLimited, Some(unit), false, json!({ "job": name }));
                return Err(e);
            }
        }

        let semaphore = inner.semaphore_for(&key);
        let permit = match inner.config.queue_policy {
            QueuePolicy::Queue => None,
            QueuePolicy::Reject => match Arc::clone(&semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    if let Some(unit) = unit_id {
                        inner.breakers.release_probe(unit);
                    }
                    inner.count(&key, |c| c.rejected += 1);
                    return Err(BridgeError::ConcurrencyLimit {
                        unit: key.clone(),
                        max: inner.limit_for(&key),
                    });
                }
            },
        };

        let job_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancelToken::new();
        let job = Job::new(job_id.clone(), unit_id, name, params.clone());
        inner.jobs.write().insert(job_id.clone(), JobEntry { job, cancel: cancel.clone() });
        inner.count(&key, |c| c.total += 1);
        inner.audit.record(
            AuditEventType::JobSubmitted,
            unit_id,
            true,
            json!({ "job_id": job_id, "name": name }),
        );
        tracing::debug!(job = %job_id, unit = %key, name = %name, "Job submitted");

        let weak = Arc::downgrade(inner);
        let progress_id = job_id.clone();
        let ctx = JobContext::new(
            job_id.clone(),
            unit_id.map(str::to_string),
            params,
            cancel.clone(),
            Arc::new(move |percent, message| report_progress(&weak, &progress_id, percent, message)),
        );
        let budget = match unit_id {
            Some(unit) => inner.timeouts.timeout_for(OperationClass::Job, unit),
            None => inner.timeouts.job,
        };

        let task_inner = Arc::clone(inner);
        let task_id = job_id.clone();
        runtime.spawn(async move {
            run_job(task_inner, task_id, semaphore, permit, cancel, budget, handler(ctx)).await;
        });

        Ok(job_id)
    }

    /// Request cancellation. A pending job is cancelled at once; a running
    /// one once its handler notices or the grace period runs out.
    /// Returns false if the job had already finished.
    pub fn cancel(&self, job_id: &str) -> BridgeResult<bool> {
        // Signalled under the jobs lock so `mark_running` either ran first
        // or sees the token and refuses.
        let status = {
            let jobs = self.inner.jobs.read();
            let entry = jobs.get(job_id).ok_or_else(|| BridgeError::NotFound(format!("job {job_id}")))?;
            if entry.job.status.is_terminal() {
                return Ok(false);
            }
            entry.cancel.cancel();
            entry.job.status
        };

        if status == JobStatus::Pending {
            self.inner.finish(job_id, Outcome::Cancelled(None));
        }
        tracing::info!(job = %job_id, "Job cancellation requested");
        Ok(true)
    }

    /// Cancel every unfinished job of a unit. Returns how many were signalled.
    pub fn cancel_unit(&self, unit_id: &str) -> usize {
        let ids: Vec<String> = self
            .inner
            .jobs
            .read()
            .values()
            .filter(|e| e.job.unit_id.as_deref() == Some(unit_id) && !e.job.status.is_terminal())
            .map(|e| e.job.id.clone())
            .collect();

        ids.iter().filter(|id| matches!(self.cancel(id), Ok(true))).count()
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.read().get(job_id).map(|e| e.job.clone())
    }

    /// Jobs matching a filter, newest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .read()
            .values()
            .filter(|e| filter.matches(&e.job))
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    /// Statistics for one unit, or for everything when `unit_id` is `None`.
    pub fn get_stats(&self, unit_id: Option<&str>) -> JobStats {
        let inner = &self.inner;
        let mut stats = JobStats { unit_id: unit_id.map(str::to_string), ..Default::default() };

        {
            let counters = inner.counters.lock();
            let selected: Vec<&Counters> = match unit_id {
                Some(unit) => counters.get(unit).into_iter().collect(),
                None => counters.values().collect(),
            };
            for c in selected {
                stats.total += c.total;
                stats.completed += c.completed;
                stats.failed += c.failed;
                stats.cancelled += c.cancelled;
                stats.rejected += c.rejected;
            }
        }

        for entry in inner.jobs.read().values() {
            if unit_id.is_some() && entry.job.unit_id.as_deref() != unit_id {
                continue;
            }
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                _ => {}
            }
        }

        match unit_id {
            Some(unit) => {
                if inner.breakers.state(unit) == CircuitState::Open {
                    stats.open_circuits.push(unit.to_string());
                }
                stats.breakers = inner.breakers.stats(unit).into_iter().collect();
            }
            None => {
                stats.open_circuits = inner.breakers.open_units();
                stats.breakers = inner.breakers.all_stats();
            }
        }
        stats
    }

    /// Wait until a job reaches a terminal state.
    pub async fn wait(&self, job_id: &str) -> BridgeResult<Job> {
        loop {
            let notified = self.inner.finished.notified();
            let job = self.get(job_id).ok_or_else(|| BridgeError::NotFound(format!("job {job_id}")))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            notified.await;
        }
    }

    /// The breakers guarding job submission.
    pub fn breakers(&self) -> &CircuitBreakers {
        &self.inner.breakers
    }

    /// Forget a unit: cancel its jobs and drop its limits and breaker.
    pub fn remove_unit(&self, unit_id: &str) -> usize {
        let cancelled = self.cancel_unit(unit_id);
        self.inner.limits.write().remove(unit_id);
        self.inner.semaphores.lock().remove(unit_id);
        self.inner.breakers.remove(unit_id);
        cancelled
    }
}

impl Inner {
    fn limit_for(&self, key: &str) -> usize {
        self.limits.read().get(key).copied().unwrap_or(self.config.max_concurrent).max(1)
    }

    fn semaphore_for(&self, key: &str) -> Arc<Semaphore> {
        let limit = self.limit_for(key);
        let mut semaphores = self.semaphores.lock();
        match semaphores.get(key) {
            Some((size, semaphore)) if *size == limit => Arc::clone(semaphore),
            _ => {
                let semaphore = Arc::new(Semaphore::new(limit));
                semaphores.insert(key.to_string(), (limit, Arc::clone(&semaphore)));
                semaphore
            }
        }
    }

    fn count(&self, key: &str, update: impl FnOnce(&mut Counters)) {
        update(self.counters.lock().entry(key.to_string()).or_default());
    }

    fn mark_running(&self, job_id: &str) -> bool {
        let (unit, name) = {
            let mut jobs = self.jobs.write();
            let Some(entry) = jobs.get_mut(job_id) else {
                return false;
            };
            if entry.job.status != JobStatus::Pending || entry.cancel.is_cancelled() {
                return false;
            }
            entry.job.status = JobStatus::Running;
            entry.job.started_at = Some(Utc::now());
            (entry.job.unit_id.clone(), entry.job.name.clone())
        };

        self.events.emit(
            topics::JOB_STARTED,
            json!({ "job_id": job_id, "unit_id": unit, "name": name }),
            unit.as_deref(),
        );
        true
    }

    /// Record a terminal outcome. Later calls for the same job are ignored.
    fn finish(&self, job_id: &str, outcome: Outcome) {
        let job = {
            let mut jobs = self.jobs.write();
            let Some(entry) = jobs.get_mut(job_id) else {
                return;
            };
            if entry.job.status.is_terminal() {
                return;
            }
            let job = &mut entry.job;
            job.completed_at = Some(Utc::now());
            match &outcome {
                Outcome::Completed(value) => {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.result = Some(value.clone());
                }
                Outcome::Failed(message) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(message.clone());
                }
                Outcome::Cancelled(message) => {
                    job.status = JobStatus::Cancelled;
                    job.error = message.clone();
                }
            }
            job.clone()
        };

        let key = job.unit_id.clone().unwrap_or_else(|| HOST_KEY.to_string());
        let unit = job.unit_id.as_deref();
        let payload = json!({
            "job_id": job.id,
            "unit_id": job.unit_id,
            "name": job.name,
            "status": job.status,
            "error": job.error,
        });

        match outcome {
            Outcome::Completed(_) => {
                self.count(&key, |c| c.completed += 1);
                if let Some(unit) = unit {
                    self.breakers.record_success(unit);
                }
                self.audit.record(AuditEventType::JobCompleted, unit, true, payload.clone());
                self.events.emit(topics::JOB_COMPLETED, payload, unit);
                tracing::debug!(job = %job.id, unit = %key, "Job completed");
            }
            Outcome::Failed(message) => {
                self.count(&key, |c| c.failed += 1);
                if let Some(unit) = unit {
                    if self.breakers.record_failure(unit) {
                        tracing::warn!(unit = %unit, "Circuit opened after repeated job failures");
                        self.audit.record(
                            AuditEventType::CircuitOpened,
                            Some(unit),
                            false,
                            json!({ "job_id": job.id }),
                        );
                    }
                }
                self.audit.record(AuditEventType::JobFailed, unit, false, payload.clone());
                self.events.emit(topics::JOB_FAILED, payload, unit);
                tracing::warn!(job = %job.id, unit = %key, error = %message, "Job failed");
            }
            Outcome::Cancelled(_) => {
                self.count(&key, |c| c.cancelled += 1);
                if let Some(unit) = unit {
                    self.breakers.release_probe(unit);
                }
                self.audit.record(AuditEventType::JobCancelled, unit, true, payload.clone());
                self.events.emit(topics::JOB_CANCELLED, payload, unit);
                tracing::info!(job = %job.id, unit = %key, "Job cancelled");
            }
        }

        self.prune();
        self.finished.notify_waiters();
    }

    fn prune(&self) {
        let mut jobs = self.jobs.write();
        let mut terminal: Vec<(chrono::DateTime<Utc>, String)> = jobs
            .values()
            .filter(|e| e.job.status.is_terminal())
            .map(|e| (e.job.completed_at.unwrap_or(e.job.created_at), e.job.id.clone()))
            .collect();
        if terminal.len() <= self.config.max_history {
            return;
        }
        terminal.sort();
        let excess = terminal.len() - self.config.max_history;
        for (_, id) in terminal.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }
}

fn report_progress(inner: &Weak<Inner>, job_id: &str, percent: u8, message: Option<String>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let unit = {
        let mut jobs = inner.jobs.write();
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        if entry.job.status != JobStatus::Running {
            return;
        }
        entry.job.progress = percent;
        entry.job.progress_message.clone_from(&message);
        entry.job.unit_id.clone()
    };
    inner.events.emit(
        topics::JOB_PROGRESS,
        json!({ "job_id": job_id, "unit_id": unit, "progress": percent, "message": message }),
        unit.as_deref(),
    );
}

async fn run_job<Fut>(
    inner: Arc<Inner>,
    job_id: String,
    semaphore: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
    cancel: CancelToken,
    budget: Duration,
    handler: Fut,
) where
    Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
{
    let permit = match permit {
        Some(permit) => permit,
        None => {
            tokio::select! {
                acquired = semaphore.acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => {
                        inner.finish(&job_id, Outcome::Failed("job slots closed".to_string()));
                        return;
                    }
                },
                () = cancel.cancelled() => {
                    inner.finish(&job_id, Outcome::Cancelled(None));
                    return;
                }
            }
        }
    };

    if cancel.is_cancelled() || !inner.mark_running(&job_id) {
        drop(permit);
        inner.finish(&job_id, Outcome::Cancelled(None));
        return;
    }

    let grace = inner.config.cancel_grace;
    let abandon_after_cancel = async {
        cancel.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    let outcome = tokio::select! {
        result = AssertUnwindSafe(handler).catch_unwind() => match result {
            Ok(_) if cancel.is_cancelled() => Outcome::Cancelled(None),
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(message)) => Outcome::Failed(message),
            Err(panic) => Outcome::Failed(format!("handler panicked: {}", panic_message(&*panic))),
        },
        () = tokio::time::sleep(budget) => {
            cancel.cancel();
            Outcome::Failed(format!("timed out after {}ms", budget.as_millis()))
        },
        () = abandon_after_cancel => {
            tracing::warn!(job = %job_id, ?grace, "Handler ignored cancellation, abandoning it");
            Outcome::Cancelled(Some("handler abandoned after cancellation grace period".to_string()))
        },
    };

    drop(permit);
    inner.finish(&job_id, outcome);
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
