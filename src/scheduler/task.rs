//! # Queue Tasks
//!
//! The units of work the scheduler owns: a job closure plus everything needed to
//! order, retry and report on it.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Dequeue preference. `Urgent` is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// What a running job gets to see about itself.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub task_id: String,
    /// 1 on the first execution, 2 on the first retry, ...
    pub attempt: u32,
    pub max_retries: u32,
    /// Fired when the task is cancelled or the scheduler shuts down
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether a failure now would be terminal rather than retried.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt > self.max_retries
    }
}

pub type JobFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A re-runnable job body. Called once per attempt.
pub type Job = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

/// Wrap an async closure as a [`Job`].
pub fn job_fn<F, Fut>(f: F) -> Job
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Position in the pending queue: highest priority first, then submission order.
pub(crate) type QueueKey = (Reverse<Priority>, u64);

pub(crate) struct QueueTask {
    pub id: String,
    pub label: String,
    pub job: Job,
    pub priority: Priority,
    /// Submission sequence number; kept across retries so a retried task keeps its place
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub attempts: u32,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub cancel: Option<CancellationToken>,
}

impl QueueTask {
    pub fn new(id: String, label: String, job: Job, priority: Priority, max_retries: u32, seq: u64) -> Self {
        Self {
            id,
            label,
            job,
            priority,
            seq,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries,
            attempts: 0,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            cancel: None,
        }
    }

    pub fn queue_key(&self) -> QueueKey {
        (Reverse(self.priority), self.seq)
    }

    pub fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.cancel = None;
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            label: self.label.clone(),
            priority: self.priority,
            status: self.status,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            attempts: self.attempts,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: match (self.started_at, self.finished_at) {
                (Some(start), Some(end)) => Some(end.signed_duration_since(start).num_milliseconds()),
                _ => None,
            },
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Serializable view of a task, without the job closure.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub label: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<String>,
}
