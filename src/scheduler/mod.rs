//! # Task Scheduler
//!
//! A priority queue in front of a fixed pool of async workers.
//!
//! ## Key Components:
//! - **task**: priorities, job closures and the per-task record
//! - **worker**: the loop each worker runs (pop, execute, settle)
//! - **TaskScheduler**: the public handle (submit, status, cancel, stats)
//!
//! ## Ordering:
//! Pending tasks are kept in a `BTreeMap` keyed by `(Reverse(priority), seq)`,
//! so the first entry is always the highest priority, oldest submission. A
//! retried task is re-inserted with its original sequence number and therefore
//! goes back to the front of its priority band.
//!
//! ## Locking:
//! All task state (the task table, the pending queue, counters) lives under a
//! single `std::sync::Mutex`. It is never held across an `.await`; jobs run
//! outside of it.

pub mod task;
mod worker;

pub use task::{job_fn, Job, JobContext, Priority, TaskSnapshot, TaskStatus};

use crate::config::SchedulerConfig;
use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use task::{QueueKey, QueueTask};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Aggregate counters returned by [`TaskScheduler::stats`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchedulerStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Mean wall-clock seconds of completed tasks, first start to finish
    pub average_duration_secs: f64,
    /// running / workers, in [0, 1]
    pub worker_utilization: f64,
    pub workers: usize,
    pub max_queue_size: usize,
}

#[derive(Default)]
pub(crate) struct SchedulerState {
    pub tasks: HashMap<String, QueueTask>,
    pub queue: BTreeMap<QueueKey, String>,
    pub next_seq: u64,
    pub running: usize,
    pub completed_duration_ms: i64,
    pub completed_count: u64,
}

pub(crate) struct Shared {
    pub state: Mutex<SchedulerState>,
    pub notify: Notify,
    pub shutdown: CancellationToken,
    pub workers: usize,
    pub max_queue_size: usize,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cloneable handle to the scheduler. All clones share one queue and pool.
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
    started: Arc<AtomicBool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskScheduler {
    /// Create a scheduler. Workers do not run until [`start`](Self::start).
    pub fn new(workers: usize, max_queue_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState::default()),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                workers: workers.max(1),
                max_queue_size,
            }),
            started: Arc::new(AtomicBool::new(false)),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.workers, config.max_queue_size)
    }

    /// Spawn the worker pool. Calling this twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        for worker_id in 0..self.shared.workers {
            handles.push(tokio::spawn(worker::run(self.shared.clone(), worker_id)));
        }
        info!(workers = self.shared.workers, max_queue_size = self.shared.max_queue_size, "Task scheduler started");
    }

    /// Queue a job.
    ///
    /// ## Parameters:
    /// - **label**: human-readable description shown in snapshots and logs
    /// - **job**: called once per attempt with a fresh [`JobContext`]
    /// - **priority**: dequeue preference
    /// - **max_retries**: extra attempts allowed after a failure
    ///
    /// ## Returns:
    /// The task id, or `AppError::Capacity` when pending + running tasks already
    /// reach the configured bound. Never waits for the job to run.
    pub fn submit(
        &self,
        label: impl Into<String>,
        job: Job,
        priority: Priority,
        max_retries: u32,
    ) -> AppResult<String> {
        if self.shared.shutdown.is_cancelled() {
            return Err(AppError::ResourceExhausted("Scheduler is shutting down".to_string()));
        }

        let label = label.into();
        let task_id = Uuid::new_v4().to_string();
        {
            let mut state = self.shared.lock();
            let in_flight = state.queue.len() + state.running;
            if in_flight >= self.shared.max_queue_size {
                warn!(in_flight, max = self.shared.max_queue_size, "Job queue is full, rejecting submission");
                return Err(AppError::Capacity(format!(
                    "Job queue is full ({} pending or running tasks)",
                    in_flight
                )));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let task = QueueTask::new(task_id.clone(), label.clone(), job, priority, max_retries, seq);
            state.queue.insert(task.queue_key(), task_id.clone());
            state.tasks.insert(task_id.clone(), task);
        }

        self.shared.notify.notify_one();
        debug!(task_id = %task_id, label = %label, ?priority, max_retries, "Task submitted");
        Ok(task_id)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.shared.lock().tasks.get(task_id).map(QueueTask::snapshot)
    }

    /// Cancel a task.
    ///
    /// - pending: removed from the queue and marked cancelled immediately
    /// - running: its cancellation token fires; the task is marked cancelled
    ///   once the job returns
    /// - terminal or unknown: `false`
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.shared.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };

        match task.status {
            TaskStatus::Pending => {
                let key = task.queue_key();
                task.error = Some("Cancelled before start".to_string());
                task.finish(TaskStatus::Cancelled);
                state.queue.remove(&key);
                info!(task_id = %task_id, "Pending task cancelled");
                true
            }
            TaskStatus::Running => {
                task.cancel_requested = true;
                if let Some(token) = &task.cancel {
                    token.cancel();
                }
                info!(task_id = %task_id, "Cancellation requested for running task");
                true
            }
            _ => false,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        let mut stats = SchedulerStats {
            total: state.tasks.len(),
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            average_duration_secs: 0.0,
            worker_utilization: state.running as f64 / self.shared.workers as f64,
            workers: self.shared.workers,
            max_queue_size: self.shared.max_queue_size,
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        if state.completed_count > 0 {
            stats.average_duration_secs =
                state.completed_duration_ms as f64 / state.completed_count as f64 / 1000.0;
        }
        stats
    }

    /// All tasks, oldest submission first.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let state = self.shared.lock();
        let mut tasks: Vec<&QueueTask> = state.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks.into_iter().map(QueueTask::snapshot).collect()
    }

    /// Drop every terminal task from the table. Returns how many were removed.
    pub fn compact(&self) -> usize {
        let mut state = self.shared.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !task.status.is_terminal());
        let removed = before - state.tasks.len();
        if removed > 0 {
            info!(removed, "Compacted task table");
        }
        removed
    }

    /// Stop the workers and signal every running job to cancel.
    ///
    /// Pending tasks stay pending; nothing will pick them up.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker exited abnormally: {}", e);
            }
        }
        info!("Task scheduler stopped");
    }
}
