//! Worker loop.
//!
//! Each worker pops the best pending task, runs one attempt of its job on a
//! separate tokio task (so a panic is caught as a `JoinError` instead of taking
//! the worker down), then settles the outcome under the scheduler lock.

use super::task::{JobContext, TaskStatus};
use super::Shared;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

enum Outcome {
    Succeeded(Value),
    Failed(String),
}

pub(crate) async fn run(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id, "Worker started");

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let Some((job, ctx)) = next_task(&shared) else {
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = shared.shutdown.cancelled() => break,
            }
            continue;
        };

        let task_id = ctx.task_id.clone();
        let attempt = ctx.attempt;
        debug!(worker_id, task_id = %task_id, attempt, "Executing task");

        let outcome = match tokio::spawn(job(ctx)).await {
            Ok(Ok(value)) => Outcome::Succeeded(value),
            Ok(Err(e)) => Outcome::Failed(format!("{:#}", e)),
            Err(join_err) if join_err.is_panic() => {
                error!(worker_id, task_id = %task_id, "Job panicked");
                Outcome::Failed(format!("Job panicked: {}", panic_message(join_err)))
            }
            Err(join_err) => Outcome::Failed(format!("Job aborted: {}", join_err)),
        };

        settle(&shared, &task_id, outcome);
    }

    debug!(worker_id, "Worker stopped");
}

/// Pop the head of the queue and mark it running.
fn next_task(shared: &Shared) -> Option<(super::Job, JobContext)> {
    let mut state = shared.lock();
    let (_, task_id) = state.queue.pop_first()?;
    let Some(task) = state.tasks.get_mut(&task_id) else {
        warn!(task_id = %task_id, "Queued task missing from task table");
        return None;
    };

    let token = shared.shutdown.child_token();
    task.status = TaskStatus::Running;
    task.attempts += 1;
    task.started_at.get_or_insert_with(Utc::now);
    task.cancel = Some(token.clone());

    let job = task.job.clone();
    let ctx = JobContext {
        task_id: task.id.clone(),
        attempt: task.attempts,
        max_retries: task.max_retries,
        cancel: token,
    };
    state.running += 1;
    Some((job, ctx))
}

/// Record the result of one attempt: complete, retry, fail or cancel.
fn settle(shared: &Shared, task_id: &str, outcome: Outcome) {
    let mut guard = shared.lock();
    let state = &mut *guard;
    state.running = state.running.saturating_sub(1);

    let Some(task) = state.tasks.get_mut(task_id) else {
        return;
    };

    if task.cancel_requested || shared.shutdown.is_cancelled() {
        if let Outcome::Failed(msg) = &outcome {
            task.error = Some(msg.clone());
        }
        task.finish(TaskStatus::Cancelled);
        info!(task_id = %task_id, "Task cancelled");
        return;
    }

    match outcome {
        Outcome::Succeeded(value) => {
            task.result = Some(value);
            task.error = None;
            task.finish(TaskStatus::Completed);
            if let (Some(start), Some(end)) = (task.started_at, task.finished_at) {
                state.completed_duration_ms += end.signed_duration_since(start).num_milliseconds();
                state.completed_count += 1;
            }
            info!(task_id = %task_id, attempts = task.attempts, "Task completed");
        }
        Outcome::Failed(msg) if task.retry_count < task.max_retries => {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.cancel = None;
            warn!(
                task_id = %task_id,
                retry = task.retry_count,
                max_retries = task.max_retries,
                error = %msg,
                "Task failed, re-queueing"
            );
            task.error = Some(msg);
            let key = task.queue_key();
            state.queue.insert(key, task_id.to_string());
            shared.notify.notify_one();
        }
        Outcome::Failed(msg) => {
            error!(task_id = %task_id, attempts = task.attempts, error = %msg, "Task failed");
            task.error = Some(msg);
            task.finish(TaskStatus::Failed);
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
