//! # Progress Registry
//!
//! Keyed store of live progress records. Every record lives inside its own
//! `tokio::sync::watch` channel: the sender *is* the record, so mutating it and
//! notifying observers is a single atomic step, and each stream consumer simply
//! holds a receiver.
//!
//! ## Locking:
//! - The id → sender map sits behind one `RwLock`. Creating and removing
//!   records takes the write lock; everything else (updates, reads, streams)
//!   only needs the read lock.
//! - Per-record mutation goes through `watch::Sender::send_if_modified`, which
//!   holds the channel's own lock while the closure runs. The terminal guard and
//!   the transition check therefore happen atomically with the write.
//!
//! ## Streaming contract:
//! `stream(id)` yields the current snapshot immediately, then a snapshot after
//! each change, and ends right after it has yielded a terminal snapshot. Fast
//! successive updates may be coalesced (a watch channel keeps only the latest
//! value), but the terminal snapshot is never skipped because nothing can
//! change after it.

use crate::progress::record::{ProgressRecord, ProgressStatus, ProgressUpdate, TaskCategory};
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use uuid::Uuid;

/// Capacity of the terminal-event broadcast; slow subscribers lag, they never block.
const TERMINAL_EVENT_CAPACITY: usize = 256;

/// Lazy sequence of snapshots for one record.
pub type ProgressStream = BoxStream<'static, ProgressRecord>;

/// Retention policy applied by [`ProgressRegistry::cleanup`].
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Terminal records completed longer ago than this are removed
    pub retention: Duration,
    /// At most this many terminal records are kept (newest first)
    pub max_terminal_records: usize,
    /// Non-terminal records not updated for this long are cancelled
    pub stale_after: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            max_terminal_records: 1000,
            stale_after: Duration::from_secs(6 * 3600),
        }
    }
}

/// Outcome of one cleanup pass.
#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct CleanupReport {
    pub removed: usize,
    pub expired: usize,
}

pub struct ProgressRegistry {
    records: RwLock<HashMap<String, watch::Sender<ProgressRecord>>>,
    terminal_tx: broadcast::Sender<ProgressRecord>,
    policy: RetentionPolicy,
}

impl ProgressRegistry {
    pub fn new(policy: RetentionPolicy) -> Self {
        let (terminal_tx, _) = broadcast::channel(TERMINAL_EVENT_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            terminal_tx,
            policy,
        }
    }

    /// Start tracking a new unit of work.
    ///
    /// ## Returns:
    /// The new record id. The record starts `pending` with progress 0.
    pub fn create(
        &self,
        category: TaskCategory,
        label: impl Into<String>,
        total_steps: u32,
        metadata: Map<String, Value>,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let label = label.into();
        let record = ProgressRecord::new(task_id.clone(), category, label.clone(), total_steps, metadata);
        let (tx, _rx) = watch::channel(record);

        self.write_records().insert(task_id.clone(), tx);
        debug!(task_id = %task_id, category = %category, label = %label, "Progress record created");
        task_id
    }

    /// Merge a partial update into a record.
    ///
    /// Returns `false` when the record is missing, already terminal, or the
    /// update would move the status backwards. In every `false` case the record
    /// is left exactly as it was.
    pub fn update(&self, task_id: &str, update: ProgressUpdate) -> bool {
        let records = self.read_records();
        let Some(tx) = records.get(task_id) else {
            return false;
        };

        let mut terminal_snapshot = None;
        let applied = tx.send_if_modified(|record| {
            let applied = record.apply(update);
            if applied && record.is_terminal() {
                terminal_snapshot = Some(record.clone());
            }
            applied
        });
        drop(records);

        if let Some(snapshot) = terminal_snapshot {
            self.announce_terminal(snapshot);
        }
        applied
    }

    /// Force a record into `completed` (success) or `failed`.
    ///
    /// ## Parameters:
    /// - **success**: completed with progress 100, or failed with progress kept
    /// - **error_message**: stored on the record (a default is used for failures)
    /// - **result_metadata**: merged into the record's metadata
    pub fn complete(
        &self,
        task_id: &str,
        success: bool,
        error_message: Option<String>,
        result_metadata: Option<Map<String, Value>>,
    ) -> bool {
        let mut update = if success {
            ProgressUpdate::new()
                .status(ProgressStatus::Completed)
                .progress(100.0)
                .step("Completed")
        } else {
            ProgressUpdate::new()
                .status(ProgressStatus::Failed)
                .step("Failed")
                .message(error_message.clone().unwrap_or_else(|| "Task failed".to_string()))
        };
        if success {
            if let Some(msg) = error_message {
                update = update.message(msg);
            }
        }
        if let Some(metadata) = result_metadata {
            update = update.metadata(metadata);
        }
        update = update.eta("0s");

        let applied = self.update(task_id, update);
        if applied {
            info!(task_id = %task_id, success, "Progress record finished");
        }
        applied
    }

    /// Force a record into `cancelled` unless it already finished.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.cancel_with_reason(task_id, "Cancelled by request")
    }

    /// Cancel with a specific message (expiry, upload timeout, shutdown).
    pub fn cancel_with_reason(&self, task_id: &str, reason: &str) -> bool {
        let applied = self.update(
            task_id,
            ProgressUpdate::new()
                .status(ProgressStatus::Cancelled)
                .step("Cancelled")
                .message(reason),
        );
        if applied {
            info!(task_id = %task_id, reason, "Progress record cancelled");
        }
        applied
    }

    /// Point-in-time snapshot of one record.
    pub fn get(&self, task_id: &str) -> Option<ProgressRecord> {
        self.read_records().get(task_id).map(|tx| tx.borrow().clone())
    }

    /// All non-terminal records, oldest first, optionally filtered by category.
    pub fn list_active(&self, category: Option<TaskCategory>) -> Vec<ProgressRecord> {
        self.list(category, false)
    }

    /// All records, optionally including terminal ones.
    pub fn list(&self, category: Option<TaskCategory>, include_terminal: bool) -> Vec<ProgressRecord> {
        let mut out: Vec<ProgressRecord> = self
            .read_records()
            .values()
            .map(|tx| tx.borrow().clone())
            .filter(|r| include_terminal || !r.is_terminal())
            .filter(|r| category.map_or(true, |c| r.category == c))
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    /// Live view of one record.
    ///
    /// Each call returns an independent stream. `None` when the id is unknown.
    pub fn stream(&self, task_id: &str) -> Option<ProgressStream> {
        let rx = self.read_records().get(task_id)?.subscribe();
        Some(snapshot_stream(rx))
    }

    /// Receive a copy of every record the moment it becomes terminal.
    ///
    /// This is the hook an archiving layer would use to persist final results.
    pub fn subscribe_terminal(&self) -> broadcast::Receiver<ProgressRecord> {
        self.terminal_tx.subscribe()
    }

    /// Apply the retention policy.
    ///
    /// ## What this does:
    /// 1. Cancels non-terminal records that have not been updated within
    ///    `stale_after` (they count as `expired`), unless their id is in
    ///    `owned`: those belong to a job that is still queued or running and
    ///    will settle them itself
    /// 2. Removes terminal records completed more than `retention` ago
    /// 3. If more than `max_terminal_records` terminal records remain, removes
    ///    the oldest until the cap holds
    pub fn cleanup(&self, owned: &HashSet<String>) -> CleanupReport {
        let now = Utc::now();
        let stale_after = self.policy.stale_after.as_secs() as i64;

        let stale: Vec<String> = self
            .read_records()
            .values()
            .filter_map(|tx| {
                let rec = tx.borrow();
                (!rec.is_terminal() && rec.idle_seconds(now) > stale_after && !owned.contains(&rec.task_id))
                    .then(|| rec.task_id.clone())
            })
            .collect();
        let expired = stale
            .iter()
            .filter(|id| self.cancel_with_reason(id, "Expired after inactivity"))
            .count();

        let retention = self.policy.retention;
        let mut records = self.write_records();
        let before = records.len();

        records.retain(|_, tx| {
            let rec = tx.borrow();
            match rec.completed_at {
                Some(done) if rec.is_terminal() => now
                    .signed_duration_since(done)
                    .to_std()
                    .map_or(true, |age| age <= retention),
                _ => true,
            }
        });

        let mut terminal: Vec<(chrono::DateTime<Utc>, String)> = records
            .values()
            .filter_map(|tx| {
                let rec = tx.borrow();
                rec.completed_at
                    .filter(|_| rec.is_terminal())
                    .map(|done| (done, rec.task_id.clone()))
            })
            .collect();
        if terminal.len() > self.policy.max_terminal_records {
            terminal.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, id) in terminal.drain(self.policy.max_terminal_records..) {
                records.remove(&id);
            }
        }

        let report = CleanupReport {
            removed: before - records.len(),
            expired,
        };
        if report.removed > 0 || report.expired > 0 {
            info!(removed = report.removed, expired = report.expired, "Progress cleanup finished");
        }
        report
    }

    fn announce_terminal(&self, snapshot: ProgressRecord) {
        // No subscribers is the normal case.
        let _ = self.terminal_tx.send(snapshot);
    }

    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, watch::Sender<ProgressRecord>>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_records(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, watch::Sender<ProgressRecord>>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

enum StreamState {
    Start(watch::Receiver<ProgressRecord>),
    Watching(watch::Receiver<ProgressRecord>),
    Done,
}

fn snapshot_stream(rx: watch::Receiver<ProgressRecord>) -> ProgressStream {
    stream::unfold(StreamState::Start(rx), |state| async move {
        let mut rx = match state {
            StreamState::Done => return None,
            StreamState::Start(rx) => rx,
            StreamState::Watching(mut rx) => {
                // Sender gone means the record was removed; end quietly.
                rx.changed().await.ok()?;
                rx
            }
        };
        let snapshot = rx.borrow_and_update().clone();
        let next = if snapshot.is_terminal() {
            StreamState::Done
        } else {
            StreamState::Watching(rx)
        };
        Some((snapshot, next))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProgressRegistry {
        ProgressRegistry::default()
    }

    #[test]
    fn test_create_starts_pending() {
        let reg = registry();
        let id = reg.create(TaskCategory::Transcription, "meeting.wav", 3, Map::new());
        let rec = reg.get(&id).unwrap();
        assert_eq!(rec.status, ProgressStatus::Pending);
        assert_eq!(rec.progress, 0.0);
        assert_eq!(rec.total_steps, 3);
    }

    #[test]
    fn test_update_missing_record_is_noop() {
        let reg = registry();
        assert!(!reg.update("nope", ProgressUpdate::new().progress(10.0)));
        assert!(!reg.complete("nope", true, None, None));
        assert!(!reg.cancel("nope"));
    }

    #[test]
    fn test_progress_monotonic_while_processing() {
        let reg = registry();
        let id = reg.create(TaskCategory::Upload, "f", 10, Map::new());
        reg.update(&id, ProgressUpdate::new().status(ProgressStatus::Processing));

        let mut last = 0.0;
        for p in [10.0, 35.0, 20.0, 35.0, 90.0, 50.0, -5.0, 120.0] {
            assert!(reg.update(&id, ProgressUpdate::new().progress(p)));
            let now = reg.get(&id).unwrap().progress;
            assert!(now >= last, "progress regressed from {} to {}", last, now);
            assert!((0.0..=100.0).contains(&now));
            last = now;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_terminal_records_ignore_everything() {
        let reg = registry();
        let id = reg.create(TaskCategory::Export, "f", 1, Map::new());
        assert!(reg.complete(&id, false, Some("boom".into()), None));
        let frozen = reg.get(&id).unwrap();
        assert_eq!(frozen.status, ProgressStatus::Failed);
        assert_eq!(frozen.message.as_deref(), Some("boom"));

        assert!(!reg.update(&id, ProgressUpdate::new().progress(99.0)));
        assert!(!reg.complete(&id, true, None, None));
        assert!(!reg.cancel(&id));
        assert_eq!(reg.get(&id).unwrap(), frozen);
    }

    #[test]
    fn test_complete_success_sets_full_progress_and_metadata() {
        let reg = registry();
        let id = reg.create(TaskCategory::Upload, "f", 1, Map::new());
        let mut meta = Map::new();
        meta.insert("final_path".into(), Value::from("/tmp/out.wav"));
        assert!(reg.complete(&id, true, None, Some(meta)));
        let rec = reg.get(&id).unwrap();
        assert_eq!(rec.status, ProgressStatus::Completed);
        assert_eq!(rec.progress, 100.0);
        assert!(rec.completed_at.is_some());
        assert_eq!(rec.metadata["final_path"], "/tmp/out.wav");
    }

    #[test]
    fn test_list_active_filters() {
        let reg = registry();
        let a = reg.create(TaskCategory::Upload, "a", 1, Map::new());
        let _b = reg.create(TaskCategory::Transcription, "b", 1, Map::new());
        let c = reg.create(TaskCategory::Upload, "c", 1, Map::new());
        reg.cancel(&c);

        let uploads = reg.list_active(Some(TaskCategory::Upload));
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].task_id, a);
        assert_eq!(reg.list_active(None).len(), 2);
        assert_eq!(reg.list(None, true).len(), 3);
    }

    #[test]
    fn test_cleanup_caps_terminal_records() {
        let reg = ProgressRegistry::new(RetentionPolicy {
            retention: Duration::from_secs(3600),
            max_terminal_records: 2,
            stale_after: Duration::from_secs(3600),
        });
        let active = reg.create(TaskCategory::Upload, "active", 1, Map::new());
        let mut finished = Vec::new();
        for i in 0..4 {
            let id = reg.create(TaskCategory::Upload, format!("done-{}", i), 1, Map::new());
            reg.complete(&id, true, None, None);
            finished.push(id);
            std::thread::sleep(Duration::from_millis(5));
        }

        let report = reg.cleanup(&HashSet::new());
        assert_eq!(report.removed, 2);
        assert!(reg.get(&active).is_some());
        assert!(reg.get(&finished[0]).is_none());
        assert!(reg.get(&finished[1]).is_none());
        assert!(reg.get(&finished[3]).is_some());
    }

    #[test]
    fn test_cleanup_removes_expired_terminal_records() {
        let reg = ProgressRegistry::new(RetentionPolicy {
            retention: Duration::from_secs(0),
            max_terminal_records: 100,
            stale_after: Duration::from_secs(3600),
        });
        let id = reg.create(TaskCategory::Download, "x", 1, Map::new());
        reg.cancel(&id);
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(reg.cleanup(&HashSet::new()).removed, 1);
        assert!(reg.get(&id).is_none());
    }

    #[test]
    fn test_cleanup_expires_stale_records() {
        let reg = ProgressRegistry::new(RetentionPolicy {
            retention: Duration::from_secs(3600),
            max_terminal_records: 100,
            stale_after: Duration::from_secs(0),
        });
        let id = reg.create(TaskCategory::Download, "x", 1, Map::new());
        std::thread::sleep(Duration::from_millis(1100));
        let report = reg.cleanup(&HashSet::new());
        assert_eq!(report.expired, 1);
        let rec = reg.get(&id).unwrap();
        assert_eq!(rec.status, ProgressStatus::Cancelled);
        assert_eq!(rec.message.as_deref(), Some("Expired after inactivity"));
    }

    #[test]
    fn test_cleanup_keeps_owned_idle_records() {
        let reg = ProgressRegistry::new(RetentionPolicy {
            retention: Duration::from_secs(3600),
            max_terminal_records: 100,
            stale_after: Duration::from_secs(0),
        });
        let queued = reg.create(TaskCategory::Transcription, "queued", 3, Map::new());
        let orphan = reg.create(TaskCategory::Transcription, "orphan", 3, Map::new());
        std::thread::sleep(Duration::from_millis(1100));

        let owned: HashSet<String> = [queued.clone()].into_iter().collect();
        assert_eq!(reg.cleanup(&owned).expired, 1);
        assert_eq!(reg.get(&queued).unwrap().status, ProgressStatus::Pending);
        assert_eq!(reg.get(&orphan).unwrap().status, ProgressStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stream_yields_snapshot_updates_then_terminal() {
        let reg = std::sync::Arc::new(registry());
        let id = reg.create(TaskCategory::Transcription, "t", 2, Map::new());
        let mut stream = reg.stream(&id).unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.status, ProgressStatus::Pending);

        reg.update(&id, ProgressUpdate::new().status(ProgressStatus::Processing).progress(50.0));
        let second = stream.next().await.unwrap();
        assert_eq!(second.status, ProgressStatus::Processing);
        assert_eq!(second.progress, 50.0);

        reg.complete(&id, true, None, None);
        let last = stream.next().await.unwrap();
        assert_eq!(last.status, ProgressStatus::Completed);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_of_finished_record_ends_after_one_item() {
        let reg = registry();
        let id = reg.create(TaskCategory::Upload, "t", 1, Map::new());
        reg.cancel(&id);
        let items: Vec<ProgressRecord> = reg.stream(&id).unwrap().collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ProgressStatus::Cancelled);
        assert!(reg.stream("missing").is_none());
    }

    #[tokio::test]
    async fn test_terminal_events_are_broadcast() {
        let reg = registry();
        let mut rx = reg.subscribe_terminal();
        let id = reg.create(TaskCategory::Upload, "t", 1, Map::new());
        reg.update(&id, ProgressUpdate::new().progress(30.0));
        reg.complete(&id, true, None, None);
        reg.cancel(&id);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, id);
        assert_eq!(event.status, ProgressStatus::Completed);
        assert!(rx.try_recv().is_err());
    }
}
