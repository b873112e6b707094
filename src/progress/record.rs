//! # Progress Records
//!
//! The data carried by a progress record and the rules for changing it.
//!
//! ## State Machine:
//! ```text
//! pending → initializing → processing ⇄ paused
//!                              ↓
//!              completed | failed | cancelled   (terminal)
//! ```
//! Any non-terminal state may jump straight to a terminal one. Nothing moves
//! backwards, and a terminal record never changes again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What kind of work a record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Upload,
    Transcription,
    AiProcessing,
    Download,
    Export,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Upload => "upload",
            TaskCategory::Transcription => "transcription",
            TaskCategory::AiProcessing => "ai_processing",
            TaskCategory::Download => "download",
            TaskCategory::Export => "export",
        }
    }
}

impl std::str::FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "upload" => Ok(TaskCategory::Upload),
            "transcription" => Ok(TaskCategory::Transcription),
            "ai_processing" | "ai-processing" | "ai" => Ok(TaskCategory::AiProcessing),
            "download" => Ok(TaskCategory::Download),
            "export" => Ok(TaskCategory::Export),
            _ => Err(format!("Unknown task category: {}", s)),
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Initializing,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Cancelled
        )
    }

    /// Position along the state machine; paused shares processing's slot.
    fn rank(&self) -> u8 {
        match self {
            ProgressStatus::Pending => 0,
            ProgressStatus::Initializing => 1,
            ProgressStatus::Processing | ProgressStatus::Paused => 2,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Cancelled => 3,
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: ProgressStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Initializing => "initializing",
            ProgressStatus::Processing => "processing",
            ProgressStatus::Paused => "paused",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
            ProgressStatus::Cancelled => "cancelled",
        }
    }
}

/// Snapshot of one unit of tracked work.
///
/// Serialized as-is for the progress endpoints and for every SSE event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task_id: String,
    pub category: TaskCategory,
    pub label: String,
    pub status: ProgressStatus,
    /// Percentage in [0, 100], never decreasing
    pub progress: f64,
    pub current_step: String,
    pub step_index: u32,
    pub total_steps: u32,
    pub processed_size: u64,
    pub total_size: Option<u64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    /// Set for failed and cancelled records
    pub message: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn new(
        task_id: String,
        category: TaskCategory,
        label: String,
        total_steps: u32,
        metadata: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            category,
            label,
            status: ProgressStatus::Pending,
            progress: 0.0,
            current_step: "Waiting to start".to_string(),
            step_index: 0,
            total_steps,
            processed_size: 0,
            total_size: None,
            speed: None,
            eta: None,
            message: None,
            metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a partial update.
    ///
    /// ## Returns:
    /// - `false` (and leaves the record untouched) when the record is terminal or
    ///   the requested status would move backwards
    /// - `true` otherwise
    ///
    /// Progress is clamped to [0, 100] and then to at least its current value.
    pub fn apply(&mut self, update: ProgressUpdate) -> bool {
        if self.is_terminal() {
            return false;
        }
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return false;
            }
        }

        let now = Utc::now();
        if let Some(next) = update.status {
            self.status = next;
            if next.is_terminal() {
                self.completed_at = Some(now);
                if next == ProgressStatus::Completed {
                    self.progress = 100.0;
                }
            }
        }
        if let Some(progress) = update.progress {
            let clamped = if progress.is_finite() { progress.clamp(0.0, 100.0) } else { 0.0 };
            self.progress = self.progress.max(clamped);
        }
        if let Some(step) = update.current_step {
            self.current_step = step;
        }
        if let Some(index) = update.step_index {
            self.step_index = index;
        }
        if let Some(size) = update.processed_size {
            self.processed_size = size;
        }
        if let Some(total) = update.total_size {
            self.total_size = Some(total);
        }
        if let Some(speed) = update.speed {
            self.speed = Some(speed);
        }
        if let Some(eta) = update.eta {
            self.eta = Some(eta);
        }
        if let Some(message) = update.message {
            self.message = Some(message);
        }
        if let Some(metadata) = update.metadata {
            self.metadata.extend(metadata);
        }
        self.updated_at = now;
        true
    }

    /// Seconds since the last mutation, used by stale-record expiry.
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.updated_at).num_seconds()
    }
}

/// A partial update; every `None` field is left as it is.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub status: Option<ProgressStatus>,
    pub progress: Option<f64>,
    pub current_step: Option<String>,
    pub step_index: Option<u32>,
    pub processed_size: Option<u64>,
    pub total_size: Option<u64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ProgressStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn step_index(mut self, index: u32) -> Self {
        self.step_index = Some(index);
        self
    }

    pub fn sizes(mut self, processed: u64, total: u64) -> Self {
        self.processed_size = Some(processed);
        self.total_size = Some(total);
        self
    }

    pub fn speed(mut self, speed: impl Into<String>) -> Self {
        self.speed = Some(speed.into());
        self
    }

    pub fn eta(mut self, eta: impl Into<String>) -> Self {
        self.eta = Some(eta.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Format a byte rate as a short human-readable string ("1.5 MB/s").
pub fn format_speed(bytes_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    if !bytes_per_second.is_finite() || bytes_per_second <= 0.0 {
        return "0 B/s".to_string();
    }
    let mut value = bytes_per_second;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Format a remaining duration ("45s", "3m 20s", "1h 05m").
pub fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "unknown".to_string();
    }
    let total = seconds.round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
