//! # Progress Tracking
//!
//! A registry of fine-grained progress records that any component (uploads,
//! transcription jobs, exports) can create, update and observe.
//!
//! ## Key Components:
//! - **record**: the record type, its status state machine and partial updates
//! - **registry**: the concurrent store with live streams and retention cleanup

pub mod record;
pub mod registry;

pub use record::{format_eta, format_speed, ProgressRecord, ProgressStatus, ProgressUpdate, TaskCategory};
pub use registry::{CleanupReport, ProgressRegistry, ProgressStream, RetentionPolicy};

use crate::config::ProgressConfig;

impl From<&ProgressConfig> for RetentionPolicy {
    fn from(config: &ProgressConfig) -> Self {
        Self {
            retention: config.retention(),
            max_terminal_records: config.max_terminal_records,
            stale_after: config.stale_after(),
        }
    }
}
