//! # Job Catalog
//!
//! Describes the jobs clients can submit and turns a description into a
//! scheduled task with its own progress record.
//!
//! ## Job Types:
//! - **transcription**: `{"type": "transcription", "file_path": "...", "language": "en"}`
//!
//! ## Key Components:
//! - **JobSpec**: the tagged job description accepted by `POST /api/v1/jobs`
//! - **JobCatalog**: submits jobs, cancels them, and hands the upload assembler
//!   a completion hook that queues a transcription for finished uploads

pub mod transcription;

use crate::error::{AppError, AppResult};
use crate::progress::{CleanupReport, ProgressRegistry, TaskCategory};
use crate::scheduler::{job_fn, Priority, TaskScheduler};
use crate::transcription::SpeechModelManager;
use crate::upload::{CompletedUpload, CompletionHook};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use transcription::TranscriptionJob;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSpec {
    Transcription {
        file_path: PathBuf,
        #[serde(default)]
        language: Option<String>,
    },
}

/// Body of `POST /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub job: JobSpec,
    #[serde(default)]
    pub priority: Priority,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubmittedJob {
    pub task_id: String,
    pub progress_id: String,
}

pub struct JobCatalog {
    scheduler: TaskScheduler,
    progress: Arc<ProgressRegistry>,
    models: Arc<SpeechModelManager>,
    default_language: Option<String>,
    default_max_retries: u32,
    /// task id -> progress record id
    progress_ids: Mutex<HashMap<String, String>>,
}

impl JobCatalog {
    pub fn new(
        scheduler: TaskScheduler,
        progress: Arc<ProgressRegistry>,
        models: Arc<SpeechModelManager>,
        default_language: Option<String>,
        default_max_retries: u32,
    ) -> Self {
        Self {
            scheduler,
            progress,
            models,
            default_language,
            default_max_retries,
            progress_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a job, open its progress record and queue it.
    ///
    /// ## Returns:
    /// - `ValidationError` when the input file does not exist
    /// - `Capacity` when the scheduler queue is full (the progress record is
    ///   failed with the same message)
    pub fn submit(&self, spec: JobSpec, priority: Priority, max_retries: Option<u32>) -> AppResult<SubmittedJob> {
        let max_retries = max_retries.unwrap_or(self.default_max_retries);

        match spec {
            JobSpec::Transcription { file_path, language } => {
                if !file_path.is_file() {
                    return Err(AppError::ValidationError(format!(
                        "Audio file not found: {}",
                        file_path.display()
                    )));
                }
                let language = language.or_else(|| self.default_language.clone());
                let file_name = file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file_path.display().to_string());

                let mut metadata = Map::new();
                metadata.insert("file_path".to_string(), json!(file_path.display().to_string()));
                metadata.insert("language".to_string(), json!(language));
                let progress_id = self.progress.create(
                    TaskCategory::Transcription,
                    format!("Transcribe {}", file_name),
                    transcription::TOTAL_STEPS,
                    metadata,
                );

                let job = TranscriptionJob {
                    file_path,
                    language,
                    progress_id: progress_id.clone(),
                    progress: self.progress.clone(),
                    models: self.models.clone(),
                };
                let submitted = self.scheduler.submit(
                    format!("transcription: {}", file_name),
                    job_fn(move |ctx| job.clone().run(ctx)),
                    priority,
                    max_retries,
                );

                let task_id = match submitted {
                    Ok(task_id) => task_id,
                    Err(e) => {
                        self.progress.complete(&progress_id, false, Some(e.message().to_string()), None);
                        return Err(e);
                    }
                };
                self.lock_ids().insert(task_id.clone(), progress_id.clone());
                info!(task_id = %task_id, progress_id = %progress_id, file = %file_name, "Transcription job queued");
                Ok(SubmittedJob { task_id, progress_id })
            }
        }
    }

    /// Cancel a task and its progress record.
    pub fn cancel(&self, task_id: &str) -> bool {
        let cancelled = self.scheduler.cancel(task_id);
        if cancelled {
            if let Some(progress_id) = self.progress_id(task_id) {
                self.progress.cancel(&progress_id);
            }
        }
        cancelled
    }

    pub fn progress_id(&self, task_id: &str) -> Option<String> {
        self.lock_ids().get(task_id).cloned()
    }

    /// Remove terminal tasks from the scheduler and forget their progress ids.
    pub fn compact(&self) -> usize {
        let removed = self.scheduler.compact();
        if removed > 0 {
            let mut ids = self.lock_ids();
            ids.retain(|task_id, _| self.scheduler.status(task_id).is_some());
        }
        removed
    }

    /// Progress cleanup that never expires the record of a task the scheduler
    /// still holds as pending or running.
    pub fn cleanup_progress(&self) -> CleanupReport {
        let owned: HashSet<String> = self
            .lock_ids()
            .iter()
            .filter(|(task_id, _)| {
                self.scheduler
                    .status(task_id)
                    .is_some_and(|snapshot| !snapshot.status.is_terminal())
            })
            .map(|(_, progress_id)| progress_id.clone())
            .collect();
        self.progress.cleanup(&owned)
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Hook for the upload assembler: queue a transcription for every finished
    /// upload that asked for one.
    pub fn completion_hook(self: &Arc<Self>) -> CompletionHook {
        let catalog = Arc::downgrade(self);
        Arc::new(move |upload: CompletedUpload| {
            if !upload.auto_transcribe {
                return;
            }
            let Some(catalog) = catalog.upgrade() else {
                return;
            };
            let spec = JobSpec::Transcription {
                file_path: upload.final_path.clone(),
                language: upload.language.clone(),
            };
            match catalog.submit(spec, Priority::Normal, None) {
                Ok(job) => info!(
                    session_id = %upload.session_id,
                    task_id = %job.task_id,
                    "Queued transcription for completed upload"
                ),
                Err(e) => error!(session_id = %upload.session_id, "Could not queue transcription: {}", e),
            }
        })
    }

    fn lock_ids(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.progress_ids.lock().unwrap_or_else(|p| p.into_inner())
    }
}
