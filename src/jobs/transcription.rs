//! # Transcription Job
//!
//! One attempt of a file transcription: decode, lease the model, transcribe
//! 30 second segments on the blocking pool, report after each one.

use crate::audio::{self, DecodedAudio};
use crate::progress::{format_eta, ProgressRegistry, ProgressStatus, ProgressUpdate};
use crate::scheduler::JobContext;
use crate::transcription::SpeechModelManager;
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Steps shown on the progress record.
pub const TOTAL_STEPS: u32 = 3;

/// Share of the progress bar spent before the first segment.
const PREPARE_PERCENT: f64 = 10.0;

#[derive(Clone)]
pub struct TranscriptionJob {
    pub file_path: PathBuf,
    pub language: Option<String>,
    pub progress_id: String,
    pub progress: Arc<ProgressRegistry>,
    pub models: Arc<SpeechModelManager>,
}

impl TranscriptionJob {
    /// Run one attempt and settle the progress record accordingly.
    ///
    /// ## Progress record outcomes:
    /// - success: completed, transcript in metadata
    /// - cancelled: cancelled
    /// - failure with retries left: stays open, message notes the retry
    /// - failure on the final attempt: failed
    pub async fn run(self, ctx: JobContext) -> Result<Value> {
        let outcome = self.attempt(&ctx).await;

        match &outcome {
            Ok(result) => {
                let metadata = result.as_object().cloned().unwrap_or_default();
                self.progress.complete(&self.progress_id, true, None, Some(metadata));
            }
            Err(_) if ctx.is_cancelled() => {
                self.progress.cancel_with_reason(&self.progress_id, "Transcription cancelled");
            }
            Err(e) if ctx.is_final_attempt() => {
                self.progress
                    .complete(&self.progress_id, false, Some(format!("{:#}", e)), None);
            }
            Err(e) => {
                warn!(task_id = %ctx.task_id, attempt = ctx.attempt, "Transcription attempt failed: {:#}", e);
                self.progress.update(
                    &self.progress_id,
                    ProgressUpdate::new().message(format!(
                        "Attempt {} of {} failed, retrying: {:#}",
                        ctx.attempt,
                        ctx.max_retries + 1,
                        e
                    )),
                );
            }
        }
        outcome
    }

    async fn attempt(&self, ctx: &JobContext) -> Result<Value> {
        let started = Instant::now();
        self.progress.update(&self.progress_id, decoding_update(ctx.attempt));

        let path = self.file_path.clone();
        let decoded: DecodedAudio = tokio::task::spawn_blocking(move || audio::decode_file(&path))
            .await
            .context("Audio decoding task failed")??;
        if decoded.samples.is_empty() {
            bail!("Audio file contains no samples");
        }
        check_cancelled(ctx)?;

        self.progress.update(
            &self.progress_id,
            ProgressUpdate::new()
                .step("Loading model")
                .step_index(2)
                .progress(PREPARE_PERCENT / 2.0),
        );
        let lease = self.models.acquire().await?;
        check_cancelled(ctx)?;

        let segment_count = decoded.segment_count();
        let duration_secs = decoded.duration_secs();
        let transcribe_started = Instant::now();
        let mut texts = Vec::with_capacity(segment_count);

        for (index, segment) in decoded.segments().enumerate() {
            check_cancelled(ctx)?;

            let model = lease.shared();
            let pcm = segment.to_vec();
            let language = self.language.clone();
            let text = tokio::task::spawn_blocking(move || model.transcribe(&pcm, language.as_deref()))
                .await
                .context("Transcription task failed")??;
            texts.push(text);

            let done = index + 1;
            let per_segment = transcribe_started.elapsed().as_secs_f64() / done as f64;
            self.progress.update(
                &self.progress_id,
                ProgressUpdate::new()
                    .status(ProgressStatus::Processing)
                    .step(format!("Transcribing segment {}/{}", done, segment_count))
                    .step_index(3)
                    .progress(PREPARE_PERCENT + (100.0 - PREPARE_PERCENT) * done as f64 / segment_count as f64)
                    .eta(format_eta(per_segment * (segment_count - done) as f64)),
            );
            debug!(task_id = %ctx.task_id, segment = done, total = segment_count, "Segment done");
            tokio::task::yield_now().await;
        }
        lease.release();

        let text = texts
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            task_id = %ctx.task_id,
            segments = segment_count,
            audio_secs = duration_secs,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transcription finished"
        );

        let mut result = Map::new();
        result.insert("text".to_string(), json!(text));
        result.insert("segments".to_string(), json!(segment_count));
        result.insert("duration_secs".to_string(), json!(duration_secs));
        result.insert("language".to_string(), json!(self.language));
        result.insert("file_path".to_string(), json!(self.file_path.display().to_string()));
        Ok(Value::Object(result))
    }
}

fn check_cancelled(ctx: &JobContext) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(anyhow!("Transcription cancelled"));
    }
    Ok(())
}

/// First update of an attempt. Only the first attempt moves the record to
/// `initializing`; a retry finds it already `processing` and a backwards
/// status would reject the whole update.
fn decoding_update(attempt: u32) -> ProgressUpdate {
    let update = ProgressUpdate::new().step("Decoding audio").step_index(1);
    if attempt == 1 {
        update.status(ProgressStatus::Initializing)
    } else {
        update
    }
}
