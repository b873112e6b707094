//! # Chunked Upload Assembler
//!
//! Resumable multi-part uploads. A client opens a session, sends chunks in any
//! order (re-sending is fine), and the call that delivers the last missing
//! chunk reassembles and verifies the file before it returns.
//!
//! ## Storage layout:
//! - chunks: `temp_dir/<session_id>/chunk_00000`, one file each
//! - while assembling: `upload_dir/.<session_id>.partial`
//! - verified result: `upload_dir/<session_id>_<file_name>`
//!
//! ## Locking:
//! The session table is one `Mutex<HashMap>`. Validation and bookkeeping happen
//! under it; file I/O never does. A chunk is validated, the lock is released,
//! the bytes are staged and renamed into place, then the lock is retaken to
//! mark the chunk. A chunk that lands after reassembly began is ignored. The
//! `assembling` flag is flipped under the lock, which is what makes reassembly
//! run exactly once even when the last two chunks race.

use super::session::{
    chunk_layout, chunk_path, normalize_hash, validate_file_name, ChunkReceipt, CompletedUpload,
    CreateSessionRequest, SessionCreated, UploadSession, UploadStatus,
};
use crate::config::UploadConfig;
use crate::error::{AppError, AppResult};
use crate::progress::{format_eta, format_speed, ProgressRegistry, ProgressStatus, ProgressUpdate, TaskCategory};
use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Called after a file has been reassembled and its hash verified.
pub type CompletionHook = Arc<dyn Fn(CompletedUpload) + Send + Sync>;

/// What reassembly needs, captured under the lock.
struct AssemblyPlan {
    session_id: String,
    file_name: String,
    file_size: u64,
    file_hash: String,
    chunk_paths: Vec<PathBuf>,
    scratch_dir: PathBuf,
    progress_id: String,
}

pub struct ChunkedUploadAssembler {
    config: UploadConfig,
    sessions: Mutex<HashMap<String, UploadSession>>,
    progress: Arc<ProgressRegistry>,
    on_complete: RwLock<Option<CompletionHook>>,
}

impl ChunkedUploadAssembler {
    pub fn new(config: UploadConfig, progress: Arc<ProgressRegistry>) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            progress,
            on_complete: RwLock::new(None),
        }
    }

    /// Register the hook fired for every verified upload.
    pub fn set_completion_hook(&self, hook: CompletionHook) {
        *self.on_complete.write().unwrap_or_else(|p| p.into_inner()) = Some(hook);
    }

    /// Open a new upload session.
    ///
    /// ## What this does:
    /// 1. Validates the file name, size, hash and chunk size
    /// 2. Rejects with `AppError::Capacity` when too many sessions are open
    /// 3. Lays out `ceil(file_size / chunk_size)` chunks
    /// 4. Creates an `upload` progress record and the scratch directory
    pub async fn create_session(&self, request: CreateSessionRequest) -> AppResult<SessionCreated> {
        validate_file_name(&request.file_name)?;
        let file_hash = normalize_hash(&request.file_hash)?;
        if request.file_size == 0 {
            return Err(AppError::ValidationError("file_size must be greater than 0".to_string()));
        }
        let chunk_size = request.chunk_size.unwrap_or(self.config.default_chunk_size);
        if chunk_size == 0 || chunk_size > self.config.max_chunk_size {
            return Err(AppError::ValidationError(format!(
                "chunk_size must be between 1 and {} bytes",
                self.config.max_chunk_size
            )));
        }
        if request.file_size > self.config.max_file_size {
            return Err(AppError::ValidationError(format!(
                "file_size {} exceeds the {} byte limit",
                request.file_size, self.config.max_file_size
            )));
        }
        let chunk_count = request.file_size.div_ceil(chunk_size);
        if chunk_count > u64::from(self.config.max_chunks) {
            return Err(AppError::ValidationError(format!(
                "{} chunks requested, at most {} per session; use a larger chunk_size",
                chunk_count, self.config.max_chunks
            )));
        }
        let chunks = chunk_layout(request.file_size, chunk_size);

        let session_id = Uuid::new_v4().to_string();
        let file_name = request.file_name.trim().to_string();
        let total_chunks = chunks.len() as u32;
        let scratch_dir = self.config.temp_dir.join(&session_id);

        let mut record_meta = request.metadata.clone();
        record_meta.insert("session_id".into(), Value::from(session_id.clone()));
        record_meta.insert("file_name".into(), Value::from(file_name.clone()));
        record_meta.insert("file_size".into(), Value::from(request.file_size));
        record_meta.insert("chunk_size".into(), Value::from(chunk_size));
        record_meta.insert("total_chunks".into(), Value::from(total_chunks));

        let progress_id = {
            let mut sessions = self.lock();
            let open = sessions.values().filter(|s| !s.completed).count();
            if open >= self.config.max_sessions {
                warn!(open, max = self.config.max_sessions, "Upload session limit reached");
                return Err(AppError::Capacity(format!(
                    "Maximum concurrent upload sessions ({}) reached",
                    self.config.max_sessions
                )));
            }

            let progress_id = self.progress.create(TaskCategory::Upload, file_name.clone(), total_chunks, record_meta);
            let now = Instant::now();
            sessions.insert(
                session_id.clone(),
                UploadSession {
                    id: session_id.clone(),
                    file_name: file_name.clone(),
                    file_size: request.file_size,
                    file_hash,
                    chunk_size,
                    chunks,
                    scratch_dir: scratch_dir.clone(),
                    progress_id: progress_id.clone(),
                    created_at: Utc::now(),
                    opened: now,
                    last_activity: now,
                    bytes_received: 0,
                    assembling: false,
                    completed: false,
                    final_path: None,
                    auto_transcribe: request.auto_transcribe,
                    language: request.language.clone(),
                    metadata: request.metadata,
                },
            );
            progress_id
        };

        if let Err(e) = tokio::fs::create_dir_all(&scratch_dir).await {
            error!(session_id = %session_id, "Failed to create scratch directory: {}", e);
            self.lock().remove(&session_id);
            self.progress
                .complete(&progress_id, false, Some(format!("Scratch storage unavailable: {}", e)), None);
            return Err(e.into());
        }

        info!(
            session_id = %session_id,
            file_name = %file_name,
            file_size = request.file_size,
            chunk_size,
            total_chunks,
            "Upload session created"
        );
        Ok(SessionCreated {
            session_id,
            chunk_size,
            total_chunks,
            progress_id,
        })
    }

    /// Store one chunk.
    ///
    /// ## Returns:
    /// - a receipt; `completed` is true once the whole file is verified
    /// - `ValidationError` for a bad index or length (nothing is changed), or
    ///   for a hash mismatch during reassembly (the session is failed and gone)
    /// - `NotFound` for unknown or cancelled sessions
    ///
    /// Re-sending a chunk overwrites the stored copy.
    pub async fn upload_chunk(&self, session_id: &str, chunk_index: u32, data: &[u8]) -> AppResult<ChunkReceipt> {
        let path = {
            let mut sessions = self.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| AppError::NotFound(format!("Upload session {} not found", session_id)))?;

            if session.completed || session.assembling {
                return Ok(receipt(session, false));
            }
            let Some(chunk) = session.chunks.get(chunk_index as usize) else {
                return Err(AppError::ValidationError(format!(
                    "Chunk index {} out of range (0..{})",
                    chunk_index,
                    session.total_chunks()
                )));
            };
            if data.len() as u64 != chunk.len() {
                return Err(AppError::ValidationError(format!(
                    "Chunk {} must be {} bytes, got {}",
                    chunk_index,
                    chunk.len(),
                    data.len()
                )));
            }
            session.last_activity = Instant::now();
            chunk_path(&session.scratch_dir, chunk_index)
        };

        let chunk_hash = format!("{:x}", Sha256::digest(data));
        if let Err(e) = store_chunk(&path, data).await {
            // The scratch directory disappears once reassembly has run.
            return match self.settled_receipt(session_id) {
                Some(receipt) => Ok(receipt),
                None => {
                    error!(session_id = %session_id, chunk_index, "Failed to store chunk: {}", e);
                    Err(AppError::Internal(format!("Failed to store chunk {}: {}", chunk_index, e)))
                }
            };
        }

        let marked = {
            let mut sessions = self.lock();
            match sessions.get_mut(session_id) {
                None => None,
                Some(session) if session.completed || session.assembling => {
                    return Ok(receipt(session, false));
                }
                Some(session) => Some(mark_chunk(session, chunk_index, chunk_hash, data.len() as u64)),
            }
        };
        // None: cancelled while the chunk was being written.
        let Some((update, plan, progress_id, snapshot)) = marked else {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(AppError::NotFound(format!("Upload session {} not found", session_id)));
        };

        self.progress.update(&progress_id, update);
        debug!(
            session_id = %session_id,
            chunk_index,
            uploaded = snapshot.uploaded_chunks,
            total = snapshot.total_chunks,
            "Chunk stored"
        );

        match plan {
            Some(plan) => self.reassemble(plan).await,
            None => Ok(snapshot),
        }
    }

    pub fn status(&self, session_id: &str) -> AppResult<UploadStatus> {
        let sessions = self.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Upload session {} not found", session_id)))?;

        Ok(UploadStatus {
            session_id: session.id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks(),
            uploaded_chunks: session.uploaded_chunks(),
            missing_chunks: session.missing_chunks(),
            progress: session.progress(),
            completed: session.completed,
            final_path: session.final_path.clone(),
            created_at: session.created_at,
            progress_record: self.progress.get(&session.progress_id),
        })
    }

    /// Abort a session: scratch storage is removed and its record cancelled.
    ///
    /// Returns `false` for unknown, completed or currently-assembling sessions.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let session = {
            let mut sessions = self.lock();
            match sessions.get(session_id) {
                Some(s) if !s.completed && !s.assembling => sessions.remove(session_id),
                _ => None,
            }
        };
        let Some(session) = session else {
            return false;
        };

        remove_scratch(&session.scratch_dir).await;
        self.progress.cancel(&session.progress_id);
        info!(session_id = %session_id, "Upload session cancelled");
        true
    }

    /// Drop sessions idle for longer than the configured timeout.
    ///
    /// Unfinished sessions are cancelled (scratch removed, record cancelled);
    /// completed ones are simply forgotten. Returns how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let timeout = self.config.session_timeout();
        let expired: Vec<UploadSession> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| !s.assembling && s.last_activity.elapsed() > timeout)
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            if !session.completed {
                remove_scratch(&session.scratch_dir).await;
                self.progress
                    .cancel_with_reason(&session.progress_id, "Upload session expired");
                info!(session_id = %session.id, "Expired idle upload session");
            }
        }
        expired.len()
    }

    /// Sessions that are still receiving chunks.
    pub fn active_sessions(&self) -> usize {
        self.lock().values().filter(|s| !s.completed).count()
    }

    async fn reassemble(&self, plan: AssemblyPlan) -> AppResult<ChunkReceipt> {
        info!(session_id = %plan.session_id, chunks = plan.chunk_paths.len(), "Reassembling upload");
        self.progress.update(
            &plan.progress_id,
            ProgressUpdate::new().step("Verifying file integrity").eta("0s"),
        );

        let partial = self.config.upload_dir.join(format!(".{}.partial", plan.session_id));
        let final_path = self
            .config
            .upload_dir
            .join(format!("{}_{}", plan.session_id, plan.file_name));

        let result = match concatenate(&plan, &partial).await {
            Ok(digest) if digest == plan.file_hash => tokio::fs::rename(&partial, &final_path)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to move assembled file: {}", e))),
            Ok(digest) => Err(AppError::ValidationError(format!(
                "File hash mismatch: expected {}, got {}",
                plan.file_hash, digest
            ))),
            Err(e) => Err(e),
        };
        remove_scratch(&plan.scratch_dir).await;

        if let Err(e) = result {
            error!(session_id = %plan.session_id, "Upload reassembly failed: {}", e);
            let _ = tokio::fs::remove_file(&partial).await;
            self.lock().remove(&plan.session_id);
            self.progress
                .complete(&plan.progress_id, false, Some(e.message().to_string()), None);
            return Err(e);
        }

        let (receipt, completed) = {
            let mut sessions = self.lock();
            let Some(session) = sessions.get_mut(&plan.session_id) else {
                return Err(AppError::NotFound(format!("Upload session {} not found", plan.session_id)));
            };
            session.completed = true;
            session.assembling = false;
            session.final_path = Some(final_path.clone());
            session.last_activity = Instant::now();
            (
                receipt(session, true),
                CompletedUpload {
                    session_id: session.id.clone(),
                    file_name: session.file_name.clone(),
                    file_size: session.file_size,
                    final_path: final_path.clone(),
                    progress_id: session.progress_id.clone(),
                    auto_transcribe: session.auto_transcribe,
                    language: session.language.clone(),
                    metadata: session.metadata.clone(),
                },
            )
        };

        let mut result_meta = Map::new();
        result_meta.insert("final_path".into(), Value::from(final_path.to_string_lossy().to_string()));
        result_meta.insert("file_hash".into(), Value::from(plan.file_hash.clone()));
        self.progress.complete(&plan.progress_id, true, None, Some(result_meta));
        info!(session_id = %plan.session_id, path = %final_path.display(), "Upload completed and verified");

        let hook = self.on_complete.read().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(hook) = hook {
            hook(completed);
        }
        Ok(receipt)
    }

    /// Receipt for a session that is assembling or done, `None` otherwise.
    fn settled_receipt(&self, session_id: &str) -> Option<ChunkReceipt> {
        let sessions = self.lock();
        let session = sessions.get(session_id)?;
        (session.completed || session.assembling).then(|| receipt(session, false))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UploadSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Mark a stored chunk, recompute progress and decide whether to reassemble.
fn mark_chunk(
    session: &mut UploadSession,
    chunk_index: u32,
    chunk_hash: String,
    len: u64,
) -> (ProgressUpdate, Option<AssemblyPlan>, String, ChunkReceipt) {
    let chunk = &mut session.chunks[chunk_index as usize];
    if let Some(previous) = chunk.hash.as_deref().filter(|_| chunk.uploaded) {
        if previous != chunk_hash {
            warn!(session_id = %session.id, chunk_index, "Chunk re-uploaded with different content, replacing");
        } else {
            debug!(session_id = %session.id, chunk_index, "Duplicate chunk upload");
        }
    }
    chunk.uploaded = true;
    chunk.hash = Some(chunk_hash);
    chunk.uploaded_at = Some(Utc::now());
    session.bytes_received += len;

    let uploaded = session.uploaded_chunks();
    let total = session.total_chunks();
    let uploaded_bytes = session.uploaded_bytes();
    let elapsed = session.opened.elapsed().as_secs_f64().max(0.001);
    let rate = session.bytes_received as f64 / elapsed;
    let remaining = session.file_size - uploaded_bytes;

    let update = ProgressUpdate::new()
        .status(ProgressStatus::Processing)
        .progress(session.progress().min(99.0))
        .step(format!("Uploading chunk {}/{}", uploaded, total))
        .step_index(uploaded)
        .sizes(uploaded_bytes, session.file_size)
        .speed(format_speed(rate))
        .eta(format_eta(remaining as f64 / rate));

    let plan = if session.all_uploaded() && !session.assembling {
        session.assembling = true;
        Some(AssemblyPlan {
            session_id: session.id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            file_hash: session.file_hash.clone(),
            chunk_paths: session
                .chunks
                .iter()
                .map(|c| chunk_path(&session.scratch_dir, c.index))
                .collect(),
            scratch_dir: session.scratch_dir.clone(),
            progress_id: session.progress_id.clone(),
        })
    } else {
        None
    };
    (update, plan, session.progress_id.clone(), receipt(session, true))
}

fn receipt(session: &UploadSession, accepted: bool) -> ChunkReceipt {
    ChunkReceipt {
        accepted,
        progress: session.progress(),
        uploaded_chunks: session.uploaded_chunks(),
        total_chunks: session.total_chunks(),
        completed: session.completed,
        final_path: session.final_path.clone(),
    }
}

/// Write a chunk next to its final name and rename it into place, so a
/// concurrent reassembly sees either the previous copy or the new one whole.
async fn store_chunk(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let staging = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let written = match tokio::fs::write(&staging, data).await {
        Ok(()) => tokio::fs::rename(&staging, path).await,
        Err(e) => Err(e),
    };
    if written.is_err() {
        let _ = tokio::fs::remove_file(&staging).await;
    }
    written
}

/// Write every chunk, in index order, into `dest` and return the hex SHA-256.
async fn concatenate(plan: &AssemblyPlan, dest: &Path) -> AppResult<String> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = tokio::fs::File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut written = 0u64;

    for (index, path) in plan.chunk_paths.iter().enumerate() {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| AppError::Internal(format!("Chunk {} unreadable during reassembly: {}", index, e)))?;
        hasher.update(&bytes);
        out.write_all(&bytes).await?;
        written += bytes.len() as u64;
    }
    out.flush().await?;

    if written != plan.file_size {
        return Err(AppError::ValidationError(format!(
            "Assembled size {} does not match declared size {}",
            written, plan.file_size
        )));
    }
    Ok(format!("{:x}", hasher.finalize()))
}

async fn remove_scratch(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), "Failed to remove scratch directory: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    fn setup(max_sessions: usize) -> (TempDir, Arc<ProgressRegistry>, ChunkedUploadAssembler) {
        let dir = tempfile::tempdir().unwrap();
        let config = UploadConfig {
            upload_dir: dir.path().join("uploads"),
            temp_dir: dir.path().join("tmp"),
            max_sessions,
            max_file_size: 64 * MB,
            max_chunks: 1000,
            default_chunk_size: MB,
            max_chunk_size: 8 * MB,
            session_timeout_secs: 3600,
            sweep_interval_secs: 60,
        };
        let progress = Arc::new(ProgressRegistry::default());
        let assembler = ChunkedUploadAssembler::new(config, progress.clone());
        (dir, progress, assembler)
    }

    fn sample_file(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn request(data: &[u8], chunk_size: u64) -> CreateSessionRequest {
        CreateSessionRequest {
            file_name: "talk.wav".to_string(),
            file_size: data.len() as u64,
            file_hash: format!("{:x}", Sha256::digest(data)),
            chunk_size: Some(chunk_size),
            auto_transcribe: false,
            language: None,
            metadata: Map::new(),
        }
    }

    fn chunk(data: &[u8], chunk_size: u64, index: u32) -> &[u8] {
        let start = (index as u64 * chunk_size) as usize;
        let end = (start + chunk_size as usize).min(data.len());
        &data[start..end]
    }

    #[tokio::test]
    async fn test_five_megabyte_round_trip() {
        let (_dir, progress, assembler) = setup(4);
        let data = sample_file(5 * MB as usize);
        let created = assembler.create_session(request(&data, MB)).await.unwrap();
        assert_eq!(created.total_chunks, 5);

        let mut last = None;
        for i in 0..5 {
            let r = assembler.upload_chunk(&created.session_id, i, chunk(&data, MB, i)).await.unwrap();
            assert!(r.accepted);
            assert_eq!(r.completed, i == 4);
            last = Some(r);
        }

        let receipt = last.unwrap();
        let final_path = receipt.final_path.unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), data);

        let record = progress.get(&created.progress_id).unwrap();
        assert_eq!(record.status, ProgressStatus::Completed);
        assert_eq!(record.progress, 100.0);
        assert_eq!(record.metadata["final_path"], final_path.to_string_lossy().to_string());

        let status = assembler.status(&created.session_id).unwrap();
        assert!(status.completed);
        assert_eq!(status.uploaded_chunks, status.total_chunks);
        assert!(status.missing_chunks.is_empty());
    }

    #[tokio::test]
    async fn test_hash_mismatch_fails_session() {
        let (dir, progress, assembler) = setup(4);
        let data = sample_file(5 * MB as usize);
        let mut req = request(&data, MB);
        req.file_hash = "0".repeat(64);
        let created = assembler.create_session(req).await.unwrap();

        for i in 0..4 {
            assembler.upload_chunk(&created.session_id, i, chunk(&data, MB, i)).await.unwrap();
        }
        let err = assembler
            .upload_chunk(&created.session_id, 4, chunk(&data, MB, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        let record = progress.get(&created.progress_id).unwrap();
        assert_eq!(record.status, ProgressStatus::Failed);
        assert!(record.message.unwrap().contains("hash mismatch"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("uploads")).unwrap().collect();
        assert!(leftovers.is_empty());
        assert!(!dir.path().join("tmp").join(&created.session_id).exists());
        assert!(assembler.status(&created.session_id).is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_and_short_last_chunk() {
        let (_dir, _progress, assembler) = setup(4);
        let data = sample_file(2500);
        let created = assembler.create_session(request(&data, 1000)).await.unwrap();
        assert_eq!(created.total_chunks, 3);

        let r = assembler.upload_chunk(&created.session_id, 2, chunk(&data, 1000, 2)).await.unwrap();
        assert!(!r.completed);
        assert_eq!(assembler.status(&created.session_id).unwrap().missing_chunks, vec![0, 1]);

        assembler.upload_chunk(&created.session_id, 0, chunk(&data, 1000, 0)).await.unwrap();
        let r = assembler.upload_chunk(&created.session_id, 1, chunk(&data, 1000, 1)).await.unwrap();
        assert!(r.completed);
        assert_eq!(tokio::fs::read(r.final_path.unwrap()).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_bad_chunk_is_rejected_without_changes() {
        let (_dir, _progress, assembler) = setup(4);
        let data = sample_file(2500);
        let created = assembler.create_session(request(&data, 1000)).await.unwrap();

        let err = assembler.upload_chunk(&created.session_id, 0, &data[..999]).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        let err = assembler.upload_chunk(&created.session_id, 3, &data[..500]).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        let err = assembler.upload_chunk("nope", 0, &data[..1000]).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let status = assembler.status(&created.session_id).unwrap();
        assert_eq!(status.uploaded_chunks, 0);
        assert_eq!(status.missing_chunks, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_overwrites() {
        let (_dir, _progress, assembler) = setup(4);
        let data = sample_file(2000);
        let created = assembler.create_session(request(&data, 1000)).await.unwrap();

        let garbage = vec![0u8; 1000];
        assembler.upload_chunk(&created.session_id, 0, &garbage).await.unwrap();
        let r = assembler.upload_chunk(&created.session_id, 0, chunk(&data, 1000, 0)).await.unwrap();
        assert_eq!(r.uploaded_chunks, 1);

        let r = assembler.upload_chunk(&created.session_id, 1, chunk(&data, 1000, 1)).await.unwrap();
        assert!(r.completed);
        assert_eq!(tokio::fs::read(r.final_path.unwrap()).await.unwrap(), data);

        // A late duplicate after completion is acknowledged but ignored.
        let late = assembler.upload_chunk(&created.session_id, 1, chunk(&data, 1000, 1)).await.unwrap();
        assert!(!late.accepted);
        assert!(late.completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resend_racing_last_chunk_still_verifies() {
        let (_dir, progress, assembler) = setup(64);
        let chunk_size = 2 * MB;
        let data = sample_file(2 * chunk_size as usize);

        for _ in 0..20 {
            let created = assembler.create_session(request(&data, chunk_size)).await.unwrap();
            let id = created.session_id.as_str();
            assembler.upload_chunk(id, 0, chunk(&data, chunk_size, 0)).await.unwrap();

            let (resent, last) = tokio::join!(
                assembler.upload_chunk(id, 0, chunk(&data, chunk_size, 0)),
                assembler.upload_chunk(id, 1, chunk(&data, chunk_size, 1)),
            );
            resent.unwrap();
            let last = last.unwrap();
            assert!(last.completed);
            assert_eq!(tokio::fs::read(last.final_path.unwrap()).await.unwrap(), data);
            assert_eq!(progress.get(&created.progress_id).unwrap().status, ProgressStatus::Completed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_last_chunks_reassemble_once() {
        let (_dir, _progress, assembler) = setup(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        assembler.set_completion_hook(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let data = sample_file(3000);
        let created = assembler.create_session(request(&data, 1000)).await.unwrap();
        let id = created.session_id.as_str();
        assembler.upload_chunk(id, 0, chunk(&data, 1000, 0)).await.unwrap();
        let (a, b) = tokio::join!(
            assembler.upload_chunk(id, 1, chunk(&data, 1000, 1)),
            assembler.upload_chunk(id, 2, chunk(&data, 1000, 2)),
        );
        assert!(a.unwrap().accepted && b.unwrap().accepted);
        assert!(assembler.status(id).unwrap().completed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oversized_declarations_are_rejected() {
        let (_dir, progress, assembler) = setup(4);
        let data = sample_file(100);

        let mut req = request(&data, 1);
        req.file_size = u64::MAX / 2;
        let err = assembler.create_session(req).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        // Within the size limit but 1-byte chunks would need too many.
        let mut req = request(&data, 1);
        req.file_size = 2000;
        let err = assembler.create_session(req).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        assert_eq!(assembler.active_sessions(), 0);
        assert_eq!(progress.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_scratch_and_cancels_record() {
        let (dir, progress, assembler) = setup(4);
        let data = sample_file(3000);
        let created = assembler.create_session(request(&data, 1000)).await.unwrap();
        assembler.upload_chunk(&created.session_id, 0, chunk(&data, 1000, 0)).await.unwrap();

        let scratch = dir.path().join("tmp").join(&created.session_id);
        assert!(scratch.exists());
        assert!(assembler.cancel(&created.session_id).await);
        assert!(!scratch.exists());
        assert_eq!(progress.get(&created.progress_id).unwrap().status, ProgressStatus::Cancelled);
        assert!(!assembler.cancel(&created.session_id).await);
    }

    #[tokio::test]
    async fn test_session_capacity() {
        let (_dir, _progress, assembler) = setup(2);
        let data = sample_file(100);
        assembler.create_session(request(&data, 50)).await.unwrap();
        assembler.create_session(request(&data, 50)).await.unwrap();
        let err = assembler.create_session(request(&data, 50)).await.unwrap_err();
        assert!(matches!(err, AppError::Capacity(_)));
        assert_eq!(assembler.active_sessions(), 2);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (_dir, _progress, assembler) = setup(2);
        let data = sample_file(100);

        let mut req = request(&data, 50);
        req.chunk_size = Some(64 * MB);
        assert!(assembler.create_session(req).await.is_err());

        let mut req = request(&data, 50);
        req.file_name = "../escape.wav".into();
        assert!(assembler.create_session(req).await.is_err());

        let mut req = request(&data, 50);
        req.file_hash = "md5-ish".into();
        assert!(assembler.create_session(req).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_expires_idle_sessions() {
        let (dir, progress, mut assembler) = setup(4);
        assembler.config.session_timeout_secs = 0;
        let data = sample_file(100);
        let created = assembler.create_session(request(&data, 50)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(assembler.sweep_expired().await, 1);
        assert!(!dir.path().join("tmp").join(&created.session_id).exists());
        let record = progress.get(&created.progress_id).unwrap();
        assert_eq!(record.status, ProgressStatus::Cancelled);
        assert_eq!(record.message.as_deref(), Some("Upload session expired"));
    }

    #[tokio::test]
    async fn test_completion_hook_fires_once() {
        let (_dir, _progress, assembler) = setup(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        assembler.set_completion_hook(Arc::new(move |done: CompletedUpload| {
            assert!(done.final_path.exists());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let data = sample_file(100);
        let mut req = request(&data, 50);
        req.auto_transcribe = true;
        let created = assembler.create_session(req).await.unwrap();
        assembler.upload_chunk(&created.session_id, 0, chunk(&data, 50, 0)).await.unwrap();
        assembler.upload_chunk(&created.session_id, 1, chunk(&data, 50, 1)).await.unwrap();
        assembler.upload_chunk(&created.session_id, 1, chunk(&data, 50, 1)).await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
