//! Upload session bookkeeping: chunk layout, validation rules and the
//! request/response shapes the HTTP layer exchanges.

use crate::error::{AppError, AppResult};
use crate::progress::ProgressRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Body of a session-create request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub file_name: String,
    pub file_size: u64,
    /// Hex SHA-256 of the whole file
    pub file_hash: String,
    /// Falls back to the configured default
    pub chunk_size: Option<u64>,
    /// Submit a transcription job once the file is verified
    #[serde(default)]
    pub auto_transcribe: bool,
    pub language: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    pub session_id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub progress_id: String,
}

/// One contiguous byte range of the file. `end` is exclusive.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub uploaded: bool,
    pub hash: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl ChunkDescriptor {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Split `file_size` bytes into `chunk_size` ranges; the last one may be shorter.
pub fn chunk_layout(file_size: u64, chunk_size: u64) -> Vec<ChunkDescriptor> {
    let total = file_size.div_ceil(chunk_size);
    (0..total)
        .map(|i| {
            let start = i * chunk_size;
            ChunkDescriptor {
                index: i as u32,
                start,
                end: (start + chunk_size).min(file_size),
                uploaded: false,
                hash: None,
                uploaded_at: None,
            }
        })
        .collect()
}

/// Accept a bare file name only; anything that could escape the upload directory is rejected.
pub fn validate_file_name(name: &str) -> AppResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::ValidationError("File name cannot be empty".to_string()));
    }
    if trimmed.contains('/') || trimmed.contains('\\') || trimmed == "." || trimmed == ".." {
        return Err(AppError::ValidationError(format!("Invalid file name: {}", name)));
    }
    if trimmed.len() > 255 {
        return Err(AppError::ValidationError("File name is longer than 255 bytes".to_string()));
    }
    Ok(())
}

/// Normalize a hex SHA-256 digest to lowercase.
pub fn normalize_hash(hash: &str) -> AppResult<String> {
    let hash = hash.trim().to_ascii_lowercase();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::ValidationError(
            "file_hash must be a 64 character hex SHA-256 digest".to_string(),
        ));
    }
    Ok(hash)
}

pub(crate) fn chunk_path(scratch_dir: &Path, index: u32) -> PathBuf {
    scratch_dir.join(format!("chunk_{:05}", index))
}

pub(crate) struct UploadSession {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkDescriptor>,
    pub scratch_dir: PathBuf,
    pub progress_id: String,
    pub created_at: DateTime<Utc>,
    pub opened: Instant,
    pub last_activity: Instant,
    pub bytes_received: u64,
    /// Set by the call that uploads the last missing chunk, so reassembly runs once
    pub assembling: bool,
    pub completed: bool,
    pub final_path: Option<PathBuf>,
    pub auto_transcribe: bool,
    pub language: Option<String>,
    pub metadata: Map<String, Value>,
}

impl UploadSession {
    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn uploaded_chunks(&self) -> u32 {
        self.chunks.iter().filter(|c| c.uploaded).count() as u32
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks.iter().filter(|c| c.uploaded).map(ChunkDescriptor::len).sum()
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        self.chunks.iter().filter(|c| !c.uploaded).map(|c| c.index).collect()
    }

    pub fn all_uploaded(&self) -> bool {
        self.chunks.iter().all(|c| c.uploaded)
    }

    /// Share of the file's bytes that have arrived, 0-100.
    pub fn progress(&self) -> f64 {
        if self.completed {
            return 100.0;
        }
        self.uploaded_bytes() as f64 / self.file_size as f64 * 100.0
    }
}

/// Result of one chunk upload.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkReceipt {
    pub accepted: bool,
    pub progress: f64,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    pub completed: bool,
    pub final_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadStatus {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: u32,
    pub missing_chunks: Vec<u32>,
    pub progress: f64,
    pub completed: bool,
    pub final_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub progress_record: Option<ProgressRecord>,
}

/// Handed to the completion hook once a file has been reassembled and verified.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub final_path: PathBuf,
    pub progress_id: String,
    pub auto_transcribe: bool,
    pub language: Option<String>,
    pub metadata: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sums_to_file_size() {
        for (size, chunk) in [(5 * 1024 * 1024, 1024 * 1024), (1000, 300), (1, 1024), (4096, 4096)] {
            let layout = chunk_layout(size, chunk);
            assert_eq!(layout.len() as u64, size.div_ceil(chunk));
            assert_eq!(layout.iter().map(ChunkDescriptor::len).sum::<u64>(), size);
            assert!(layout.iter().all(|c| c.len() <= chunk && c.len() > 0));
        }
    }

    #[test]
    fn test_short_last_chunk() {
        let layout = chunk_layout(1000, 300);
        assert_eq!(layout.len(), 4);
        assert_eq!(layout[3].start, 900);
        assert_eq!(layout[3].len(), 100);
    }

    #[test]
    fn test_file_name_validation() {
        assert!(validate_file_name("meeting.wav").is_ok());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("a\\b.wav").is_err());
    }

    #[test]
    fn test_hash_normalization() {
        let upper = "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
        assert_eq!(normalize_hash(upper).unwrap(), upper.to_lowercase());
        assert!(normalize_hash("abc").is_err());
        assert!(normalize_hash(&"z".repeat(64)).is_err());
    }
}
