//! # Chunked Uploads
//!
//! ## Key Components:
//! - **session**: chunk layout, validation and the request/response types
//! - **assembler**: the session table, chunk storage and reassembly

pub mod assembler;
pub mod session;

pub use assembler::{ChunkedUploadAssembler, CompletionHook};
pub use session::{ChunkReceipt, CompletedUpload, CreateSessionRequest, SessionCreated, UploadStatus};
