//! # Error Handling
//!
//! Defines the error taxonomy shared by the orchestration components and how each
//! category is rendered as an HTTP response.
//!
//! ## Error Categories:
//! - **Capacity**: a bounded structure is full (job queue, upload sessions). The
//!   request was rejected before anything changed; the caller should back off.
//! - **Validation**: the caller sent something inconsistent (chunk index out of
//!   range, wrong chunk length, malformed hash). Shared state is untouched.
//! - **ResourceExhausted**: a heavyweight resource could not be provided (model
//!   load failure, memory pressure).
//! - **NotFound / BadRequest / Internal / ConfigError**: the usual web suspects.
//!
//! Cancellation is deliberately *not* an error: cancelled jobs, uploads and
//! progress records are a terminal state of their own.
//!
//! ## Why one enum:
//! Low-level failures (I/O on a chunk file, JSON decoding, a panicking job) are
//! translated into one of these variants at the component boundary, so nothing
//! leaves the scheduler or the upload assembler as an unclassified error.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Capacity("Job queue is full (1000 tasks)".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Internal server errors (I/O failures, poisoned state, join errors)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// A bounded queue or session table is full
    Capacity(String),

    /// A heavyweight resource (model, memory) is unavailable
    ResourceExhausted(String),
}

impl AppError {
    /// Machine-readable error type used in JSON bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Capacity(_) => "capacity_exceeded",
            AppError::ResourceExhausted(_) => "resource_exhausted",
        }
    }

    /// The human-readable message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Capacity(msg)
            | AppError::ResourceExhausted(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Capacity(msg) => write!(f, "Capacity exceeded: {}", msg),
            AppError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
/// - Capacity → 429 (retry later)
/// - ResourceExhausted → 503
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "capacity_exceeded",
///     "message": "Maximum concurrent upload sessions (10) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Anything that bubbles up through `anyhow` without a category is internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<AppError>() {
            Ok(app_err) => app_err,
            Err(other) => AppError::Internal(format!("{:#}", other)),
        }
    }
}

/// JSON parsing errors are almost always the client's fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("I/O error: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
