//! Error taxonomy and retry classification.

use std::path::PathBuf;
use std::time::Duration;

/// Failures raised by the client.
///
/// These travel inside `anyhow::Error`; retry decisions recover them with
/// `downcast_ref` and match on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Missing API key or otherwise unusable configuration.
    Configuration(String),
    /// A single round trip failed below the HTTP status layer
    /// (connection refused, DNS, TLS, timeout, truncated body).
    Transport(String),
    /// Every connection-level attempt of one HTTP call failed.
    ConnectionExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
    /// The service answered with a non-200 status (HTTP or envelope code).
    HttpStatus {
        operation: String,
        status: u16,
        body: String,
    },
    /// The response could not be decoded or lacked a required field.
    InvalidResponse(String),
    /// The service reported the prediction as failed.
    PredictionFailed { id: String, error: String },
    /// Polling exceeded the attempt's time budget.
    PredictionTimeout { id: String, timeout: Duration },
    /// The upload endpoint rejected the file.
    Upload(String),
    /// The file to upload does not exist.
    FileNotFound(PathBuf),
    /// The caller cancelled the operation.
    Cancelled,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ApiError::Transport(msg) => write!(f, "Connection error: {}", msg),
            ApiError::ConnectionExhausted {
                operation,
                attempts,
                last_error,
            } => write!(
                f,
                "{} failed after {} attempts: {}",
                operation, attempts, last_error
            ),
            ApiError::HttpStatus {
                operation,
                status,
                body,
            } => write!(f, "{}: HTTP {}: {}", operation, status, body),
            ApiError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            ApiError::PredictionFailed { id, error } => {
                write!(f, "Prediction failed (task_id: {}): {}", id, error)
            }
            ApiError::PredictionTimeout { id, timeout } => write!(
                f,
                "Prediction timed out after {} seconds (task_id: {})",
                timeout.as_secs_f64(),
                id
            ),
            ApiError::Upload(msg) => write!(f, "Upload failed: {}", msg),
            ApiError::FileNotFound(path) => write!(f, "File not found: {}", path.display()),
            ApiError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// Whether a whole task may be restarted after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_)
            | ApiError::ConnectionExhausted { .. }
            | ApiError::PredictionTimeout { .. } => true,
            ApiError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            ApiError::Configuration(_)
            | ApiError::InvalidResponse(_)
            | ApiError::PredictionFailed { .. }
            | ApiError::Upload(_)
            | ApiError::FileNotFound(_)
            | ApiError::Cancelled => false,
        }
    }
}

/// Classifies an arbitrary failure for the task-retry loop.
/// Errors that are not an [`ApiError`] are never retried.
pub fn is_retryable(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_retryable)
}

/// Whether the failure is a single connection-level failure, the only kind
/// the transport retrier absorbs.
pub fn is_transport_error(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<ApiError>(), Some(ApiError::Transport(_)))
}
