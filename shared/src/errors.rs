/// Unified error types for batchget.
use thiserror::Error;

/// Top-level error type for batchget.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors recorded against a single transfer.
///
/// These never abort the batch: the offending task is completed with the
/// error attached and the queue moves on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {code} {reason}")]
    HttpStatus { code: u16, reason: String },

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Proxy authentication failed")]
    ProxyAuthenticationFailed,

    #[error("Can't open input file {path}: {reason}")]
    SourceUnavailable { path: String, reason: String },

    #[error("Can't write output file {path}: {reason}")]
    Destination { path: String, reason: String },

    #[error("Coordinator went away before the transfer finished")]
    ClientGone,
}

impl TransferError {
    /// Build from an HTTP status code and its canonical reason phrase.
    pub fn from_status(code: u16, reason: Option<&str>) -> Self {
        TransferError::HttpStatus {
            code,
            reason: reason.unwrap_or("Unknown status").to_string(),
        }
    }

    /// Whether this error came from a rejected credential exchange.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self,
            TransferError::AuthenticationFailed
            | TransferError::ProxyAuthenticationFailed
        )
    }
}

/// Result type alias for batchget operations.
pub type BatchResult<T> = Result<T, BatchError>;
