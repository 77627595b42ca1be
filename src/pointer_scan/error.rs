//! Error taxonomy for snapshot loading, index building and chain search.

use std::path::PathBuf;

use thiserror::Error;

use crate::pointer_scan::types::ScanErrorCode;

#[derive(Debug, Error)]
pub enum ScanError {
    /// The snapshot file could not be opened or read.
    #[error("Failed to read memory dump {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A live capture could not read the requested range.
    #[error("Failed to capture memory at 0x{address:08X}: {message}")]
    Capture { address: u32, message: String },

    /// The operation observed a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to parse scan configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// A background worker died without reporting a result.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        ScanError::InvalidConfig(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        ScanError::InvalidState(message.into())
    }

    /// Check if this error only reports a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanError::Cancelled)
    }

    /// Numeric code published through the progress record.
    pub fn code(&self) -> ScanErrorCode {
        match self {
            ScanError::Io { .. } => ScanErrorCode::IoFailed,
            ScanError::Capture { .. } => ScanErrorCode::MemoryReadFailed,
            ScanError::Cancelled => ScanErrorCode::None,
            ScanError::InvalidConfig(_) | ScanError::Config(_) => ScanErrorCode::InvalidConfig,
            ScanError::InvalidState(_) => ScanErrorCode::InvalidState,
            ScanError::Internal(_) => ScanErrorCode::InternalError,
        }
    }
}
