//! Transfer error types.

use std::fmt;
use std::path::PathBuf;

use crate::store::StoreError;

/// A failure reported by the object store: status plus optional code/message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status {}, ErrorCode: {}, ErrorMessage: {}",
            self.status, self.code, self.message
        )
    }
}

/// Errors produced by transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cannot read local file {path}: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} failed for {target}: {error}")]
    Remote {
        operation: &'static str,
        target: String,
        error: RemoteError,
    },

    #[error("{size} bytes need {parts} parts of {part_size} bytes, more than the limit of {max}")]
    TooManyParts {
        size: u64,
        part_size: u64,
        parts: u64,
        max: u64,
    },

    #[error("invalid part size: {0}")]
    InvalidPartSize(u64),

    #[error("{0}")]
    PartsFailed(String),

    #[error("complete multipart upload failed: {0}")]
    CompleteFailed(String),

    #[error("etag mismatch: remote {remote}, local {local}")]
    EtagMismatch { remote: String, local: String },

    #[error("invalid byte size: {0}")]
    InvalidByteSize(String),

    #[error("invalid flow policy: {0}")]
    InvalidFlowPolicy(String),

    #[error("cancelled")]
    Cancelled,
}
