//! Object store interface consumed by the transfer engine.
//!
//! The engine never speaks HTTP itself: a backend implements
//! [`ObjectStore`] and reports each call's status, optional body and
//! optional error code/message. Keeping the seam a trait lets the engine
//! run against any S3-compatible client and against test doubles.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use crate::error::RemoteError;
use crate::part::Part;

/// Errors raised before a status is available (connection reset, timeout).
///
/// Always treated as transient by the engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one store call.
#[derive(Debug)]
pub struct StoreResponse<T> {
    pub status: u16,
    pub body: Option<T>,
    pub error_code: String,
    pub error_message: String,
}

impl<T> StoreResponse<T> {
    pub fn ok(body: T) -> Self {
        Self {
            status: 200,
            body: Some(body),
            error_code: String::new(),
            error_message: String::new(),
        }
    }

    pub fn error(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: None,
            error_code: code.into(),
            error_message: message.into(),
        }
    }

    /// `true` for any status below 300.
    pub fn is_success(&self) -> bool {
        self.status < 300
    }

    pub fn remote_error(&self) -> RemoteError {
        RemoteError {
            status: self.status,
            code: self.error_code.clone(),
            message: self.error_message.clone(),
        }
    }

    /// The body of a successful response, or the remote error.
    pub fn into_result(self) -> Result<T, RemoteError> {
        if !self.is_success() {
            return Err(self.remote_error());
        }
        let status = self.status;
        self.body.ok_or_else(|| RemoteError {
            status,
            code: "EmptyBody".into(),
            message: "successful response without a body".into(),
        })
    }
}

/// Inclusive byte range of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn of(part: &Part) -> Self {
        Self {
            start: part.offset,
            end: part.last_byte(),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}

/// Destination of one uploaded or copied part.
#[derive(Debug, Clone, Copy)]
pub struct PartTarget<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub upload_id: &'a str,
    pub part_number: u32,
}

/// A `(part number, etag)` entry of a complete-multipart-upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Metadata of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: String,
    pub etag: String,
    pub version_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Typed, synchronous operations of an S3-compatible object store.
pub trait ObjectStore: Send + Sync {
    fn head_bucket(&self, bucket: &str) -> Result<StoreResponse<()>, StoreError>;

    /// Opens a multipart session and returns its upload id.
    fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<StoreResponse<String>, StoreError>;

    /// Uploads `length` bytes read from `body`; returns the part etag.
    fn upload_part(
        &self,
        target: &PartTarget<'_>,
        body: &mut dyn Read,
        length: u64,
    ) -> Result<StoreResponse<String>, StoreError>;

    /// Copies `range` of a source object into a part; returns the part etag.
    fn copy_part(
        &self,
        target: &PartTarget<'_>,
        source_bucket: &str,
        source_key: &str,
        range: ByteRange,
    ) -> Result<StoreResponse<String>, StoreError>;

    /// Assembles the listed parts; returns the object etag.
    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<StoreResponse<String>, StoreError>;

    fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<StoreResponse<()>, StoreError>;

    fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<StoreResponse<ObjectMeta>, StoreError>;

    /// Streams `range` of an object.
    fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        range: ByteRange,
    ) -> Result<StoreResponse<Box<dyn Read + Send>>, StoreError>;
}
