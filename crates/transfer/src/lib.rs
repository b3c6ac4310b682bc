//! Resumable, parallel multipart transfer engine.
//!
//! Uploads, downloads and server-side copies of large objects are split
//! into fixed-size parts, transferred by a bounded pool of worker threads
//! and tracked in a checkpoint file so an interrupted transfer resumes
//! without re-sending completed parts.
//!
//! # Pipeline
//!
//! 1. **Init**: preflight checks against the local file and remote store
//! 2. **Build / Resume**: load and validate a checkpoint, or plan new parts
//! 3. **Dispatch**: run outstanding parts with bounded parallelism
//! 4. **Finalize / Clean up**: complete the multipart upload or rename the
//!    download, or abort and discard everything on hard failure

mod checkpoint;
mod chunked;
mod context;
mod error;
mod etag;
mod executor;
mod governor;
mod operation;
mod part;
mod progress;
mod record;
mod retry;
mod store;
mod units;
mod validation;

#[cfg(test)]
mod test_support;

pub use checkpoint::{CheckpointStore, checkpoint_file_name, sanitize_path};
pub use error::{RemoteError, TransferError};
pub use etag::{md5_hex, multipart_etag};
pub use executor::{Task, TaskExecutor, ThreadExecutor};
pub use governor::{FlowGovernor, FlowPolicy, SharedTransferState};
pub use operation::{
    CopyOperation, DownloadOperation, DownloadOutcome, MultipartOutcome, TransferOptions,
    TransferState, UploadOperation,
};
pub use part::{Part, check_part_count, clamp_part_size, fit_part_size, plan_parts};
pub use progress::SpeedCalculator;
pub use record::{
    CheckpointRecord, CopyRecord, DownloadRecord, FileStatus, ObjectStatus, PartEtag,
    TransferKind, UploadRecord,
};
pub use retry::with_retries;
pub use store::{
    ByteRange, CompletedPart, ObjectMeta, ObjectStore, PartTarget, StoreError, StoreResponse,
};
pub use units::{format_byte_size, parse_byte_size};

/// Additional attempts made for a failed part before it is given up.
pub const MAX_PART_RETRIES: u32 = 2;

/// Maximum number of parts in one multipart upload.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Smallest accepted part size.
pub const MIN_PART_SIZE: u64 = 1;

/// Largest accepted part size: 5 GiB.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Default part size: 5 MiB.
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Default number of concurrent part workers per operation.
pub const DEFAULT_PART_TASKS: usize = 8;

/// Suffix appended to a download destination while parts are written.
pub const DOWNLOAD_TMP_SUFFIX: &str = ".download.tmp";

/// Locks a mutex, recovering the data if a worker panicked while holding it.
///
/// Every piece of shared state guarded this way is flag- or append-only,
/// so a poisoned guard still holds consistent data.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
