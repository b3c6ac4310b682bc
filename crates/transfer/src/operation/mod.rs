//! Upload, download and copy operations built on one dispatch skeleton.
//!
//! Each operation walks the same states: preflight checks (`Init`), build a
//! fresh checkpoint record or resume a validated one, dispatch outstanding
//! parts to a bounded pool of workers, then either finalize or clean up.

mod copy;
mod download;
mod upload;

pub use copy::CopyOperation;
pub use download::{DownloadOperation, DownloadOutcome};
pub use upload::UploadOperation;

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::context::TransferContext;
use crate::error::RemoteError;
use crate::executor::{TaskExecutor, ThreadExecutor};
use crate::governor::{FlowGovernor, SharedTransferState};
use crate::part::{Part, check_part_count, fit_part_size};
use crate::retry::with_retries;
use crate::store::{CompletedPart, ObjectStore, StoreError, StoreResponse};
use crate::{DEFAULT_PART_SIZE, DEFAULT_PART_TASKS, MAX_PART_RETRIES, TransferError};

/// Tunables shared by the three operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Requested part size; grown if the object would need too many parts.
    pub part_size: u64,
    /// Concurrent part workers.
    pub task_num: usize,
    /// Objects smaller than this are sent as a single part. `0` disables.
    pub part_threshold: u64,
    /// Directory for checkpoint files; `None` disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            task_num: DEFAULT_PART_TASKS,
            part_threshold: 0,
            checkpoint_dir: None,
        }
    }
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn task_num(mut self, task_num: usize) -> Self {
        self.task_num = task_num.max(1);
        self
    }

    pub fn part_threshold(mut self, threshold: u64) -> Self {
        self.part_threshold = threshold;
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Part size to plan `total` bytes with.
    pub fn effective_part_size(&self, total: u64) -> Result<u64, TransferError> {
        let part_size = if total < self.part_threshold {
            total.max(1)
        } else {
            fit_part_size(total, self.part_size)
        };
        check_part_count(total, part_size)?;
        Ok(part_size)
    }
}

/// Where an operation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    Building,
    Resuming,
    Dispatching,
    Finalizing,
    CleaningUp,
    Succeeded,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Building => "BUILDING",
            Self::Resuming => "RESUMING",
            Self::Dispatching => "DISPATCHING",
            Self::Finalizing => "FINALIZING",
            Self::CleaningUp => "CLEANING_UP",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        })
    }
}

/// Result of a completed upload or copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartOutcome {
    pub upload_id: String,
    /// ETag of the assembled object.
    pub etag: String,
    /// Part size the object was assembled from; a resumed transfer keeps
    /// the size recorded in its checkpoint.
    pub part_size: u64,
}

// ---------------------------------------------------------------------------
// Part-level errors
// ---------------------------------------------------------------------------

/// Failure of one attempt at one part.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PartError {
    /// 3xx/4xx: the multipart session cannot be trusted any more.
    #[error("{0}")]
    Rejected(RemoteError),

    #[error("{0}")]
    Server(RemoteError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl PartError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    pub fn is_hard(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    fn from_remote(error: RemoteError) -> Self {
        if (300..500).contains(&error.status) {
            Self::Rejected(error)
        } else {
            Self::Server(error)
        }
    }
}

impl From<StoreError> for PartError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transport(msg) => Self::Transport(msg),
            StoreError::Io(e) => Self::Io(e),
        }
    }
}

/// Unwraps a part-level store response.
pub(crate) fn part_response<T>(
    response: Result<StoreResponse<T>, StoreError>,
) -> Result<T, PartError> {
    response?.into_result().map_err(PartError::from_remote)
}

/// Unwraps a preflight or session-level store response.
pub(crate) fn remote_response<T>(
    operation: &'static str,
    target: &str,
    response: Result<StoreResponse<T>, StoreError>,
) -> Result<T, TransferError> {
    response?
        .into_result()
        .map_err(|error| TransferError::Remote {
            operation,
            target: target.to_string(),
            error,
        })
}

/// Like [`remote_response`] for calls whose success carries no body.
pub(crate) fn remote_status<T>(
    operation: &'static str,
    target: &str,
    response: Result<StoreResponse<T>, StoreError>,
) -> Result<(), TransferError> {
    let response = response?;
    if response.is_success() {
        return Ok(());
    }
    Err(TransferError::Remote {
        operation,
        target: target.to_string(),
        error: response.remote_error(),
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Moves one part between the local side and the store.
pub(crate) trait PartTransfer: Send + Sync + 'static {
    /// Performs one attempt; returns the part etag for upload and copy.
    fn transfer(&self, part: &Part) -> Result<Option<String>, PartError>;
}

/// How the dispatch phase ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DispatchResult {
    Completed,
    Hard(String),
    Soft(String),
    Cancelled,
}

impl DispatchResult {
    /// Whether local state should survive for a later resume.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Soft(_) | Self::Cancelled)
    }

    pub fn into_error(self) -> TransferError {
        match self {
            Self::Hard(msg) | Self::Soft(msg) => TransferError::PartsFailed(msg),
            Self::Cancelled | Self::Completed => TransferError::Cancelled,
        }
    }
}

const GENERIC_PART_FAILURE: &str = "some parts failed, please retry";

/// Everything a dispatch run needs besides the worker.
pub(crate) struct Dispatch<'a> {
    pub name: &'a str,
    pub outstanding: Vec<Part>,
    pub task_num: usize,
    pub context: Arc<TransferContext>,
    pub checkpoint: Option<Arc<CheckpointStore>>,
    pub shared: Arc<SharedTransferState>,
    pub flow_limit: Option<u64>,
}

impl Dispatch<'_> {
    /// Runs every outstanding part through `worker` with bounded parallelism.
    ///
    /// Stops launching parts once a hard failure is flagged or the shared
    /// state is cancelled; parts already running finish.
    pub fn run<W: PartTransfer>(self, worker: Arc<W>) -> DispatchResult {
        let Dispatch {
            name,
            outstanding,
            task_num,
            context,
            checkpoint,
            shared,
            flow_limit,
        } = self;
        let mut executor = ThreadExecutor::with_token(name, shared.token());
        let mut governor = FlowGovernor::new(flow_limit, &shared);
        let mut queue: VecDeque<Part> = outstanding.into();
        let task_num = task_num.max(1);

        debug!(parts = queue.len(), task_num, "dispatching parts");

        while !queue.is_empty() {
            if executor.is_cancelled() || context.has_hard_failure() {
                break;
            }
            if executor.running() >= task_num {
                executor.wait_any();
                continue;
            }
            governor.throttle(&shared);
            if executor.is_cancelled() {
                break;
            }
            let Some(part) = queue.pop_front() else {
                break;
            };

            let worker = Arc::clone(&worker);
            let part_context = Arc::clone(&context);
            let part_checkpoint = checkpoint.clone();
            let part_shared = Arc::clone(&shared);
            let spawned = executor.spawn(Box::new(move || {
                run_part(
                    &*worker,
                    &part,
                    &part_context,
                    part_checkpoint.as_deref(),
                    &part_shared,
                );
            }));
            if let Err(e) = spawned {
                error!(error = %e, "cannot start part worker");
                context.record_error(format!("cannot start part worker: {e}"));
                break;
            }
        }
        executor.join();

        let first_error = || {
            context
                .first_error()
                .unwrap_or_else(|| GENERIC_PART_FAILURE.to_string())
        };
        if context.has_hard_failure() {
            return DispatchResult::Hard(first_error());
        }
        if context.all_completed() {
            return DispatchResult::Completed;
        }
        if shared.is_cancelled() {
            return DispatchResult::Cancelled;
        }
        DispatchResult::Soft(first_error())
    }
}

fn run_part(
    worker: &dyn PartTransfer,
    part: &Part,
    context: &TransferContext,
    checkpoint: Option<&CheckpointStore>,
    shared: &SharedTransferState,
) {
    let number = part.part_number;
    let result = with_retries(
        MAX_PART_RETRIES,
        |_| {
            if shared.is_cancelled() {
                return Err(PartError::Cancelled);
            }
            worker.transfer(part)
        },
        |e: &PartError| {
            let retry = e.is_retryable();
            if retry {
                warn!(part = number, error = %e, "part attempt failed, retrying");
            }
            retry
        },
    );

    match result {
        Ok(etag) => {
            context.complete(number, etag.clone());
            if let Some(checkpoint) = checkpoint {
                if let Err(e) = checkpoint.update(|r| r.mark_completed(number, etag.as_deref())) {
                    warn!(part = number, error = %e, "cannot record part in checkpoint");
                }
            }
            shared.add_progress(part.length);
            debug!(part = number, bytes = part.length, "part completed");
        }
        Err(PartError::Cancelled) => {
            debug!(part = number, "part skipped after cancellation");
        }
        Err(e) => {
            if e.is_hard() {
                context.fail_hard();
            }
            error!(part = number, error = %e, "part failed");
            context.record_error(format!("part {number}: {e}"));
        }
    }
}

// ---------------------------------------------------------------------------
// Multipart session helpers
// ---------------------------------------------------------------------------

/// Identifies the multipart session of an upload or copy.
pub(crate) struct Session<'a> {
    pub store: &'a dyn ObjectStore,
    pub bucket: &'a str,
    pub key: &'a str,
    pub upload_id: &'a str,
}

impl Session<'_> {
    fn target(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// Aborts the session; failures are logged, not returned.
    pub fn abort(&self) {
        let response = self
            .store
            .abort_multipart_upload(self.bucket, self.key, self.upload_id);
        match remote_status("abort multipart upload", &self.target(), response) {
            Ok(()) => info!(
                bucket = %self.bucket,
                key = %self.key,
                upload_id = %self.upload_id,
                "multipart upload aborted"
            ),
            Err(e) => warn!(upload_id = %self.upload_id, error = %e, "cannot abort multipart upload"),
        }
    }

    /// Completes the session with `parts` sorted by part number.
    ///
    /// A failed completion aborts the session.
    pub fn complete(&self, parts: &[CompletedPart]) -> Result<String, TransferError> {
        let response =
            self.store
                .complete_multipart_upload(self.bucket, self.key, self.upload_id, parts);
        match remote_response("complete multipart upload", &self.target(), response) {
            Ok(etag) => Ok(etag),
            Err(e) => {
                error!(upload_id = %self.upload_id, error = %e, "complete multipart upload failed");
                self.abort();
                Err(TransferError::CompleteFailed(e.to_string()))
            }
        }
    }
}

/// Deletes a checkpoint, logging failures.
pub(crate) fn discard_checkpoint(checkpoint: Option<&CheckpointStore>) {
    if let Some(checkpoint) = checkpoint {
        if let Err(e) = checkpoint.delete() {
            warn!(path = %checkpoint.path().display(), error = %e, "cannot delete checkpoint");
        }
    }
}

pub(crate) fn transition(state: &mut TransferState, next: TransferState, target: &str) {
    debug!(from = %state, to = %next, target, "transfer state");
    *state = next;
}
