use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::{
    Dispatch, DispatchResult, MultipartOutcome, PartError, PartTransfer, Session, TransferOptions,
    TransferState, discard_checkpoint, part_response, remote_response, remote_status, transition,
};
use crate::TransferError;
use crate::checkpoint::CheckpointStore;
use crate::chunked::open_part_reader;
use crate::context::TransferContext;
use crate::governor::SharedTransferState;
use crate::part::{Part, plan_parts};
use crate::record::{CheckpointRecord, FileStatus, TransferKind, UploadRecord};
use crate::store::{ObjectStore, PartTarget};
use crate::validation::check_upload_record;

/// Multipart upload of one local file.
pub struct UploadOperation {
    store: Arc<dyn ObjectStore>,
    shared: Arc<SharedTransferState>,
    bucket: String,
    key: String,
    file: PathBuf,
    metadata: BTreeMap<String, String>,
    options: TransferOptions,
    checkpoint: Option<Arc<CheckpointStore>>,
    state: TransferState,
}

struct UploadPart {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    upload_id: String,
    file: PathBuf,
}

impl PartTransfer for UploadPart {
    fn transfer(&self, part: &Part) -> Result<Option<String>, PartError> {
        let mut reader = open_part_reader(&self.file, part)?;
        let target = PartTarget {
            bucket: &self.bucket,
            key: &self.key,
            upload_id: &self.upload_id,
            part_number: part.part_number,
        };
        let etag = part_response(self.store.upload_part(&target, &mut reader, part.length))?;
        Ok(Some(etag))
    }
}

impl UploadOperation {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        shared: Arc<SharedTransferState>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        let file = file.into();
        let checkpoint = options.checkpoint_dir.as_deref().map(|dir| {
            Arc::new(CheckpointStore::for_transfer(
                dir,
                TransferKind::Upload,
                &bucket,
                &key,
                &file.to_string_lossy(),
            ))
        });
        Self {
            store,
            shared,
            bucket,
            key,
            file,
            metadata: BTreeMap::new(),
            options,
            checkpoint,
            state: TransferState::Init,
        }
    }

    /// User metadata attached to the object when the session is opened.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint.as_deref().map(CheckpointStore::path)
    }

    /// Uploads the file, resuming from a valid checkpoint when one exists.
    ///
    /// `flow_limit` caps the aggregate dispatch rate in bytes per second.
    pub fn upload(&mut self, flow_limit: Option<u64>) -> Result<MultipartOutcome, TransferError> {
        let result = self.run(flow_limit);
        let end = if result.is_ok() {
            TransferState::Succeeded
        } else {
            TransferState::Failed
        };
        transition(&mut self.state, end, &self.key);
        result
    }

    fn run(&mut self, flow_limit: Option<u64>) -> Result<MultipartOutcome, TransferError> {
        let status = self.preflight()?;
        let record = self.load_or_build(status)?;

        let upload_id = record.upload_id.clone().unwrap_or_default();
        let context = Arc::new(TransferContext::from_record(&CheckpointRecord::Upload(
            record.clone(),
        )));
        let outstanding: Vec<Part> = record
            .parts
            .iter()
            .filter(|p| !p.is_completed)
            .cloned()
            .collect();

        transition(&mut self.state, TransferState::Dispatching, &self.key);
        let worker = Arc::new(UploadPart {
            store: Arc::clone(&self.store),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: upload_id.clone(),
            file: self.file.clone(),
        });
        let result = Dispatch {
            name: "upload-part",
            outstanding,
            task_num: self.options.task_num,
            context: Arc::clone(&context),
            checkpoint: self.checkpoint.clone(),
            shared: Arc::clone(&self.shared),
            flow_limit,
        }
        .run(worker);

        let session = Session {
            store: self.store.as_ref(),
            bucket: &self.bucket,
            key: &self.key,
            upload_id: &upload_id,
        };

        if result != DispatchResult::Completed {
            if result.is_resumable() && self.checkpoint.is_some() {
                warn!(
                    bucket = %self.bucket,
                    key = %self.key,
                    "upload interrupted, checkpoint kept for resume"
                );
            } else {
                transition(&mut self.state, TransferState::CleaningUp, &self.key);
                session.abort();
                discard_checkpoint(self.checkpoint.as_deref());
            }
            return Err(result.into_error());
        }

        transition(&mut self.state, TransferState::Finalizing, &self.key);
        let parts = context.completed_parts();
        let etag = match session.complete(&parts) {
            Ok(etag) => etag,
            Err(e) => {
                discard_checkpoint(self.checkpoint.as_deref());
                return Err(e);
            }
        };
        discard_checkpoint(self.checkpoint.as_deref());

        info!(
            bucket = %self.bucket,
            key = %self.key,
            parts = parts.len(),
            etag = %etag,
            "upload complete"
        );
        Ok(MultipartOutcome {
            upload_id,
            etag,
            part_size: record.part_size,
        })
    }

    fn preflight(&self) -> Result<FileStatus, TransferError> {
        let local = |source| TransferError::LocalFile {
            path: self.file.clone(),
            source,
        };
        let meta = std::fs::metadata(&self.file).map_err(local)?;
        if !meta.is_file() {
            return Err(local(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        let status = FileStatus::of(&self.file).map_err(local)?;

        remote_status(
            "head bucket",
            &self.bucket,
            self.store.head_bucket(&self.bucket),
        )?;
        Ok(status)
    }

    fn load_or_build(&mut self, status: FileStatus) -> Result<UploadRecord, TransferError> {
        let Some(checkpoint) = self.checkpoint.clone() else {
            return self.build(status);
        };

        match checkpoint.load() {
            Some(CheckpointRecord::Upload(record)) => {
                match check_upload_record(&record, &self.bucket, &self.key, &self.file) {
                    Ok(()) => {
                        transition(&mut self.state, TransferState::Resuming, &self.key);
                        let done = checkpoint.completed_bytes();
                        self.shared.add_resumed(done);
                        info!(
                            bucket = %self.bucket,
                            key = %self.key,
                            completed_bytes = done,
                            "resuming upload from checkpoint"
                        );
                        return Ok(record);
                    }
                    Err(reason) => {
                        warn!(
                            path = %checkpoint.path().display(),
                            reason = %reason,
                            "upload checkpoint is stale, starting over"
                        );
                        if let Some(upload_id) = record.upload_id.as_deref() {
                            Session {
                                store: self.store.as_ref(),
                                bucket: &record.bucket_name,
                                key: &record.object_key,
                                upload_id,
                            }
                            .abort();
                        }
                        checkpoint.delete()?;
                    }
                }
            }
            Some(other) => {
                warn!(kind = %other.kind(), "checkpoint holds another transfer kind, discarding");
                checkpoint.delete()?;
            }
            None => {}
        }
        self.build(status)
    }

    fn build(&mut self, status: FileStatus) -> Result<UploadRecord, TransferError> {
        transition(&mut self.state, TransferState::Building, &self.key);
        let part_size = self.options.effective_part_size(status.size)?;
        let parts = plan_parts(status.size, part_size)?;

        let target = format!("{}/{}", self.bucket, self.key);
        let upload_id = remote_response(
            "initiate multipart upload",
            &target,
            self.store
                .initiate_multipart_upload(&self.bucket, &self.key, &self.metadata),
        )?;
        info!(
            bucket = %self.bucket,
            key = %self.key,
            upload_id = %upload_id,
            parts = parts.len(),
            part_size,
            "multipart upload initiated"
        );

        let record = UploadRecord {
            bucket_name: self.bucket.clone(),
            object_key: self.key.clone(),
            upload_file: self.file.clone(),
            upload_id: Some(upload_id.clone()),
            file_status: status,
            part_size,
            parts,
            part_etags: Vec::new(),
        };

        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint.write(&CheckpointRecord::Upload(record.clone())) {
                Session {
                    store: self.store.as_ref(),
                    bucket: &self.bucket,
                    key: &self.key,
                    upload_id: &upload_id,
                }
                .abort();
                return Err(e);
            }
        }
        Ok(record)
    }
}
