use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::{
    Dispatch, DispatchResult, MultipartOutcome, PartError, PartTransfer, Session, TransferOptions,
    TransferState, discard_checkpoint, part_response, remote_response, remote_status, transition,
};
use crate::TransferError;
use crate::checkpoint::CheckpointStore;
use crate::context::TransferContext;
use crate::governor::SharedTransferState;
use crate::part::{Part, plan_parts};
use crate::record::{CheckpointRecord, CopyRecord, ObjectStatus, TransferKind};
use crate::store::{ByteRange, ObjectMeta, ObjectStore, PartTarget};
use crate::validation::check_copy_record;

/// Server-side multipart copy of one object into another.
pub struct CopyOperation {
    store: Arc<dyn ObjectStore>,
    shared: Arc<SharedTransferState>,
    source_bucket: String,
    source_key: String,
    bucket: String,
    key: String,
    options: TransferOptions,
    checkpoint: Option<Arc<CheckpointStore>>,
    state: TransferState,
}

struct CopyPart {
    store: Arc<dyn ObjectStore>,
    source_bucket: String,
    source_key: String,
    bucket: String,
    key: String,
    upload_id: String,
}

impl PartTransfer for CopyPart {
    fn transfer(&self, part: &Part) -> Result<Option<String>, PartError> {
        let target = PartTarget {
            bucket: &self.bucket,
            key: &self.key,
            upload_id: &self.upload_id,
            part_number: part.part_number,
        };
        let etag = part_response(self.store.copy_part(
            &target,
            &self.source_bucket,
            &self.source_key,
            ByteRange::of(part),
        ))?;
        Ok(Some(etag))
    }
}

/// `obs://bucket/key` form of an object path.
fn object_path(bucket: &str, key: &str) -> String {
    format!("obs://{bucket}/{key}")
}

impl CopyOperation {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        shared: Arc<SharedTransferState>,
        source: (impl Into<String>, impl Into<String>),
        destination: (impl Into<String>, impl Into<String>),
        options: TransferOptions,
    ) -> Self {
        let (source_bucket, source_key) = (source.0.into(), source.1.into());
        let (bucket, key) = (destination.0.into(), destination.1.into());
        let checkpoint = options.checkpoint_dir.as_deref().map(|dir| {
            Arc::new(CheckpointStore::for_transfer(
                dir,
                TransferKind::Copy,
                &bucket,
                &key,
                &object_path(&source_bucket, &source_key),
            ))
        });
        Self {
            store,
            shared,
            source_bucket,
            source_key,
            bucket,
            key,
            options,
            checkpoint,
            state: TransferState::Init,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint.as_deref().map(CheckpointStore::path)
    }

    fn copy_source(&self) -> String {
        object_path(&self.source_bucket, &self.source_key)
    }

    /// Copies the source object, resuming from a valid checkpoint when one
    /// exists.
    pub fn copy(&mut self, flow_limit: Option<u64>) -> Result<MultipartOutcome, TransferError> {
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
        let source = self.preflight()?;
        let record = self.load_or_build(&source)?;

        let upload_id = record.upload_id.clone().unwrap_or_default();
        let context = Arc::new(TransferContext::from_record(&CheckpointRecord::Copy(
            record.clone(),
        )));
        let outstanding: Vec<Part> = record
            .parts
            .iter()
            .filter(|p| !p.is_completed)
            .cloned()
            .collect();

        transition(&mut self.state, TransferState::Dispatching, &self.key);
        let worker = Arc::new(CopyPart {
            store: Arc::clone(&self.store),
            source_bucket: self.source_bucket.clone(),
            source_key: self.source_key.clone(),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: upload_id.clone(),
        });
        let result = Dispatch {
            name: "copy-part",
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
                    "copy interrupted, checkpoint kept for resume"
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
        let completed = session.complete(&parts);
        discard_checkpoint(self.checkpoint.as_deref());
        let etag = completed?;

        info!(
            source = %self.copy_source(),
            bucket = %self.bucket,
            key = %self.key,
            parts = parts.len(),
            "copy complete"
        );
        Ok(MultipartOutcome {
            upload_id,
            etag,
            part_size: record.part_size,
        })
    }

    fn preflight(&self) -> Result<ObjectMeta, TransferError> {
        remote_status(
            "head bucket",
            &self.bucket,
            self.store.head_bucket(&self.bucket),
        )?;
        remote_response(
            "get object metadata",
            &self.copy_source(),
            self.store
                .get_object_metadata(&self.source_bucket, &self.source_key, None),
        )
    }

    fn load_or_build(&mut self, source: &ObjectMeta) -> Result<CopyRecord, TransferError> {
        let status = ObjectStatus {
            size: source.size,
            last_modified: source.last_modified.clone(),
        };
        let Some(checkpoint) = self.checkpoint.clone() else {
            return self.build(source, status);
        };

        match checkpoint.load() {
            Some(CheckpointRecord::Copy(record)) => {
                match check_copy_record(
                    &record,
                    &self.bucket,
                    &self.key,
                    &self.copy_source(),
                    &status,
                ) {
                    Ok(()) => {
                        transition(&mut self.state, TransferState::Resuming, &self.key);
                        let done = checkpoint.completed_bytes();
                        self.shared.add_resumed(done);
                        info!(
                            source = %self.copy_source(),
                            key = %self.key,
                            completed_bytes = done,
                            "resuming copy from checkpoint"
                        );
                        return Ok(record);
                    }
                    Err(reason) => {
                        warn!(
                            path = %checkpoint.path().display(),
                            reason = %reason,
                            "copy checkpoint is stale, starting over"
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
        self.build(source, status)
    }

    fn build(
        &mut self,
        source: &ObjectMeta,
        status: ObjectStatus,
    ) -> Result<CopyRecord, TransferError> {
        transition(&mut self.state, TransferState::Building, &self.key);
        let part_size = self.options.effective_part_size(status.size)?;
        let parts = plan_parts(status.size, part_size)?;

        let target = format!("{}/{}", self.bucket, self.key);
        let upload_id = remote_response(
            "initiate multipart upload",
            &target,
            self.store
                .initiate_multipart_upload(&self.bucket, &self.key, &source.metadata),
        )?;
        info!(
            source = %self.copy_source(),
            bucket = %self.bucket,
            key = %self.key,
            upload_id = %upload_id,
            parts = parts.len(),
            "multipart copy initiated"
        );

        let record = CopyRecord {
            bucket_name: self.bucket.clone(),
            object_key: self.key.clone(),
            copy_source: self.copy_source(),
            upload_id: Some(upload_id.clone()),
            source_status: status,
            part_size,
            parts,
            part_etags: Vec::new(),
        };
        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint.write(&CheckpointRecord::Copy(record.clone())) {
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
