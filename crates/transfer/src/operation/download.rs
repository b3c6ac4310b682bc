use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::{
    Dispatch, DispatchResult, PartError, PartTransfer, TransferOptions, TransferState,
    discard_checkpoint, part_response, remote_response, transition,
};
use crate::TransferError;
use crate::checkpoint::CheckpointStore;
use crate::chunked::{create_placeholder, download_tmp_path, write_part};
use crate::context::TransferContext;
use crate::governor::SharedTransferState;
use crate::part::{Part, plan_parts};
use crate::record::{CheckpointRecord, DownloadRecord, ObjectStatus, TransferKind};
use crate::store::{ByteRange, ObjectStore};
use crate::validation::check_download_record;

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub size: u64,
}

/// Ranged, parallel download of one object into a local file.
///
/// Parts are written into `<file>.download.tmp`, which is renamed onto the
/// destination once every part has landed.
pub struct DownloadOperation {
    store: Arc<dyn ObjectStore>,
    shared: Arc<SharedTransferState>,
    bucket: String,
    key: String,
    version_id: Option<String>,
    file: PathBuf,
    options: TransferOptions,
    checkpoint: Option<Arc<CheckpointStore>>,
    state: TransferState,
}

struct DownloadPart {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    version_id: Option<String>,
    tmp: PathBuf,
}

impl PartTransfer for DownloadPart {
    fn transfer(&self, part: &Part) -> Result<Option<String>, PartError> {
        let mut body = part_response(self.store.get_object_range(
            &self.bucket,
            &self.key,
            self.version_id.as_deref(),
            ByteRange::of(part),
        ))?;
        write_part(&self.tmp, part, &mut body)?;
        Ok(None)
    }
}

impl DownloadOperation {
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
                TransferKind::Download,
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
            version_id: None,
            file,
            options,
            checkpoint,
            state: TransferState::Init,
        }
    }

    pub fn with_version_id(mut self, version_id: Option<String>) -> Self {
        self.version_id = version_id;
        self
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoint.as_deref().map(CheckpointStore::path)
    }

    pub fn tmp_path(&self) -> PathBuf {
        download_tmp_path(&self.file)
    }

    /// Downloads the object, resuming from a valid checkpoint when one exists.
    pub fn download(&mut self, flow_limit: Option<u64>) -> Result<DownloadOutcome, TransferError> {
        let result = self.run(flow_limit);
        let end = if result.is_ok() {
            TransferState::Succeeded
        } else {
            TransferState::Failed
        };
        transition(&mut self.state, end, &self.key);
        result
    }

    fn run(&mut self, flow_limit: Option<u64>) -> Result<DownloadOutcome, TransferError> {
        let object = self.preflight()?;
        let record = self.load_or_build(&object)?;
        let tmp = self.tmp_path();

        let context = Arc::new(TransferContext::from_record(&CheckpointRecord::Download(
            record.clone(),
        )));
        let outstanding: Vec<Part> = record
            .parts
            .iter()
            .filter(|p| !p.is_completed)
            .cloned()
            .collect();

        transition(&mut self.state, TransferState::Dispatching, &self.key);
        let worker = Arc::new(DownloadPart {
            store: Arc::clone(&self.store),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            version_id: self.version_id.clone(),
            tmp: tmp.clone(),
        });
        let result = Dispatch {
            name: "download-part",
            outstanding,
            task_num: self.options.task_num,
            context,
            checkpoint: self.checkpoint.clone(),
            shared: Arc::clone(&self.shared),
            flow_limit,
        }
        .run(worker);

        if result != DispatchResult::Completed {
            if result.is_resumable() && self.checkpoint.is_some() {
                warn!(
                    bucket = %self.bucket,
                    key = %self.key,
                    "download interrupted, checkpoint kept for resume"
                );
            } else {
                transition(&mut self.state, TransferState::CleaningUp, &self.key);
                self.remove_tmp(&tmp);
                discard_checkpoint(self.checkpoint.as_deref());
            }
            return Err(result.into_error());
        }

        transition(&mut self.state, TransferState::Finalizing, &self.key);
        if let Err(source) = std::fs::rename(&tmp, &self.file) {
            self.remove_tmp(&tmp);
            discard_checkpoint(self.checkpoint.as_deref());
            return Err(TransferError::LocalFile {
                path: self.file.clone(),
                source,
            });
        }
        discard_checkpoint(self.checkpoint.as_deref());

        info!(
            bucket = %self.bucket,
            key = %self.key,
            path = %self.file.display(),
            size = object.size,
            "download complete"
        );
        Ok(DownloadOutcome {
            path: self.file.clone(),
            size: object.size,
        })
    }

    fn preflight(&self) -> Result<ObjectStatus, TransferError> {
        let target = format!("{}/{}", self.bucket, self.key);
        let meta = remote_response(
            "get object metadata",
            &target,
            self.store
                .get_object_metadata(&self.bucket, &self.key, self.version_id.as_deref()),
        )?;
        Ok(ObjectStatus {
            size: meta.size,
            last_modified: meta.last_modified,
        })
    }

    fn load_or_build(&mut self, object: &ObjectStatus) -> Result<DownloadRecord, TransferError> {
        let Some(checkpoint) = self.checkpoint.clone() else {
            return self.build(object);
        };

        match checkpoint.load() {
            Some(CheckpointRecord::Download(record)) => {
                match check_download_record(
                    &record,
                    &self.bucket,
                    &self.key,
                    self.version_id.as_deref(),
                    &self.file,
                    object,
                ) {
                    Ok(()) => {
                        transition(&mut self.state, TransferState::Resuming, &self.key);
                        let done = checkpoint.completed_bytes();
                        self.shared.add_resumed(done);
                        info!(
                            bucket = %self.bucket,
                            key = %self.key,
                            completed_bytes = done,
                            "resuming download from checkpoint"
                        );
                        return Ok(record);
                    }
                    Err(reason) => {
                        warn!(
                            path = %checkpoint.path().display(),
                            reason = %reason,
                            "download checkpoint is stale, starting over"
                        );
                        self.remove_tmp(&self.tmp_path());
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
        self.build(object)
    }

    fn build(&mut self, object: &ObjectStatus) -> Result<DownloadRecord, TransferError> {
        transition(&mut self.state, TransferState::Building, &self.key);
        let part_size = self.options.effective_part_size(object.size)?;
        let parts = plan_parts(object.size, part_size)?;

        let tmp = self.tmp_path();
        create_placeholder(&tmp, object.size)
            .map_err(|source| TransferError::LocalFile { path: tmp, source })?;

        let record = DownloadRecord {
            bucket_name: self.bucket.clone(),
            object_key: self.key.clone(),
            version_id: self.version_id.clone(),
            download_file: self.file.clone(),
            object_status: object.clone(),
            part_size,
            parts,
        };
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.write(&CheckpointRecord::Download(record.clone()))?;
        }
        info!(
            bucket = %self.bucket,
            key = %self.key,
            parts = record.parts.len(),
            part_size,
            "download planned"
        );
        Ok(record)
    }

    fn remove_tmp(&self, tmp: &Path) {
        match std::fs::remove_file(tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %tmp.display(), error = %e, "cannot remove download temp file"),
        }
    }
}
