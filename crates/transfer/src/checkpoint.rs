//! Checkpoint files: one JSON record per in-flight transfer.
//!
//! Files live in a checkpoint directory and are named
//! `<sanitized local path>.<kind>.<digest>`, where the digest is derived
//! from the local path, bucket and key so two transfers never share a file
//! and the same transfer always maps to the same one.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::record::{CheckpointRecord, TransferKind};
use crate::{TransferError, lock};

/// Longest sanitized path prefix kept in a checkpoint file name.
const MAX_PATH_PREFIX: usize = 160;

/// Replaces path separators and drive markers with `_`.
pub fn sanitize_path(path: &str) -> String {
    let trimmed = path.trim_matches(|c| c == '/' || c == '\\');
    let mut out = trimmed.to_string();
    for rep in [":\\", "\\", "//", "/", ":"] {
        out = out.replace(rep, "_");
    }
    if out.len() > MAX_PATH_PREFIX {
        let mut start = out.len() - MAX_PATH_PREFIX;
        while !out.is_char_boundary(start) {
            start += 1;
        }
        out = out[start..].to_string();
    }
    out
}

/// Deterministic checkpoint file name for one transfer.
///
/// `local` is the local file path, or the source object path for copies.
pub fn checkpoint_file_name(kind: TransferKind, bucket: &str, key: &str, local: &str) -> String {
    let seed = match kind {
        TransferKind::Download => format!("{bucket}{key}{local}"),
        TransferKind::Upload | TransferKind::Copy => format!("{local}{bucket}{key}"),
    };
    let digest = Sha256::digest(seed.as_bytes());
    format!(
        "{}.{}.{}",
        sanitize_path(local),
        kind.as_str(),
        hex::encode(&digest[..16])
    )
}

/// Reads and writes the checkpoint record of one transfer.
///
/// All workers of an operation share one store; [`update`](Self::update)
/// serializes their read-modify-write cycles.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Store for the given transfer inside `dir`.
    pub fn for_transfer(
        dir: &Path,
        kind: TransferKind,
        bucket: &str,
        key: &str,
        local: &str,
    ) -> Self {
        Self::new(dir.join(checkpoint_file_name(kind, bucket, key, local)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the record, or `None` if it is absent or unreadable.
    ///
    /// A file that fails to parse is deleted.
    pub fn load(&self) -> Option<CheckpointRecord> {
        let content = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read checkpoint");
                return None;
            }
        };

        match serde_json::from_slice(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "checkpoint file is broken, rebuilding transfer"
                );
                if let Err(e) = self.delete() {
                    warn!(path = %self.path.display(), error = %e, "cannot delete broken checkpoint");
                }
                None
            }
        }
    }

    /// Overwrites the file with `record`.
    pub fn write(&self, record: &CheckpointRecord) -> Result<(), TransferError> {
        let _guard = lock(&self.write_lock);
        self.write_unlocked(record)
    }

    /// Loads the record, applies `mutate`, and writes it back under the lock.
    ///
    /// Returns `false` without writing if there is no record or `mutate`
    /// reports no change.
    pub fn update<F>(&self, mutate: F) -> Result<bool, TransferError>
    where
        F: FnOnce(&mut CheckpointRecord) -> bool,
    {
        let _guard = lock(&self.write_lock);
        let Some(mut record) = self.load() else {
            return Ok(false);
        };
        if !mutate(&mut record) {
            return Ok(false);
        }
        self.write_unlocked(&record)?;
        Ok(true)
    }

    /// Removes the file. Absent files are not an error.
    pub fn delete(&self) -> Result<(), TransferError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes already transferred according to the stored record.
    pub fn completed_bytes(&self) -> u64 {
        self.load().map(|r| r.completed_bytes()).unwrap_or(0)
    }

    fn write_unlocked(&self, record: &CheckpointRecord) -> Result<(), TransferError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp_name = OsString::from(self.path.as_os_str());
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let content = serde_json::to_vec(record)?;
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), "checkpoint written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::plan_parts;
    use crate::record::{FileStatus, UploadRecord};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn record(parts: u64) -> CheckpointRecord {
        CheckpointRecord::Upload(UploadRecord {
            bucket_name: "bucket".into(),
            object_key: "dir/key".into(),
            upload_file: PathBuf::from("/data/big.iso"),
            upload_id: Some("upload-1".into()),
            file_status: FileStatus {
                size: parts * 4,
                modified_nanos: 42,
            },
            part_size: 4,
            parts: plan_parts(parts * 4, 4).unwrap(),
            part_etags: Vec::new(),
        })
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_path("/home/user/file.bin"), "home_user_file.bin");
        assert_eq!(sanitize_path("C:\\data\\file.bin"), "C_data_file.bin");
        assert_eq!(sanitize_path("obs://bucket/key"), "obs__bucket_key");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a/".repeat(200);
        assert!(sanitize_path(&long).len() <= MAX_PATH_PREFIX);
    }

    #[test]
    fn file_names_are_deterministic_and_distinct() {
        let a = checkpoint_file_name(TransferKind::Upload, "b", "k", "/f");
        let b = checkpoint_file_name(TransferKind::Upload, "b", "k", "/f");
        assert_eq!(a, b);
        assert!(a.starts_with("f.upload."));
        assert_eq!(a.rsplit('.').next().unwrap().len(), 32);

        assert_ne!(a, checkpoint_file_name(TransferKind::Upload, "b", "k2", "/f"));
        assert_ne!(a, checkpoint_file_name(TransferKind::Download, "b", "k", "/f"));
        assert_ne!(a, checkpoint_file_name(TransferKind::Copy, "b", "k", "/f"));
    }

    #[test]
    fn write_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested").join("cp"));
        let original = record(3);

        store.write(&original).unwrap();
        assert!(store.exists());
        assert_eq!(store.load(), Some(original));
    }

    #[test]
    fn missing_file_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("absent"));
        assert!(store.load().is_none());
        assert_eq!(store.completed_bytes(), 0);
    }

    #[test]
    fn corrupt_file_loads_none_and_is_deleted() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp"));
        store.write(&record(2)).unwrap();

        let mut bytes = std::fs::read(store.path()).unwrap();
        bytes.truncate(bytes.len() / 2);
        std::fs::write(store.path(), bytes).unwrap();

        assert!(store.load().is_none());
        assert!(!store.exists());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp"));
        store.write(&record(1)).unwrap();
        store.delete().unwrap();
        store.delete().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn update_without_record_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp"));
        assert!(!store.update(|r| r.mark_completed(1, None)).unwrap());
        assert!(!store.exists());
    }

    #[test]
    fn completed_bytes_sums_completed_parts() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp"));
        store.write(&record(3)).unwrap();
        store.update(|r| r.mark_completed(1, Some("e1"))).unwrap();
        store.update(|r| r.mark_completed(3, Some("e3"))).unwrap();
        assert_eq!(store.completed_bytes(), 8);
    }

    #[test]
    fn concurrent_updates_do_not_lose_parts() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(dir.path().join("cp")));
        let total = 64u32;
        store.write(&record(total as u64)).unwrap();

        let mut handles = vec![];
        for worker in 0..8u32 {
            let s = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for n in (1..=total).filter(|n| n % 8 == worker) {
                    let etag = format!("etag-{n}");
                    s.update(|r| r.mark_completed(n, Some(&etag))).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let loaded = store.load().unwrap();
        assert!(loaded.parts().iter().all(|p| p.is_completed));
        assert_eq!(loaded.part_etags().len(), total as usize);
    }
}
