//! Decides whether a loaded checkpoint may be resumed.
//!
//! Every check compares the record against live state: the local file on
//! disk, the remote object's current metadata, or the download placeholder.
//! A record that passes describes exactly the transfer being requested.

use std::fmt;
use std::path::Path;

use crate::chunked::download_tmp_path;
use crate::record::{CopyRecord, DownloadRecord, FileStatus, ObjectStatus, UploadRecord};

/// Why a checkpoint cannot be resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// Bucket, key, local path or source do not match the requested transfer.
    Identity,
    MissingUploadId,
    SizeChanged { recorded: u64, current: u64 },
    ModifiedChanged,
    LastModifiedChanged,
    LocalUnreadable(String),
    TmpFileMissing,
    TmpFileSize { expected: u64, actual: u64 },
    /// The plan does not tile the recorded size.
    PartsMismatch,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => f.write_str("checkpoint belongs to a different transfer"),
            Self::MissingUploadId => f.write_str("checkpoint has no upload id"),
            Self::SizeChanged { recorded, current } => {
                write!(f, "size changed from {recorded} to {current}")
            }
            Self::ModifiedChanged => f.write_str("local file was modified"),
            Self::LastModifiedChanged => f.write_str("remote object was modified"),
            Self::LocalUnreadable(e) => write!(f, "cannot stat local file: {e}"),
            Self::TmpFileMissing => f.write_str("download temp file is missing"),
            Self::TmpFileSize { expected, actual } => {
                write!(f, "download temp file is {actual} bytes, expected {expected}")
            }
            Self::PartsMismatch => f.write_str("part list does not cover the recorded size"),
        }
    }
}

fn check_parts(parts: &[crate::part::Part], size: u64) -> Result<(), StaleReason> {
    let mut offset = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.part_number as usize != i + 1 || part.offset != offset || part.length == 0 {
            return Err(StaleReason::PartsMismatch);
        }
        offset += part.length;
    }
    if offset != size {
        return Err(StaleReason::PartsMismatch);
    }
    Ok(())
}

fn check_object_status(recorded: &ObjectStatus, live: &ObjectStatus) -> Result<(), StaleReason> {
    if recorded.size != live.size {
        return Err(StaleReason::SizeChanged {
            recorded: recorded.size,
            current: live.size,
        });
    }
    if recorded.last_modified != live.last_modified {
        return Err(StaleReason::LastModifiedChanged);
    }
    Ok(())
}

/// Upload checkpoints stay valid while the local file is untouched.
pub fn check_upload_record(
    record: &UploadRecord,
    bucket: &str,
    key: &str,
    file: &Path,
) -> Result<(), StaleReason> {
    if record.bucket_name != bucket || record.object_key != key || record.upload_file != file {
        return Err(StaleReason::Identity);
    }
    if record.upload_id.is_none() {
        return Err(StaleReason::MissingUploadId);
    }

    let current = FileStatus::of(file).map_err(|e| StaleReason::LocalUnreadable(e.to_string()))?;
    if record.file_status.size != current.size {
        return Err(StaleReason::SizeChanged {
            recorded: record.file_status.size,
            current: current.size,
        });
    }
    if record.file_status.modified_nanos != current.modified_nanos {
        return Err(StaleReason::ModifiedChanged);
    }
    check_parts(&record.parts, record.file_status.size)
}

/// Copy checkpoints stay valid while the source object is unchanged.
pub fn check_copy_record(
    record: &CopyRecord,
    bucket: &str,
    key: &str,
    copy_source: &str,
    source: &ObjectStatus,
) -> Result<(), StaleReason> {
    if record.bucket_name != bucket || record.object_key != key || record.copy_source != copy_source
    {
        return Err(StaleReason::Identity);
    }
    if record.upload_id.is_none() {
        return Err(StaleReason::MissingUploadId);
    }
    check_object_status(&record.source_status, source)?;
    check_parts(&record.parts, record.source_status.size)
}

/// Download checkpoints need the placeholder file at full size and an
/// unchanged remote object.
///
/// The placeholder's content is not verified; a right-sized file is trusted.
pub fn check_download_record(
    record: &DownloadRecord,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
    file: &Path,
    object: &ObjectStatus,
) -> Result<(), StaleReason> {
    if record.bucket_name != bucket
        || record.object_key != key
        || record.version_id.as_deref() != version_id
        || record.download_file != file
    {
        return Err(StaleReason::Identity);
    }

    let tmp = download_tmp_path(file);
    let actual = match std::fs::metadata(&tmp) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Err(StaleReason::TmpFileMissing),
    };
    if actual != record.object_status.size {
        return Err(StaleReason::TmpFileSize {
            expected: record.object_status.size,
            actual,
        });
    }

    check_object_status(&record.object_status, object)?;
    check_parts(&record.parts, record.object_status.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::plan_parts;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const STAMP: &str = "Mon, 01 Jan 2024 00:00:00 +0000";

    fn upload_record(file: &Path) -> UploadRecord {
        let status = FileStatus::of(file).unwrap();
        UploadRecord {
            bucket_name: "b".into(),
            object_key: "k".into(),
            upload_file: file.to_path_buf(),
            upload_id: Some("u".into()),
            file_status: status,
            part_size: 4,
            parts: plan_parts(status.size, 4).unwrap(),
            part_etags: Vec::new(),
        }
    }

    fn object(size: u64, stamp: &str) -> ObjectStatus {
        ObjectStatus {
            size,
            last_modified: stamp.into(),
        }
    }

    #[test]
    fn upload_record_matches_untouched_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, b"0123456789").unwrap();
        let record = upload_record(&file);
        assert_eq!(check_upload_record(&record, "b", "k", &file), Ok(()));
    }

    #[test]
    fn upload_record_rejects_identity_and_missing_id() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, b"0123456789").unwrap();
        let mut record = upload_record(&file);

        assert_eq!(
            check_upload_record(&record, "other", "k", &file),
            Err(StaleReason::Identity)
        );
        assert_eq!(
            check_upload_record(&record, "b", "k", &PathBuf::from("/elsewhere")),
            Err(StaleReason::Identity)
        );

        record.upload_id = None;
        assert_eq!(
            check_upload_record(&record, "b", "k", &file),
            Err(StaleReason::MissingUploadId)
        );
    }

    #[test]
    fn upload_record_rejects_size_change() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, b"0123456789").unwrap();
        let record = upload_record(&file);

        std::fs::write(&file, b"0123456789abc").unwrap();
        assert_eq!(
            check_upload_record(&record, "b", "k", &file),
            Err(StaleReason::SizeChanged {
                recorded: 10,
                current: 13
            })
        );
    }

    #[test]
    fn upload_record_rejects_mtime_change() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, b"0123456789").unwrap();
        let mut record = upload_record(&file);
        record.file_status.modified_nanos -= 1_000_000_000;

        assert_eq!(
            check_upload_record(&record, "b", "k", &file),
            Err(StaleReason::ModifiedChanged)
        );
    }

    #[test]
    fn upload_record_rejects_broken_plan() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f.bin");
        std::fs::write(&file, b"0123456789").unwrap();
        let mut record = upload_record(&file);
        record.parts.pop();

        assert_eq!(
            check_upload_record(&record, "b", "k", &file),
            Err(StaleReason::PartsMismatch)
        );
    }

    #[test]
    fn copy_record_tracks_source() {
        let record = CopyRecord {
            bucket_name: "dst".into(),
            object_key: "k2".into(),
            copy_source: "obs://src/k1".into(),
            upload_id: Some("u".into()),
            source_status: object(10, STAMP),
            part_size: 5,
            parts: plan_parts(10, 5).unwrap(),
            part_etags: Vec::new(),
        };

        assert_eq!(
            check_copy_record(&record, "dst", "k2", "obs://src/k1", &object(10, STAMP)),
            Ok(())
        );
        assert_eq!(
            check_copy_record(&record, "dst", "k2", "obs://src/other", &object(10, STAMP)),
            Err(StaleReason::Identity)
        );
        assert!(matches!(
            check_copy_record(&record, "dst", "k2", "obs://src/k1", &object(11, STAMP)),
            Err(StaleReason::SizeChanged { .. })
        ));
        assert_eq!(
            check_copy_record(
                &record,
                "dst",
                "k2",
                "obs://src/k1",
                &object(10, "Tue, 02 Jan 2024 00:00:00 +0000")
            ),
            Err(StaleReason::LastModifiedChanged)
        );
    }

    #[test]
    fn download_record_needs_full_size_placeholder() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("out.bin");
        let record = DownloadRecord {
            bucket_name: "b".into(),
            object_key: "k".into(),
            version_id: None,
            download_file: file.clone(),
            object_status: object(8, STAMP),
            part_size: 4,
            parts: plan_parts(8, 4).unwrap(),
        };
        let live = object(8, STAMP);

        assert_eq!(
            check_download_record(&record, "b", "k", None, &file, &live),
            Err(StaleReason::TmpFileMissing)
        );

        let tmp = download_tmp_path(&file);
        std::fs::write(&tmp, b"1234").unwrap();
        assert_eq!(
            check_download_record(&record, "b", "k", None, &file, &live),
            Err(StaleReason::TmpFileSize {
                expected: 8,
                actual: 4
            })
        );

        std::fs::write(&tmp, b"12345678").unwrap();
        assert_eq!(
            check_download_record(&record, "b", "k", None, &file, &live),
            Ok(())
        );
        assert_eq!(
            check_download_record(&record, "b", "k", Some("v2"), &file, &live),
            Err(StaleReason::Identity)
        );
        assert!(matches!(
            check_download_record(&record, "b", "k", None, &file, &object(9, STAMP)),
            Err(StaleReason::SizeChanged { .. })
        ));
    }
}
