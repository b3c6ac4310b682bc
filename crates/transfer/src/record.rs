use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::part::Part;

/// Which of the three transfer variants a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Upload,
    Download,
    Copy,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Copy => "copy",
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size and modification time of a local file when its checkpoint was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub modified_nanos: u64,
}

impl FileStatus {
    /// Reads the current status of `path`.
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata.modified()?;
        let modified_nanos = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(Self {
            size: metadata.len(),
            modified_nanos,
        })
    }
}

/// Size and last-modified stamp of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    pub size: u64,
    pub last_modified: String,
}

/// ETag returned by the store for one uploaded or copied part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartEtag {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub bucket_name: String,
    pub object_key: String,
    pub upload_file: PathBuf,
    pub upload_id: Option<String>,
    pub file_status: FileStatus,
    pub part_size: u64,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub part_etags: Vec<PartEtag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub bucket_name: String,
    pub object_key: String,
    pub version_id: Option<String>,
    pub download_file: PathBuf,
    pub object_status: ObjectStatus,
    pub part_size: u64,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyRecord {
    pub bucket_name: String,
    pub object_key: String,
    /// Source object as `obs://bucket/key`.
    pub copy_source: String,
    pub upload_id: Option<String>,
    pub source_status: ObjectStatus,
    pub part_size: u64,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub part_etags: Vec<PartEtag>,
}

/// Persisted state of one resumable transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckpointRecord {
    Upload(UploadRecord),
    Download(DownloadRecord),
    Copy(CopyRecord),
}

impl CheckpointRecord {
    pub fn kind(&self) -> TransferKind {
        match self {
            Self::Upload(_) => TransferKind::Upload,
            Self::Download(_) => TransferKind::Download,
            Self::Copy(_) => TransferKind::Copy,
        }
    }

    pub fn parts(&self) -> &[Part] {
        match self {
            Self::Upload(r) => &r.parts,
            Self::Download(r) => &r.parts,
            Self::Copy(r) => &r.parts,
        }
    }

    fn parts_mut(&mut self) -> &mut Vec<Part> {
        match self {
            Self::Upload(r) => &mut r.parts,
            Self::Download(r) => &mut r.parts,
            Self::Copy(r) => &mut r.parts,
        }
    }

    pub fn part_size(&self) -> u64 {
        match self {
            Self::Upload(r) => r.part_size,
            Self::Download(r) => r.part_size,
            Self::Copy(r) => r.part_size,
        }
    }

    /// Multipart session id, for the variants that have one.
    pub fn upload_id(&self) -> Option<&str> {
        match self {
            Self::Upload(r) => r.upload_id.as_deref(),
            Self::Copy(r) => r.upload_id.as_deref(),
            Self::Download(_) => None,
        }
    }

    /// Parts not yet confirmed, in part-number order.
    pub fn outstanding_parts(&self) -> Vec<Part> {
        self.parts()
            .iter()
            .filter(|p| !p.is_completed)
            .cloned()
            .collect()
    }

    /// Sum of the lengths of completed parts.
    pub fn completed_bytes(&self) -> u64 {
        self.parts()
            .iter()
            .filter(|p| p.is_completed)
            .map(|p| p.length)
            .sum()
    }

    /// Marks `part_number` completed and, for upload/copy, records its etag.
    ///
    /// Returns `false` if the part number is not in the plan.
    pub fn mark_completed(&mut self, part_number: u32, etag: Option<&str>) -> bool {
        let Some(part) = self
            .parts_mut()
            .iter_mut()
            .find(|p| p.part_number == part_number)
        else {
            return false;
        };
        part.is_completed = true;

        let etags = match self {
            Self::Upload(r) => Some(&mut r.part_etags),
            Self::Copy(r) => Some(&mut r.part_etags),
            Self::Download(_) => None,
        };
        if let (Some(etags), Some(etag)) = (etags, etag) {
            etags.retain(|e| e.part_number != part_number);
            etags.push(PartEtag {
                part_number,
                etag: etag.to_string(),
            });
        }
        true
    }

    /// Etags recorded so far, keyed by part number.
    pub fn part_etags(&self) -> &[PartEtag] {
        match self {
            Self::Upload(r) => &r.part_etags,
            Self::Copy(r) => &r.part_etags,
            Self::Download(_) => &[],
        }
    }
}
