use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use obsctl_transfer::{
    ByteRange, CompletedPart, ObjectMeta, ObjectStore, PartTarget, StoreError, StoreResponse,
    MAX_PART_COUNT,
};

use crate::keys::{validate_bucket_name, validate_object_key};
use crate::session::{HashingWriter, ObjectSidecar, SessionDir, SessionInfo};
use crate::{META_DIR, MULTIPART_DIR};

type StoreResult<T> = Result<StoreResponse<T>, StoreError>;

/// [`ObjectStore`] over a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

fn no_such_bucket<T>(bucket: &str) -> StoreResult<T> {
    Ok(StoreResponse::error(
        404,
        "NoSuchBucket",
        format!("bucket {bucket} does not exist"),
    ))
}

fn no_such_key<T>(key: &str) -> StoreResult<T> {
    Ok(StoreResponse::error(
        404,
        "NoSuchKey",
        format!("object {key} does not exist"),
    ))
}

fn no_such_upload<T>(upload_id: &str) -> StoreResult<T> {
    Ok(StoreResponse::error(
        404,
        "NoSuchUpload",
        format!("upload {upload_id} does not exist"),
    ))
}

fn bad_request<T>(code: &str, message: impl Into<String>) -> StoreResult<T> {
    Ok(StoreResponse::error(400, code, message))
}

fn invalid_range<T>(range: ByteRange, size: u64) -> StoreResult<T> {
    Ok(StoreResponse::error(
        416,
        "InvalidRange",
        format!("{range} is not satisfiable for {size} bytes"),
    ))
}

fn rfc2822(time: std::time::SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc2822()
}

impl LocalStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a bucket directory. Existing buckets are left alone.
    pub fn create_bucket(&self, bucket: &str) -> io::Result<()> {
        validate_bucket_name(bucket)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        std::fs::create_dir_all(self.root.join(bucket))?;
        info!(bucket, "bucket created");
        Ok(())
    }

    fn bucket_dir(&self, bucket: &str) -> Option<PathBuf> {
        validate_bucket_name(bucket).ok()?;
        let dir = self.root.join(bucket);
        dir.is_dir().then_some(dir)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn sidecar_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root
            .join(META_DIR)
            .join(bucket)
            .join(format!("{key}.json"))
    }

    fn session(&self, upload_id: &str) -> Option<SessionDir> {
        // Upload ids are uuids; anything else cannot name a session.
        if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return None;
        }
        let session = SessionDir::new(self.root.join(MULTIPART_DIR).join(upload_id));
        session.exists().then_some(session)
    }

    fn read_sidecar(&self, bucket: &str, key: &str) -> Option<ObjectSidecar> {
        let bytes = std::fs::read(self.sidecar_path(bucket, key)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Resolves an existing object file, or the error response to return.
    fn existing_object<T>(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(PathBuf, std::fs::Metadata), StoreResult<T>> {
        if self.bucket_dir(bucket).is_none() {
            return Err(no_such_bucket(bucket));
        }
        if validate_object_key(key).is_err() {
            return Err(no_such_key(key));
        }
        if let Some(version) = version_id {
            if version != "null" {
                return Err(Ok(StoreResponse::error(
                    404,
                    "NoSuchVersion",
                    format!("version {version} does not exist"),
                )));
            }
        }
        let path = self.object_path(bucket, key);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok((path, meta)),
            Ok(_) => Err(no_such_key(key)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(no_such_key(key)),
            Err(e) => Err(Err(e.into())),
        }
    }

    fn compute_etag(path: &Path) -> io::Result<String> {
        let mut file = File::open(path)?;
        let mut writer = HashingWriter::new(io::sink());
        io::copy(&mut file, &mut writer)?;
        writer.finish()
    }

    fn check_part_number(part_number: u32) -> bool {
        part_number >= 1 && u64::from(part_number) <= MAX_PART_COUNT
    }
}

impl ObjectStore for LocalStore {
    fn head_bucket(&self, bucket: &str) -> StoreResult<()> {
        match self.bucket_dir(bucket) {
            Some(_) => Ok(StoreResponse::ok(())),
            None => no_such_bucket(bucket),
        }
    }

    fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &BTreeMap<String, String>,
    ) -> StoreResult<String> {
        if self.bucket_dir(bucket).is_none() {
            return no_such_bucket(bucket);
        }
        if let Err(e) = validate_object_key(key) {
            return bad_request("InvalidKey", e.to_string());
        }

        let upload_id = uuid::Uuid::new_v4().to_string();
        let session = SessionDir::new(self.root.join(MULTIPART_DIR).join(&upload_id));
        session.create(&SessionInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            metadata: metadata.clone(),
            initiated: Utc::now().to_rfc2822(),
        })?;
        debug!(bucket, key, upload_id = %upload_id, "multipart session opened");
        Ok(StoreResponse::ok(upload_id))
    }

    fn upload_part(
        &self,
        target: &PartTarget<'_>,
        body: &mut dyn Read,
        length: u64,
    ) -> StoreResult<String> {
        let Some(session) = self.session(target.upload_id) else {
            return no_such_upload(target.upload_id);
        };
        if !Self::check_part_number(target.part_number) {
            return bad_request("InvalidArgument", "part number out of range");
        }
        match session.write_part(target.part_number, body, length)? {
            Some(etag) => Ok(StoreResponse::ok(etag)),
            None => bad_request("IncompleteBody", "request body ended early"),
        }
    }

    fn copy_part(
        &self,
        target: &PartTarget<'_>,
        source_bucket: &str,
        source_key: &str,
        range: ByteRange,
    ) -> StoreResult<String> {
        let Some(session) = self.session(target.upload_id) else {
            return no_such_upload(target.upload_id);
        };
        if !Self::check_part_number(target.part_number) {
            return bad_request("InvalidArgument", "part number out of range");
        }
        let (path, meta) = match self.existing_object(source_bucket, source_key, None) {
            Ok(found) => found,
            Err(response) => return response,
        };
        if range.is_empty() || range.end >= meta.len() {
            return invalid_range(range, meta.len());
        }

        let mut source = File::open(&path)?;
        source.seek(SeekFrom::Start(range.start))?;
        match session.write_part(target.part_number, &mut source, range.len())? {
            Some(etag) => Ok(StoreResponse::ok(etag)),
            None => bad_request("InvalidRange", "source changed during copy"),
        }
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<String> {
        let Some(session) = self.session(upload_id) else {
            return no_such_upload(upload_id);
        };
        let info = session.info()?;
        if info.bucket != bucket || info.key != key {
            return bad_request("InvalidRequest", "upload belongs to another object");
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return bad_request("InvalidPartOrder", "parts must be in ascending order");
        }
        for part in parts {
            match session.part_etag(part.part_number)? {
                Some(etag) if etag == part.etag => {}
                _ => {
                    return bad_request(
                        "InvalidPart",
                        format!("part {} was not uploaded or its etag differs", part.part_number),
                    );
                }
            }
        }

        let staging = session.path().join("object.tmp");
        let mut writer = HashingWriter::new(File::create(&staging)?);
        let mut digests = Vec::with_capacity(parts.len() * 16);
        for part in parts {
            let part_path = session.part_path(part.part_number);
            let mut hasher = HashingWriter::new(&mut writer);
            io::copy(&mut File::open(&part_path)?, &mut hasher)?;
            digests.extend(hasher.finish_raw()?);
        }
        let whole = writer.finish()?;

        let etag = if parts.len() <= 1 {
            whole
        } else {
            let mut combined = HashingWriter::new(io::sink());
            io::Write::write_all(&mut combined, &digests)?;
            let combined = combined.finish_raw()?;
            format!("\"{}-{}\"", hex::encode(combined), parts.len())
        };

        let object = self.object_path(bucket, key);
        if let Some(parent) = object.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&staging, &object)?;

        let sidecar = self.sidecar_path(bucket, key);
        if let Some(parent) = sidecar.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let meta = ObjectSidecar {
            etag: etag.clone(),
            metadata: info.metadata,
        };
        std::fs::write(&sidecar, serde_json::to_vec(&meta).map_err(io::Error::from)?)?;
        session.remove()?;

        info!(bucket, key, upload_id, parts = parts.len(), "multipart upload completed");
        Ok(StoreResponse::ok(etag))
    }

    fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> StoreResult<()> {
        let Some(session) = self.session(upload_id) else {
            return no_such_upload(upload_id);
        };
        session.remove()?;
        debug!(upload_id, "multipart session aborted");
        Ok(StoreResponse {
            status: 204,
            body: Some(()),
            error_code: String::new(),
            error_message: String::new(),
        })
    }

    fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StoreResult<ObjectMeta> {
        let (path, meta) = match self.existing_object(bucket, key, version_id) {
            Ok(found) => found,
            Err(response) => return response,
        };
        let sidecar = self.read_sidecar(bucket, key);
        let (etag, metadata) = match sidecar {
            Some(sidecar) => (sidecar.etag, sidecar.metadata),
            None => (Self::compute_etag(&path)?, BTreeMap::new()),
        };
        Ok(StoreResponse::ok(ObjectMeta {
            size: meta.len(),
            last_modified: rfc2822(meta.modified()?),
            etag,
            version_id: None,
            metadata,
        }))
    }

    fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        range: ByteRange,
    ) -> StoreResult<Box<dyn Read + Send>> {
        let (path, meta) = match self.existing_object(bucket, key, version_id) {
            Ok(found) => found,
            Err(response) => return response,
        };
        if range.is_empty() || range.end >= meta.len() {
            return invalid_range(range, meta.len());
        }
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(range.start))?;
        Ok(StoreResponse {
            status: 206,
            body: Some(Box::new(file.take(range.len()))),
            error_code: String::new(),
            error_message: String::new(),
        })
    }
}
