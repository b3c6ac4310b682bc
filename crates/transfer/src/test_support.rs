//! In-memory object store for operation tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use md5::{Digest, Md5};

use crate::etag::md5_hex;
use crate::lock;
use crate::store::{
    ByteRange, CompletedPart, ObjectMeta, ObjectStore, PartTarget, StoreError, StoreResponse,
};

/// A call observed by [`MockStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    HeadBucket(String),
    Initiate(String),
    UploadPart(u32),
    CopyPart(u32),
    Complete(Vec<u32>),
    Abort(String),
    GetMetadata(String),
    GetRange(u64),
}

/// An injected failure for one attempt.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Status(u16),
    Transport,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    last_modified: String,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Session {
    bucket: String,
    key: String,
    metadata: BTreeMap<String, String>,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), StoredObject>,
    sessions: HashMap<String, Session>,
    next_id: u64,
    stamp: u64,
    calls: Vec<Call>,
    /// Faults keyed by part number (upload/copy) or range start (download).
    faults: HashMap<u64, VecDeque<Fault>>,
    complete_fault: Option<Fault>,
}

/// Scripted, thread-safe [`ObjectStore`] double.
#[derive(Default)]
pub struct MockStore {
    inner: Mutex<Inner>,
    part_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    hook: Option<Box<dyn Fn(u32) + Send + Sync>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, bucket: &str) -> Self {
        lock(&self.inner).buckets.insert(bucket.to_string());
        self
    }

    /// Makes every part call sleep, so parts overlap.
    pub fn with_part_delay(mut self, delay: Duration) -> Self {
        self.part_delay = Some(delay);
        self
    }

    /// Runs `hook` with the part number before each upload/copy part call.
    pub fn with_part_hook(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn put_object(&self, bucket: &str, key: &str, data: &[u8]) {
        let mut inner = lock(&self.inner);
        inner.buckets.insert(bucket.to_string());
        inner.stamp += 1;
        let object = StoredObject {
            data: data.to_vec(),
            etag: format!("\"{}\"", md5_hex(data)),
            last_modified: format!("stamp-{}", inner.stamp),
            metadata: BTreeMap::new(),
        };
        inner
            .objects
            .insert((bucket.to_string(), key.to_string()), object);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.inner)
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Opens a session directly, as a previous run would have.
    pub fn open_session(&self, bucket: &str, key: &str) -> String {
        let mut inner = lock(&self.inner);
        Self::new_session(&mut inner, bucket, key, BTreeMap::new())
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner).sessions.len()
    }

    /// Queues faults for successive attempts at part `number`.
    pub fn fail_part(&self, number: u32, faults: &[Fault]) {
        self.fail_at(number as u64, faults);
    }

    /// Queues faults for successive ranged gets starting at `offset`.
    pub fn fail_range(&self, offset: u64, faults: &[Fault]) {
        self.fail_at(offset, faults);
    }

    pub fn fail_complete(&self, fault: Fault) {
        lock(&self.inner).complete_fault = Some(fault);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.inner).calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        lock(&self.inner).calls.iter().filter(|c| matches(c)).count()
    }

    /// Part numbers of upload/copy part calls, in call order.
    pub fn part_calls(&self) -> Vec<u32> {
        lock(&self.inner)
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::UploadPart(n) | Call::CopyPart(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn fail_at(&self, slot: u64, faults: &[Fault]) {
        lock(&self.inner)
            .faults
            .entry(slot)
            .or_default()
            .extend(faults.iter().copied());
    }

    fn new_session(
        inner: &mut Inner,
        bucket: &str,
        key: &str,
        metadata: BTreeMap<String, String>,
    ) -> String {
        inner.next_id += 1;
        let id = format!("upload-{}", inner.next_id);
        inner.sessions.insert(
            id.clone(),
            Session {
                bucket: bucket.to_string(),
                key: key.to_string(),
                metadata,
                parts: BTreeMap::new(),
            },
        );
        id
    }

    fn record(&self, call: Call) -> Option<Fault> {
        let mut inner = lock(&self.inner);
        let slot = match &call {
            Call::UploadPart(n) | Call::CopyPart(n) => Some(*n as u64),
            Call::GetRange(start) => Some(*start),
            _ => None,
        };
        inner.calls.push(call);
        slot.and_then(|slot| inner.faults.get_mut(&slot).and_then(|q| q.pop_front()))
    }

    /// Brackets a part call for concurrency tracking.
    fn enter_part(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.part_delay {
            std::thread::sleep(delay);
        }
    }

    fn leave_part(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn fault_response<T>(fault: Fault) -> Result<StoreResponse<T>, StoreError> {
        match fault {
            Fault::Status(status) => Ok(StoreResponse::error(status, "Injected", "injected fault")),
            Fault::Transport => Err(StoreError::Transport("connection reset".into())),
        }
    }

    fn no_such_upload<T>() -> Result<StoreResponse<T>, StoreError> {
        Ok(StoreResponse::error(404, "NoSuchUpload", "no such upload"))
    }

    fn store_part(&self, target: &PartTarget<'_>, data: Vec<u8>) -> StoreResponse<String> {
        let mut inner = lock(&self.inner);
        let Some(session) = inner.sessions.get_mut(target.upload_id) else {
            return StoreResponse::error(404, "NoSuchUpload", "no such upload");
        };
        let etag = format!("\"{}\"", md5_hex(&data));
        session.parts.insert(target.part_number, data);
        StoreResponse::ok(etag)
    }
}

impl ObjectStore for MockStore {
    fn head_bucket(&self, bucket: &str) -> Result<StoreResponse<()>, StoreError> {
        self.record(Call::HeadBucket(bucket.to_string()));
        if lock(&self.inner).buckets.contains(bucket) {
            Ok(StoreResponse::ok(()))
        } else {
            Ok(StoreResponse::error(404, "NoSuchBucket", "bucket not found"))
        }
    }

    fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<StoreResponse<String>, StoreError> {
        self.record(Call::Initiate(key.to_string()));
        let mut inner = lock(&self.inner);
        if !inner.buckets.contains(bucket) {
            return Ok(StoreResponse::error(404, "NoSuchBucket", "bucket not found"));
        }
        let id = Self::new_session(&mut inner, bucket, key, metadata.clone());
        Ok(StoreResponse::ok(id))
    }

    fn upload_part(
        &self,
        target: &PartTarget<'_>,
        body: &mut dyn Read,
        length: u64,
    ) -> Result<StoreResponse<String>, StoreError> {
        if let Some(hook) = &self.hook {
            hook(target.part_number);
        }
        if let Some(fault) = self.record(Call::UploadPart(target.part_number)) {
            return Self::fault_response(fault);
        }
        self.enter_part();
        let mut data = Vec::new();
        let read = body.read_to_end(&mut data);
        self.leave_part();
        read?;
        if data.len() as u64 != length {
            return Ok(StoreResponse::error(400, "IncompleteBody", "short body"));
        }
        Ok(self.store_part(target, data))
    }

    fn copy_part(
        &self,
        target: &PartTarget<'_>,
        source_bucket: &str,
        source_key: &str,
        range: ByteRange,
    ) -> Result<StoreResponse<String>, StoreError> {
        if let Some(hook) = &self.hook {
            hook(target.part_number);
        }
        if let Some(fault) = self.record(Call::CopyPart(target.part_number)) {
            return Self::fault_response(fault);
        }
        self.enter_part();
        self.leave_part();
        let data = {
            let inner = lock(&self.inner);
            let key = (source_bucket.to_string(), source_key.to_string());
            let Some(source) = inner.objects.get(&key) else {
                return Ok(StoreResponse::error(404, "NoSuchKey", "source not found"));
            };
            if range.end >= source.data.len() as u64 {
                return Ok(StoreResponse::error(416, "InvalidRange", "range out of bounds"));
            }
            source.data[range.start as usize..=range.end as usize].to_vec()
        };
        Ok(self.store_part(target, data))
    }

    fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<StoreResponse<String>, StoreError> {
        self.record(Call::Complete(parts.iter().map(|p| p.part_number).collect()));
        let mut inner = lock(&self.inner);
        if let Some(fault) = inner.complete_fault.take() {
            drop(inner);
            return Self::fault_response(fault);
        }
        let Some(session) = inner.sessions.remove(upload_id) else {
            return Self::no_such_upload();
        };
        if session.bucket != bucket || session.key != key {
            return Ok(StoreResponse::error(400, "InvalidRequest", "session mismatch"));
        }

        let mut data = Vec::new();
        let mut digests = Vec::new();
        for part in parts {
            let Some(bytes) = session.parts.get(&part.part_number) else {
                return Ok(StoreResponse::error(400, "InvalidPart", "missing part"));
            };
            if part.etag != format!("\"{}\"", md5_hex(bytes)) {
                return Ok(StoreResponse::error(400, "InvalidPart", "etag mismatch"));
            }
            digests.extend_from_slice(&Md5::digest(bytes));
            data.extend_from_slice(bytes);
        }
        let etag = if parts.len() == 1 {
            format!("\"{}\"", md5_hex(&data))
        } else {
            format!("\"{}-{}\"", md5_hex(&digests), parts.len())
        };

        inner.stamp += 1;
        let object = StoredObject {
            data,
            etag: etag.clone(),
            last_modified: format!("stamp-{}", inner.stamp),
            metadata: session.metadata,
        };
        inner
            .objects
            .insert((bucket.to_string(), key.to_string()), object);
        Ok(StoreResponse::ok(etag))
    }

    fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<StoreResponse<()>, StoreError> {
        self.record(Call::Abort(upload_id.to_string()));
        match lock(&self.inner).sessions.remove(upload_id) {
            Some(_) => Ok(StoreResponse::ok(())),
            None => Self::no_such_upload(),
        }
    }

    fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
        _version_id: Option<&str>,
    ) -> Result<StoreResponse<ObjectMeta>, StoreError> {
        self.record(Call::GetMetadata(key.to_string()));
        let inner = lock(&self.inner);
        match inner.objects.get(&(bucket.to_string(), key.to_string())) {
            Some(o) => Ok(StoreResponse::ok(ObjectMeta {
                size: o.data.len() as u64,
                last_modified: o.last_modified.clone(),
                etag: o.etag.clone(),
                version_id: None,
                metadata: o.metadata.clone(),
            })),
            None => Ok(StoreResponse::error(404, "NoSuchKey", "object not found")),
        }
    }

    fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        _version_id: Option<&str>,
        range: ByteRange,
    ) -> Result<StoreResponse<Box<dyn Read + Send>>, StoreError> {
        if let Some(fault) = self.record(Call::GetRange(range.start)) {
            return Self::fault_response(fault);
        }
        self.enter_part();
        self.leave_part();
        let inner = lock(&self.inner);
        let Some(object) = inner.objects.get(&(bucket.to_string(), key.to_string())) else {
            return Ok(StoreResponse::error(404, "NoSuchKey", "object not found"));
        };
        if range.end >= object.data.len() as u64 {
            return Ok(StoreResponse::error(416, "InvalidRange", "range out of bounds"));
        }
        let slice = object.data[range.start as usize..=range.end as usize].to_vec();
        Ok(StoreResponse::ok(Box::new(Cursor::new(slice))))
    }
}
