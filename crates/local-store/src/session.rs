use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Persisted description of one multipart session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionInfo {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub initiated: String,
}

/// Metadata kept beside a completed object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectSidecar {
    pub etag: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Staging directory of one multipart session.
pub(crate) struct SessionDir {
    dir: PathBuf,
}

const SESSION_FILE: &str = "session.json";

impl SessionDir {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(SESSION_FILE).is_file()
    }

    pub fn create(&self, info: &SessionInfo) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.dir.join(SESSION_FILE), serde_json::to_vec(info)?)
    }

    pub fn info(&self) -> io::Result<SessionInfo> {
        let bytes = std::fs::read(self.dir.join(SESSION_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn part_path(&self, part_number: u32) -> PathBuf {
        self.dir.join(format!("{part_number:05}.part"))
    }

    fn etag_path(&self, part_number: u32) -> PathBuf {
        self.dir.join(format!("{part_number:05}.etag"))
    }

    /// Streams exactly `length` bytes of `body` into the part's file.
    ///
    /// Returns the quoted MD5 etag, or `None` if the body was short. A part
    /// uploaded again replaces the previous one.
    pub fn write_part(
        &self,
        part_number: u32,
        body: &mut dyn Read,
        length: u64,
    ) -> io::Result<Option<String>> {
        let tmp = self.dir.join(format!("{part_number:05}.part.tmp"));
        let mut writer = HashingWriter::new(File::create(&tmp)?);
        let written = io::copy(&mut body.take(length), &mut writer)?;
        if written != length {
            drop(writer);
            std::fs::remove_file(&tmp)?;
            return Ok(None);
        }
        let etag = writer.finish()?;
        std::fs::rename(&tmp, self.part_path(part_number))?;
        std::fs::write(self.etag_path(part_number), &etag)?;
        Ok(Some(etag))
    }

    /// Etag recorded for an uploaded part.
    pub fn part_etag(&self, part_number: u32) -> io::Result<Option<String>> {
        match std::fs::read_to_string(self.etag_path(part_number)) {
            Ok(etag) => Ok(Some(etag)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn remove(&self) -> io::Result<()> {
        std::fs::remove_dir_all(&self.dir)
    }
}

/// Writer that hashes everything passing through it.
pub(crate) struct HashingWriter<W> {
    inner: W,
    hasher: Md5,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
        }
    }

    /// Flushes and returns the raw MD5 digest.
    pub fn finish_raw(mut self) -> io::Result<Vec<u8>> {
        self.inner.flush()?;
        Ok(self.hasher.finalize().to_vec())
    }

    /// Flushes and returns the quoted hex etag.
    pub fn finish(self) -> io::Result<String> {
        Ok(format!("\"{}\"", hex::encode(self.finish_raw()?)))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
