use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::TransferError;
use crate::chunked::open_part_reader;
use crate::part::plan_parts;

/// Hex MD5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn md5_of(reader: &mut dyn Read) -> std::io::Result<Vec<u8>> {
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// ETag the store reports for `path` uploaded in parts of `part_size`.
///
/// A single part gives the quoted MD5 of the content; more parts give the
/// MD5 of the concatenated part digests followed by `-<count>`.
pub fn multipart_etag(path: &Path, part_size: u64) -> Result<String, TransferError> {
    let local = |source| TransferError::LocalFile {
        path: path.to_path_buf(),
        source,
    };
    let size = std::fs::metadata(path).map_err(local)?.len();
    let parts = plan_parts(size, part_size)?;

    if parts.len() <= 1 {
        let mut file = std::fs::File::open(path).map_err(local)?;
        let digest = md5_of(&mut file).map_err(local)?;
        return Ok(format!("\"{}\"", hex::encode(digest)));
    }

    let mut digests = Vec::with_capacity(parts.len() * 16);
    for part in &parts {
        let mut reader = open_part_reader(path, part).map_err(local)?;
        digests.extend_from_slice(&md5_of(&mut reader).map_err(local)?);
    }
    Ok(format!("\"{}-{}\"", md5_hex(&digests), parts.len()))
}
