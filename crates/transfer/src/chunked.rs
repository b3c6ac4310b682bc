use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};

use crate::DOWNLOAD_TMP_SUFFIX;
use crate::part::Part;

// ---------------------------------------------------------------------------
// Reading parts of a local file
// ---------------------------------------------------------------------------

/// Opens `path` positioned at the part's offset, limited to its length.
pub fn open_part_reader(path: &Path, part: &Part) -> io::Result<Take<File>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(part.offset))?;
    Ok(file.take(part.length))
}

// ---------------------------------------------------------------------------
// Writing parts into a download placeholder
// ---------------------------------------------------------------------------

/// Temporary file a download is written to before the final rename.
pub fn download_tmp_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(DOWNLOAD_TMP_SUFFIX);
    PathBuf::from(name)
}

/// Creates (or truncates) `path` as a sparse file of `size` bytes.
///
/// Parts are later written into it at their own offsets.
pub fn create_placeholder(path: &Path, size: u64) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    file.set_len(size)?;
    Ok(())
}

/// Copies one part from `body` into `path` at the part's offset.
///
/// Fails with `UnexpectedEof` if the body ends before the part's length.
pub fn write_part(path: &Path, part: &Part, body: &mut dyn Read) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(part.offset))?;

    let written = io::copy(&mut body.take(part.length), &mut file)?;
    if written != part.length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "part {} received {written} of {} bytes",
                part.part_number, part.length
            ),
        ));
    }
    file.flush()?;
    Ok(())
}
