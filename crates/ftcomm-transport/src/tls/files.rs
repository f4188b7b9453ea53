//! Validation of operator-supplied TLS file paths.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use super::TlsError;

/// Validates `path` and returns its canonical form.
///
/// The path must be absolute, must not be a symlink, must name a regular file
/// that canonicalises under `base_dir`, and must not exceed `max_size` bytes.
pub fn validate_file(path: &Path, base_dir: &Path, max_size: u64) -> Result<PathBuf, TlsError> {
    open_validated(path, base_dir, max_size).map(|(canonical, _)| canonical)
}

/// Opens `path` once and runs every check against that handle.
fn open_validated(path: &Path, base_dir: &Path, max_size: u64) -> Result<(PathBuf, File), TlsError> {
    let invalid = |reason: &str| TlsError::InvalidPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let read_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| TlsError::Read { path, source }
    };

    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }
    let file = match OpenOptions::new().read(true).custom_flags(libc::O_NOFOLLOW).open(path) {
        Ok(file) => file,
        Err(err) if err.raw_os_error() == Some(libc::ELOOP) => return Err(invalid("symlinks are not allowed")),
        Err(err) => return Err(read_err(path)(err)),
    };
    let meta = file.metadata().map_err(read_err(path))?;
    if !meta.is_file() {
        return Err(invalid("not a regular file"));
    }
    if meta.len() > max_size {
        return Err(invalid(&format!("file exceeds {max_size} bytes")));
    }

    let canonical = fs::canonicalize(path).map_err(read_err(path))?;
    let base = fs::canonicalize(base_dir).map_err(read_err(base_dir))?;
    if !canonical.starts_with(&base) {
        return Err(invalid("outside the TLS base directory"));
    }
    // The canonical path must still name the file we hold open.
    let resolved = fs::metadata(&canonical).map_err(read_err(&canonical))?;
    if (resolved.dev(), resolved.ino()) != (meta.dev(), meta.ino()) {
        return Err(invalid("file was replaced during validation"));
    }
    Ok((canonical, file))
}

/// Validates then reads `path` through the same handle, at most `max_size` bytes.
pub(crate) fn read_validated(path: &Path, base_dir: &Path, max_size: u64) -> Result<(PathBuf, Vec<u8>), TlsError> {
    let (canonical, file) = open_validated(path, base_dir, max_size)?;
    let mut data = Vec::new();
    file.take(max_size.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|source| TlsError::Read {
            path: canonical.clone(),
            source,
        })?;
    // The file may have grown after the size check.
    if data.len() as u64 > max_size {
        return Err(TlsError::InvalidPath {
            path: canonical,
            reason: format!("file exceeds {max_size} bytes"),
        });
    }
    Ok((canonical, data))
}
