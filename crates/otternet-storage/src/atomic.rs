//! Crash-safe whole-file writes.
//!
//! Every persisted file in this crate is replaced atomically:
//! write tmp → fsync → rename. A crash at any point leaves either the
//! previous file or the new one on disk, never a truncated mix.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use otternet_types::{OtternetError, Result};

/// Replaces the contents of `path` with `bytes` atomically.
///
/// # Atomic Write Flow
///
/// 1. Create `.{name}.tmp` in the same directory as `path`.
/// 2. Write all bytes and `fsync` the temporary file.
/// 3. Rename the temporary file over `path`.
///
/// If any step fails, the original file is untouched and the
/// temporary file is removed on a best-effort basis.
///
/// # Errors
///
/// Returns `OtternetError::StorageError` on any I/O failure.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = tmp_path(path)?;

    {
        let mut file = fs::File::create(&tmp_path).map_err(|e| OtternetError::StorageError {
            reason: format!("failed to create temp file {}: {e}", tmp_path.display()),
        })?;

        if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(&tmp_path);
            return Err(OtternetError::StorageError {
                reason: format!("failed to write temp file {}: {e}", tmp_path.display()),
            });
        }
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        OtternetError::StorageError {
            reason: format!("failed to rename temp file over {}: {e}", path.display()),
        }
    })
}

/// Reads `path` as UTF-8, returning `None` if the file does not exist.
///
/// # Errors
///
/// Returns `OtternetError::StorageError` if the file exists but
/// cannot be read.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(OtternetError::StorageError {
            reason: format!("failed to read {}: {e}", path.display()),
        }),
    }
}

/// Temporary file path in the same directory as `path`.
///
/// Creates the parent directory if it does not exist yet.
pub(crate) fn tmp_path(path: &Path) -> Result<PathBuf> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if !parent.exists() {
        fs::create_dir_all(&parent).map_err(|e| OtternetError::StorageError {
            reason: format!("failed to create directory {}: {e}", parent.display()),
        })?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| OtternetError::StorageError {
            reason: format!("path {} has no file name", path.display()),
        })?;

    Ok(parent.join(format!(".{file_name}.tmp")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.txt");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(read_optional(&path).unwrap().as_deref(), Some("second"));
        assert!(!dir.path().join(".state.txt.tmp").exists());
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("file");
        write_atomic(&path, b"x").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn tmp_path_is_hidden_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = tmp_path(&dir.path().join("providers.txt")).unwrap();
        assert_eq!(tmp, dir.path().join(".providers.txt.tmp"));
    }
}
