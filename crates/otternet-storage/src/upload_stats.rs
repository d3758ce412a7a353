//! Running total of bytes served to other peers.
//!
//! Stored as a single decimal number in a text file so the dashboard
//! that reads it does not need to understand any other format.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use otternet_types::{OtternetError, Result};

use crate::atomic::{read_optional, write_atomic};

/// Default file name, relative to the node's data directory.
pub const DEFAULT_FILE_NAME: &str = "bytes_uploaded.txt";

/// Persisted bytes-uploaded counter.
#[derive(Debug)]
pub struct UploadCounter {
    path: PathBuf,
    total: Mutex<u64>,
}

impl UploadCounter {
    /// Opens the counter at `path`. A missing or empty file starts at 0.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::StorageError` if the file cannot be read
    /// or does not contain a non-negative integer.
    pub fn open(path: &Path) -> Result<Self> {
        let total = match read_optional(path)? {
            Some(text) if !text.trim().is_empty() => {
                text.trim().parse::<u64>().map_err(|e| OtternetError::StorageError {
                    reason: format!("invalid upload counter in {}: {e}", path.display()),
                })?
            }
            _ => 0,
        };

        Ok(Self {
            path: path.to_path_buf(),
            total: Mutex::new(total),
        })
    }

    /// Adds `bytes` to the total and persists it. Returns the new total.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::StorageError` if persisting fails; the
    /// in-memory total is not advanced in that case.
    pub fn add(&self, bytes: u64) -> Result<u64> {
        let mut total = self.total.lock().map_err(|_| OtternetError::StorageError {
            reason: "upload counter lock poisoned".into(),
        })?;

        let next = total.saturating_add(bytes);
        write_atomic(&self.path, next.to_string().as_bytes())?;
        *total = next;
        Ok(next)
    }

    /// Current total.
    pub fn total(&self) -> u64 {
        self.total.lock().map(|t| *t).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_FILE_NAME);

        let counter = UploadCounter::open(&path).unwrap();
        assert_eq!(counter.total(), 0);
        counter.add(100).unwrap();
        assert_eq!(counter.add(23).unwrap(), 123);

        let reopened = UploadCounter::open(&path).unwrap();
        assert_eq!(reopened.total(), 123);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "123");
    }

    #[test]
    fn garbage_counter_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_FILE_NAME);
        std::fs::write(&path, "lots").unwrap();
        assert!(UploadCounter::open(&path).is_err());
    }
}
