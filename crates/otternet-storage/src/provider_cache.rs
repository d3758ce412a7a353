//! Bounded, persisted cache of known provider peer ids.
//!
//! The cache is an insertion-ordered list of peer-id strings with a
//! parallel `HashSet` for O(1) duplicate detection. It is backed by a
//! newline-delimited file (one peer id per line).
//!
//! # Eviction
//!
//! Strict FIFO. When an append pushes the list past `capacity`, the
//! oldest `pop_amount` entries are dropped (repeatedly, until the list
//! fits). A peer that is appended again while still cached is a
//! duplicate: it keeps its original position and is not refreshed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use otternet_types::{OtternetError, Result};

use crate::atomic::{read_optional, write_atomic};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default maximum number of cached provider ids.
pub const DEFAULT_CAPACITY: usize = 50;

/// Default number of oldest entries dropped per eviction.
pub const DEFAULT_POP_AMOUNT: usize = 5;

/// Default file name, relative to the node's data directory.
pub const DEFAULT_FILE_NAME: &str = "providers.txt";

// ---------------------------------------------------------------------------
// CacheState
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
struct CacheState {
    /// Insertion order; index 0 is the oldest entry.
    order: Vec<String>,
    /// Membership mirror of `order`.
    members: HashSet<String>,
}

impl CacheState {
    fn from_lines(text: &str) -> Self {
        let mut state = Self::default();
        for line in text.lines() {
            let id = line.trim();
            if !id.is_empty() && state.members.insert(id.to_owned()) {
                state.order.push(id.to_owned());
            }
        }
        state
    }

    fn to_lines(&self) -> String {
        let mut out = String::new();
        for id in &self.order {
            out.push_str(id);
            out.push('\n');
        }
        out
    }

    /// Merges `ids`, skipping blanks and duplicates, then evicts.
    /// Returns the number of newly inserted ids.
    fn merge(&mut self, ids: &[String], capacity: usize, pop_amount: usize) -> usize {
        let mut added = 0;
        for id in ids {
            let id = id.trim();
            if id.is_empty() || self.members.contains(id) {
                continue;
            }
            self.members.insert(id.to_owned());
            self.order.push(id.to_owned());
            added += 1;
        }

        while self.order.len() > capacity {
            let n = pop_amount.min(self.order.len());
            for evicted in self.order.drain(..n) {
                self.members.remove(&evicted);
            }
        }

        added
    }
}

// ---------------------------------------------------------------------------
// ProviderCache
// ---------------------------------------------------------------------------

/// Size-bounded, order-preserving, disk-backed list of provider ids.
///
/// Thread-safe: the in-memory state is guarded by its own mutex,
/// independent of any other lock in the node. Each `append` persists
/// the full list with an atomic file replace before the in-memory
/// state is updated, so memory and disk never disagree after a
/// failed write.
#[derive(Debug)]
pub struct ProviderCache {
    path: PathBuf,
    capacity: usize,
    pop_amount: usize,
    state: Mutex<CacheState>,
}

impl ProviderCache {
    /// Opens the cache at `path` with the default bounds
    /// ([`DEFAULT_CAPACITY`], [`DEFAULT_POP_AMOUNT`]).
    ///
    /// # Errors
    ///
    /// See [`ProviderCache::open_with_limits`].
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_limits(path, DEFAULT_CAPACITY, DEFAULT_POP_AMOUNT)
    }

    /// Opens the cache at `path`, loading any persisted entries.
    ///
    /// A missing file yields an empty cache. A persisted file longer
    /// than `capacity` is trimmed with the normal eviction rule on
    /// load.
    ///
    /// # Errors
    ///
    /// - `OtternetError::ConfigError` if `capacity` or `pop_amount` is 0.
    /// - `OtternetError::StorageError` if the file exists but cannot be read.
    pub fn open_with_limits(path: &Path, capacity: usize, pop_amount: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(OtternetError::ConfigError {
                reason: "provider cache capacity must be greater than 0".into(),
            });
        }
        if pop_amount == 0 {
            return Err(OtternetError::ConfigError {
                reason: "provider cache pop amount must be greater than 0".into(),
            });
        }

        let mut state = match read_optional(path)? {
            Some(text) => CacheState::from_lines(&text),
            None => CacheState::default(),
        };
        state.merge(&[], capacity, pop_amount);

        tracing::debug!(
            path = %path.display(),
            entries = state.order.len(),
            "provider cache loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            capacity,
            pop_amount,
            state: Mutex::new(state),
        })
    }

    /// Appends peer ids, preserving order and skipping duplicates,
    /// evicting the oldest entries if the capacity is exceeded, and
    /// persisting the result.
    ///
    /// Returns the number of ids that were newly inserted.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::StorageError` if persisting fails; the
    /// in-memory cache is left unchanged in that case.
    pub fn append(&self, ids: &[String]) -> Result<usize> {
        let mut guard = self.lock()?;

        let mut next = guard.clone();
        let added = next.merge(ids, self.capacity, self.pop_amount);
        if added == 0 {
            return Ok(0);
        }

        write_atomic(&self.path, next.to_lines().as_bytes())?;
        *guard = next;

        tracing::debug!(added, entries = guard.order.len(), "provider cache updated");
        Ok(added)
    }

    /// Returns the cached ids, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::StorageError` if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.order.clone())
    }

    /// Returns `true` if `id` is currently cached.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().map(|s| s.members.contains(id)).unwrap_or(false)
    }

    /// Number of cached ids.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.order.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state.lock().map_err(|_| OtternetError::StorageError {
            reason: "provider cache lock poisoned".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn merge_skips_duplicates_and_blanks() {
        let mut state = CacheState::default();
        let added = state.merge(&ids(&["a", "", "b", "a", "  "]), 10, 1);
        assert_eq!(added, 2);
        assert_eq!(state.order, ids(&["a", "b"]));
    }

    #[test]
    fn merge_evicts_in_batches_until_within_capacity() {
        let mut state = CacheState::default();
        state.merge(&ids(&["1", "2", "3", "4", "5", "6", "7"]), 3, 2);
        // 7 > 3 → drop 2 → 5 > 3 → drop 2 → 3.
        assert_eq!(state.order, ids(&["5", "6", "7"]));
        assert_eq!(state.members.len(), 3);
    }

    #[test]
    fn lines_roundtrip_ignores_blank_lines() {
        let state = CacheState::from_lines("p1\n\np2\r\np1\n");
        assert_eq!(state.order, ids(&["p1", "p2"]));
        assert_eq!(state.to_lines(), "p1\np2\n");
    }

    #[test]
    fn zero_limits_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_FILE_NAME);
        assert!(ProviderCache::open_with_limits(&path, 0, 1).is_err());
        assert!(ProviderCache::open_with_limits(&path, 1, 0).is_err());
    }

    #[test]
    fn appending_only_duplicates_does_not_rewrite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_FILE_NAME);
        let cache = ProviderCache::open(&path).unwrap();

        cache.append(&ids(&["p1"])).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(cache.append(&ids(&["p1"])).unwrap(), 0);
        assert!(!path.exists());
    }
}
