//! Integration tests for the provider cache.
//!
//! Each test gets its own temporary directory; nothing touches the
//! working directory.

use std::path::PathBuf;
use std::sync::Arc;

use otternet_storage::provider_cache::{ProviderCache, DEFAULT_CAPACITY, DEFAULT_FILE_NAME};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_owned()).collect()
}

fn cache_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join(DEFAULT_FILE_NAME)
}

// ---------------------------------------------------------------------------
// Ordering and dedup
// ---------------------------------------------------------------------------

#[test]
fn fifo_eviction_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ProviderCache::open_with_limits(&cache_path(&dir), 3, 1).unwrap();

    cache.append(&ids(&["p1", "p2", "p3"])).unwrap();
    assert_eq!(cache.snapshot().unwrap(), ids(&["p1", "p2", "p3"]));

    cache.append(&ids(&["p4"])).unwrap();
    assert_eq!(cache.snapshot().unwrap(), ids(&["p2", "p3", "p4"]));
}

#[test]
fn duplicate_append_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ProviderCache::open(&cache_path(&dir)).unwrap();

    cache.append(&ids(&["p1"])).unwrap();
    cache.append(&ids(&["p1"])).unwrap();
    cache.append(&ids(&["p1", "p1"])).unwrap();

    assert_eq!(cache.snapshot().unwrap(), ids(&["p1"]));
}

#[test]
fn reappearing_peer_keeps_original_position() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ProviderCache::open_with_limits(&cache_path(&dir), 3, 1).unwrap();

    cache.append(&ids(&["p1", "p2", "p3"])).unwrap();
    // p1 is already cached: not moved to the back.
    cache.append(&ids(&["p1", "p4"])).unwrap();

    assert_eq!(cache.snapshot().unwrap(), ids(&["p2", "p3", "p4"]));
    assert!(!cache.contains("p1"));
}

#[test]
fn never_exceeds_capacity_and_survivors_keep_order() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ProviderCache::open(&cache_path(&dir)).unwrap();

    for batch in 0..20 {
        let fresh: Vec<String> = (0..7).map(|i| format!("peer-{batch}-{i}")).collect();
        let before = cache.snapshot().unwrap();
        cache.append(&fresh).unwrap();
        let after = cache.snapshot().unwrap();

        assert!(after.len() <= DEFAULT_CAPACITY);

        // Survivors from `before` appear in the same relative order,
        // and form a suffix of `before` (oldest were dropped).
        let survivors: Vec<&String> = after.iter().filter(|id| before.contains(id)).collect();
        let expected_suffix = &before[before.len() - survivors.len()..];
        assert_eq!(survivors, expected_suffix.iter().collect::<Vec<_>>());
    }
    assert_eq!(cache.len(), 50);
}

#[test]
fn eviction_removes_exactly_pop_amount() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ProviderCache::open(&cache_path(&dir)).unwrap();

    let fill: Vec<String> = (0..DEFAULT_CAPACITY).map(|i| format!("p{i}")).collect();
    cache.append(&fill).unwrap();
    assert_eq!(cache.len(), DEFAULT_CAPACITY);

    cache.append(&ids(&["overflow"])).unwrap();
    let snapshot = cache.snapshot().unwrap();
    // 51 entries → drop the 5 oldest → 46 left.
    assert_eq!(snapshot.len(), DEFAULT_CAPACITY + 1 - 5);
    assert_eq!(snapshot.first().map(String::as_str), Some("p5"));
    assert_eq!(snapshot.last().map(String::as_str), Some("overflow"));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn persisted_file_is_line_delimited_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = cache_path(&dir);

    {
        let cache = ProviderCache::open(&path).unwrap();
        cache.append(&ids(&["a", "b", "c"])).unwrap();
    }

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\nc\n");

    let reopened = ProviderCache::open(&path).unwrap();
    assert_eq!(reopened.snapshot().unwrap(), ids(&["a", "b", "c"]));
}

#[test]
fn missing_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ProviderCache::open(&cache_path(&dir)).unwrap();
    assert!(cache.is_empty());
}

#[test]
fn leftover_temp_file_does_not_corrupt_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = cache_path(&dir);

    {
        let cache = ProviderCache::open(&path).unwrap();
        cache.append(&ids(&["a", "b"])).unwrap();
    }

    // Simulate a crash between temp-file write and rename.
    std::fs::write(dir.path().join(format!(".{DEFAULT_FILE_NAME}.tmp")), "half").unwrap();

    let reopened = ProviderCache::open(&path).unwrap();
    assert_eq!(reopened.snapshot().unwrap(), ids(&["a", "b"]));

    // The next append overwrites the stale temp file cleanly.
    reopened.append(&ids(&["c"])).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\nc\n");
}

#[test]
fn failed_persist_leaves_memory_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sub").join(DEFAULT_FILE_NAME);
    let cache = ProviderCache::open_with_limits(&path, 3, 1).unwrap();

    // A regular file where the parent directory should be.
    std::fs::write(dir.path().join("sub"), "not a directory").unwrap();

    assert!(cache.append(&ids(&["z"])).is_err());
    assert!(cache.is_empty());
    assert!(!cache.contains("z"));
}

#[test]
fn concurrent_appends_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ProviderCache::open_with_limits(&cache_path(&dir), 1000, 5).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..10 {
                    cache.append(&[format!("t{t}-{i}"), "shared".to_owned()]).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let snapshot = cache.snapshot().unwrap();
    assert_eq!(snapshot.len(), 81);
    assert_eq!(snapshot.iter().filter(|id| *id == "shared").count(), 1);

    let reopened = ProviderCache::open_with_limits(&cache_path(&dir), 1000, 5).unwrap();
    assert_eq!(reopened.snapshot().unwrap(), snapshot);
}
