//! Read access to the metadata of locally hosted files.
//!
//! The exchange protocols only ever *read* the catalog. Upload and
//! delete flows own the writes and live outside the node, so the
//! node talks to them through the [`CatalogStore`] trait.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use otternet_types::{CatalogItem, OtternetError, Result};

use crate::atomic::read_optional;

// ---------------------------------------------------------------------------
// CatalogStore
// ---------------------------------------------------------------------------

/// Source of catalog entries.
///
/// Implementations must be cheap to call per request: handlers ask
/// for a fresh view on every inbound stream.
pub trait CatalogStore: Send + Sync {
    /// All known entries, regardless of owner.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::StorageError` if the backing store
    /// cannot be read.
    fn items(&self) -> Result<Vec<CatalogItem>>;

    /// Entries owned by `wallet_id`, in store order.
    fn owned_by(&self, wallet_id: &str) -> Result<Vec<CatalogItem>> {
        Ok(self
            .items()?
            .into_iter()
            .filter(|item| item.wallet_id == wallet_id)
            .collect())
    }

    /// First entry whose content hash equals `file_hash`.
    fn find_by_hash(&self, file_hash: &str) -> Result<Option<CatalogItem>> {
        Ok(self
            .items()?
            .into_iter()
            .find(|item| item.file_hash == file_hash))
    }
}

// ---------------------------------------------------------------------------
// MemoryCatalog
// ---------------------------------------------------------------------------

/// In-process catalog, for embedding the node and for tests.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    items: RwLock<Vec<CatalogItem>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `item`, replacing any entry with the same content hash.
    pub fn upsert(&self, item: CatalogItem) {
        if let Ok(mut items) = self.items.write() {
            match items.iter_mut().find(|i| i.file_hash == item.file_hash) {
                Some(existing) => *existing = item,
                None => items.push(item),
            }
        }
    }

    /// Removes the entry with `file_hash`. Returns whether one existed.
    pub fn remove(&self, file_hash: &str) -> bool {
        match self.items.write() {
            Ok(mut items) => {
                let before = items.len();
                items.retain(|i| i.file_hash != file_hash);
                items.len() != before
            }
            Err(_) => false,
        }
    }
}

impl CatalogStore for MemoryCatalog {
    fn items(&self) -> Result<Vec<CatalogItem>> {
        self.items
            .read()
            .map(|items| items.clone())
            .map_err(|_| OtternetError::StorageError {
                reason: "catalog lock poisoned".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// JsonCatalog
// ---------------------------------------------------------------------------

/// Catalog backed by a JSON array file maintained by the upload flow.
///
/// The file is re-read on every call so that uploads made by the
/// other process are visible without a restart. A missing or empty
/// file is an empty catalog.
#[derive(Clone, Debug)]
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CatalogStore for JsonCatalog {
    fn items(&self) -> Result<Vec<CatalogItem>> {
        let text = match read_optional(&self.path)? {
            Some(text) if !text.trim().is_empty() => text,
            _ => return Ok(Vec::new()),
        };

        let items: Option<Vec<CatalogItem>> =
            serde_json::from_str(&text).map_err(|e| OtternetError::StorageError {
                reason: format!("invalid catalog file {}: {e}", self.path.display()),
            })?;

        Ok(items.unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn item(wallet: &str, hash: &str) -> CatalogItem {
        CatalogItem {
            wallet_id: wallet.into(),
            src_id: String::new(),
            price: 2.0,
            file_name: format!("{hash}.bin"),
            file_path: String::new(),
            file_size: 10,
            file_type: "application/octet-stream".into(),
            timestamp: String::new(),
            file_hash: hash.into(),
            bundle_mode: false,
        }
    }

    #[test]
    fn memory_catalog_upsert_replaces_same_hash() {
        let catalog = MemoryCatalog::new();
        catalog.upsert(item("w1", "h1"));
        let mut updated = item("w1", "h1");
        updated.price = 9.0;
        catalog.upsert(updated);

        let items = catalog.items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].price, 9.0);
    }

    #[test]
    fn owned_by_filters_on_wallet() {
        let catalog = MemoryCatalog::new();
        catalog.upsert(item("w1", "h1"));
        catalog.upsert(item("w2", "h2"));
        catalog.upsert(item("w1", "h3"));

        let mine = catalog.owned_by("w1").unwrap();
        let hashes: Vec<_> = mine.iter().map(|i| i.file_hash.as_str()).collect();
        assert_eq!(hashes, vec!["h1", "h3"]);
    }

    #[test]
    fn remove_reports_presence() {
        let catalog = MemoryCatalog::new();
        catalog.upsert(item("w1", "h1"));
        assert!(catalog.remove("h1"));
        assert!(!catalog.remove("h1"));
        assert!(catalog.find_by_hash("h1").unwrap().is_none());
    }

    #[test]
    fn json_catalog_missing_empty_and_null_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.json");
        let catalog = JsonCatalog::new(&path);
        assert!(catalog.items().unwrap().is_empty());

        std::fs::write(&path, "").unwrap();
        assert!(catalog.items().unwrap().is_empty());

        std::fs::write(&path, "null").unwrap();
        assert!(catalog.items().unwrap().is_empty());
    }

    #[test]
    fn json_catalog_reads_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.json");
        std::fs::write(
            &path,
            r#"[{"walletID":"w1","fileName":"a","fileHash":"h1","price":1.25}]"#,
        )
        .unwrap();

        let found = JsonCatalog::new(&path).find_by_hash("h1").unwrap().unwrap();
        assert_eq!(found.price, 1.25);
    }

    #[test]
    fn json_catalog_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(JsonCatalog::new(&path).items().is_err());
    }
}
