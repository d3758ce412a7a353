//! Per-node session state.
//!
//! [`Session`] bundles everything the protocol handlers need to answer
//! peers: the wallet address, the catalog, the provider cache, the
//! upload counter and the proxy registry. It is shared by `Arc` with
//! every handler task.

use std::path::Path;
use std::sync::Arc;

use libp2p::PeerId;

use otternet_network::handler::ExchangeBackend;
use otternet_storage::catalog::CatalogStore;
use otternet_storage::provider_cache::{self, ProviderCache};
use otternet_storage::upload_stats::{self, UploadCounter};
use otternet_types::{CatalogItem, OtternetError, Result};

use crate::proxy::ProxyRegistry;

/// State of one running node, shared with the protocol handlers.
pub struct Session {
    wallet_address: String,
    catalog: Arc<dyn CatalogStore>,
    provider_cache: ProviderCache,
    uploads: UploadCounter,
    proxy: ProxyRegistry,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("wallet_address", &self.wallet_address)
            .field("provider_cache", &self.provider_cache.path())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        wallet_address: impl Into<String>,
        catalog: Arc<dyn CatalogStore>,
        provider_cache: ProviderCache,
        uploads: UploadCounter,
    ) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            catalog,
            provider_cache,
            uploads,
            proxy: ProxyRegistry::new(),
        }
    }

    /// Opens the provider cache and upload counter under `data_dir`
    /// with their default file names, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::StorageError` if the directory cannot be
    /// created or either file exists but cannot be read.
    pub fn open(
        data_dir: &Path,
        wallet_address: impl Into<String>,
        catalog: Arc<dyn CatalogStore>,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| OtternetError::StorageError {
            reason: format!("failed to create data dir {}: {e}", data_dir.display()),
        })?;
        let provider_cache = ProviderCache::open(&data_dir.join(provider_cache::DEFAULT_FILE_NAME))?;
        let uploads = UploadCounter::open(&data_dir.join(upload_stats::DEFAULT_FILE_NAME))?;
        Ok(Self::new(wallet_address, catalog, provider_cache, uploads))
    }

    pub fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    pub fn catalog_store(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn proxy(&self) -> &ProxyRegistry {
        &self.proxy
    }

    pub fn provider_cache(&self) -> &ProviderCache {
        &self.provider_cache
    }

    /// Appends provider ids to the cache. Returns how many were new.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::StorageError` if persisting fails.
    pub fn append_providers(&self, ids: &[String]) -> Result<usize> {
        self.provider_cache.append(ids)
    }

    /// Ordered snapshot of the provider cache.
    pub fn providers(&self) -> Result<Vec<String>> {
        self.provider_cache.snapshot()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.uploads.total()
    }
}

impl ExchangeBackend for Session {
    fn wallet_address(&self) -> String {
        self.wallet_address.clone()
    }

    fn catalog(&self) -> Result<Vec<CatalogItem>> {
        self.catalog.owned_by(&self.wallet_address)
    }

    fn lookup(&self, file_hash: &str) -> Result<Option<CatalogItem>> {
        self.catalog.find_by_hash(file_hash)
    }

    fn record_upload(&self, bytes: u64) -> Result<()> {
        let total = self.uploads.add(bytes)?;
        tracing::debug!(bytes, total, "upload recorded");
        Ok(())
    }

    fn authorize_client(&self, client_addr: &str) {
        self.proxy.authorize(client_addr);
    }

    fn deauthorize_client(&self, client_addr: &str) {
        if !self.proxy.deauthorize(client_addr) {
            tracing::debug!(%client_addr, "disconnect for client that was not authorized");
        }
    }

    fn known_peers_received(&self, from: &PeerId, peers: &[PeerId]) {
        let ids: Vec<String> = peers.iter().map(PeerId::to_string).collect();
        match self.append_providers(&ids) {
            Ok(added) => tracing::debug!(%from, added, "known peers cached"),
            Err(e) => tracing::warn!(%from, %e, "failed to cache known peers"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use otternet_storage::catalog::MemoryCatalog;
    use tempfile::TempDir;

    use super::*;

    fn item(wallet: &str, hash: &str) -> CatalogItem {
        CatalogItem {
            wallet_id: wallet.into(),
            src_id: String::new(),
            price: 1.0,
            file_name: format!("{hash}.txt"),
            file_path: String::new(),
            file_size: 3,
            file_type: "text/plain".into(),
            timestamp: String::new(),
            file_hash: hash.into(),
            bundle_mode: false,
        }
    }

    fn session(dir: &TempDir) -> (Session, Arc<MemoryCatalog>) {
        let catalog = Arc::new(MemoryCatalog::new());
        let session = Session::open(dir.path(), "mine", catalog.clone()).unwrap();
        (session, catalog)
    }

    #[test]
    fn catalog_is_filtered_by_wallet() {
        let dir = TempDir::new().unwrap();
        let (session, catalog) = session(&dir);
        catalog.upsert(item("mine", "a"));
        catalog.upsert(item("theirs", "b"));

        let owned = ExchangeBackend::catalog(&session).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].file_hash, "a");
        assert!(session.lookup("b").unwrap().is_some());
    }

    #[test]
    fn uploads_persist_across_sessions() {
        let dir = TempDir::new().unwrap();
        {
            let (session, _) = session(&dir);
            session.record_upload(10).unwrap();
            session.record_upload(5).unwrap();
            assert_eq!(session.bytes_uploaded(), 15);
        }
        let (session, _) = session(&dir);
        assert_eq!(session.bytes_uploaded(), 15);
    }

    #[test]
    fn known_peers_land_in_provider_cache() {
        let dir = TempDir::new().unwrap();
        let (session, _) = session(&dir);
        let from = PeerId::random();
        let p1 = PeerId::random();
        let p2 = PeerId::random();

        session.known_peers_received(&from, &[p1, p2]);
        session.known_peers_received(&from, &[p1]);

        assert_eq!(session.providers().unwrap(), vec![p1.to_string(), p2.to_string()]);
        let text = std::fs::read_to_string(dir.path().join("providers.txt")).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn proxy_requests_go_to_registry() {
        let dir = TempDir::new().unwrap();
        let (session, _) = session(&dir);
        session.authorize_client("8.8.8.8:1234");
        assert!(session.proxy().is_authorized("8.8.8.8:1"));
        session.deauthorize_client("8.8.8.8:1234");
        assert!(!session.proxy().is_authorized("8.8.8.8:1"));
    }
}
