//! Single-instance node coordinator.
//!
//! A process runs at most one Otternet node. [`Coordinator`] owns it
//! behind an async mutex so collaborators can start and stop the node
//! from any task without racing each other.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use otternet_network::config::NetworkConfig;
use otternet_network::handle::NetworkHandle;
use otternet_storage::catalog::CatalogStore;
use otternet_types::{OtternetError, Result};

use crate::node::Node;
use crate::session::Session;

struct RunningNode {
    node: Node,
    wallet_address: String,
}

/// Owns the process's one running node.
///
/// The mutex is only held to inspect or swap the slot; a node being
/// started is tracked by `starting` so readers never wait on bootstrap.
#[derive(Default)]
pub struct Coordinator {
    inner: Mutex<Option<RunningNode>>,
    starting: AtomicBool,
}

/// Clears the `starting` flag when a start attempt ends, including when
/// its future is dropped.
struct StartGuard<'a>(&'a AtomicBool);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates, starts and bootstraps the node.
    ///
    /// The session keeps its provider cache and upload counter under
    /// `data_dir`. If bootstrapping fails the node is closed again and
    /// the coordinator stays empty.
    ///
    /// # Errors
    ///
    /// - `OtternetError::ConfigError` if a node is already running or
    ///   starting, or `config` is invalid.
    /// - Any error from session setup, node creation or bootstrap.
    pub async fn start(
        &self,
        wallet_address: &str,
        config: NetworkConfig,
        data_dir: &Path,
        catalog: Arc<dyn CatalogStore>,
    ) -> Result<NetworkHandle> {
        if self.starting.swap(true, Ordering::AcqRel) {
            return Err(OtternetError::ConfigError {
                reason: "node is already starting".into(),
            });
        }
        let _guard = StartGuard(&self.starting);
        if self.inner.lock().await.is_some() {
            return Err(OtternetError::ConfigError {
                reason: "node is already running".into(),
            });
        }

        let session = Arc::new(Session::open(data_dir, wallet_address, catalog)?);
        let mut node = Node::new(config, session)?;
        node.start()?;

        if let Err(e) = node.bootstrap_network().await {
            tracing::error!(%e, "bootstrap failed, closing node");
            if let Err(close_err) = node.close().await {
                tracing::warn!(%close_err, "failed to close node after bootstrap failure");
            }
            return Err(e);
        }

        let handle = node.handle().clone();
        tracing::info!(peer_id = %node.peer_id(), %wallet_address, "node running");
        *self.inner.lock().await = Some(RunningNode {
            node,
            wallet_address: wallet_address.to_owned(),
        });
        Ok(handle)
    }

    /// Stops the running node and forgets the wallet address.
    ///
    /// # Errors
    ///
    /// `OtternetError::ConfigError` if no node is running.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(mut running) = inner.take() else {
            return Err(OtternetError::ConfigError {
                reason: "no node is running".into(),
            });
        };
        running.node.close().await
    }

    /// `true` while a start is in progress.
    pub fn is_starting(&self) -> bool {
        self.starting.load(Ordering::Acquire)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    pub async fn wallet_address(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|r| r.wallet_address.clone())
    }

    pub async fn handle(&self) -> Option<NetworkHandle> {
        self.inner.lock().await.as_ref().map(|r| r.node.handle().clone())
    }

    pub async fn session(&self) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|r| Arc::clone(r.node.session()))
    }
}
