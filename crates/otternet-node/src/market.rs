//! Market helpers built on top of the exchange protocols.

use std::collections::HashMap;

use libp2p::PeerId;

use otternet_network::exchange;
use otternet_network::handle::NetworkHandle;
use otternet_types::Result;

use crate::session::Session;

/// Asks every provider of `file_hash` for its price.
///
/// Providers are queried one after another, each bounded by the
/// request timeout. Providers that answered are appended to the
/// provider cache.
///
/// # Errors
///
/// Returns the provider lookup error. Per-provider failures are
/// reported in the map instead.
pub async fn discover_prices(
    handle: &NetworkHandle,
    session: &Session,
    file_hash: &str,
) -> Result<HashMap<PeerId, Result<f64>>> {
    let providers = handle.find_providers(file_hash).await?;
    tracing::info!(hash = %file_hash, providers = providers.len(), "querying provider prices");

    let mut prices = HashMap::with_capacity(providers.len());
    let mut responded = Vec::new();
    for provider in providers {
        if provider.peer_id == handle.local_peer_id() {
            continue;
        }
        let price = exchange::request_price(handle, provider.peer_id, file_hash).await;
        match &price {
            Ok(price) => {
                tracing::debug!(peer_id = %provider.peer_id, price, "price received");
                responded.push(provider.peer_id.to_string());
            }
            Err(e) => tracing::debug!(peer_id = %provider.peer_id, %e, "price request failed"),
        }
        prices.insert(provider.peer_id, price);
    }

    if !responded.is_empty() {
        if let Err(e) = session.append_providers(&responded) {
            tracing::warn!(%e, "failed to cache responding providers");
        }
    }
    Ok(prices)
}

/// Returns the connected peers that answer the liveness check.
///
/// # Errors
///
/// Returns an error only if the connected-peer list cannot be read.
pub async fn find_otternet_peers(handle: &NetworkHandle) -> Result<Vec<PeerId>> {
    let mut live = Vec::new();
    for peer_id in handle.connected_peers().await? {
        match exchange::check_liveness(handle, peer_id).await {
            Ok(true) => live.push(peer_id),
            Ok(false) => {}
            Err(e) => tracing::debug!(%peer_id, %e, "liveness check failed"),
        }
    }
    Ok(live)
}
