//! HTTP proxy bookkeeping.
//!
//! A node acting as an HTTP proxy keeps a set of authorized client
//! addresses (filled by the proxy connect/disconnect protocols) and a
//! list of known proxy nodes. Both live under one mutex, exposed
//! through [`ProxyRegistry::lock`] so callers can combine operations
//! atomically.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;

use otternet_network::handle::NetworkHandle;
use otternet_network::protocol::PROXY_PROVIDER_KEY;
use otternet_types::{ProxyNode, ProxyStatus, Result};

// ---------------------------------------------------------------------------
// Address normalization
// ---------------------------------------------------------------------------

/// Reduces a client address to its host part.
///
/// - `1.2.3.4:5000` → `1.2.3.4`
/// - `[2001:db8::1]:443` → `2001:db8::1`
/// - `::1`, `[::1]:80` → `127.0.0.1`
pub fn normalize_address(addr: &str) -> String {
    let addr = addr.trim();

    let ip = addr
        .parse::<SocketAddr>()
        .map(|s| s.ip())
        .or_else(|_| addr.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>());

    match ip {
        Ok(ip) if ip.is_loopback() && ip.is_ipv6() => Ipv4Addr::LOCALHOST.to_string(),
        Ok(ip) => ip.to_string(),
        // Host names: drop a trailing `:port`.
        Err(_) => match addr.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_owned(),
            _ => addr.to_owned(),
        },
    }
}

// ---------------------------------------------------------------------------
// ProxyState / ProxyRegistry
// ---------------------------------------------------------------------------

/// State guarded by the registry mutex.
#[derive(Debug, Default)]
pub struct ProxyState {
    authorized: HashMap<String, bool>,
    nodes: Vec<ProxyNode>,
}

impl ProxyState {
    pub fn authorize(&mut self, client_addr: &str) {
        self.authorized.insert(normalize_address(client_addr), true);
    }

    /// Returns `true` if the address was authorized.
    pub fn deauthorize(&mut self, client_addr: &str) -> bool {
        self.authorized.remove(&normalize_address(client_addr)).is_some()
    }

    pub fn is_authorized(&self, remote: &str) -> bool {
        self.authorized
            .get(&normalize_address(remote))
            .copied()
            .unwrap_or(false)
    }

    pub fn authorized_clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self.authorized.keys().cloned().collect();
        clients.sort();
        clients
    }

    /// Adds `node`, replacing an entry with the same id, ip and port.
    pub fn add_proxy_node(&mut self, node: ProxyNode) {
        match self
            .nodes
            .iter_mut()
            .find(|n| n.id == node.id && n.ip == node.ip && n.port == node.port)
        {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    pub fn proxy_nodes(&self) -> &[ProxyNode] {
        &self.nodes
    }
}

/// Authorized clients and known proxy nodes under a single mutex.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    state: Mutex<ProxyState>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the registry. A poisoned lock is recovered, since every
    /// mutation leaves the state consistent.
    pub fn lock(&self) -> MutexGuard<'_, ProxyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn authorize(&self, client_addr: &str) {
        self.lock().authorize(client_addr);
    }

    pub fn deauthorize(&self, client_addr: &str) -> bool {
        self.lock().deauthorize(client_addr)
    }

    pub fn is_authorized(&self, remote: &str) -> bool {
        self.lock().is_authorized(remote)
    }

    /// Authorizes the local machine, for a proxy used by its own host.
    pub fn authorize_loopback(&self) {
        self.authorize(&Ipv4Addr::LOCALHOST.to_string());
    }

    pub fn add_proxy_node(&self, node: ProxyNode) {
        self.lock().add_proxy_node(node);
    }

    pub fn proxy_nodes(&self) -> Vec<ProxyNode> {
        self.lock().proxy_nodes().to_vec()
    }
}

// ---------------------------------------------------------------------------
// DHT advertisement
// ---------------------------------------------------------------------------

/// Announces this node as an HTTP proxy and records it locally as
/// `available`.
///
/// The provider key is the multihash of [`PROXY_PROVIDER_KEY`], the
/// same derivation as file content keys. Nodes that announce under the
/// hash of the key's CID string are not found, and do not find us.
///
/// # Errors
///
/// Returns the provide error; the registry is left untouched then.
pub async fn advertise_self_as_node(
    handle: &NetworkHandle,
    registry: &ProxyRegistry,
    ip: &str,
    port: &str,
    price_per_hour: f64,
) -> Result<()> {
    handle.provide_key(PROXY_PROVIDER_KEY).await?;

    registry.add_proxy_node(ProxyNode {
        id: handle.local_peer_id().to_string(),
        ip: ip.to_owned(),
        port: port.to_owned(),
        price_per_hour,
        status: ProxyStatus::Available,
    });
    tracing::info!(%ip, %port, price_per_hour, "advertised as proxy node");
    Ok(())
}

/// Lists the proxies announced in the DHT, one entry per usable
/// provider address. Uses the provider key of [`advertise_self_as_node`].
///
/// # Errors
///
/// Returns the provider lookup error.
pub async fn fetch_available_proxies(handle: &NetworkHandle) -> Result<Vec<ProxyNode>> {
    let providers = handle.find_providers(PROXY_PROVIDER_KEY).await?;
    tracing::debug!(count = providers.len(), "proxy providers found");

    let mut nodes = Vec::new();
    for provider in providers {
        for addr in &provider.addrs {
            match ip_and_port(addr) {
                Some((ip, port)) => nodes.push(ProxyNode {
                    id: provider.peer_id.to_string(),
                    ip,
                    port,
                    price_per_hour: 0.0,
                    status: ProxyStatus::Available,
                }),
                None => tracing::debug!(%addr, "skipping proxy address without ip/port"),
            }
        }
    }
    Ok(nodes)
}

/// Extracts the IP and TCP/UDP port of a multiaddr.
fn ip_and_port(addr: &Multiaddr) -> Option<(String, String)> {
    let mut ip = None;
    let mut port = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(v4) if ip.is_none() => ip = Some(v4.to_string()),
            Protocol::Ip6(v6) if ip.is_none() => ip = Some(v6.to_string()),
            Protocol::Tcp(p) | Protocol::Udp(p) if port.is_none() => port = Some(p.to_string()),
            _ => {}
        }
    }
    Some((ip?, port?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_forms() {
        assert_eq!(normalize_address("1.2.3.4:5000"), "1.2.3.4");
        assert_eq!(normalize_address("1.2.3.4"), "1.2.3.4");
        assert_eq!(normalize_address("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(normalize_address("::1"), "127.0.0.1");
        assert_eq!(normalize_address("[::1]:8080"), "127.0.0.1");
        assert_eq!(normalize_address("localhost:8080"), "localhost");
    }

    #[test]
    fn authorization_toggles() {
        let registry = ProxyRegistry::new();
        assert!(!registry.is_authorized("10.0.0.1:999"));

        registry.authorize("10.0.0.1:4000");
        assert!(registry.is_authorized("10.0.0.1:999"));

        assert!(registry.deauthorize("10.0.0.1"));
        assert!(!registry.is_authorized("10.0.0.1:999"));
        assert!(!registry.deauthorize("10.0.0.1"));
    }

    #[test]
    fn loopback_covers_v4_and_v6() {
        let registry = ProxyRegistry::new();
        registry.authorize_loopback();
        assert!(registry.is_authorized("127.0.0.1:5555"));
        assert!(registry.is_authorized("[::1]:5555"));
    }

    #[test]
    fn compound_update_under_one_lock() {
        let registry = ProxyRegistry::new();
        {
            let mut state = registry.lock();
            state.authorize("1.1.1.1");
            state.add_proxy_node(ProxyNode {
                id: "p".into(),
                ip: "1.1.1.1".into(),
                port: "80".into(),
                price_per_hour: 0.5,
                status: ProxyStatus::Available,
            });
        }
        assert_eq!(registry.lock().authorized_clients(), vec!["1.1.1.1".to_owned()]);
        assert_eq!(registry.proxy_nodes().len(), 1);
    }

    #[test]
    fn proxy_nodes_deduplicate_by_endpoint() {
        let registry = ProxyRegistry::new();
        let node = |status| ProxyNode {
            id: "p".into(),
            ip: "1.1.1.1".into(),
            port: "80".into(),
            price_per_hour: 0.5,
            status,
        };
        registry.add_proxy_node(node(ProxyStatus::Available));
        registry.add_proxy_node(node(ProxyStatus::Busy));
        let nodes = registry.proxy_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, ProxyStatus::Busy);
    }

    #[test]
    fn multiaddr_ip_and_port() {
        let tcp: Multiaddr = "/ip4/5.6.7.8/tcp/4001".parse().unwrap();
        assert_eq!(ip_and_port(&tcp), Some(("5.6.7.8".into(), "4001".into())));

        let quic: Multiaddr = "/ip6/::1/udp/9/quic-v1".parse().unwrap();
        assert_eq!(ip_and_port(&quic), Some(("::1".into(), "9".into())));

        let dns: Multiaddr = "/dns4/example.com/tcp/1".parse().unwrap();
        assert_eq!(ip_and_port(&dns), None);
    }

    #[test]
    fn proxy_key_uses_content_derivation() {
        use otternet_network::content_id::ContentId;

        let id = ContentId::from_key(PROXY_PROVIDER_KEY);
        assert_eq!(id.provider_key().to_vec(), id.multihash());
        assert_ne!(id.provider_key().to_vec(), id.cid_bytes());
    }
}
