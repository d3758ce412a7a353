//! DHT-based content discovery for the Otternet network.
//!
//! Wraps Kademlia and Identify into a single [`NetworkBehaviour`] that
//! provides:
//!
//! - **Values**: namespaced `put_value`/`get_value` records.
//! - **Providers**: announce and look up providers of a content id.
//! - **Bootstrap**: seed the routing table with well-known peers.
//! - **Identify**: exchange listen addresses on every connection so
//!   Kademlia can populate its routing table.
//!
//! Inbound records are filtered (`StoreInserts::FilterBoth`): the swarm
//! validates each one and stores it with
//! [`DiscoveryBehaviour::store_inbound_record`].

use std::time::Duration;

use libp2p::identity;
use libp2p::kad;
use libp2p::kad::store::RecordStore;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, Multiaddr, PeerId, StreamProtocol};

use otternet_types::OtternetError;

use crate::config::NetworkConfig;
use crate::content_id::ContentId;

/// Local alias so we never shadow `std::result::Result` (which the
/// `#[derive(NetworkBehaviour)]` macro needs).
type BResult<T> = std::result::Result<T, OtternetError>;

/// Identify protocol version, matching go-libp2p's default.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "ipfs/0.1.0";

// ---------------------------------------------------------------------------
// Combined NetworkBehaviour
// ---------------------------------------------------------------------------

/// Kademlia DHT + Identify.
#[derive(NetworkBehaviour)]
pub struct DiscoveryBehaviour {
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Builds a [`DiscoveryBehaviour`] from the given identity and config.
///
/// The Kademlia mode is pinned to client or server according to
/// `dht_server_mode` rather than left to automatic detection.
///
/// # Errors
///
/// Returns `OtternetError::ConfigError` if the Kademlia protocol name
/// is invalid.
pub fn build_discovery_behaviour(
    keypair: &identity::Keypair,
    config: &NetworkConfig,
) -> BResult<DiscoveryBehaviour> {
    let local_peer_id = PeerId::from(keypair.public());

    let protocol = StreamProtocol::try_from_owned(config.kad_protocol.clone()).map_err(|e| {
        OtternetError::ConfigError {
            reason: format!("invalid Kademlia protocol name '{}': {e}", config.kad_protocol),
        }
    })?;

    let mut kad_config = kad::Config::new(protocol);
    kad_config.set_query_timeout(Duration::from_secs(config.kad_query_timeout_secs));
    kad_config.set_record_filtering(kad::StoreInserts::FilterBoth);

    let store = kad::store::MemoryStore::new(local_peer_id);
    let mut kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);
    kademlia.set_mode(Some(if config.dht_server_mode {
        kad::Mode::Server
    } else {
        kad::Mode::Client
    }));

    let identify_config =
        identify::Config::new(IDENTIFY_PROTOCOL_VERSION.into(), keypair.public())
            .with_agent_version(format!("otternet-node/{}", env!("CARGO_PKG_VERSION")));
    let identify = identify::Behaviour::new(identify_config);

    Ok(DiscoveryBehaviour { kademlia, identify })
}

// ---------------------------------------------------------------------------
// DHT operations
// ---------------------------------------------------------------------------

impl DiscoveryBehaviour {
    /// Stores `value` under the (already namespaced) `key`.
    ///
    /// The record goes into the local store first, then to the
    /// closest peers. Progress is reported through
    /// `kad::Event::OutboundQueryProgressed`.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::DhtError` if the local store refuses
    /// the record.
    pub fn put_value(&mut self, key: &str, value: Vec<u8>) -> BResult<kad::QueryId> {
        let record = kad::Record {
            key: kad::RecordKey::new(&key),
            value,
            publisher: None,
            expires: None,
        };

        self.kademlia
            .put_record(record, kad::Quorum::One)
            .map_err(|e| OtternetError::DhtError {
                reason: format!("failed to put record {key}: {e}"),
            })
    }

    /// Starts a lookup for records under the (already namespaced) `key`.
    pub fn get_value(&mut self, key: &str) -> kad::QueryId {
        self.kademlia.get_record(kad::RecordKey::new(&key))
    }

    /// Announces this node as a provider of `content`.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::DhtError` if the provider record cannot
    /// be stored locally.
    pub fn start_providing(&mut self, content: &ContentId) -> BResult<kad::QueryId> {
        self.kademlia
            .start_providing(content.provider_key())
            .map_err(|e| OtternetError::DhtError {
                reason: format!("failed to provide {content}: {e}"),
            })
    }

    /// Starts a provider lookup for `content`.
    pub fn get_providers(&mut self, content: &ContentId) -> kad::QueryId {
        self.kademlia.get_providers(content.provider_key())
    }

    /// Stores a record received from a remote `PUT_VALUE` after it has
    /// passed validation.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::DhtError` if the local store is full.
    pub fn store_inbound_record(&mut self, record: kad::Record) -> BResult<()> {
        self.kademlia
            .store_mut()
            .put(record)
            .map_err(|e| OtternetError::DhtError {
                reason: format!("failed to store inbound record: {e}"),
            })
    }

    /// Stores a provider record received from a remote `ADD_PROVIDER`.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::DhtError` if the local store is full.
    pub fn store_inbound_provider(&mut self, record: kad::ProviderRecord) -> BResult<()> {
        self.kademlia
            .store_mut()
            .add_provider(record)
            .map_err(|e| OtternetError::DhtError {
                reason: format!("failed to store inbound provider record: {e}"),
            })
    }

    /// Adds well-known nodes to the Kademlia routing table.
    ///
    /// Each multiaddr must contain a `/p2p/<peer_id>` component.
    /// Addresses without a peer id are skipped with a warning.
    ///
    /// Returns the number of nodes added.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::DhtError` if `nodes` is non-empty and
    /// none of them could be used.
    pub fn add_bootstrap_nodes(&mut self, nodes: &[Multiaddr]) -> BResult<usize> {
        let mut added = 0usize;

        for addr in nodes {
            match extract_peer_id(addr) {
                Some((peer_id, clean_addr)) => {
                    self.kademlia.add_address(&peer_id, clean_addr);
                    added += 1;
                    tracing::info!(%peer_id, %addr, "added bootstrap node to routing table");
                }
                None => {
                    tracing::warn!(%addr, "skipping bootstrap node: missing /p2p/ component");
                }
            }
        }

        if !nodes.is_empty() && added == 0 {
            return Err(OtternetError::DhtError {
                reason: "no usable bootstrap nodes (all missing /p2p/ component)".into(),
            });
        }

        Ok(added)
    }

    /// Starts a Kademlia bootstrap.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::DhtError` if the routing table is empty.
    pub fn bootstrap(&mut self) -> BResult<kad::QueryId> {
        self.kademlia.bootstrap().map_err(|e| OtternetError::DhtError {
            reason: format!("failed to start Kademlia bootstrap: {e}"),
        })
    }

    /// Pins `addr` for `peer_id` in the routing table.
    pub fn add_address(&mut self, peer_id: &PeerId, addr: Multiaddr) {
        self.kademlia.add_address(peer_id, addr);
    }

    /// Sets the Kademlia mode (Client or Server).
    pub fn set_mode(&mut self, mode: kad::Mode) {
        self.kademlia.set_mode(Some(mode));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extracts the `PeerId` and the address-without-p2p from a multiaddr.
///
/// Given `/ip4/1.2.3.4/tcp/4001/p2p/12D3KooW...`, returns
/// `Some((PeerId, /ip4/1.2.3.4/tcp/4001))`. When several `/p2p/`
/// components are present (circuit addresses) the last one wins.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let mut clean_addr = Multiaddr::empty();
    let mut peer_id = None;

    for proto in addr.iter() {
        match proto {
            libp2p::multiaddr::Protocol::P2p(id) => {
                peer_id = Some(id);
            }
            other => {
                clean_addr.push(other);
            }
        }
    }

    peer_id.map(|pid| (pid, clean_addr))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_peer_id_with_p2p_component() {
        let keypair = identity::Keypair::generate_ed25519();
        let peer_id = PeerId::from(keypair.public());
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer_id}")
            .parse()
            .unwrap();

        let (pid, clean) = extract_peer_id(&addr).unwrap();
        assert_eq!(pid, peer_id);
        assert_eq!(clean.to_string(), "/ip4/127.0.0.1/tcp/4001");
    }

    #[test]
    fn extract_peer_id_without_p2p_returns_none() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(extract_peer_id(&addr).is_none());
    }

    #[test]
    fn build_discovery_behaviour_default_config() {
        let keypair = identity::Keypair::generate_ed25519();
        assert!(build_discovery_behaviour(&keypair, &NetworkConfig::default()).is_ok());
    }

    #[test]
    fn build_discovery_behaviour_bad_protocol_fails() {
        let keypair = identity::Keypair::generate_ed25519();
        let config = NetworkConfig {
            kad_protocol: "no-slash".into(),
            ..NetworkConfig::default()
        };
        assert!(build_discovery_behaviour(&keypair, &config).is_err());
    }

    #[test]
    fn bootstrap_without_peers_fails() {
        let keypair = identity::Keypair::generate_ed25519();
        let mut behaviour = build_discovery_behaviour(&keypair, &NetworkConfig::local("t")).unwrap();
        assert!(behaviour.bootstrap().is_err());
    }

    #[test]
    fn add_bootstrap_nodes_rejects_all_invalid() {
        let keypair = identity::Keypair::generate_ed25519();
        let mut behaviour = build_discovery_behaviour(&keypair, &NetworkConfig::local("t")).unwrap();
        let bad: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        assert!(behaviour.add_bootstrap_nodes(&[bad]).is_err());
        assert_eq!(behaviour.add_bootstrap_nodes(&[]).unwrap(), 0);
    }

    #[test]
    fn local_put_then_store_lookup() {
        let keypair = identity::Keypair::generate_ed25519();
        let mut behaviour = build_discovery_behaviour(&keypair, &NetworkConfig::local("t")).unwrap();
        behaviour.put_value("/orcanet/k", b"v".to_vec()).unwrap();

        let key = kad::RecordKey::new(&"/orcanet/k");
        let stored = behaviour.kademlia.store_mut().get(&key).unwrap();
        assert_eq!(stored.value, b"v".to_vec());
    }
}
