//! Network configuration for the Otternet libp2p layer.
//!
//! All values have documented defaults that point at the deployed
//! Otternet relay and bootstrap nodes. Validation rejects zero-valued
//! timeouts and malformed protocol names or peer addresses at startup.

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};

use otternet_types::{OtternetError, Result};

use crate::identity::LEGACY_SHARED_SEED;

// ---------------------------------------------------------------------------
// Well-known nodes
// ---------------------------------------------------------------------------

/// Relay node run for the Otternet network.
pub const DEFAULT_RELAY_NODES: &[&str] =
    &["/ip4/130.245.173.221/tcp/4001/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"];

/// Bootstrap node run for the Otternet network.
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] =
    &["/ip4/130.245.173.222/tcp/61000/p2p/12D3KooWQd1K1k8XA9xVEzSAu7HUCodC7LJB6uW5Kw4VwkRdstPE"];

/// Kademlia protocol spoken by the deployed DHT.
pub const DEFAULT_KAD_PROTOCOL: &str = "/ipfs/kad/1.0.0";

/// Namespace prepended to every `put_value`/`get_value` key.
pub const DEFAULT_DHT_NAMESPACE: &str = "orcanet";

fn parse_defaults(list: &[&str]) -> Vec<Multiaddr> {
    list.iter().filter_map(|s| s.parse::<Multiaddr>().ok()).collect()
}

/// Network-layer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    // -----------------------------------------------------------------------
    // Core networking
    // -----------------------------------------------------------------------

    /// Addresses to listen on.
    ///
    /// Default: `/ip4/0.0.0.0/tcp/0` and `/ip4/0.0.0.0/udp/0/quic-v1`
    /// (OS-assigned ports on all interfaces).
    #[serde(with = "multiaddr_vec_serde")]
    pub listen_addrs: Vec<Multiaddr>,

    /// Seed from which the node identity is derived.
    ///
    /// Default: the legacy shared seed. Set a per-installation value.
    pub identity_seed: String,

    /// Seconds before an idle connection is closed by the swarm.
    pub idle_timeout_secs: u64,

    /// Seconds before an outbound dial attempt is abandoned.
    pub dial_timeout_secs: u64,

    /// Per-call deadline for DHT operations and stream requests.
    pub request_timeout_secs: u64,

    // -----------------------------------------------------------------------
    // Well-known peers
    // -----------------------------------------------------------------------

    /// Relay nodes used for reservations and circuit dials. Each entry
    /// must contain a `/p2p/<peer_id>` component.
    #[serde(with = "multiaddr_vec_serde")]
    pub relay_nodes: Vec<Multiaddr>,

    /// Bootstrap nodes for the DHT. Each entry must contain a
    /// `/p2p/<peer_id>` component.
    #[serde(with = "multiaddr_vec_serde")]
    pub bootstrap_nodes: Vec<Multiaddr>,

    // -----------------------------------------------------------------------
    // Kademlia DHT
    // -----------------------------------------------------------------------

    /// Kademlia protocol name. Default: `/ipfs/kad/1.0.0`.
    pub kad_protocol: String,

    /// Seconds before a Kademlia query times out inside libp2p.
    pub kad_query_timeout_secs: u64,

    /// Namespace for value keys: `key` is stored as `/<namespace>/key`.
    pub dht_namespace: String,

    /// Run Kademlia in server mode (accept and store records).
    ///
    /// Default: `false`. Deployed nodes are DHT clients; tests set
    /// this to get a node that can hold records.
    pub dht_server_mode: bool,

    // -----------------------------------------------------------------------
    // NAT traversal
    // -----------------------------------------------------------------------

    /// Enable AutoNAT probing and the AutoNAT service for other peers.
    pub enable_autonat: bool,

    /// Number of AutoNAT confirmations before a status is trusted.
    pub autonat_confidence_max: usize,

    /// Enable UPnP port mapping on the local gateway.
    pub enable_upnp: bool,

    /// Serve as a circuit relay for other peers.
    pub enable_relay_server: bool,

    /// Attempts at a relay reservation during bootstrap.
    pub reservation_attempts: u32,

    /// Initial backoff between reservation attempts; doubled after
    /// each failure.
    pub reservation_backoff_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        // Built without parsing so no fallible call is needed.
        let mut tcp = Multiaddr::empty();
        tcp.push(Protocol::Ip4(std::net::Ipv4Addr::UNSPECIFIED));
        tcp.push(Protocol::Tcp(0));

        let mut quic = Multiaddr::empty();
        quic.push(Protocol::Ip4(std::net::Ipv4Addr::UNSPECIFIED));
        quic.push(Protocol::Udp(0));
        quic.push(Protocol::QuicV1);

        Self {
            listen_addrs: vec![tcp, quic],
            identity_seed: LEGACY_SHARED_SEED.into(),
            idle_timeout_secs: 60,
            dial_timeout_secs: 10,
            request_timeout_secs: 30,
            relay_nodes: parse_defaults(DEFAULT_RELAY_NODES),
            bootstrap_nodes: parse_defaults(DEFAULT_BOOTSTRAP_NODES),
            kad_protocol: DEFAULT_KAD_PROTOCOL.into(),
            kad_query_timeout_secs: 60,
            dht_namespace: DEFAULT_DHT_NAMESPACE.into(),
            dht_server_mode: false,
            enable_autonat: true,
            autonat_confidence_max: 3,
            enable_upnp: true,
            enable_relay_server: true,
            reservation_attempts: 5,
            reservation_backoff_secs: 2,
        }
    }
}

impl NetworkConfig {
    /// Configuration for an isolated node on the loopback interface:
    /// ephemeral TCP port, no well-known peers, DHT server mode, no
    /// UPnP. Used by tests and local harnesses.
    pub fn local(seed: &str) -> Self {
        let mut tcp = Multiaddr::empty();
        tcp.push(Protocol::Ip4(std::net::Ipv4Addr::LOCALHOST));
        tcp.push(Protocol::Tcp(0));

        Self {
            listen_addrs: vec![tcp],
            identity_seed: seed.into(),
            relay_nodes: Vec::new(),
            bootstrap_nodes: Vec::new(),
            dht_server_mode: true,
            enable_upnp: false,
            enable_relay_server: false,
            request_timeout_secs: 10,
            ..Self::default()
        }
    }

    /// Validates all configuration values.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::ConfigError` naming the first field that
    /// is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addrs.is_empty() {
            return Err(config_error("listen_addrs must not be empty"));
        }
        if self.identity_seed.is_empty() {
            return Err(config_error("identity_seed must not be empty"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(config_error("idle_timeout_secs must be greater than 0"));
        }
        if self.dial_timeout_secs == 0 {
            return Err(config_error("dial_timeout_secs must be greater than 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(config_error("request_timeout_secs must be greater than 0"));
        }
        if !self.kad_protocol.starts_with('/') {
            return Err(config_error("kad_protocol must start with '/'"));
        }
        if self.kad_query_timeout_secs == 0 {
            return Err(config_error("kad_query_timeout_secs must be greater than 0"));
        }
        if self.dht_namespace.is_empty() || self.dht_namespace.contains('/') {
            return Err(config_error("dht_namespace must be a non-empty path segment"));
        }
        if self.autonat_confidence_max == 0 {
            return Err(config_error("autonat_confidence_max must be greater than 0"));
        }
        if self.reservation_attempts == 0 {
            return Err(config_error("reservation_attempts must be greater than 0"));
        }

        for addr in self.relay_nodes.iter().chain(&self.bootstrap_nodes) {
            if crate::discovery::extract_peer_id(addr).is_none() {
                return Err(OtternetError::ConfigError {
                    reason: format!("well-known peer address {addr} has no /p2p/<peer_id>"),
                });
            }
        }

        Ok(())
    }

    /// Returns `true` if the identity seed is the legacy shared value.
    pub fn uses_legacy_seed(&self) -> bool {
        self.identity_seed == LEGACY_SHARED_SEED
    }
}

fn config_error(reason: &str) -> OtternetError {
    OtternetError::ConfigError {
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Serde helpers (Multiaddr does not implement Serialize/Deserialize)
// ---------------------------------------------------------------------------

pub mod multiaddr_vec_serde {
    use libp2p::Multiaddr;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(addrs: &[Multiaddr], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(addrs.iter().map(|a| a.to_string()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<Multiaddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
