//! Otternet libp2p network layer.
//!
//! Provides node identity, transport configuration, DHT-based content
//! discovery, NAT traversal, swarm orchestration and the application
//! protocols spoken between Otternet peers.
//!
//! # Architecture
//!
//! - [`identity`]: seed-derived Ed25519 identities
//! - [`transport`]: TCP + QUIC transport settings
//! - [`config`]: network configuration with defaults
//! - [`discovery`]: Kademlia DHT + Identify behaviour
//! - [`content_id`]: content-key → CID / provider key derivation
//! - [`validator`]: DHT record validation
//! - [`nat`], [`relay`], [`hole_punch`]: reachability
//! - [`swarm`]: swarm wrapper, owned by one event-loop task
//! - [`command`], [`handle`]: command channel and its async front end
//! - [`protocol`], [`envelope`]: wire formats
//! - [`handler`]: inbound stream handlers
//! - [`exchange`], [`peer_exchange`]: outbound requests

pub mod command;
pub mod config;
pub mod content_id;
pub mod discovery;
pub mod envelope;
pub mod events;
pub mod exchange;
pub mod handle;
pub mod handler;
pub mod hole_punch;
pub mod identity;
pub mod nat;
pub mod peer_exchange;
pub mod protocol;
pub mod relay;
pub mod swarm;
pub mod transport;
pub mod validator;
