//! Commands sent to the swarm task.
//!
//! The swarm is owned by a single task. Every other context drives it
//! through a bounded `mpsc` channel of [`NetworkCommand`]s; each
//! command carries a `oneshot::Sender` for the reply. A caller that
//! gives up (timeout, cancellation) drops its receiver, and the swarm
//! task cancels the matching DHT query on its next maintenance sweep.

use libp2p::{Multiaddr, PeerId};
use tokio::sync::oneshot;

use otternet_types::OtternetError;

use crate::nat::NatStatus;

/// Convenience alias to avoid shadowing `std::result::Result`.
type BResult<T> = std::result::Result<T, OtternetError>;

// ---------------------------------------------------------------------------
// ProviderInfo
// ---------------------------------------------------------------------------

/// A provider found in the DHT, with the addresses this node knows
/// for it (possibly none).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

// ---------------------------------------------------------------------------
// NetworkCommand
// ---------------------------------------------------------------------------

/// Commands accepted by the swarm task.
///
/// DHT keys are passed un-namespaced; the swarm applies the
/// configured namespace.
pub enum NetworkCommand {
    /// Add the configured bootstrap nodes and start a Kademlia
    /// bootstrap. Replies once the query is started, with the number of
    /// peers in the routing table.
    Bootstrap {
        reply: oneshot::Sender<BResult<usize>>,
    },

    PutValue {
        key: String,
        value: Vec<u8>,
        reply: oneshot::Sender<BResult<()>>,
    },

    /// Replies with the value picked by the record validator.
    GetValue {
        key: String,
        reply: oneshot::Sender<BResult<Vec<u8>>>,
    },

    /// Announce this node as a provider of the content id derived
    /// from `key`.
    StartProviding {
        key: String,
        reply: oneshot::Sender<BResult<()>>,
    },

    FindProviders {
        key: String,
        reply: oneshot::Sender<BResult<Vec<ProviderInfo>>>,
    },

    /// Dial `addr`, which must end in `/p2p/<peer_id>`. Replies once
    /// the connection is established or has failed.
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<BResult<PeerId>>,
    },

    /// Reserve a slot on the relay at `relay_addr` by listening on
    /// its `/p2p-circuit` address. Replies with the relay's peer id
    /// once the reservation is accepted.
    ListenOnRelay {
        relay_addr: Multiaddr,
        reply: oneshot::Sender<BResult<PeerId>>,
    },

    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },

    Listeners {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },

    /// Addresses known for `peer_id` (address book).
    PeerAddresses {
        peer_id: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },

    NatStatus {
        reply: oneshot::Sender<NatStatus>,
    },
}

impl NetworkCommand {
    /// Returns `true` if the caller has stopped waiting for the reply.
    pub fn is_abandoned(&self) -> bool {
        match self {
            Self::Bootstrap { reply } => reply.is_closed(),
            Self::PutValue { reply, .. } | Self::StartProviding { reply, .. } => reply.is_closed(),
            Self::GetValue { reply, .. } => reply.is_closed(),
            Self::FindProviders { reply, .. } => reply.is_closed(),
            Self::Dial { reply, .. } | Self::ListenOnRelay { reply, .. } => reply.is_closed(),
            Self::ConnectedPeers { reply } => reply.is_closed(),
            Self::Listeners { reply } | Self::PeerAddresses { reply, .. } => reply.is_closed(),
            Self::NatStatus { reply } => reply.is_closed(),
        }
    }
}

// Manual Debug because oneshot::Sender does not implement Debug.
impl std::fmt::Debug for NetworkCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrap { .. } => f.write_str("Bootstrap"),
            Self::PutValue { key, value, .. } => f
                .debug_struct("PutValue")
                .field("key", key)
                .field("value_len", &value.len())
                .finish_non_exhaustive(),
            Self::GetValue { key, .. } => {
                f.debug_struct("GetValue").field("key", key).finish_non_exhaustive()
            }
            Self::StartProviding { key, .. } => {
                f.debug_struct("StartProviding").field("key", key).finish_non_exhaustive()
            }
            Self::FindProviders { key, .. } => {
                f.debug_struct("FindProviders").field("key", key).finish_non_exhaustive()
            }
            Self::Dial { addr, .. } => {
                f.debug_struct("Dial").field("addr", addr).finish_non_exhaustive()
            }
            Self::ListenOnRelay { relay_addr, .. } => f
                .debug_struct("ListenOnRelay")
                .field("relay_addr", relay_addr)
                .finish_non_exhaustive(),
            Self::ConnectedPeers { .. } => f.write_str("ConnectedPeers"),
            Self::Listeners { .. } => f.write_str("Listeners"),
            Self::PeerAddresses { peer_id, .. } => f
                .debug_struct("PeerAddresses")
                .field("peer_id", peer_id)
                .finish_non_exhaustive(),
            Self::NatStatus { .. } => f.write_str("NatStatus"),
        }
    }
}
