//! Network events emitted by the Otternet swarm.
//!
//! [`NetworkEvent`] is the unified event type higher layers receive
//! from the event loop. libp2p-specific events are mapped into this
//! enum before they leave the network crate.

use libp2p::{Multiaddr, PeerId};

use crate::nat::NatStatus;

/// Events emitted by the Otternet network layer.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    /// A connection to a remote peer was established.
    PeerConnected {
        peer_id: PeerId,
        /// Remote address of the connection.
        address: Multiaddr,
        /// Whether the connection runs over a relay circuit.
        relayed: bool,
    },

    /// The last connection to a remote peer closed.
    PeerDisconnected(PeerId),

    /// The swarm is listening on a new address.
    ListeningOn(Multiaddr),

    /// A relay accepted our reservation.
    ReservationAccepted { relay_peer_id: PeerId },

    /// A relayed connection was upgraded to a direct one.
    HolePunched(PeerId),

    /// AutoNAT reported a new reachability status.
    NatStatusChanged(NatStatus),
}
