//! Observable node status, folded from network events.

use std::collections::BTreeSet;

use libp2p::{Multiaddr, PeerId};

use otternet_network::events::NetworkEvent;
use otternet_network::nat::NatStatus;

/// Snapshot of the node's connectivity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    pub connected_peers: BTreeSet<PeerId>,
    pub listen_addrs: Vec<Multiaddr>,
    /// Relays that accepted a reservation.
    pub relays: BTreeSet<PeerId>,
    pub nat_status: NatStatus,
    /// Number of successful hole punches.
    pub hole_punches: u64,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            connected_peers: BTreeSet::new(),
            listen_addrs: Vec::new(),
            relays: BTreeSet::new(),
            nat_status: NatStatus::Unknown,
            hole_punches: 0,
        }
    }
}

impl NodeStatus {
    /// Applies one network event.
    pub fn apply(&mut self, event: &NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected { peer_id, .. } => {
                self.connected_peers.insert(*peer_id);
            }
            NetworkEvent::PeerDisconnected(peer_id) => {
                self.connected_peers.remove(peer_id);
            }
            NetworkEvent::ListeningOn(addr) => {
                if !self.listen_addrs.contains(addr) {
                    self.listen_addrs.push(addr.clone());
                }
            }
            NetworkEvent::ReservationAccepted { relay_peer_id } => {
                self.relays.insert(*relay_peer_id);
            }
            NetworkEvent::HolePunched(_) => self.hole_punches += 1,
            NetworkEvent::NatStatusChanged(status) => self.nat_status = status.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_disconnect_are_tracked() {
        let mut status = NodeStatus::default();
        let peer = PeerId::random();
        status.apply(&NetworkEvent::PeerConnected {
            peer_id: peer,
            address: "/ip4/127.0.0.1/tcp/1".parse().unwrap(),
            relayed: false,
        });
        assert!(status.connected_peers.contains(&peer));

        status.apply(&NetworkEvent::PeerDisconnected(peer));
        assert!(status.connected_peers.is_empty());
    }

    #[test]
    fn listen_addresses_are_unique() {
        let mut status = NodeStatus::default();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/9".parse().unwrap();
        status.apply(&NetworkEvent::ListeningOn(addr.clone()));
        status.apply(&NetworkEvent::ListeningOn(addr));
        assert_eq!(status.listen_addrs.len(), 1);
    }

    #[test]
    fn nat_and_relay_updates() {
        let mut status = NodeStatus::default();
        let relay = PeerId::random();
        status.apply(&NetworkEvent::ReservationAccepted { relay_peer_id: relay });
        status.apply(&NetworkEvent::NatStatusChanged(NatStatus::BehindNat));
        status.apply(&NetworkEvent::HolePunched(PeerId::random()));

        assert!(status.relays.contains(&relay));
        assert_eq!(status.nat_status, NatStatus::BehindNat);
        assert_eq!(status.hole_punches, 1);
    }
}
