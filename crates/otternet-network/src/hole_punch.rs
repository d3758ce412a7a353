//! Direct connection upgrade through relay (DCUtR).
//!
//! After a peer is reached over a relay circuit
//! ([`crate::relay::build_relay_circuit_addr`]), the DCUtR behaviour
//! coordinates a simultaneous dial on both sides. No explicit call is
//! needed; this module only interprets the outcome.

use libp2p::dcutr;
use libp2p::PeerId;

/// Outcome of a hole punch attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HolePunchOutcome {
    /// A direct connection replaced the relayed one.
    Direct(PeerId),
    /// The upgrade failed; traffic stays on the relay circuit.
    StayedRelayed(PeerId),
}

impl HolePunchOutcome {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Direct(p) | Self::StayedRelayed(p) => p,
        }
    }
}

/// Logs a DCUtR event and maps it to a [`HolePunchOutcome`].
pub fn handle_dcutr_event(event: dcutr::Event) -> HolePunchOutcome {
    let remote_peer_id = event.remote_peer_id;

    match event.result {
        Ok(direct_conn_id) => {
            tracing::info!(%remote_peer_id, ?direct_conn_id, "hole punch succeeded");
            HolePunchOutcome::Direct(remote_peer_id)
        }
        Err(error) => {
            tracing::warn!(%remote_peer_id, ?error, "hole punch failed; staying on relay");
            HolePunchOutcome::StayedRelayed(remote_peer_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_exposes_peer() {
        let peer = PeerId::random();
        assert_eq!(HolePunchOutcome::Direct(peer).peer_id(), &peer);
        assert_eq!(HolePunchOutcome::StayedRelayed(peer).peer_id(), &peer);
    }
}
