//! Circuit Relay v2 support.
//!
//! - **Relay client**: built into the transport via
//!   `SwarmBuilder::with_relay_client`; lets this node listen on and
//!   dial `/p2p-circuit` addresses.
//! - **Relay server** (optional): lets this node relay for others.

use libp2p::multiaddr::Protocol;
use libp2p::relay;
use libp2p::{Multiaddr, PeerId};

use otternet_types::OtternetError;

/// Local alias to avoid shadowing `std::result::Result`.
type BResult<T> = std::result::Result<T, OtternetError>;

// ---------------------------------------------------------------------------
// Relay server
// ---------------------------------------------------------------------------

/// Builds the relay server behaviour if `enable` is set.
///
/// The caller wraps the result in a `Toggle`.
pub fn build_relay_server_behaviour(local_peer_id: PeerId, enable: bool) -> Option<relay::Behaviour> {
    if enable {
        tracing::info!("relay server mode enabled");
        Some(relay::Behaviour::new(local_peer_id, relay::Config::default()))
    } else {
        tracing::debug!("relay server mode disabled");
        None
    }
}

// ---------------------------------------------------------------------------
// Address helpers
// ---------------------------------------------------------------------------

/// Requires `relay_addr` to carry `/p2p/<relay_peer_id>`.
fn with_relay_peer(relay_addr: &Multiaddr) -> BResult<(PeerId, Multiaddr)> {
    let relay_peer_id = extract_relay_peer_id(relay_addr).ok_or_else(|| {
        OtternetError::NetworkError {
            reason: format!("relay address {relay_addr} has no /p2p/<peer_id>"),
        }
    })?;
    Ok((relay_peer_id, relay_addr.clone()))
}

/// Address for dialing `target` through the relay:
/// `<relay>/p2p/<relay_id>/p2p-circuit/p2p/<target>`.
///
/// # Errors
///
/// Returns `OtternetError::NetworkError` if `relay_addr` carries no
/// relay peer id.
pub fn build_relay_circuit_addr(relay_addr: &Multiaddr, target: &PeerId) -> BResult<Multiaddr> {
    let (_, addr) = with_relay_peer(relay_addr)?;
    Ok(addr.with(Protocol::P2pCircuit).with(Protocol::P2p(*target)))
}

/// Address for reserving a slot on the relay:
/// `<relay>/p2p/<relay_id>/p2p-circuit`.
///
/// # Errors
///
/// Returns `OtternetError::NetworkError` if `relay_addr` carries no
/// relay peer id.
pub fn build_relay_listen_addr(relay_addr: &Multiaddr) -> BResult<(PeerId, Multiaddr)> {
    let (relay_peer_id, addr) = with_relay_peer(relay_addr)?;
    Ok((relay_peer_id, addr.with(Protocol::P2pCircuit)))
}

/// First `/p2p/` component of a relay address.
pub fn extract_relay_peer_id(relay_addr: &Multiaddr) -> Option<PeerId> {
    relay_addr.iter().find_map(|proto| match proto {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// Returns `true` if `addr` goes through a relay circuit.
pub fn is_relayed(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

// ---------------------------------------------------------------------------
// Event logging
// ---------------------------------------------------------------------------

pub fn log_relay_client_event(event: &relay::client::Event) {
    match event {
        relay::client::Event::ReservationReqAccepted {
            relay_peer_id,
            renewal,
            ..
        } => {
            tracing::info!(%relay_peer_id, renewal, "relay reservation accepted");
        }
        relay::client::Event::OutboundCircuitEstablished { relay_peer_id, .. } => {
            tracing::info!(%relay_peer_id, "outbound relay circuit established");
        }
        relay::client::Event::InboundCircuitEstablished { src_peer_id, .. } => {
            tracing::info!(%src_peer_id, "inbound relay circuit established");
        }
        #[allow(unreachable_patterns)]
        other => {
            tracing::debug!(?other, "relay client: other event");
        }
    }
}

pub fn log_relay_server_event(event: &relay::Event) {
    match event {
        relay::Event::ReservationReqAccepted { src_peer_id, renewed, .. } => {
            tracing::info!(%src_peer_id, renewed, "relay server: reservation accepted");
        }
        relay::Event::ReservationReqDenied { src_peer_id, .. } => {
            tracing::warn!(%src_peer_id, "relay server: reservation denied");
        }
        relay::Event::CircuitReqAccepted { src_peer_id, dst_peer_id, .. } => {
            tracing::info!(%src_peer_id, %dst_peer_id, "relay server: circuit accepted");
        }
        relay::Event::CircuitReqDenied { src_peer_id, dst_peer_id, .. } => {
            tracing::warn!(%src_peer_id, %dst_peer_id, "relay server: circuit denied");
        }
        relay::Event::CircuitClosed { src_peer_id, dst_peer_id, error, .. } => {
            tracing::debug!(%src_peer_id, %dst_peer_id, ?error, "relay server: circuit closed");
        }
        _ => {
            tracing::trace!(?event, "relay server: other event");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_addr(peer: &PeerId) -> Multiaddr {
        format!("/ip4/130.245.173.221/tcp/4001/p2p/{peer}").parse().unwrap()
    }

    #[test]
    fn circuit_addr_layout() {
        let relay = PeerId::random();
        let target = PeerId::random();
        let addr = build_relay_circuit_addr(&relay_addr(&relay), &target).unwrap();
        assert_eq!(
            addr.to_string(),
            format!("/ip4/130.245.173.221/tcp/4001/p2p/{relay}/p2p-circuit/p2p/{target}")
        );
        assert!(is_relayed(&addr));
    }

    #[test]
    fn listen_addr_layout() {
        let relay = PeerId::random();
        let (pid, addr) = build_relay_listen_addr(&relay_addr(&relay)).unwrap();
        assert_eq!(pid, relay);
        assert!(addr.to_string().ends_with("/p2p-circuit"));
    }

    #[test]
    fn relay_without_peer_id_rejected() {
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
        assert!(build_relay_listen_addr(&addr).is_err());
        assert!(build_relay_circuit_addr(&addr, &PeerId::random()).is_err());
        assert!(!is_relayed(&addr));
    }

    #[test]
    fn relay_server_toggle() {
        assert!(build_relay_server_behaviour(PeerId::random(), true).is_some());
        assert!(build_relay_server_behaviour(PeerId::random(), false).is_none());
    }
}
