//! Seed-derived node identities.
//!
//! An Otternet node's libp2p identity is an Ed25519 keypair whose
//! secret is `SHA-256(seed)`. The same seed always yields the same
//! keypair and `PeerId`, so a node keeps its id across restarts
//! without storing key material.
//!
//! # Shared seed
//!
//! Deployed nodes historically all used the same seed
//! ([`LEGACY_SHARED_SEED`]), which gives every such node the same
//! `PeerId`. The seed is configurable; callers should set a
//! per-installation value. [`keypair_from_seed`] logs a warning when
//! the legacy value is used.

use libp2p::identity;
use libp2p::PeerId;
use sha2::{Digest, Sha256};

use otternet_types::{OtternetError, Result};

/// Seed shared by the already deployed nodes.
pub const LEGACY_SHARED_SEED: &str = "114295851";

/// Derives the node keypair from `seed`.
///
/// # Errors
///
/// - `OtternetError::ConfigError` if `seed` is empty.
/// - `OtternetError::NetworkError` if libp2p rejects the derived
///   secret (not expected for a 32-byte digest).
pub fn keypair_from_seed(seed: &str) -> Result<identity::Keypair> {
    if seed.is_empty() {
        return Err(OtternetError::ConfigError {
            reason: "identity seed must not be empty".into(),
        });
    }

    if seed == LEGACY_SHARED_SEED {
        tracing::warn!(
            "using the legacy shared identity seed; every node with this seed has the same peer id"
        );
    }

    let secret: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
    identity::Keypair::ed25519_from_bytes(secret).map_err(|e| OtternetError::NetworkError {
        reason: format!("failed to derive ed25519 identity from seed: {e}"),
    })
}

/// Extracts the `PeerId` from a libp2p `Keypair`.
pub fn peer_id_from_keypair(keypair: &identity::Keypair) -> PeerId {
    PeerId::from(keypair.public())
}

/// Parses a base58 peer id string.
///
/// # Errors
///
/// Returns `OtternetError::ProtocolError` if `s` is not a valid peer id.
pub fn parse_peer_id(s: &str) -> Result<PeerId> {
    s.trim().parse::<PeerId>().map_err(|e| OtternetError::ProtocolError {
        reason: format!("invalid peer id '{s}': {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_peer_id() {
        let a = keypair_from_seed("otter-seed").unwrap();
        let b = keypair_from_seed("otter-seed").unwrap();
        assert_eq!(peer_id_from_keypair(&a), peer_id_from_keypair(&b));
    }

    #[test]
    fn different_seeds_different_peer_ids() {
        let a = keypair_from_seed("seed-a").unwrap();
        let b = keypair_from_seed("seed-b").unwrap();
        assert_ne!(peer_id_from_keypair(&a), peer_id_from_keypair(&b));
    }

    #[test]
    fn legacy_seed_still_derives() {
        let kp = keypair_from_seed(LEGACY_SHARED_SEED).unwrap();
        let pid = peer_id_from_keypair(&kp);
        // Ed25519 identities use the identity multihash: "12D3KooW..." ids.
        assert!(pid.to_string().starts_with("12D3KooW"));
    }

    #[test]
    fn empty_seed_rejected() {
        assert!(matches!(
            keypair_from_seed(""),
            Err(OtternetError::ConfigError { .. })
        ));
    }

    #[test]
    fn parse_peer_id_roundtrip_and_garbage() {
        let pid = peer_id_from_keypair(&keypair_from_seed("x").unwrap());
        assert_eq!(parse_peer_id(&format!(" {pid}\n")).unwrap(), pid);
        assert!(parse_peer_id("not-a-peer").is_err());
    }
}
