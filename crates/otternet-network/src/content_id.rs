//! Content identifiers for provider records.
//!
//! A content key (typically a file hash string) is hashed with
//! SHA-256 and wrapped as a sha2-256 multihash. The Kademlia provider
//! key is the raw multihash, which is what go-libp2p-kad-dht derives
//! from a CID, so provider records interoperate with go-libp2p peers. The
//! CIDv1 form (raw codec) is exposed for logging and display.

use std::fmt;

use libp2p::kad::RecordKey;
use sha2::{Digest, Sha256};

/// Multihash code for sha2-256.
pub const SHA2_256_CODE: u8 = 0x12;

/// Digest length of sha2-256.
pub const SHA2_256_LEN: u8 = 0x20;

/// CID version byte.
pub const CID_V1: u8 = 0x01;

/// Multicodec for raw binary content.
pub const RAW_CODEC: u8 = 0x55;

/// Content id derived from a content key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentId {
    digest: [u8; 32],
}

impl ContentId {
    /// Derives the content id for `key`.
    pub fn from_key(key: &str) -> Self {
        Self {
            digest: Sha256::digest(key.as_bytes()).into(),
        }
    }

    /// The SHA-256 digest of the content key.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// sha2-256 multihash: `0x12 0x20 ‖ digest`.
    pub fn multihash(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34);
        out.push(SHA2_256_CODE);
        out.push(SHA2_256_LEN);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Binary CIDv1 with the raw codec: `0x01 0x55 ‖ multihash`.
    pub fn cid_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(36);
        out.push(CID_V1);
        out.push(RAW_CODEC);
        out.extend_from_slice(&self.multihash());
        out
    }

    /// Kademlia provider key (the multihash bytes).
    pub fn provider_key(&self) -> RecordKey {
        RecordKey::new(&self.multihash())
    }
}

impl fmt::Display for ContentId {
    /// Lowercase hex of the binary CID, prefixed with the base16
    /// multibase code `f`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", hex::encode(self.cid_bytes()))
    }
}
