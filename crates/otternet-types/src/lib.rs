//! Core shared types for the Otternet overlay node.
//!
//! This crate defines the records exchanged between peers and the
//! central error type. Field names on the serialized records match
//! the JSON already spoken by deployed Otternet nodes, so they must
//! not be renamed.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// CatalogItem
// ---------------------------------------------------------------------------

/// Metadata describing one locally hosted file.
///
/// A node's catalog is the set of items whose `wallet_id` equals the
/// node's wallet address. Items are created on upload, replaced on
/// re-upload with the same `file_hash` and removed on delete; those
/// writers live outside this workspace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Wallet that owns (and is paid for) this file.
    #[serde(rename = "walletID")]
    pub wallet_id: String,
    /// Peer id of the node that uploaded the file.
    #[serde(rename = "srcID", default)]
    pub src_id: String,
    /// Price per download.
    #[serde(default)]
    pub price: f64,
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// Local filesystem path. Never sent to remote peers.
    #[serde(rename = "filePath", default)]
    pub file_path: String,
    #[serde(rename = "fileSize", default)]
    pub file_size: i64,
    #[serde(rename = "fileType", default)]
    pub file_type: String,
    #[serde(default)]
    pub timestamp: String,
    /// Content hash; the lookup key for every exchange protocol.
    #[serde(rename = "fileHash")]
    pub file_hash: String,
    #[serde(rename = "bundleMode", default)]
    pub bundle_mode: bool,
}

// ---------------------------------------------------------------------------
// FileTransferMetadata
// ---------------------------------------------------------------------------

/// Record sent at the start of a file transfer.
///
/// Constructed per request from the matching [`CatalogItem`]. Uses the
/// same JSON field names as the catalog record so that peers decoding
/// it as a catalog entry keep working; the local file path is dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileTransferMetadata {
    #[serde(rename = "walletID", default)]
    pub wallet_id: String,
    #[serde(rename = "srcID", default)]
    pub src_id: String,
    #[serde(default)]
    pub price: f64,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "fileSize", default)]
    pub file_size: i64,
    #[serde(rename = "fileType", default)]
    pub file_type: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "fileHash")]
    pub file_hash: String,
    #[serde(rename = "bundleMode", default)]
    pub bundle_mode: bool,
}

impl From<&CatalogItem> for FileTransferMetadata {
    fn from(item: &CatalogItem) -> Self {
        Self {
            wallet_id: item.wallet_id.clone(),
            src_id: item.src_id.clone(),
            price: item.price,
            file_name: item.file_name.clone(),
            file_size: item.file_size,
            file_type: item.file_type.clone(),
            timestamp: item.timestamp.clone(),
            file_hash: item.file_hash.clone(),
            bundle_mode: item.bundle_mode,
        }
    }
}

// ---------------------------------------------------------------------------
// ProxyNode
// ---------------------------------------------------------------------------

/// Availability of an advertised HTTP proxy node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Available,
    Busy,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

/// A peer offering HTTP relaying, as listed to the local user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyNode {
    /// libp2p peer id of the proxy.
    pub id: String,
    pub ip: String,
    pub port: String,
    #[serde(rename = "pricePerHour", default)]
    pub price_per_hour: f64,
    pub status: ProxyStatus,
}

// ---------------------------------------------------------------------------
// OtternetError
// ---------------------------------------------------------------------------

/// Central error type for the Otternet node.
///
/// All crates in the workspace convert their internal errors into
/// variants of this enum.
#[derive(Debug, Error)]
pub enum OtternetError {
    /// A transport, dial or stream-open operation failed.
    #[error("network error: {reason}")]
    NetworkError {
        /// Human-readable description of the network failure.
        reason: String,
    },

    /// A DHT operation (bootstrap, put, get, provide, find) failed.
    #[error("dht error: {reason}")]
    DhtError {
        /// Human-readable description of the DHT failure.
        reason: String,
    },

    /// Malformed data was read from or written to a peer stream.
    #[error("protocol error: {reason}")]
    ProtocolError {
        /// Human-readable description of the protocol failure.
        reason: String,
    },

    /// Reading or writing persisted state failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// A configuration value is invalid, or the node was driven
    /// through an invalid lifecycle transition.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },

    /// The requested content hash or DHT record does not exist.
    #[error("not found: {reason}")]
    NotFound {
        /// What was looked up.
        reason: String,
    },

    /// A per-call deadline expired before the operation completed.
    #[error("timed out: {reason}")]
    Timeout {
        /// Which operation timed out, and after how long.
        reason: String,
    },

    /// A remote peer answered with an explicit error frame.
    #[error("remote error ({code}): {reason}")]
    RemoteError {
        /// Error class reported by the peer.
        code: String,
        /// Peer-supplied description.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`OtternetError`].
pub type Result<T> = std::result::Result<T, OtternetError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> CatalogItem {
        CatalogItem {
            wallet_id: "wallet-1".into(),
            src_id: "12D3KooWsrc".into(),
            price: 1.5,
            file_name: "otter.png".into(),
            file_path: "/srv/files/otter.png".into(),
            file_size: 2048,
            file_type: "image/png".into(),
            timestamp: "2024-11-01T10:00:00Z".into(),
            file_hash: "abc123".into(),
            bundle_mode: false,
        }
    }

    #[test]
    fn catalog_item_uses_wire_field_names() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_value(sample_item())?;
        assert_eq!(json["walletID"], "wallet-1");
        assert_eq!(json["fileHash"], "abc123");
        assert_eq!(json["bundleMode"], false);
        assert_eq!(json["fileSize"], 2048);
        Ok(())
    }

    #[test]
    fn catalog_item_tolerates_missing_optional_fields() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let item: CatalogItem = serde_json::from_str(
            r#"{"walletID":"w","fileName":"a.txt","fileHash":"h"}"#,
        )?;
        assert_eq!(item.price, 0.0);
        assert!(!item.bundle_mode);
        assert!(item.file_path.is_empty());
        Ok(())
    }

    #[test]
    fn transfer_metadata_omits_file_path() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let meta = FileTransferMetadata::from(&sample_item());
        let json = serde_json::to_value(&meta)?;
        assert!(json.get("filePath").is_none());
        assert_eq!(json["fileName"], "otter.png");
        assert_eq!(json["srcID"], "12D3KooWsrc");
        Ok(())
    }

    #[test]
    fn proxy_status_serializes_lowercase() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let node = ProxyNode {
            id: "peer".into(),
            ip: "10.0.0.1".into(),
            port: "8081".into(),
            price_per_hour: 0.01,
            status: ProxyStatus::Available,
        };
        let json = serde_json::to_value(&node)?;
        assert_eq!(json["status"], "available");
        assert_eq!(json["pricePerHour"], 0.01);
        assert_eq!(ProxyStatus::Busy.to_string(), "busy");
        Ok(())
    }

    #[test]
    fn error_display() {
        let err = OtternetError::RemoteError {
            code: "not_found".into(),
            reason: "no such hash".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("not_found"));
        assert!(msg.contains("no such hash"));
    }
}
