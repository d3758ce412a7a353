//! Protocol identifiers and wire records for Otternet peer streams.
//!
//! The first group of protocols is the line/JSON format spoken by the
//! deployed nodes and must stay byte-compatible. The framed exchange
//! protocol ([`EXCHANGE_PROTOCOL`]) is described in
//! [`crate::envelope`].

use libp2p::StreamProtocol;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol ids
// ---------------------------------------------------------------------------

/// `<hash>\n` → metadata JSON, wallet JSON, raw file bytes.
pub const FILE_REQUEST_PROTOCOL: StreamProtocol = StreamProtocol::new("/otternet/fileRequest");

/// `<hash>\n` → price with six decimals, no newline.
pub const PRICE_REQUEST_PROTOCOL: StreamProtocol = StreamProtocol::new("/otternet/priceRequest");

/// Anything → JSON array of the node's catalog items.
pub const CATALOG_REQUEST_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/otternet/catalogRequest");

/// `otternet1\n` → `otternet2\n` when the node hosts files.
pub const LIVENESS_PROTOCOL: StreamProtocol = StreamProtocol::new("/otternet/peers");

/// One JSON line of known peers; no reply.
pub const PEER_EXCHANGE_PROTOCOL: StreamProtocol = StreamProtocol::new("/orcanet/p2p");

/// Authorize a client address on this proxy.
pub const PROXY_CONNECT_PROTOCOL: StreamProtocol = StreamProtocol::new("/proxy/connect/1.0.0");

/// Remove a client address from this proxy.
pub const PROXY_DISCONNECT_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/proxy/disconnect/1.0.0");

/// Length-prefixed JSON request/response protocol.
pub const EXCHANGE_PROTOCOL: StreamProtocol = StreamProtocol::new("/otternet/exchange/2.0.0");

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Liveness request token, compared trimmed and case-insensitively.
pub const LIVENESS_REQUEST: &str = "otternet1";

/// Liveness reply sent by nodes with a non-empty catalog.
pub const LIVENESS_REPLY: &str = "otternet2\n";

/// Provider key under which HTTP proxy nodes announce themselves.
pub const PROXY_PROVIDER_KEY: &str = "proxy-louis-test1";

/// Reply message for a proxy connect.
pub const PROXY_CONNECTED_MESSAGE: &str = "Connected to proxy";

/// Reply message for a proxy disconnect.
pub const PROXY_DISCONNECTED_MESSAGE: &str = "Disconnected from proxy";

/// Upper bound on a single request line.
pub const MAX_REQUEST_LINE: usize = 4096;

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// Second JSON object of a file transfer.
///
/// Deployed nodes send the wallet address with a trailing newline
/// inside the value; [`WalletAddress::for_wire`] reproduces it and
/// [`WalletAddress::address`] strips it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    #[serde(rename = "walletID")]
    pub wallet_id: String,
}

impl WalletAddress {
    pub fn for_wire(address: &str) -> Self {
        Self {
            wallet_id: format!("{address}\n"),
        }
    }

    pub fn address(&self) -> &str {
        self.wallet_id.trim_end()
    }
}

/// One entry of a peer-exchange message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub peer_id: String,
}

/// Peer-exchange line: `{"known_peers":[{"peer_id":"..."}]}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeers {
    #[serde(default)]
    pub known_peers: Vec<KnownPeer>,
}

impl KnownPeers {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_peers: ids
                .into_iter()
                .map(|id| KnownPeer { peer_id: id.into() })
                .collect(),
        }
    }
}

/// Proxy connect/disconnect request body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    #[serde(rename = "clientAddr")]
    pub client_addr: String,
}

/// Proxy connect/disconnect reply body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyReply {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Formats a price the way deployed nodes do (`%f`).
pub fn format_price(price: f64) -> String {
    format!("{price:.6}")
}

/// Parses a proxy request line: JSON `{"clientAddr": ...}` or a bare
/// address. Returns `None` for a blank line.
pub fn parse_proxy_request(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<ProxyRequest>(line) {
        Ok(req) if !req.client_addr.trim().is_empty() => Some(req.client_addr.trim().to_owned()),
        Ok(_) => None,
        Err(_) if line.starts_with('{') => None,
        Err(_) => Some(line.to_owned()),
    }
}

/// Returns `true` if `line` is a liveness request.
pub fn is_liveness_request(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(LIVENESS_REQUEST)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_has_six_decimals() {
        assert_eq!(format_price(2.5), "2.500000");
        assert_eq!(format_price(0.0), "0.000000");
    }

    #[test]
    fn wallet_object_matches_deployed_format() {
        let json = serde_json::to_string(&WalletAddress::for_wire("bc1q")).unwrap();
        assert_eq!(json, r#"{"walletID":"bc1q\n"}"#);
        let back: WalletAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.address(), "bc1q");
    }

    #[test]
    fn known_peers_line_format() {
        let msg = KnownPeers::from_ids(["a", "b"]);
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"known_peers":[{"peer_id":"a"},{"peer_id":"b"}]}"#
        );
    }

    #[test]
    fn proxy_request_json_or_bare() {
        assert_eq!(
            parse_proxy_request(r#"{"clientAddr":"1.2.3.4:5000"}"#).as_deref(),
            Some("1.2.3.4:5000")
        );
        assert_eq!(parse_proxy_request("1.2.3.4\n").as_deref(), Some("1.2.3.4"));
        assert_eq!(parse_proxy_request("  \n"), None);
        assert_eq!(parse_proxy_request("{broken"), None);
        assert_eq!(parse_proxy_request(r#"{"clientAddr":""}"#), None);
    }

    #[test]
    fn liveness_token_is_case_insensitive() {
        assert!(is_liveness_request("otternet1\n"));
        assert!(is_liveness_request("  OtterNet1 "));
        assert!(!is_liveness_request("otternet2"));
    }
}
