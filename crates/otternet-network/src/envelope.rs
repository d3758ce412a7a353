//! Length-prefixed JSON framing for the exchange protocol.
//!
//! # Wire format
//!
//! ```text
//! +----------------+---------------------------+
//! | u32 (BE) len   | JSON body (len bytes)     |
//! +----------------+---------------------------+
//! ```
//!
//! Bodies larger than [`MAX_FRAME_LEN`] are rejected on both sides. A
//! stream may carry several request/response pairs; the initiator
//! closes its write half when done. A `FileHeader` response is
//! followed by exactly `size` raw bytes outside any frame.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use otternet_types::{CatalogItem, FileTransferMetadata, OtternetError, Result};

/// Maximum JSON body size of one frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Requests carried by the exchange protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeRequest {
    Price { hash: String },
    Catalog,
    Liveness,
    File { hash: String },
    ProxyConnect { client_addr: String },
    ProxyDisconnect { client_addr: String },
    /// Gossip of known peer ids. `(session, seq)` identifies the
    /// message so that retransmissions are acknowledged but applied
    /// once.
    KnownPeers {
        session: u64,
        seq: u64,
        peers: Vec<String>,
    },
}

impl ExchangeRequest {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Price { .. } => "price",
            Self::Catalog => "catalog",
            Self::Liveness => "liveness",
            Self::File { .. } => "file",
            Self::ProxyConnect { .. } => "proxy_connect",
            Self::ProxyDisconnect { .. } => "proxy_disconnect",
            Self::KnownPeers { .. } => "known_peers",
        }
    }
}

/// Error classes reported in an [`ExchangeResponse::Error`] frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Malformed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Malformed => "malformed",
            Self::Internal => "internal",
        }
    }
}

/// Responses carried by the exchange protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeResponse {
    Price { price: f64 },
    Catalog { items: Vec<CatalogItem> },
    Liveness { active: bool },
    FileHeader {
        metadata: FileTransferMetadata,
        wallet: String,
        size: u64,
    },
    Proxy { message: String },
    Ack { session: u64, seq: u64 },
    Error { code: ErrorCode, reason: String },
}

impl ExchangeResponse {
    /// Builds an error frame from a local error.
    pub fn from_error(err: &OtternetError) -> Self {
        let code = match err {
            OtternetError::NotFound { .. } => ErrorCode::NotFound,
            OtternetError::ProtocolError { .. } => ErrorCode::Malformed,
            _ => ErrorCode::Internal,
        };
        Self::Error {
            code,
            reason: err.to_string(),
        }
    }

    /// Converts an `Error` frame into `Err(RemoteError)`.
    ///
    /// # Errors
    ///
    /// Returns `OtternetError::RemoteError` if `self` is an error frame.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Error { code, reason } => Err(OtternetError::RemoteError {
                code: code.as_str().into(),
                reason,
            }),
            other => Ok(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame I/O
// ---------------------------------------------------------------------------

/// Encodes `message` as a frame body, enforcing [`MAX_FRAME_LEN`].
///
/// # Errors
///
/// Returns `OtternetError::ProtocolError` if the body cannot be
/// serialized or exceeds [`MAX_FRAME_LEN`].
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message).map_err(|e| OtternetError::ProtocolError {
        reason: format!("failed to encode frame: {e}"),
    })?;
    if body.len() > MAX_FRAME_LEN {
        return Err(OtternetError::ProtocolError {
            reason: format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", body.len()),
        });
    }
    Ok(body)
}

/// Writes one frame containing `message` as JSON.
///
/// # Errors
///
/// - `OtternetError::ProtocolError` if the encoded body exceeds
///   [`MAX_FRAME_LEN`] or cannot be serialized.
/// - `OtternetError::NetworkError` on a stream write failure.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode_frame(message)?;
    write_encoded(writer, &body).await
}

/// Writes a body produced by [`encode_frame`] behind its length prefix.
///
/// # Errors
///
/// - `OtternetError::ProtocolError` if `body` exceeds [`MAX_FRAME_LEN`].
/// - `OtternetError::NetworkError` on a stream write failure.
pub async fn write_encoded<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(OtternetError::ProtocolError {
            reason: format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", body.len()),
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| OtternetError::ProtocolError {
        reason: "frame length does not fit in u32".into(),
    })?;

    writer.write_all(&len.to_be_bytes()).await.map_err(stream_error)?;
    writer.write_all(body).await.map_err(stream_error)?;
    writer.flush().await.map_err(stream_error)
}

/// Reads one frame and decodes it as `T`.
///
/// Returns `Ok(None)` on a clean end of stream before the length
/// prefix.
///
/// # Errors
///
/// - `OtternetError::ProtocolError` if the declared length exceeds
///   [`MAX_FRAME_LEN`] or the body is not valid JSON for `T`.
/// - `OtternetError::NetworkError` on a read failure or truncation.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await.map_err(stream_error)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(OtternetError::NetworkError {
                reason: "stream closed inside a frame length prefix".into(),
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(OtternetError::ProtocolError {
            reason: format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(stream_error)?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| OtternetError::ProtocolError {
            reason: format!("invalid frame body: {e}"),
        })
}

pub(crate) fn stream_error(e: std::io::Error) -> OtternetError {
    OtternetError::NetworkError {
        reason: format!("stream I/O failed: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ExchangeRequest::Catalog).await.unwrap();
        write_frame(&mut buf, &ExchangeRequest::Price { hash: "h".into() })
            .await
            .unwrap();
        assert_eq!(&buf[..4], &(br#"{"type":"catalog"}"#.len() as u32).to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let first: Option<ExchangeRequest> = read_frame(&mut cursor).await.unwrap();
        let second: Option<ExchangeRequest> = read_frame(&mut cursor).await.unwrap();
        let end: Option<ExchangeRequest> = read_frame(&mut cursor).await.unwrap();

        assert_eq!(first, Some(ExchangeRequest::Catalog));
        assert_eq!(second, Some(ExchangeRequest::Price { hash: "h".into() }));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let result: Result<Option<ExchangeRequest>> = read_frame(&mut Cursor::new(buf)).await;
        assert!(matches!(result, Err(OtternetError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn oversized_body_is_not_written() {
        let response = ExchangeResponse::Proxy {
            message: "x".repeat(MAX_FRAME_LEN),
        };
        assert!(matches!(
            encode_frame(&response),
            Err(OtternetError::ProtocolError { .. })
        ));

        let mut buf = Vec::new();
        let result = write_frame(&mut buf, &response).await;
        assert!(matches!(result, Err(OtternetError::ProtocolError { .. })));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn truncated_prefix_is_an_error() {
        let result: Result<Option<ExchangeRequest>> =
            read_frame(&mut Cursor::new(vec![0u8, 0])).await;
        assert!(matches!(result, Err(OtternetError::NetworkError { .. })));
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{{{");
        let result: Result<Option<ExchangeRequest>> = read_frame(&mut Cursor::new(buf)).await;
        assert!(matches!(result, Err(OtternetError::ProtocolError { .. })));
    }

    #[test]
    fn error_frame_mapping() {
        let frame = ExchangeResponse::from_error(&OtternetError::NotFound {
            reason: "h".into(),
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""code":"not_found""#));

        match frame.into_result() {
            Err(OtternetError::RemoteError { code, .. }) => assert_eq!(code, "not_found"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            ExchangeResponse::from_error(&OtternetError::ProtocolError { reason: "x".into() }),
            ExchangeResponse::Error { code: ErrorCode::Malformed, .. }
        ));
        assert!(matches!(
            ExchangeResponse::from_error(&OtternetError::StorageError { reason: "x".into() }),
            ExchangeResponse::Error { code: ErrorCode::Internal, .. }
        ));
    }

    #[test]
    fn request_tagging() {
        let json = serde_json::to_string(&ExchangeRequest::KnownPeers {
            session: 7,
            seq: 1,
            peers: vec!["p".into()],
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"known_peers","session":7,"seq":1,"peers":["p"]}"#);
    }
}
