//! Outbound requests on the Otternet exchange protocols.
//!
//! Every call opens a fresh stream to the target peer. Opening the
//! stream and reading the reply are bounded by the handle's request
//! timeout; file bodies are streamed to disk without a deadline once
//! the headers have arrived.

use std::path::Path;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use libp2p::{PeerId, Stream, StreamProtocol};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt as _;

use otternet_types::{CatalogItem, FileTransferMetadata, OtternetError, Result};

use crate::envelope::{
    read_frame, stream_error, write_frame, ExchangeRequest, ExchangeResponse, MAX_FRAME_LEN,
};
use crate::handle::{with_deadline, NetworkHandle};
use crate::protocol::{
    ProxyReply, ProxyRequest, WalletAddress, CATALOG_REQUEST_PROTOCOL, EXCHANGE_PROTOCOL,
    FILE_REQUEST_PROTOCOL, LIVENESS_PROTOCOL, LIVENESS_REPLY, LIVENESS_REQUEST,
    PRICE_REQUEST_PROTOCOL, PROXY_CONNECT_PROTOCOL, PROXY_DISCONNECT_PROTOCOL,
};

/// Largest reply body accepted on the line-oriented protocols.
pub const MAX_RESPONSE_LEN: u64 = 16 * 1024 * 1024;

/// A file received from a peer.
#[derive(Clone, Debug, PartialEq)]
pub struct FileDownload {
    pub metadata: FileTransferMetadata,
    /// Wallet address to pay, without the trailing newline.
    pub wallet_address: String,
    /// Number of bytes written to the destination.
    pub bytes: u64,
}

// ---------------------------------------------------------------------------
// Legacy protocols
// ---------------------------------------------------------------------------

/// Downloads the file with `file_hash` from `peer` into `dest`.
///
/// # Errors
///
/// - `OtternetError::NotFound` if the peer closes without sending
///   metadata.
/// - `OtternetError::ProtocolError` if the headers are malformed.
/// - `OtternetError::StorageError` if `dest` cannot be written.
pub async fn request_file(
    handle: &NetworkHandle,
    peer: PeerId,
    file_hash: &str,
    dest: &Path,
) -> Result<FileDownload> {
    let headers = async {
        let mut stream = send_line(handle, peer, FILE_REQUEST_PROTOCOL, file_hash).await?;
        let mut buf = Vec::new();
        let metadata: Option<FileTransferMetadata> = read_json_prefix(&mut stream, &mut buf).await?;
        let Some(metadata) = metadata else {
            return Err(OtternetError::NotFound {
                reason: format!("{peer} sent no file for {file_hash}"),
            });
        };
        let wallet: Option<WalletAddress> = read_json_prefix(&mut stream, &mut buf).await?;
        let wallet = wallet.ok_or_else(|| OtternetError::ProtocolError {
            reason: "stream ended before the wallet address".into(),
        })?;
        Ok((stream, buf, metadata, wallet))
    };
    let (mut stream, buffered, metadata, wallet) =
        with_deadline(handle.request_timeout(), "file request", headers).await??;

    let mut file = create_destination(dest).await?;
    file.write_all(&buffered).await.map_err(|e| write_error(dest, e))?;
    let copied = copy_to_file(&mut stream, &mut file, dest, None).await?;
    file.flush().await.map_err(|e| write_error(dest, e))?;

    let bytes = buffered.len() as u64 + copied;
    tracing::info!(%peer, hash = %file_hash, bytes, "file downloaded");
    Ok(FileDownload {
        metadata,
        wallet_address: wallet.address().to_owned(),
        bytes,
    })
}

/// Asks `peer` for the price of `file_hash`.
///
/// # Errors
///
/// `NotFound` if the peer does not host the file, `ProtocolError` if
/// the reply is not a number.
pub async fn request_price(handle: &NetworkHandle, peer: PeerId, file_hash: &str) -> Result<f64> {
    let reply = with_deadline(handle.request_timeout(), "price request", async {
        let mut stream = send_line(handle, peer, PRICE_REQUEST_PROTOCOL, file_hash).await?;
        read_reply(&mut stream).await
    })
    .await??;

    let text = String::from_utf8_lossy(&reply);
    let text = text.trim();
    if text.is_empty() {
        return Err(OtternetError::NotFound {
            reason: format!("{peer} has no price for {file_hash}"),
        });
    }
    text.parse::<f64>().map_err(|e| OtternetError::ProtocolError {
        reason: format!("invalid price '{text}': {e}"),
    })
}

/// Fetches the catalog of `peer`. A peer that answers `null` or nothing
/// has an empty catalog.
pub async fn request_catalog(handle: &NetworkHandle, peer: PeerId) -> Result<Vec<CatalogItem>> {
    let reply = with_deadline(handle.request_timeout(), "catalog request", async {
        let mut stream = handle.open_stream(peer, CATALOG_REQUEST_PROTOCOL).await?;
        stream.close().await.map_err(stream_error)?;
        read_reply(&mut stream).await
    })
    .await??;

    if reply.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let items: Option<Vec<CatalogItem>> =
        serde_json::from_slice(&reply).map_err(|e| OtternetError::ProtocolError {
            reason: format!("invalid catalog from {peer}: {e}"),
        })?;
    Ok(items.unwrap_or_default())
}

/// Returns `true` if `peer` is an Otternet node hosting files.
pub async fn check_liveness(handle: &NetworkHandle, peer: PeerId) -> Result<bool> {
    let reply = with_deadline(handle.request_timeout(), "liveness check", async {
        let mut stream = send_line(handle, peer, LIVENESS_PROTOCOL, LIVENESS_REQUEST).await?;
        read_reply(&mut stream).await
    })
    .await??;
    Ok(String::from_utf8_lossy(&reply).trim() == LIVENESS_REPLY.trim())
}

/// Asks the proxy `peer` to authorize `client_addr`. Returns the
/// proxy's message.
pub async fn proxy_connect(handle: &NetworkHandle, peer: PeerId, client_addr: &str) -> Result<String> {
    proxy_request(handle, peer, PROXY_CONNECT_PROTOCOL, client_addr).await
}

/// Asks the proxy `peer` to forget `client_addr`. Returns the proxy's
/// message.
pub async fn proxy_disconnect(
    handle: &NetworkHandle,
    peer: PeerId,
    client_addr: &str,
) -> Result<String> {
    proxy_request(handle, peer, PROXY_DISCONNECT_PROTOCOL, client_addr).await
}

async fn proxy_request(
    handle: &NetworkHandle,
    peer: PeerId,
    protocol: StreamProtocol,
    client_addr: &str,
) -> Result<String> {
    let body = serde_json::to_string(&ProxyRequest {
        client_addr: client_addr.to_owned(),
    })
    .map_err(|e| OtternetError::ProtocolError {
        reason: format!("failed to encode proxy request: {e}"),
    })?;

    let reply = with_deadline(handle.request_timeout(), "proxy request", async {
        let mut stream = send_line(handle, peer, protocol, &body).await?;
        read_reply(&mut stream).await
    })
    .await??;

    let reply: ProxyReply =
        serde_json::from_slice(&reply).map_err(|e| OtternetError::ProtocolError {
            reason: format!("invalid proxy reply from {peer}: {e}"),
        })?;
    Ok(reply.message)
}

// ---------------------------------------------------------------------------
// Framed protocol
// ---------------------------------------------------------------------------

/// Sends one framed request and returns the reply.
///
/// # Errors
///
/// - `OtternetError::RemoteError` if the peer answered with an error
///   frame.
/// - `OtternetError::ProtocolError` for `File` requests (use
///   [`framed_download`]) or if the peer closed without replying.
pub async fn framed_request(
    handle: &NetworkHandle,
    peer: PeerId,
    request: &ExchangeRequest,
) -> Result<ExchangeResponse> {
    if matches!(request, ExchangeRequest::File { .. }) {
        return Err(OtternetError::ProtocolError {
            reason: "file requests carry a body; use framed_download".into(),
        });
    }

    let response = with_deadline(handle.request_timeout(), request.kind(), async {
        let mut stream = handle.open_stream(peer, EXCHANGE_PROTOCOL).await?;
        write_frame(&mut stream, request).await?;
        let response = read_response(&mut stream, peer).await?;
        stream.close().await.map_err(stream_error)?;
        Ok::<_, OtternetError>(response)
    })
    .await??;

    response.into_result()
}

/// Downloads a file over the framed protocol into `dest`.
///
/// # Errors
///
/// - `OtternetError::RemoteError` with code `not_found` if the peer
///   does not host the file.
/// - `OtternetError::NetworkError` if the stream ends before `size`
///   bytes arrived.
pub async fn framed_download(
    handle: &NetworkHandle,
    peer: PeerId,
    file_hash: &str,
    dest: &Path,
) -> Result<FileDownload> {
    let request = ExchangeRequest::File {
        hash: file_hash.to_owned(),
    };
    let (mut stream, header) = with_deadline(handle.request_timeout(), "file request", async {
        let mut stream = handle.open_stream(peer, EXCHANGE_PROTOCOL).await?;
        write_frame(&mut stream, &request).await?;
        let header = read_response(&mut stream, peer).await?.into_result()?;
        Ok::<_, OtternetError>((stream, header))
    })
    .await??;

    let (metadata, wallet, size) = match header {
        ExchangeResponse::FileHeader {
            metadata,
            wallet,
            size,
        } => (metadata, wallet, size),
        other => {
            return Err(OtternetError::ProtocolError {
                reason: format!("{peer} answered a file request with {}", other_kind(&other)),
            });
        }
    };

    let mut file = create_destination(dest).await?;
    let bytes = copy_to_file(&mut stream, &mut file, dest, Some(size)).await?;
    file.flush().await.map_err(|e| write_error(dest, e))?;
    if bytes != size {
        return Err(OtternetError::NetworkError {
            reason: format!("transfer from {peer} ended after {bytes} of {size} bytes"),
        });
    }
    stream.close().await.map_err(stream_error)?;

    Ok(FileDownload {
        metadata,
        wallet_address: wallet,
        bytes,
    })
}

async fn read_response(stream: &mut Stream, peer: PeerId) -> Result<ExchangeResponse> {
    read_frame::<_, ExchangeResponse>(stream)
        .await?
        .ok_or_else(|| OtternetError::ProtocolError {
            reason: format!("{peer} closed the exchange stream without replying"),
        })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn other_kind(response: &ExchangeResponse) -> &'static str {
    match response {
        ExchangeResponse::Price { .. } => "price",
        ExchangeResponse::Catalog { .. } => "catalog",
        ExchangeResponse::Liveness { .. } => "liveness",
        ExchangeResponse::FileHeader { .. } => "file_header",
        ExchangeResponse::Proxy { .. } => "proxy",
        ExchangeResponse::Ack { .. } => "ack",
        ExchangeResponse::Error { .. } => "error",
    }
}

/// Opens a stream, writes `line` plus `\n` and closes the write half.
pub(crate) async fn send_line(
    handle: &NetworkHandle,
    peer: PeerId,
    protocol: StreamProtocol,
    line: &str,
) -> Result<Stream> {
    let mut stream = handle.open_stream(peer, protocol).await?;
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    stream.write_all(&bytes).await.map_err(stream_error)?;
    stream.close().await.map_err(stream_error)?;
    Ok(stream)
}

/// Reads the remainder of the stream, bounded by [`MAX_RESPONSE_LEN`].
async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader
        .take(MAX_RESPONSE_LEN)
        .read_to_end(&mut buf)
        .await
        .map_err(stream_error)?;
    Ok(buf)
}

/// Parses one JSON value from the front of `buf`, reading more from
/// `reader` as needed. Consumed bytes are removed from `buf`.
///
/// Returns `Ok(None)` if the stream ends before any non-whitespace
/// byte.
pub(crate) async fn read_json_prefix<R, T>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut chunk = [0u8; 4096];
    loop {
        let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<T>();
        match values.next() {
            Some(Ok(value)) => {
                let used = values.byte_offset();
                buf.drain(..used);
                return Ok(Some(value));
            }
            Some(Err(e)) if !e.is_eof() => {
                return Err(OtternetError::ProtocolError {
                    reason: format!("invalid JSON header: {e}"),
                });
            }
            _ => {}
        }

        if buf.len() > MAX_FRAME_LEN {
            return Err(OtternetError::ProtocolError {
                reason: format!("JSON header exceeds {MAX_FRAME_LEN} bytes"),
            });
        }
        let n = reader.read(&mut chunk).await.map_err(stream_error)?;
        if n == 0 {
            if buf.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            return Err(OtternetError::ProtocolError {
                reason: "stream ended inside a JSON header".into(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn create_destination(dest: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| write_error(parent, e))?;
    }
    tokio::fs::File::create(dest)
        .await
        .map_err(|e| write_error(dest, e))
}

async fn copy_to_file<R: AsyncRead + Unpin>(
    reader: &mut R,
    file: &mut tokio::fs::File,
    dest: &Path,
    limit: Option<u64>,
) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    loop {
        let want = match limit {
            Some(limit) if limit - copied < buf.len() as u64 => (limit - copied) as usize,
            _ => buf.len(),
        };
        if want == 0 {
            break;
        }
        let n = reader.read(&mut buf[..want]).await.map_err(stream_error)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await.map_err(|e| write_error(dest, e))?;
        copied += n as u64;
    }
    Ok(copied)
}

fn write_error(path: &Path, e: std::io::Error) -> OtternetError {
    OtternetError::StorageError {
        reason: format!("cannot write {}: {e}", path.display()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
