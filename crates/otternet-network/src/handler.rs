//! Inbound stream handlers for the Otternet application protocols.
//!
//! Each protocol gets one accept loop registered on the
//! `libp2p_stream` control; every accepted stream is served in its own
//! tokio task. Handler failures are logged at `warn` and the stream is
//! dropped without a payload, so a remote peer never sees local error
//! details on the legacy protocols. The framed protocol answers with an
//! `Error` frame instead.
//!
//! Node state is reached through the [`ExchangeBackend`] trait, which
//! the session object implements.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::StreamExt;
use libp2p::{PeerId, Stream, StreamProtocol};
use tokio::io::AsyncReadExt as _;
use tokio::task::JoinHandle;

use otternet_types::{CatalogItem, FileTransferMetadata, OtternetError, Result};

use crate::envelope::{
    encode_frame, read_frame, stream_error, write_encoded, write_frame, ErrorCode, ExchangeRequest,
    ExchangeResponse,
};
use crate::handle::NetworkHandle;
use crate::identity::parse_peer_id;
use crate::protocol::{
    format_price, is_liveness_request, parse_proxy_request, KnownPeers, ProxyReply,
    WalletAddress, CATALOG_REQUEST_PROTOCOL, EXCHANGE_PROTOCOL, FILE_REQUEST_PROTOCOL,
    LIVENESS_PROTOCOL, LIVENESS_REPLY, MAX_REQUEST_LINE, PEER_EXCHANGE_PROTOCOL,
    PRICE_REQUEST_PROTOCOL, PROXY_CONNECTED_MESSAGE, PROXY_CONNECT_PROTOCOL,
    PROXY_DISCONNECTED_MESSAGE, PROXY_DISCONNECT_PROTOCOL,
};

/// Chunk size used when streaming file contents.
pub const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Number of `(peer, session, seq)` triples remembered for
/// known-peers deduplication.
pub const SEEN_MESSAGES_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// ExchangeBackend
// ---------------------------------------------------------------------------

/// Node state consulted by the inbound handlers.
pub trait ExchangeBackend: Send + Sync + 'static {
    /// Wallet address paid for downloads from this node.
    fn wallet_address(&self) -> String;

    /// Catalog items owned by this node's wallet.
    fn catalog(&self) -> Result<Vec<CatalogItem>>;

    /// Looks up a hosted file by content hash.
    fn lookup(&self, file_hash: &str) -> Result<Option<CatalogItem>>;

    /// Adds `bytes` to the bytes-uploaded counter.
    fn record_upload(&self, bytes: u64) -> Result<()>;

    fn authorize_client(&self, client_addr: &str);

    fn deauthorize_client(&self, client_addr: &str);

    /// Called with the valid peer ids received through peer exchange.
    fn known_peers_received(&self, from: &PeerId, peers: &[PeerId]);
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Registers the file, price, catalog, liveness, proxy and framed
/// exchange protocols. Returns the accept-loop tasks.
///
/// # Errors
///
/// Returns `OtternetError::ConfigError` if one of the protocols already
/// has a handler.
pub fn spawn_exchange_handlers(
    handle: &NetworkHandle,
    backend: Arc<dyn ExchangeBackend>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut control = handle.stream_control();
    let mut tasks = Vec::with_capacity(7);

    let b = Arc::clone(&backend);
    tasks.push(serve(&mut control, FILE_REQUEST_PROTOCOL, move |_, s| {
        serve_file(Arc::clone(&b), s)
    })?);

    let b = Arc::clone(&backend);
    tasks.push(serve(&mut control, PRICE_REQUEST_PROTOCOL, move |_, s| {
        serve_price(Arc::clone(&b), s)
    })?);

    let b = Arc::clone(&backend);
    tasks.push(serve(&mut control, CATALOG_REQUEST_PROTOCOL, move |_, s| {
        serve_catalog(Arc::clone(&b), s)
    })?);

    let b = Arc::clone(&backend);
    tasks.push(serve(&mut control, LIVENESS_PROTOCOL, move |_, s| {
        serve_liveness(Arc::clone(&b), s)
    })?);

    let b = Arc::clone(&backend);
    tasks.push(serve(&mut control, PROXY_CONNECT_PROTOCOL, move |_, s| {
        serve_proxy(Arc::clone(&b), s, ProxyAction::Connect)
    })?);

    let b = Arc::clone(&backend);
    tasks.push(serve(&mut control, PROXY_DISCONNECT_PROTOCOL, move |_, s| {
        serve_proxy(Arc::clone(&b), s, ProxyAction::Disconnect)
    })?);

    let seen = Arc::new(Mutex::new(SeenMessages::new(SEEN_MESSAGES_CAPACITY)));
    let h = handle.clone();
    tasks.push(serve(&mut control, EXCHANGE_PROTOCOL, move |peer, s| {
        serve_framed(h.clone(), Arc::clone(&backend), Arc::clone(&seen), peer, s)
    })?);

    tracing::info!(protocols = tasks.len(), "exchange handlers registered");
    Ok(tasks)
}

/// Registers the `/orcanet/p2p` peer-exchange protocol.
///
/// # Errors
///
/// Returns `OtternetError::ConfigError` if the protocol already has a
/// handler.
pub fn spawn_peer_exchange_handler(
    handle: &NetworkHandle,
    backend: Arc<dyn ExchangeBackend>,
) -> Result<JoinHandle<()>> {
    let mut control = handle.stream_control();
    let h = handle.clone();
    serve(&mut control, PEER_EXCHANGE_PROTOCOL, move |peer, s| {
        serve_peer_exchange(h.clone(), Arc::clone(&backend), peer, s)
    })
}

/// Starts the accept loop for `protocol`, serving each stream with
/// `serve_one` in its own task.
fn serve<F, Fut>(
    control: &mut libp2p_stream::Control,
    protocol: StreamProtocol,
    serve_one: F,
) -> Result<JoinHandle<()>>
where
    F: Fn(PeerId, Stream) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut incoming = control
        .accept(protocol.clone())
        .map_err(|e| OtternetError::ConfigError {
            reason: format!("cannot register {protocol}: {e}"),
        })?;

    Ok(tokio::spawn(async move {
        while let Some((peer, stream)) = incoming.next().await {
            tracing::debug!(%peer, %protocol, "inbound stream");
            let fut = serve_one(peer, stream);
            let protocol = protocol.clone();
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    tracing::warn!(%peer, %protocol, %e, "stream handler failed");
                }
            });
        }
        tracing::debug!(%protocol, "accept loop stopped");
    }))
}

// ---------------------------------------------------------------------------
// Legacy protocols
// ---------------------------------------------------------------------------

async fn serve_file(backend: Arc<dyn ExchangeBackend>, mut stream: Stream) -> Result<()> {
    let hash = read_request_line(&mut stream).await?;
    let hash = hash.trim();

    let Some(item) = backend.lookup(hash)? else {
        tracing::warn!(%hash, "file request for unknown hash");
        return close(&mut stream).await;
    };
    let mut file = open_hosted_file(&item).await?;

    let metadata = FileTransferMetadata::from(&item);
    write_json(&mut stream, &metadata).await?;
    write_json(&mut stream, &WalletAddress::for_wire(&backend.wallet_address())).await?;

    let sent = copy_file(&mut file, &mut stream, None).await?;
    close(&mut stream).await?;

    tracing::info!(%hash, bytes = sent, "file sent");
    backend.record_upload(sent)
}

async fn serve_price(backend: Arc<dyn ExchangeBackend>, mut stream: Stream) -> Result<()> {
    let hash = read_request_line(&mut stream).await?;
    let hash = hash.trim();

    match backend.lookup(hash)? {
        Some(item) => {
            stream
                .write_all(format_price(item.price).as_bytes())
                .await
                .map_err(stream_error)?;
        }
        None => tracing::warn!(%hash, "price request for unknown hash"),
    }
    close(&mut stream).await
}

async fn serve_catalog(backend: Arc<dyn ExchangeBackend>, mut stream: Stream) -> Result<()> {
    // The request body carries nothing; answer without reading it.
    let items = backend.catalog()?;
    write_json(&mut stream, &items).await?;
    close(&mut stream).await
}

async fn serve_liveness(backend: Arc<dyn ExchangeBackend>, mut stream: Stream) -> Result<()> {
    let line = read_request_line(&mut stream).await?;
    if !is_liveness_request(&line) {
        tracing::warn!(request = %line.trim(), "invalid liveness request");
        return close(&mut stream).await;
    }

    if !backend.catalog()?.is_empty() {
        stream
            .write_all(LIVENESS_REPLY.as_bytes())
            .await
            .map_err(stream_error)?;
    }
    close(&mut stream).await
}

#[derive(Clone, Copy, Debug)]
enum ProxyAction {
    Connect,
    Disconnect,
}

impl ProxyAction {
    fn apply(self, backend: &dyn ExchangeBackend, client_addr: &str) -> &'static str {
        match self {
            Self::Connect => {
                backend.authorize_client(client_addr);
                tracing::info!(%client_addr, "client connected to proxy");
                PROXY_CONNECTED_MESSAGE
            }
            Self::Disconnect => {
                backend.deauthorize_client(client_addr);
                tracing::info!(%client_addr, "client disconnected from proxy");
                PROXY_DISCONNECTED_MESSAGE
            }
        }
    }
}

async fn serve_proxy(
    backend: Arc<dyn ExchangeBackend>,
    mut stream: Stream,
    action: ProxyAction,
) -> Result<()> {
    let line = read_request_line(&mut stream).await?;
    let Some(client_addr) = parse_proxy_request(&line) else {
        tracing::warn!(?action, "malformed proxy request");
        return close(&mut stream).await;
    };

    let message = action.apply(backend.as_ref(), &client_addr);
    let mut reply = serde_json::to_vec(&ProxyReply {
        message: message.to_owned(),
    })
    .map_err(encode_error)?;
    reply.push(b'\n');
    stream.write_all(&reply).await.map_err(stream_error)?;
    close(&mut stream).await
}

async fn serve_peer_exchange(
    handle: NetworkHandle,
    backend: Arc<dyn ExchangeBackend>,
    peer: PeerId,
    mut stream: Stream,
) -> Result<()> {
    let line = read_request_line(&mut stream).await?;
    close(&mut stream).await?;

    let message: KnownPeers =
        serde_json::from_str(line.trim()).map_err(|e| OtternetError::ProtocolError {
            reason: format!("invalid known-peers message: {e}"),
        })?;
    let ids: Vec<String> = message.known_peers.into_iter().map(|p| p.peer_id).collect();
    accept_known_peers(&handle, backend.as_ref(), peer, &ids).await;
    Ok(())
}

/// Reports the usable ids in `ids` to the backend and connects to each
/// through a relay. Relays and the local peer are skipped.
async fn accept_known_peers(
    handle: &NetworkHandle,
    backend: &dyn ExchangeBackend,
    from: PeerId,
    ids: &[String],
) {
    let local = handle.local_peer_id();
    let mut peers = Vec::with_capacity(ids.len());
    for id in ids {
        match parse_peer_id(id) {
            Ok(peer_id) if peer_id == local || handle.is_relay(&peer_id) => {}
            Ok(peer_id) => {
                if !peers.contains(&peer_id) {
                    peers.push(peer_id);
                }
            }
            Err(e) => tracing::debug!(%from, %e, "skipping invalid known peer"),
        }
    }

    tracing::info!(%from, count = peers.len(), "received known peers");
    if peers.is_empty() {
        return;
    }
    backend.known_peers_received(&from, &peers);

    for peer_id in &peers {
        match handle.connect_to_peer_using_relay(&peer_id.to_string()).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(%peer_id, "no relay circuit to known peer"),
            Err(e) => tracing::debug!(%peer_id, %e, "relay connect failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Framed exchange protocol
// ---------------------------------------------------------------------------

async fn serve_framed(
    handle: NetworkHandle,
    backend: Arc<dyn ExchangeBackend>,
    seen: Arc<Mutex<SeenMessages>>,
    peer: PeerId,
    mut stream: Stream,
) -> Result<()> {
    loop {
        let request = match read_frame::<_, ExchangeRequest>(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%peer, %e, "malformed exchange frame");
                write_frame(&mut stream, &ExchangeResponse::from_error(&e)).await?;
                break;
            }
        };
        tracing::debug!(%peer, kind = request.kind(), "exchange request");

        if let ExchangeRequest::File { hash } = &request {
            serve_framed_file(backend.as_ref(), &mut stream, hash).await?;
            continue;
        }

        let response = match framed_response(&handle, &backend, &seen, peer, request) {
            Ok(response) => response,
            Err(e) => ExchangeResponse::from_error(&e),
        };
        write_response(&mut stream, &response).await?;
    }
    close(&mut stream).await
}

/// Writes `response`, replacing it with an `internal` error frame when
/// it does not fit in one frame.
async fn write_response<S>(stream: &mut S, response: &ExchangeResponse) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = match encode_frame(response) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(%e, "exchange response does not fit in a frame");
            encode_frame(&ExchangeResponse::Error {
                code: ErrorCode::Internal,
                reason: e.to_string(),
            })?
        }
    };
    write_encoded(stream, &body).await
}

fn framed_response(
    handle: &NetworkHandle,
    backend: &Arc<dyn ExchangeBackend>,
    seen: &Mutex<SeenMessages>,
    peer: PeerId,
    request: ExchangeRequest,
) -> Result<ExchangeResponse> {
    match request {
        ExchangeRequest::Price { hash } => match backend.lookup(hash.trim())? {
            Some(item) => Ok(ExchangeResponse::Price { price: item.price }),
            None => Err(unknown_hash(&hash)),
        },
        ExchangeRequest::Catalog => Ok(ExchangeResponse::Catalog {
            items: backend.catalog()?,
        }),
        ExchangeRequest::Liveness => Ok(ExchangeResponse::Liveness {
            active: !backend.catalog()?.is_empty(),
        }),
        ExchangeRequest::ProxyConnect { client_addr } => {
            proxy_response(backend.as_ref(), &client_addr, ProxyAction::Connect)
        }
        ExchangeRequest::ProxyDisconnect { client_addr } => {
            proxy_response(backend.as_ref(), &client_addr, ProxyAction::Disconnect)
        }
        ExchangeRequest::KnownPeers {
            session,
            seq,
            peers,
        } => {
            let fresh = seen
                .lock()
                .map_err(|_| OtternetError::ProtocolError {
                    reason: "seen-message set poisoned".into(),
                })?
                .insert(peer, session, seq);
            if fresh {
                let handle = handle.clone();
                let backend = Arc::clone(backend);
                tokio::spawn(async move {
                    accept_known_peers(&handle, backend.as_ref(), peer, &peers).await;
                });
            } else {
                tracing::debug!(%peer, session, seq, "duplicate known-peers message");
            }
            Ok(ExchangeResponse::Ack { session, seq })
        }
        ExchangeRequest::File { hash } => Err(OtternetError::ProtocolError {
            reason: format!("file request for {hash} must be streamed"),
        }),
    }
}

fn proxy_response(
    backend: &dyn ExchangeBackend,
    client_addr: &str,
    action: ProxyAction,
) -> Result<ExchangeResponse> {
    let client_addr = parse_proxy_request(client_addr).ok_or_else(|| {
        OtternetError::ProtocolError {
            reason: "empty client address".into(),
        }
    })?;
    Ok(ExchangeResponse::Proxy {
        message: action.apply(backend, &client_addr).to_owned(),
    })
}

async fn serve_framed_file<S>(backend: &dyn ExchangeBackend, stream: &mut S, hash: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let item = match backend.lookup(hash.trim()) {
        Ok(Some(item)) => item,
        Ok(None) => return write_frame(stream, &ExchangeResponse::from_error(&unknown_hash(hash))).await,
        Err(e) => return write_frame(stream, &ExchangeResponse::from_error(&e)).await,
    };

    let (mut file, size) = match open_with_size(&item).await {
        Ok(v) => v,
        Err(e) => return write_frame(stream, &ExchangeResponse::from_error(&e)).await,
    };

    let header = ExchangeResponse::FileHeader {
        metadata: FileTransferMetadata::from(&item),
        wallet: backend.wallet_address(),
        size,
    };
    write_response(stream, &header).await?;

    let sent = copy_file(&mut file, stream, Some(size)).await?;
    if sent != size {
        return Err(OtternetError::StorageError {
            reason: format!("{} shrank during transfer ({sent} of {size} bytes)", item.file_path),
        });
    }
    stream.flush().await.map_err(stream_error)?;
    backend.record_upload(sent)
}

// ---------------------------------------------------------------------------
// Known-peers deduplication
// ---------------------------------------------------------------------------

/// Bounded FIFO set of `(peer, session, seq)` triples.
#[derive(Debug)]
pub struct SeenMessages {
    capacity: usize,
    order: VecDeque<(PeerId, u64, u64)>,
    members: HashSet<(PeerId, u64, u64)>,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Records the triple. Returns `false` if it was already present.
    pub fn insert(&mut self, peer: PeerId, session: u64, seq: u64) -> bool {
        let key = (peer, session, seq);
        if !self.members.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Reads bytes up to (not including) `\n` or end of stream.
///
/// # Errors
///
/// - `OtternetError::ProtocolError` if the line exceeds
///   [`MAX_REQUEST_LINE`] bytes or is not UTF-8.
/// - `OtternetError::NetworkError` on a read failure.
pub async fn read_request_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await.map_err(stream_error)?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        if line.len() == MAX_REQUEST_LINE {
            return Err(OtternetError::ProtocolError {
                reason: format!("request line exceeds {MAX_REQUEST_LINE} bytes"),
            });
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).map_err(|e| OtternetError::ProtocolError {
        reason: format!("request line is not UTF-8: {e}"),
    })
}

async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let body = serde_json::to_vec(value).map_err(encode_error)?;
    writer.write_all(&body).await.map_err(stream_error)
}

async fn open_hosted_file(item: &CatalogItem) -> Result<tokio::fs::File> {
    tokio::fs::File::open(&item.file_path)
        .await
        .map_err(|e| OtternetError::StorageError {
            reason: format!("cannot open {}: {e}", item.file_path),
        })
}

async fn open_with_size(item: &CatalogItem) -> Result<(tokio::fs::File, u64)> {
    let file = open_hosted_file(item).await?;
    let metadata = file.metadata().await.map_err(|e| OtternetError::StorageError {
        reason: format!("cannot stat {}: {e}", item.file_path),
    })?;
    Ok((file, metadata.len()))
}

/// Streams `file` into `writer`, stopping after `limit` bytes when set.
/// Returns the number of bytes written.
async fn copy_file<W>(file: &mut tokio::fs::File, writer: &mut W, limit: Option<u64>) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let want = match limit {
            Some(limit) if limit - sent < buf.len() as u64 => (limit - sent) as usize,
            _ => buf.len(),
        };
        if want == 0 {
            break;
        }
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| OtternetError::StorageError {
                reason: format!("file read failed: {e}"),
            })?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.map_err(stream_error)?;
        sent += n as u64;
    }
    Ok(sent)
}

async fn close<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.close().await.map_err(stream_error)
}

fn unknown_hash(hash: &str) -> OtternetError {
    OtternetError::NotFound {
        reason: format!("no hosted file with hash {}", hash.trim()),
    }
}

fn encode_error(e: serde_json::Error) -> OtternetError {
    OtternetError::ProtocolError {
        reason: format!("failed to encode response: {e}"),
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
    async fn request_line_stops_at_newline() {
        let mut cursor = Cursor::new(b"abc\ntrailing".to_vec());
        assert_eq!(read_request_line(&mut cursor).await.unwrap(), "abc");
        assert_eq!(read_request_line(&mut cursor).await.unwrap(), "trailing");
        assert_eq!(read_request_line(&mut cursor).await.unwrap(), "");
    }

    #[tokio::test]
    async fn request_line_is_bounded() {
        let mut cursor = Cursor::new(vec![b'x'; MAX_REQUEST_LINE + 1]);
        assert!(matches!(
            read_request_line(&mut cursor).await,
            Err(OtternetError::ProtocolError { .. })
        ));

        let mut exact = vec![b'x'; MAX_REQUEST_LINE];
        exact.push(b'\n');
        let line = read_request_line(&mut Cursor::new(exact)).await.unwrap();
        assert_eq!(line.len(), MAX_REQUEST_LINE);
    }

    #[tokio::test]
    async fn request_line_rejects_invalid_utf8() {
        let mut cursor = Cursor::new(vec![0xff, 0xfe, b'\n']);
        assert!(matches!(
            read_request_line(&mut cursor).await,
            Err(OtternetError::ProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_response_becomes_internal_error() {
        let response = ExchangeResponse::Proxy {
            message: "x".repeat(crate::envelope::MAX_FRAME_LEN),
        };
        let mut buf = Vec::new();
        write_response(&mut buf, &response).await.unwrap();

        let frame: Option<ExchangeResponse> = read_frame(&mut Cursor::new(buf)).await.unwrap();
        assert!(matches!(
            frame,
            Some(ExchangeResponse::Error { code: ErrorCode::Internal, .. })
        ));
    }

    #[test]
    fn seen_messages_dedup_and_evict() {
        let a = PeerId::random();
        let b = PeerId::random();
        let mut seen = SeenMessages::new(2);

        assert!(seen.insert(a, 1, 1));
        assert!(!seen.insert(a, 1, 1));
        assert!(seen.insert(b, 1, 1));
        assert_eq!(seen.len(), 2);

        // Third entry pushes out (a, 1, 1).
        assert!(seen.insert(a, 1, 2));
        assert_eq!(seen.len(), 2);
        assert!(seen.insert(a, 1, 1));
    }
}
