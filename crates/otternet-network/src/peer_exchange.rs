//! Outbound side of peer exchange.
//!
//! The legacy form writes a single `{"known_peers":[...]}` line on
//! `/orcanet/p2p` and expects nothing back. The framed form tags every
//! message with `(session, seq)` so the receiver can acknowledge it and
//! drop retransmissions.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::io::AsyncReadExt;
use libp2p::PeerId;

use otternet_types::{OtternetError, Result};

use crate::envelope::{stream_error, ExchangeRequest, ExchangeResponse};
use crate::exchange::{framed_request, send_line};
use crate::handle::{with_deadline, NetworkHandle};
use crate::protocol::{KnownPeers, PEER_EXCHANGE_PROTOCOL};

/// Sends `peers` to `target` on the legacy peer-exchange protocol.
///
/// # Errors
///
/// `NetworkError` if the stream cannot be opened or written.
pub async fn send_known_peers(handle: &NetworkHandle, target: PeerId, peers: &[PeerId]) -> Result<()> {
    let line = serde_json::to_string(&KnownPeers::from_ids(peers.iter().map(PeerId::to_string)))
        .map_err(|e| OtternetError::ProtocolError {
            reason: format!("failed to encode known peers: {e}"),
        })?;

    with_deadline(handle.request_timeout(), "peer exchange", async {
        let mut stream = send_line(handle, target, PEER_EXCHANGE_PROTOCOL, &line).await?;
        // Wait for the remote close so the line is not cut short.
        let mut sink = Vec::new();
        stream.read_to_end(&mut sink).await.map_err(stream_error)?;
        Ok::<_, OtternetError>(())
    })
    .await??;

    tracing::debug!(%target, count = peers.len(), "sent known peers");
    Ok(())
}

/// Sender for framed known-peers messages.
///
/// One instance per process: `session` is random and `seq` increases
/// with every message, so a retransmission reuses the pair it was
/// first sent with.
#[derive(Debug)]
pub struct PeerExchange {
    session: u64,
    next_seq: AtomicU64,
}

impl Default for PeerExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerExchange {
    pub fn new() -> Self {
        Self {
            session: rand::random(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Allocates the next sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `peers` to `target` with a fresh sequence number. Returns
    /// the sequence number used.
    ///
    /// # Errors
    ///
    /// `ProtocolError` if the peer acknowledges a different message.
    pub async fn send(&self, handle: &NetworkHandle, target: PeerId, peers: &[PeerId]) -> Result<u64> {
        let seq = self.next_seq();
        self.resend(handle, target, seq, peers).await?;
        Ok(seq)
    }

    /// Sends `peers` under an existing sequence number.
    pub async fn resend(
        &self,
        handle: &NetworkHandle,
        target: PeerId,
        seq: u64,
        peers: &[PeerId],
    ) -> Result<()> {
        let request = ExchangeRequest::KnownPeers {
            session: self.session,
            seq,
            peers: peers.iter().map(PeerId::to_string).collect(),
        };
        match framed_request(handle, target, &request).await? {
            ExchangeResponse::Ack { session, seq: acked } if session == self.session && acked == seq => {
                Ok(())
            }
            other => Err(OtternetError::ProtocolError {
                reason: format!("unexpected reply to known peers: {other:?}"),
            }),
        }
    }
}
