//! Async front end of the swarm task.
//!
//! [`NetworkHandle`] is cheap to clone and may be used from any task.
//! Every method sends a [`NetworkCommand`] and waits for the reply
//! under a deadline. When the deadline expires the reply receiver is
//! dropped, which the swarm task notices on its next maintenance sweep
//! and cancels the underlying operation.

use std::future::Future;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId, Stream, StreamProtocol};
use tokio::sync::{mpsc, oneshot};

use otternet_types::{OtternetError, Result};

use crate::command::{NetworkCommand, ProviderInfo};
use crate::config::NetworkConfig;
use crate::identity::parse_peer_id;
use crate::nat::NatStatus;
use crate::relay::{build_relay_circuit_addr, extract_relay_peer_id};

/// Cloneable handle to the swarm task.
#[derive(Clone)]
pub struct NetworkHandle {
    local_peer_id: PeerId,
    command_tx: mpsc::Sender<NetworkCommand>,
    control: libp2p_stream::Control,
    request_timeout: Duration,
    dial_timeout: Duration,
    relay_nodes: Vec<Multiaddr>,
}

impl std::fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandle")
            .field("local_peer_id", &self.local_peer_id)
            .field("request_timeout", &self.request_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

impl NetworkHandle {
    pub(crate) fn new(
        local_peer_id: PeerId,
        command_tx: mpsc::Sender<NetworkCommand>,
        control: libp2p_stream::Control,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            local_peer_id,
            command_tx,
            control,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            dial_timeout: Duration::from_secs(config.dial_timeout_secs),
            relay_nodes: config.relay_nodes.clone(),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Default deadline for requests made through this handle.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Relay addresses from the configuration.
    pub fn relay_nodes(&self) -> &[Multiaddr] {
        &self.relay_nodes
    }

    /// Returns a stream control for registering inbound protocols or
    /// opening raw streams.
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    // -----------------------------------------------------------------------
    // Command plumbing
    // -----------------------------------------------------------------------

    /// Sends a command built by `make` and waits up to `timeout` for
    /// its reply.
    async fn request<T, F>(&self, what: &str, timeout: Duration, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> NetworkCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| network_stopped())?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(network_stopped()),
            Err(_) => Err(OtternetError::Timeout {
                reason: format!("{what} did not complete within {timeout:?}"),
            }),
        }
    }

    /// Like [`Self::request`] for commands whose reply is itself a
    /// `Result`.
    async fn try_request<T, F>(&self, what: &str, timeout: Duration, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> NetworkCommand,
    {
        self.request(what, timeout, make).await?
    }

    // -----------------------------------------------------------------------
    // DHT
    // -----------------------------------------------------------------------

    /// Adds the configured bootstrap nodes and starts a Kademlia
    /// bootstrap. Returns the routing table size once the query is
    /// under way; the refresh itself completes in the background,
    /// bounded by `kad_query_timeout_secs`.
    ///
    /// # Errors
    ///
    /// `DhtError` if a bootstrap node address is unusable or the query
    /// cannot start, `Timeout` if the swarm does not answer within the
    /// request timeout.
    pub async fn bootstrap(&self) -> Result<usize> {
        self.try_request("bootstrap", self.request_timeout, |reply| {
            NetworkCommand::Bootstrap { reply }
        })
        .await
    }

    /// Stores `value` under the namespaced `key`.
    ///
    /// # Errors
    ///
    /// `DhtError` if no peer accepted the record.
    pub async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let key = key.to_owned();
        self.try_request("put_value", self.request_timeout, |reply| {
            NetworkCommand::PutValue { key, value, reply }
        })
        .await
    }

    /// Looks up the namespaced `key`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no valid record exists.
    pub async fn get_value(&self, key: &str) -> Result<Vec<u8>> {
        let key = key.to_owned();
        self.try_request("get_value", self.request_timeout, |reply| {
            NetworkCommand::GetValue { key, reply }
        })
        .await
    }

    /// Announces this node as a provider of `key`.
    pub async fn provide_key(&self, key: &str) -> Result<()> {
        let key = key.to_owned();
        self.try_request("provide", self.request_timeout, |reply| {
            NetworkCommand::StartProviding { key, reply }
        })
        .await
    }

    /// Finds providers of `key`. An empty list is not an error.
    pub async fn find_providers(&self, key: &str) -> Result<Vec<ProviderInfo>> {
        self.find_providers_within(key, self.request_timeout).await
    }

    /// [`Self::find_providers`] with an explicit deadline.
    pub async fn find_providers_within(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Vec<ProviderInfo>> {
        let key = key.to_owned();
        self.try_request("find_providers", timeout, |reply| {
            NetworkCommand::FindProviders { key, reply }
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        self.request("connected_peers", self.request_timeout, |reply| {
            NetworkCommand::ConnectedPeers { reply }
        })
        .await
    }

    pub async fn listeners(&self) -> Result<Vec<Multiaddr>> {
        self.request("listeners", self.request_timeout, |reply| {
            NetworkCommand::Listeners { reply }
        })
        .await
    }

    pub async fn peer_addresses(&self, peer_id: PeerId) -> Result<Vec<Multiaddr>> {
        self.request("peer_addresses", self.request_timeout, |reply| {
            NetworkCommand::PeerAddresses { peer_id, reply }
        })
        .await
    }

    pub async fn nat_status(&self) -> Result<NatStatus> {
        self.request("nat_status", self.request_timeout, |reply| {
            NetworkCommand::NatStatus { reply }
        })
        .await
    }

    /// Dials `addr` (which must end in `/p2p/<peer_id>`) and waits for
    /// the connection.
    ///
    /// # Errors
    ///
    /// `NetworkError` if the dial fails, `Timeout` after the dial
    /// timeout.
    pub async fn dial(&self, addr: Multiaddr) -> Result<PeerId> {
        self.try_request("dial", self.dial_timeout, |reply| NetworkCommand::Dial {
            addr,
            reply,
        })
        .await
    }

    /// Connects to the peer at the textual multiaddr `addr`.
    ///
    /// Returns `Ok(false)` when the address is valid but the peer could
    /// not be reached.
    ///
    /// # Errors
    ///
    /// `ProtocolError` if `addr` is not a multiaddr ending in
    /// `/p2p/<peer_id>`.
    pub async fn connect_to_peer(&self, addr: &str) -> Result<bool> {
        let addr: Multiaddr = addr.trim().parse().map_err(|e| OtternetError::ProtocolError {
            reason: format!("invalid multiaddr '{addr}': {e}"),
        })?;
        if !matches!(addr.iter().last(), Some(libp2p::multiaddr::Protocol::P2p(_))) {
            return Err(OtternetError::ProtocolError {
                reason: format!("multiaddr {addr} has no /p2p/ suffix"),
            });
        }

        match self.dial(addr.clone()).await {
            Ok(peer_id) => {
                tracing::info!(%peer_id, %addr, "connected to peer");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(%addr, %e, "failed to connect to peer");
                Ok(false)
            }
        }
    }

    /// Connects to `peer_id` through each configured relay until one
    /// circuit succeeds.
    ///
    /// # Errors
    ///
    /// `ProtocolError` if `peer_id` does not parse.
    pub async fn connect_to_peer_using_relay(&self, peer_id: &str) -> Result<bool> {
        let target = parse_peer_id(peer_id)?;

        for relay in &self.relay_nodes {
            let circuit = build_relay_circuit_addr(relay, &target)?;
            match self.dial(circuit.clone()).await {
                Ok(_) => {
                    tracing::info!(peer_id = %target, %circuit, "connected via relay");
                    return Ok(true);
                }
                Err(e) => {
                    tracing::debug!(peer_id = %target, %circuit, %e, "relay circuit failed");
                }
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Relay reservations
    // -----------------------------------------------------------------------

    /// Reserves a slot on the relay at `relay_addr`.
    ///
    /// Dials the relay first, then listens on its circuit address and
    /// waits for the reservation to be accepted.
    ///
    /// # Errors
    ///
    /// `NetworkError` if the relay cannot be reached or refuses,
    /// `Timeout` if it does not answer in time.
    pub async fn make_reservation_on(&self, relay_addr: &Multiaddr) -> Result<PeerId> {
        self.dial(relay_addr.clone()).await?;
        let relay_addr = relay_addr.clone();
        self.try_request("relay reservation", self.request_timeout, |reply| {
            NetworkCommand::ListenOnRelay { relay_addr, reply }
        })
        .await
    }

    /// Reserves a slot on every configured relay. Returns the number of
    /// accepted reservations.
    ///
    /// # Errors
    ///
    /// `NetworkError` if relays are configured and none accepted.
    pub async fn make_reservation(&self) -> Result<usize> {
        if self.relay_nodes.is_empty() {
            return Ok(0);
        }

        let mut accepted = 0usize;
        let mut last_error = None;
        for relay in &self.relay_nodes {
            match self.make_reservation_on(relay).await {
                Ok(relay_peer_id) => {
                    tracing::info!(%relay_peer_id, "relay reservation accepted");
                    accepted += 1;
                }
                Err(e) => {
                    tracing::warn!(relay = %relay, %e, "relay reservation failed");
                    last_error = Some(e);
                }
            }
        }

        match (accepted, last_error) {
            (0, Some(e)) => Err(OtternetError::NetworkError {
                reason: format!("no relay accepted a reservation: {e}"),
            }),
            _ => Ok(accepted),
        }
    }

    /// Returns `true` if `peer_id` is one of the configured relays.
    pub fn is_relay(&self, peer_id: &PeerId) -> bool {
        self.relay_nodes
            .iter()
            .any(|addr| extract_relay_peer_id(addr).as_ref() == Some(peer_id))
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// Opens a stream to `peer_id` speaking `protocol`.
    ///
    /// # Errors
    ///
    /// `NetworkError` if the peer does not support the protocol or
    /// cannot be reached, `Timeout` after the request timeout.
    pub async fn open_stream(&self, peer_id: PeerId, protocol: StreamProtocol) -> Result<Stream> {
        let mut control = self.control.clone();
        let open = control.open_stream(peer_id, protocol.clone());
        let stream = with_deadline(self.request_timeout, "open stream", open)
            .await?
            .map_err(|e| OtternetError::NetworkError {
                reason: format!("failed to open {protocol} stream to {peer_id}: {e}"),
            })?;
        Ok(stream)
    }
}

/// Awaits `fut` with a deadline, mapping expiry to `Timeout`.
pub(crate) async fn with_deadline<F: Future>(
    timeout: Duration,
    what: &str,
    fut: F,
) -> Result<F::Output> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| OtternetError::Timeout {
            reason: format!("{what} did not complete within {timeout:?}"),
        })
}

fn network_stopped() -> OtternetError {
    OtternetError::NetworkError {
        reason: "network task is not running".into(),
    }
}
