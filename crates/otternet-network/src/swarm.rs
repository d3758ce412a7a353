//! High-level swarm wrapper for the Otternet network.
//!
//! [`OtternetSwarm`] owns the libp2p `Swarm` with the combined
//! [`OtternetBehaviour`]. It is driven by exactly one task through
//! [`OtternetSwarm::run`], which multiplexes swarm events, commands
//! from [`NetworkHandle`]s, a maintenance tick and a shutdown signal.
//!
//! Long-running operations (DHT queries, dials, relay reservations)
//! are tracked in pending maps keyed by their libp2p id and answered
//! when the matching swarm event arrives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::core::ConnectedPoint;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, NetworkBehaviour, SwarmEvent};
use libp2p::{
    autonat, dcutr, identify, kad, noise, relay, upnp, yamux, Multiaddr, PeerId, Swarm,
};
use tokio::sync::{mpsc, oneshot, watch};

use otternet_types::OtternetError;

use crate::command::{NetworkCommand, ProviderInfo};
use crate::config::NetworkConfig;
use crate::content_id::ContentId;
use crate::discovery::{
    build_discovery_behaviour, extract_peer_id, DiscoveryBehaviour, DiscoveryBehaviourEvent,
};
use crate::events::NetworkEvent;
use crate::handle::NetworkHandle;
use crate::hole_punch::{handle_dcutr_event, HolePunchOutcome};
use crate::identity::keypair_from_seed;
use crate::nat::{build_autonat_behaviour, build_upnp_behaviour, NatManager};
use crate::relay::{
    build_relay_listen_addr, build_relay_server_behaviour, is_relayed, log_relay_client_event,
    log_relay_server_event,
};
use crate::transport;
use crate::validator::{default_validator, namespaced_key, RecordValidator};

/// Convenience alias to avoid shadowing `std::result::Result`
/// which the `#[derive(NetworkBehaviour)]` macro requires.
type BResult<T> = std::result::Result<T, OtternetError>;

/// Capacity of the command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Interval of the maintenance sweep for abandoned operations.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Combined behaviour
// ---------------------------------------------------------------------------

/// Combined libp2p behaviour for Otternet.
#[derive(NetworkBehaviour)]
pub struct OtternetBehaviour {
    /// Kademlia + Identify.
    pub discovery: DiscoveryBehaviour,
    /// Reachability probing and the AutoNAT service.
    pub autonat: Toggle<autonat::Behaviour>,
    /// Circuit relay client (reservations, circuit dials).
    pub relay_client: relay::client::Behaviour,
    /// Circuit relay server.
    pub relay_server: Toggle<relay::Behaviour>,
    /// Hole punching over relayed connections.
    pub dcutr: dcutr::Behaviour,
    /// Gateway port mapping.
    pub upnp: Toggle<upnp::tokio::Behaviour>,
    /// Raw streams for the application protocols.
    pub stream: libp2p_stream::Behaviour,
}

fn build_combined_behaviour(
    key: &libp2p::identity::Keypair,
    relay_client: relay::client::Behaviour,
    config: &NetworkConfig,
) -> BResult<OtternetBehaviour> {
    let local_peer_id = PeerId::from(key.public());

    Ok(OtternetBehaviour {
        discovery: build_discovery_behaviour(key, config)?,
        autonat: Toggle::from(build_autonat_behaviour(
            local_peer_id,
            config.enable_autonat,
            config.autonat_confidence_max,
        )),
        relay_client,
        relay_server: Toggle::from(build_relay_server_behaviour(
            local_peer_id,
            config.enable_relay_server,
        )),
        dcutr: dcutr::Behaviour::new(local_peer_id),
        upnp: Toggle::from(build_upnp_behaviour(config.enable_upnp)),
        stream: libp2p_stream::Behaviour::new(),
    })
}

// ---------------------------------------------------------------------------
// Pending operations
// ---------------------------------------------------------------------------

enum PendingQuery {
    PutValue {
        key: String,
        reply: oneshot::Sender<BResult<()>>,
    },
    GetValue {
        key: String,
        values: Vec<Vec<u8>>,
        reply: oneshot::Sender<BResult<Vec<u8>>>,
    },
    Provide {
        content: ContentId,
        reply: oneshot::Sender<BResult<()>>,
    },
    FindProviders {
        content: ContentId,
        providers: Vec<PeerId>,
        reply: oneshot::Sender<BResult<Vec<ProviderInfo>>>,
    },
}

impl PendingQuery {
    fn is_abandoned(&self) -> bool {
        match self {
            Self::PutValue { reply, .. } | Self::Provide { reply, .. } => reply.is_closed(),
            Self::GetValue { reply, .. } => reply.is_closed(),
            Self::FindProviders { reply, .. } => reply.is_closed(),
        }
    }
}

struct PendingDial {
    peer_id: PeerId,
    reply: oneshot::Sender<BResult<PeerId>>,
}

struct PendingReservation {
    relay_peer_id: PeerId,
    reply: oneshot::Sender<BResult<PeerId>>,
}

// ---------------------------------------------------------------------------
// OtternetSwarm
// ---------------------------------------------------------------------------

/// Wrapper around `Swarm<OtternetBehaviour>` plus the bookkeeping for
/// in-flight operations.
pub struct OtternetSwarm {
    swarm: Swarm<OtternetBehaviour>,
    config: NetworkConfig,
    validator: Arc<dyn RecordValidator>,
    event_sender: mpsc::UnboundedSender<NetworkEvent>,
    nat: NatManager,
    /// Addresses learned for each peer. Entries are added, never removed.
    address_book: HashMap<PeerId, Vec<Multiaddr>>,
    pending_queries: HashMap<kad::QueryId, PendingQuery>,
    pending_dials: HashMap<ConnectionId, PendingDial>,
    pending_reservations: HashMap<ListenerId, PendingReservation>,
}

impl OtternetSwarm {
    /// Builds the swarm and starts listening on the configured
    /// addresses.
    ///
    /// Returns `(swarm, event_receiver)`.
    ///
    /// # Errors
    ///
    /// - `OtternetError::ConfigError` if the configuration is invalid.
    /// - `OtternetError::NetworkError` if the transport or behaviour
    ///   cannot be built, or if none of the listen addresses can be
    ///   bound.
    pub fn new(
        config: NetworkConfig,
        validator: Option<Arc<dyn RecordValidator>>,
    ) -> BResult<(Self, mpsc::UnboundedReceiver<NetworkEvent>)> {
        config.validate()?;
        let keypair = keypair_from_seed(&config.identity_seed)?;
        let validator = validator.unwrap_or_else(|| default_validator(&config.dht_namespace));

        let behaviour_config = config.clone();
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(transport::tcp_config(), noise::Config::new, yamux::Config::default)
            .map_err(|e| OtternetError::NetworkError {
                reason: format!("failed to configure TCP transport: {e}"),
            })?
            .with_quic()
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(|e| OtternetError::NetworkError {
                reason: format!("failed to configure relay client transport: {e}"),
            })?
            .with_behaviour(|key, relay_client| {
                build_combined_behaviour(key, relay_client, &behaviour_config)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            })
            .map_err(|e| OtternetError::NetworkError {
                reason: format!("failed to build network behaviour: {e}"),
            })?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(Duration::from_secs(config.idle_timeout_secs))
            })
            .build();

        let mut bound = 0usize;
        for addr in &config.listen_addrs {
            match swarm.listen_on(addr.clone()) {
                Ok(_) => bound += 1,
                Err(e) => tracing::warn!(%addr, %e, "failed to listen"),
            }
        }
        if bound == 0 {
            return Err(OtternetError::NetworkError {
                reason: "could not listen on any configured address".into(),
            });
        }

        tracing::info!(peer_id = %swarm.local_peer_id(), "otternet swarm created");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let me = Self {
            swarm,
            config,
            validator,
            event_sender: event_tx,
            nat: NatManager::new(),
            address_book: HashMap::new(),
            pending_queries: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_reservations: HashMap::new(),
        };
        Ok((me, event_rx))
    }

    /// Returns the local `PeerId` of this swarm.
    pub fn local_peer_id(&self) -> &PeerId {
        self.swarm.local_peer_id()
    }

    /// Creates the command channel and the cloneable handle that feeds it.
    pub fn handle(&self) -> (NetworkHandle, mpsc::Receiver<NetworkCommand>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = NetworkHandle::new(
            *self.swarm.local_peer_id(),
            command_tx,
            self.swarm.behaviour().stream.new_control(),
            &self.config,
        );
        (handle, command_rx)
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Runs the swarm until `shutdown` flips to `true` or every command
    /// sender is gone.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<NetworkCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.on_swarm_event(event);
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            tracing::debug!("all network handles dropped; stopping swarm");
                            break;
                        }
                    }
                }
                _ = maintenance.tick() => {
                    self.sweep_abandoned();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("swarm shutting down");
                        break;
                    }
                }
            }
        }

        self.fail_all_pending();
    }

    /// Executes one command.
    pub fn handle_command(&mut self, command: NetworkCommand) {
        if command.is_abandoned() {
            tracing::debug!(?command, "dropping command abandoned by caller");
            return;
        }

        match command {
            NetworkCommand::Bootstrap { reply } => self.start_bootstrap(reply),
            NetworkCommand::PutValue { key, value, reply } => {
                let key = namespaced_key(&self.config.dht_namespace, &key);
                match self.swarm.behaviour_mut().discovery.put_value(&key, value) {
                    Ok(id) => {
                        self.pending_queries.insert(id, PendingQuery::PutValue { key, reply });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            NetworkCommand::GetValue { key, reply } => {
                let key = namespaced_key(&self.config.dht_namespace, &key);
                let id = self.swarm.behaviour_mut().discovery.get_value(&key);
                self.pending_queries.insert(
                    id,
                    PendingQuery::GetValue {
                        key,
                        values: Vec::new(),
                        reply,
                    },
                );
            }
            NetworkCommand::StartProviding { key, reply } => {
                let content = ContentId::from_key(&key);
                match self.swarm.behaviour_mut().discovery.start_providing(&content) {
                    Ok(id) => {
                        self.pending_queries.insert(id, PendingQuery::Provide { content, reply });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            NetworkCommand::FindProviders { key, reply } => {
                let content = ContentId::from_key(&key);
                let id = self.swarm.behaviour_mut().discovery.get_providers(&content);
                self.pending_queries.insert(
                    id,
                    PendingQuery::FindProviders {
                        content,
                        providers: Vec::new(),
                        reply,
                    },
                );
            }
            NetworkCommand::Dial { addr, reply } => self.start_dial(addr, reply),
            NetworkCommand::ListenOnRelay { relay_addr, reply } => {
                self.start_reservation(relay_addr, reply)
            }
            NetworkCommand::ConnectedPeers { reply } => {
                let _ = reply.send(self.swarm.connected_peers().copied().collect());
            }
            NetworkCommand::Listeners { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            NetworkCommand::PeerAddresses { peer_id, reply } => {
                let _ = reply.send(self.address_book.get(&peer_id).cloned().unwrap_or_default());
            }
            NetworkCommand::NatStatus { reply } => {
                let _ = reply.send(self.nat.current_status().clone());
            }
        }
    }

    /// Cancels operations whose callers stopped waiting.
    ///
    /// Kademlia queries are finished so they stop consuming resources;
    /// relay listeners are removed. Dials cannot be cancelled and are
    /// only forgotten.
    pub fn sweep_abandoned(&mut self) {
        let abandoned: Vec<kad::QueryId> = self
            .pending_queries
            .iter()
            .filter(|(_, q)| q.is_abandoned())
            .map(|(id, _)| *id)
            .collect();
        for id in abandoned {
            self.pending_queries.remove(&id);
            if let Some(mut query) = self.swarm.behaviour_mut().discovery.kademlia.query_mut(&id) {
                query.finish();
            }
            tracing::debug!(?id, "cancelled abandoned DHT query");
        }

        self.pending_dials.retain(|_, d| !d.reply.is_closed());

        let abandoned: Vec<ListenerId> = self
            .pending_reservations
            .iter()
            .filter(|(_, r)| r.reply.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in abandoned {
            self.pending_reservations.remove(&id);
            self.swarm.remove_listener(id);
            tracing::debug!(?id, "removed abandoned relay listener");
        }
    }

    fn fail_all_pending(&mut self) {
        let stopped = || OtternetError::NetworkError {
            reason: "network stopped".into(),
        };
        for (_, query) in self.pending_queries.drain() {
            match query {
                PendingQuery::PutValue { reply, .. } | PendingQuery::Provide { reply, .. } => {
                    let _ = reply.send(Err(stopped()));
                }
                PendingQuery::GetValue { reply, .. } => {
                    let _ = reply.send(Err(stopped()));
                }
                PendingQuery::FindProviders { reply, .. } => {
                    let _ = reply.send(Err(stopped()));
                }
            }
        }
        for (_, dial) in self.pending_dials.drain() {
            let _ = dial.reply.send(Err(stopped()));
        }
        for (_, reservation) in self.pending_reservations.drain() {
            let _ = reservation.reply.send(Err(stopped()));
        }
    }

    // -----------------------------------------------------------------------
    // Command helpers
    // -----------------------------------------------------------------------

    fn start_bootstrap(&mut self, reply: oneshot::Sender<BResult<usize>>) {
        let nodes = self.config.bootstrap_nodes.clone();

        if let Err(e) = self.swarm.behaviour_mut().discovery.add_bootstrap_nodes(&nodes) {
            let _ = reply.send(Err(e));
            return;
        }

        if self.routing_table_size() == 0 {
            tracing::info!("routing table is empty; skipping Kademlia bootstrap");
            let _ = reply.send(Ok(0));
            return;
        }

        // The refresh walk runs in the background; its outcome is only
        // logged.
        let outcome = self.swarm.behaviour_mut().discovery.bootstrap().map(|id| {
            tracing::debug!(?id, "Kademlia bootstrap started");
            self.routing_table_size()
        });
        let _ = reply.send(outcome);
    }

    fn start_dial(&mut self, addr: Multiaddr, reply: oneshot::Sender<BResult<PeerId>>) {
        let Some(Protocol::P2p(peer_id)) = addr.iter().last() else {
            let _ = reply.send(Err(OtternetError::NetworkError {
                reason: format!("dial address {addr} does not end in /p2p/<peer_id>"),
            }));
            return;
        };

        if peer_id == *self.swarm.local_peer_id() {
            let _ = reply.send(Err(OtternetError::NetworkError {
                reason: "refusing to dial self".into(),
            }));
            return;
        }

        if self.swarm.is_connected(&peer_id) {
            if !is_relayed(&addr) {
                self.pin_address(peer_id, &addr);
            }
            let _ = reply.send(Ok(peer_id));
            return;
        }

        let opts = DialOpts::peer_id(peer_id).addresses(vec![addr.clone()]).build();
        let connection_id = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                tracing::debug!(%peer_id, %addr, ?connection_id, "dialing");
                self.pending_dials.insert(connection_id, PendingDial { peer_id, reply });
            }
            Err(e) => {
                let _ = reply.send(Err(OtternetError::NetworkError {
                    reason: format!("failed to dial {addr}: {e}"),
                }));
            }
        }
    }

    fn start_reservation(&mut self, relay_addr: Multiaddr, reply: oneshot::Sender<BResult<PeerId>>) {
        let (relay_peer_id, listen_addr) = match build_relay_listen_addr(&relay_addr) {
            Ok(v) => v,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        match self.swarm.listen_on(listen_addr.clone()) {
            Ok(listener_id) => {
                tracing::info!(%relay_peer_id, %listen_addr, "requesting relay reservation");
                self.pending_reservations.insert(
                    listener_id,
                    PendingReservation {
                        relay_peer_id,
                        reply,
                    },
                );
            }
            Err(e) => {
                let _ = reply.send(Err(OtternetError::NetworkError {
                    reason: format!("failed to listen on relay {relay_addr}: {e}"),
                }));
            }
        }
    }

    /// Pins a direct address for `peer_id` in the address book and the
    /// Kademlia routing table.
    fn pin_address(&mut self, peer_id: PeerId, addr: &Multiaddr) {
        let clean = match extract_peer_id(addr) {
            Some((_, clean)) => clean,
            None => addr.clone(),
        };
        if clean.is_empty() {
            return;
        }
        let entry = self.address_book.entry(peer_id).or_default();
        if !entry.contains(&clean) {
            entry.push(clean.clone());
        }
        self.swarm
            .behaviour_mut()
            .discovery
            .add_address(&peer_id, clean);
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.event_sender.send(event);
    }

    // -----------------------------------------------------------------------
    // Swarm events
    // -----------------------------------------------------------------------

    fn on_swarm_event(&mut self, event: SwarmEvent<OtternetBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { listener_id, address } => {
                tracing::info!(%address, ?listener_id, "new listen address");
                self.emit(NetworkEvent::ListeningOn(address));
            }

            SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                if let Some(pending) = self.pending_reservations.remove(&listener_id) {
                    let reason = match reason {
                        Ok(()) => "listener closed".to_owned(),
                        Err(e) => e.to_string(),
                    };
                    tracing::warn!(relay = %pending.relay_peer_id, %reason, "relay reservation failed");
                    let _ = pending.reply.send(Err(OtternetError::NetworkError {
                        reason: format!("relay reservation failed: {reason}"),
                    }));
                } else {
                    tracing::debug!(?listener_id, ?reason, "listener closed");
                }
            }

            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                let address = match &endpoint {
                    ConnectedPoint::Dialer { address, .. } => address.clone(),
                    ConnectedPoint::Listener { send_back_addr, .. } => send_back_addr.clone(),
                };
                let relayed = endpoint.is_relayed();
                tracing::info!(%peer_id, %address, relayed, num_established, "connection established");

                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    if endpoint.is_dialer() && !relayed {
                        self.pin_address(pending.peer_id, &address);
                    }
                    let _ = pending.reply.send(Ok(peer_id));
                }

                self.emit(NetworkEvent::PeerConnected {
                    peer_id,
                    address,
                    relayed,
                });
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                cause,
                num_established,
                ..
            } => {
                tracing::debug!(%peer_id, ?cause, num_established, "connection closed");
                if num_established == 0 {
                    self.emit(NetworkEvent::PeerDisconnected(peer_id));
                }
            }

            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                tracing::warn!(?peer_id, %error, "outgoing connection error");
                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    let _ = pending.reply.send(Err(OtternetError::NetworkError {
                        reason: format!("dial to {} failed: {error}", pending.peer_id),
                    }));
                }
            }

            SwarmEvent::IncomingConnectionError {
                local_addr,
                send_back_addr,
                error,
                ..
            } => {
                tracing::debug!(%local_addr, %send_back_addr, %error, "incoming connection error");
            }

            SwarmEvent::ExternalAddrConfirmed { address } => {
                tracing::info!(%address, "external address confirmed");
            }

            SwarmEvent::Behaviour(event) => self.on_behaviour_event(event),

            other => {
                tracing::trace!(?other, "unhandled swarm event");
            }
        }
    }

    fn on_behaviour_event(&mut self, event: OtternetBehaviourEvent) {
        match event {
            OtternetBehaviourEvent::Discovery(DiscoveryBehaviourEvent::Kademlia(ev)) => {
                self.on_kademlia_event(ev);
            }
            OtternetBehaviourEvent::Discovery(DiscoveryBehaviourEvent::Identify(ev)) => {
                self.on_identify_event(ev);
            }
            OtternetBehaviourEvent::Autonat(ev) => {
                if let Some(status) = self.nat.on_autonat_event(ev) {
                    self.emit(NetworkEvent::NatStatusChanged(status));
                }
            }
            OtternetBehaviourEvent::RelayClient(ev) => {
                log_relay_client_event(&ev);
                if let relay::client::Event::ReservationReqAccepted { relay_peer_id, .. } = ev {
                    self.resolve_reservation(relay_peer_id);
                    self.emit(NetworkEvent::ReservationAccepted { relay_peer_id });
                }
            }
            OtternetBehaviourEvent::RelayServer(ev) => log_relay_server_event(&ev),
            OtternetBehaviourEvent::Dcutr(ev) => {
                if let HolePunchOutcome::Direct(peer_id) = handle_dcutr_event(ev) {
                    self.emit(NetworkEvent::HolePunched(peer_id));
                }
            }
            OtternetBehaviourEvent::Upnp(ev) => {
                if let Some(addr) = self.nat.on_upnp_event(ev) {
                    self.swarm.add_external_address(addr);
                }
            }
            OtternetBehaviourEvent::Stream(()) => {}
        }
    }

    fn resolve_reservation(&mut self, relay_peer_id: PeerId) {
        let accepted: Vec<ListenerId> = self
            .pending_reservations
            .iter()
            .filter(|(_, r)| r.relay_peer_id == relay_peer_id)
            .map(|(id, _)| *id)
            .collect();
        for id in accepted {
            if let Some(pending) = self.pending_reservations.remove(&id) {
                let _ = pending.reply.send(Ok(relay_peer_id));
            }
        }
    }

    fn on_identify_event(&mut self, event: identify::Event) {
        match event {
            identify::Event::Received { peer_id, info, .. } => {
                tracing::debug!(
                    %peer_id,
                    agent_version = %info.agent_version,
                    listen_addrs = ?info.listen_addrs,
                    "identify: received peer info"
                );
                let speaks_kad = info
                    .protocols
                    .iter()
                    .any(|p| p.as_ref() == self.config.kad_protocol);
                for addr in info.listen_addrs {
                    if is_relayed(&addr) {
                        continue;
                    }
                    if speaks_kad {
                        self.swarm
                            .behaviour_mut()
                            .discovery
                            .add_address(&peer_id, addr.clone());
                    }
                    let entry = self.address_book.entry(peer_id).or_default();
                    if !entry.contains(&addr) {
                        entry.push(addr);
                    }
                }
            }
            identify::Event::Error { peer_id, error, .. } => {
                tracing::debug!(%peer_id, %error, "identify: error");
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Kademlia
    // -----------------------------------------------------------------------

    fn on_kademlia_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed { id, result, step, .. } => {
                self.on_query_progress(id, result, step.last);
            }
            kad::Event::InboundRequest { request } => self.on_inbound_request(request),
            kad::Event::RoutingUpdated { peer, addresses, .. } => {
                tracing::debug!(%peer, ?addresses, "routing table updated");
                let entry = self.address_book.entry(peer).or_default();
                for addr in addresses.iter() {
                    if !entry.contains(addr) {
                        entry.push(addr.clone());
                    }
                }
            }
            kad::Event::ModeChanged { new_mode } => {
                tracing::info!(%new_mode, "Kademlia mode changed");
            }
            other => {
                tracing::trace!(?other, "other Kademlia event");
            }
        }
    }

    fn on_inbound_request(&mut self, request: kad::InboundRequest) {
        match request {
            kad::InboundRequest::PutRecord {
                source,
                record: Some(record),
                ..
            } => {
                let key = String::from_utf8_lossy(record.key.as_ref()).into_owned();
                match self.validator.validate(&key, &record.value) {
                    Ok(()) => {
                        if let Err(e) = self.swarm.behaviour_mut().discovery.store_inbound_record(record) {
                            tracing::warn!(%source, %key, %e, "failed to store inbound record");
                        } else {
                            tracing::debug!(%source, %key, "stored inbound record");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%source, %key, %e, "rejected inbound record");
                    }
                }
            }
            kad::InboundRequest::AddProvider {
                record: Some(record),
            } => {
                if let Err(e) = self.swarm.behaviour_mut().discovery.store_inbound_provider(record) {
                    tracing::warn!(%e, "failed to store inbound provider record");
                }
            }
            other => {
                tracing::trace!(?other, "Kademlia inbound request");
            }
        }
    }

    fn on_query_progress(&mut self, id: kad::QueryId, result: kad::QueryResult, last: bool) {
        if let kad::QueryResult::Bootstrap(progress) = &result {
            match progress {
                Ok(kad::BootstrapOk { peer, num_remaining }) => {
                    tracing::debug!(?id, %peer, num_remaining, "bootstrap progress");
                }
                Err(e) => tracing::warn!(?id, ?e, "bootstrap step failed"),
            }
            if last {
                let known = self.routing_table_size();
                tracing::info!(known, "Kademlia bootstrap finished");
            }
            return;
        }

        let Some(pending) = self.pending_queries.remove(&id) else {
            tracing::trace!(?id, last, "progress for untracked query");
            return;
        };

        // Every arm either re-inserts the pending entry (more results
        // expected) or answers it.
        match (pending, result) {
            (PendingQuery::PutValue { key, reply }, kad::QueryResult::PutRecord(result)) => {
                let outcome = result.map(|_| ()).map_err(|e| OtternetError::DhtError {
                    reason: format!("put {key} failed: {e:?}"),
                });
                let _ = reply.send(outcome);
            }

            (
                PendingQuery::GetValue { key, mut values, reply },
                kad::QueryResult::GetRecord(result),
            ) => {
                if let Ok(kad::GetRecordOk::FoundRecord(kad::PeerRecord { record, peer })) = &result {
                    match self.validator.validate(&key, &record.value) {
                        Ok(()) => values.push(record.value.clone()),
                        Err(e) => tracing::debug!(?peer, %key, %e, "discarding invalid record"),
                    }
                }
                if last {
                    let _ = reply.send(self.select_value(&key, values));
                } else {
                    self.pending_queries
                        .insert(id, PendingQuery::GetValue { key, values, reply });
                }
            }

            (PendingQuery::Provide { content, reply }, kad::QueryResult::StartProviding(result)) => {
                let outcome = match result {
                    Ok(_) => {
                        tracing::info!(%content, "now providing");
                        Ok(())
                    }
                    Err(e) => Err(OtternetError::DhtError {
                        reason: format!("provide {content} failed: {e:?}"),
                    }),
                };
                let _ = reply.send(outcome);
            }

            (
                PendingQuery::FindProviders { content, mut providers, reply },
                kad::QueryResult::GetProviders(result),
            ) => {
                match result {
                    Ok(kad::GetProvidersOk::FoundProviders { providers: found, .. }) => {
                        for p in found {
                            if !providers.contains(&p) {
                                providers.push(p);
                            }
                        }
                    }
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                    Err(e) => tracing::debug!(%content, ?e, "provider lookup ended with error"),
                }
                if last {
                    let infos = providers
                        .into_iter()
                        .map(|peer_id| ProviderInfo {
                            addrs: self.address_book.get(&peer_id).cloned().unwrap_or_default(),
                            peer_id,
                        })
                        .collect();
                    let _ = reply.send(Ok(infos));
                } else {
                    self.pending_queries.insert(
                        id,
                        PendingQuery::FindProviders {
                            content,
                            providers,
                            reply,
                        },
                    );
                }
            }

            (pending, other) => {
                tracing::warn!(?id, ?other, "query result does not match pending operation");
                if !last {
                    self.pending_queries.insert(id, pending);
                }
            }
        }
    }

    fn select_value(&self, key: &str, values: Vec<Vec<u8>>) -> BResult<Vec<u8>> {
        if values.is_empty() {
            return Err(OtternetError::NotFound {
                reason: format!("no record for {key}"),
            });
        }
        let index = self.validator.select(key, &values)?;
        values
            .into_iter()
            .nth(index)
            .ok_or_else(|| OtternetError::DhtError {
                reason: format!("validator selected out-of-range index {index} for {key}"),
            })
    }

    fn routing_table_size(&mut self) -> usize {
        self.swarm
            .behaviour_mut()
            .discovery
            .kademlia
            .kbuckets()
            .map(|bucket| bucket.num_entries())
            .sum()
    }

    /// Returns the set of peers with at least one open connection.
    pub fn connected_peers(&self) -> HashSet<PeerId> {
        self.swarm.connected_peers().copied().collect()
    }
}
