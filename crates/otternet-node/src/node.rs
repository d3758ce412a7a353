//! Node lifecycle and state machine.
//!
//! The [`Node`] owns the network stack of one Otternet peer together
//! with its [`Session`]. Collaborators talk to the network through the
//! cloneable [`NetworkHandle`] returned by [`Node::handle`].
//!
//! # State machine
//!
//! ```text
//! Initializing ──start()──▶ Running ──close()──▶ ShuttingDown ──▶ (dropped)
//! ```
//!
//! - `Initializing`: swarm built and listening, event loop not started.
//! - `Running`: event loop active; [`Node::bootstrap_network`] may run.
//! - `ShuttingDown`: handlers aborted, event loop drained.
//!
//! Double-start and close-from-initializing are rejected with
//! `OtternetError::ConfigError`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use otternet_network::command::NetworkCommand;
use otternet_network::config::NetworkConfig;
use otternet_network::events::NetworkEvent;
use otternet_network::handle::NetworkHandle;
use otternet_network::handler::{spawn_exchange_handlers, spawn_peer_exchange_handler};
use otternet_network::swarm::OtternetSwarm;
use otternet_network::validator::RecordValidator;
use otternet_types::{OtternetError, Result};

use crate::event_loop;
use crate::session::Session;
use crate::status::NodeStatus;

/// Capacity of the network event broadcast channel.
const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Upper bound on the delay between reservation attempts.
const MAX_RESERVATION_BACKOFF: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Lifecycle state of the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Components created, event loop not started.
    Initializing,
    /// Event loop is active.
    Running,
    /// Shutdown in progress or done.
    ShuttingDown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeRuntime (internal)
// ---------------------------------------------------------------------------

/// Owned runtime state moved into the event loop task.
pub(crate) struct NodeRuntime {
    pub swarm: OtternetSwarm,
    pub commands: mpsc::Receiver<NetworkCommand>,
    pub events: mpsc::UnboundedReceiver<NetworkEvent>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub status: Arc<Mutex<NodeStatus>>,
    pub event_tx: broadcast::Sender<NetworkEvent>,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One Otternet peer: network stack, session and background tasks.
pub struct Node {
    state: NodeState,
    config: NetworkConfig,
    handle: NetworkHandle,
    session: Arc<Session>,

    /// Moved into the event loop by `start()`.
    runtime: Option<NodeRuntime>,

    shutdown_tx: watch::Sender<bool>,
    loop_task: Option<JoinHandle<()>>,
    handler_tasks: Vec<JoinHandle<()>>,
    status: Arc<Mutex<NodeStatus>>,
    event_tx: broadcast::Sender<NetworkEvent>,
}

impl Node {
    /// Creates the node: derives the identity, builds the swarm and
    /// binds the listen addresses.
    ///
    /// # Errors
    ///
    /// - `OtternetError::ConfigError` if `config` is invalid.
    /// - `OtternetError::NetworkError` if the swarm cannot be built or
    ///   no listen address can be bound.
    pub fn new(config: NetworkConfig, session: Arc<Session>) -> Result<Self> {
        Self::build(config, session, None)
    }

    /// Like [`Node::new`] with a custom DHT record validator.
    pub fn with_validator(
        config: NetworkConfig,
        session: Arc<Session>,
        validator: Arc<dyn RecordValidator>,
    ) -> Result<Self> {
        Self::build(config, session, Some(validator))
    }

    fn build(
        config: NetworkConfig,
        session: Arc<Session>,
        validator: Option<Arc<dyn RecordValidator>>,
    ) -> Result<Self> {
        let (swarm, events) = OtternetSwarm::new(config.clone(), validator)?;
        let (handle, commands) = swarm.handle();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let status = Arc::new(Mutex::new(NodeStatus::default()));

        tracing::info!(peer_id = %handle.local_peer_id(), "node created");

        let runtime = NodeRuntime {
            swarm,
            commands,
            events,
            shutdown_rx,
            status: Arc::clone(&status),
            event_tx: event_tx.clone(),
        };

        Ok(Self {
            state: NodeState::Initializing,
            config,
            handle,
            session,
            runtime: Some(runtime),
            shutdown_tx,
            loop_task: None,
            handler_tasks: Vec::new(),
            status,
            event_tx,
        })
    }

    /// Spawns the event loop. Transitions `Initializing → Running`.
    ///
    /// # Errors
    ///
    /// `OtternetError::ConfigError` if the node is not `Initializing`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != NodeState::Initializing {
            return Err(OtternetError::ConfigError {
                reason: format!(
                    "cannot start node in state '{}'; expected 'initializing'",
                    self.state,
                ),
            });
        }

        let runtime = self.runtime.take().ok_or_else(|| OtternetError::ConfigError {
            reason: "runtime already consumed (double start?)".into(),
        })?;

        self.loop_task = Some(tokio::spawn(event_loop::run_event_loop(runtime)));
        self.state = NodeState::Running;
        Ok(())
    }

    /// Joins the overlay:
    ///
    /// 1. connect to each configured relay;
    /// 2. reserve a relay slot, retrying with backoff;
    /// 3. connect to each bootstrap peer;
    /// 4. run the Kademlia bootstrap;
    /// 5. register the exchange and peer-exchange handlers.
    ///
    /// Relay and peer connection failures are logged and skipped.
    ///
    /// # Errors
    ///
    /// - `OtternetError::ConfigError` if the node is not running.
    /// - The bootstrap error if the Kademlia bootstrap fails.
    pub async fn bootstrap_network(&mut self) -> Result<()> {
        self.ensure_running("bootstrap")?;

        for relay in &self.config.relay_nodes {
            if !self.handle.connect_to_peer(&relay.to_string()).await? {
                tracing::warn!(%relay, "relay unreachable");
            }
        }

        let reservations = self.make_reservation_with_retry().await;
        if !self.config.relay_nodes.is_empty() && reservations == 0 {
            tracing::warn!("continuing without a relay reservation; reachability is degraded");
        }

        for peer in &self.config.bootstrap_nodes {
            if !self.handle.connect_to_peer(&peer.to_string()).await? {
                tracing::warn!(%peer, "bootstrap peer unreachable");
            }
        }

        let known = self.handle.bootstrap().await?;
        tracing::info!(known, "DHT bootstrap started");

        self.register_exchange_handlers()?;
        self.start_peer_exchange()?;
        Ok(())
    }

    /// Reserves relay slots, retrying failed rounds with exponential
    /// backoff. Returns the number of accepted reservations, 0 once
    /// the attempts are exhausted.
    pub async fn make_reservation_with_retry(&self) -> usize {
        if self.config.relay_nodes.is_empty() {
            return 0;
        }

        let attempts = self.config.reservation_attempts.max(1);
        let mut backoff = Duration::from_secs(self.config.reservation_backoff_secs);
        for attempt in 1..=attempts {
            match self.handle.make_reservation().await {
                Ok(accepted) => return accepted,
                Err(e) => {
                    tracing::warn!(attempt, attempts, %e, "relay reservation attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_RESERVATION_BACKOFF);
                    }
                }
            }
        }
        0
    }

    /// Registers the file, price, catalog, liveness, proxy and framed
    /// exchange handlers.
    ///
    /// # Errors
    ///
    /// `OtternetError::ConfigError` if the node is not running or the
    /// handlers are already registered.
    pub fn register_exchange_handlers(&mut self) -> Result<()> {
        self.ensure_running("register handlers")?;
        let tasks = spawn_exchange_handlers(&self.handle, self.session.clone())?;
        self.handler_tasks.extend(tasks);
        Ok(())
    }

    /// Registers the peer-exchange handler.
    ///
    /// # Errors
    ///
    /// `OtternetError::ConfigError` if the node is not running or peer
    /// exchange is already registered.
    pub fn start_peer_exchange(&mut self) -> Result<()> {
        self.ensure_running("start peer exchange")?;
        let task = spawn_peer_exchange_handler(&self.handle, self.session.clone())?;
        self.handler_tasks.push(task);
        Ok(())
    }

    /// Stops the node: aborts the handler tasks, signals the event loop
    /// and waits for it. Idempotent once shutting down.
    ///
    /// # Errors
    ///
    /// `OtternetError::ConfigError` if the node was never started.
    pub async fn close(&mut self) -> Result<()> {
        match self.state {
            NodeState::Initializing => {
                return Err(OtternetError::ConfigError {
                    reason: "cannot close a node that has not been started".into(),
                });
            }
            NodeState::ShuttingDown => return Ok(()),
            NodeState::Running => {}
        }

        self.state = NodeState::ShuttingDown;
        for task in self.handler_tasks.drain(..) {
            task.abort();
        }
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.loop_task.take() {
            if let Err(e) = task.await {
                tracing::error!(%e, "event loop task failed");
            }
        }
        tracing::info!(peer_id = %self.handle.local_peer_id(), "node closed");
        Ok(())
    }

    pub fn handle(&self) -> &NetworkHandle {
        &self.handle
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn peer_id(&self) -> PeerId {
        self.handle.local_peer_id()
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Current connectivity snapshot.
    pub fn status(&self) -> NodeStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribes to network events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_tx.subscribe()
    }

    fn ensure_running(&self, what: &str) -> Result<()> {
        if self.state == NodeState::Running {
            Ok(())
        } else {
            Err(OtternetError::ConfigError {
                reason: format!("cannot {what} in state '{}'; expected 'running'", self.state),
            })
        }
    }
}
