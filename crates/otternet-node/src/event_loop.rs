//! Node event loop.
//!
//! [`run_event_loop`] is spawned by [`Node::start`](crate::node::Node::start).
//! It starts the swarm task, which owns the libp2p swarm and serves
//! commands from every `NetworkHandle`, and then folds the network
//! events the swarm emits into the shared [`NodeStatus`] until shutdown
//! is signalled.

use std::sync::{Arc, Mutex, PoisonError};

use otternet_network::events::NetworkEvent;
use tokio::sync::broadcast;

use crate::node::NodeRuntime;
use crate::status::NodeStatus;

/// Runs until the shutdown signal fires or the swarm task exits.
pub(crate) async fn run_event_loop(rt: NodeRuntime) {
    let NodeRuntime {
        swarm,
        commands,
        mut events,
        mut shutdown_rx,
        status,
        event_tx,
    } = rt;

    let mut swarm_task = tokio::spawn(swarm.run(commands, shutdown_rx.clone()));
    tracing::info!("node event loop started");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => handle_network_event(event, &status, &event_tx),
                None => {
                    tracing::debug!("network event channel closed");
                    break;
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("shutdown signal received -- exiting event loop");
                    break;
                }
            }
            result = &mut swarm_task => {
                if let Err(e) = result {
                    tracing::error!(%e, "swarm task failed");
                }
                tracing::info!("event loop stopped");
                return;
            }
        }
    }

    if let Err(e) = swarm_task.await {
        tracing::error!(%e, "swarm task failed");
    }
    tracing::info!("event loop stopped");
}

fn handle_network_event(
    event: NetworkEvent,
    status: &Arc<Mutex<NodeStatus>>,
    event_tx: &broadcast::Sender<NetworkEvent>,
) {
    match &event {
        NetworkEvent::PeerConnected {
            peer_id,
            address,
            relayed,
        } => {
            tracing::info!(%peer_id, %address, relayed, "peer connected");
        }
        NetworkEvent::PeerDisconnected(peer_id) => {
            tracing::debug!(%peer_id, "peer disconnected");
        }
        NetworkEvent::ListeningOn(addr) => {
            tracing::info!(%addr, "listening");
        }
        NetworkEvent::ReservationAccepted { relay_peer_id } => {
            tracing::info!(%relay_peer_id, "relay reservation active");
        }
        NetworkEvent::HolePunched(peer_id) => {
            tracing::info!(%peer_id, "direct connection established by hole punching");
        }
        NetworkEvent::NatStatusChanged(nat) => {
            tracing::info!(%nat, "NAT status changed");
        }
    }

    status
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .apply(&event);

    // No subscribers is fine.
    let _ = event_tx.send(event);
}
