//! NAT status detection (AutoNAT) and gateway port mapping (UPnP).
//!
//! [`NatManager`] folds AutoNAT and UPnP events into the node's view
//! of its own reachability: the current [`NatStatus`] and the set of
//! external addresses learned so far.

use libp2p::{autonat, upnp, Multiaddr, PeerId};

// ---------------------------------------------------------------------------
// NatStatus
// ---------------------------------------------------------------------------

/// Observed NAT status of the local node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NatStatus {
    /// Publicly reachable.
    Public,
    /// Behind a NAT or firewall.
    BehindNat,
    /// Not determined yet.
    Unknown,
}

impl std::fmt::Display for NatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "Public"),
            Self::BehindNat => write!(f, "BehindNat"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// NatManager
// ---------------------------------------------------------------------------

/// Tracks reachability from AutoNAT probes and UPnP mappings.
#[derive(Debug)]
pub struct NatManager {
    current_status: NatStatus,
    /// Address confirmed by AutoNAT (only while `Public`).
    autonat_addr: Option<Multiaddr>,
    /// Addresses mapped on the gateway by UPnP.
    mapped_addrs: Vec<Multiaddr>,
}

impl NatManager {
    pub fn new() -> Self {
        Self {
            current_status: NatStatus::Unknown,
            autonat_addr: None,
            mapped_addrs: Vec::new(),
        }
    }

    pub fn current_status(&self) -> &NatStatus {
        &self.current_status
    }

    /// All external addresses currently believed to be valid.
    pub fn external_addresses(&self) -> Vec<Multiaddr> {
        self.autonat_addr
            .iter()
            .chain(&self.mapped_addrs)
            .cloned()
            .collect()
    }

    /// Processes an AutoNAT event. Returns the new status if it changed.
    pub fn on_autonat_event(&mut self, event: autonat::Event) -> Option<NatStatus> {
        match event {
            autonat::Event::StatusChanged { old: _, new } => {
                let mapped = from_libp2p_status(&new);
                self.autonat_addr = match new {
                    autonat::NatStatus::Public(addr) => Some(addr),
                    _ => None,
                };

                if self.current_status == mapped {
                    return None;
                }
                self.current_status = mapped;
                tracing::info!(
                    status = %self.current_status,
                    external_addr = ?self.autonat_addr,
                    "NAT status changed"
                );
                Some(self.current_status.clone())
            }
            autonat::Event::InboundProbe(probe) => {
                tracing::debug!(?probe, "autonat inbound probe");
                None
            }
            autonat::Event::OutboundProbe(probe) => {
                tracing::debug!(?probe, "autonat outbound probe");
                None
            }
        }
    }

    /// Processes a UPnP event. Returns a newly mapped external address,
    /// which the caller should announce with `Swarm::add_external_address`.
    pub fn on_upnp_event(&mut self, event: upnp::Event) -> Option<Multiaddr> {
        match event {
            upnp::Event::NewExternalAddr(addr) => {
                tracing::info!(%addr, "UPnP: port mapped on gateway");
                if !self.mapped_addrs.contains(&addr) {
                    self.mapped_addrs.push(addr.clone());
                }
                Some(addr)
            }
            upnp::Event::ExpiredExternalAddr(addr) => {
                tracing::debug!(%addr, "UPnP: mapping expired");
                self.mapped_addrs.retain(|a| a != &addr);
                None
            }
            upnp::Event::GatewayNotFound => {
                tracing::debug!("UPnP: no gateway found");
                None
            }
            upnp::Event::NonRoutableGateway => {
                tracing::debug!("UPnP: gateway is not routable");
                None
            }
        }
    }
}

impl Default for NatManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a libp2p `autonat::NatStatus` to [`NatStatus`].
pub fn from_libp2p_status(status: &autonat::NatStatus) -> NatStatus {
    match status {
        autonat::NatStatus::Public(_) => NatStatus::Public,
        autonat::NatStatus::Private => NatStatus::BehindNat,
        autonat::NatStatus::Unknown => NatStatus::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Behaviour builders
// ---------------------------------------------------------------------------

/// Builds the AutoNAT behaviour if `enable` is set.
///
/// The behaviour both probes our own reachability and answers probes
/// from other peers (the NAT service).
pub fn build_autonat_behaviour(
    local_peer_id: PeerId,
    enable: bool,
    confidence_max: usize,
) -> Option<autonat::Behaviour> {
    if !enable {
        tracing::debug!("autonat disabled");
        return None;
    }
    let config = autonat::Config {
        confidence_max,
        ..autonat::Config::default()
    };
    Some(autonat::Behaviour::new(local_peer_id, config))
}

/// Builds the UPnP behaviour if `enable` is set.
pub fn build_upnp_behaviour(enable: bool) -> Option<upnp::tokio::Behaviour> {
    if enable {
        Some(upnp::tokio::Behaviour::default())
    } else {
        tracing::debug!("UPnP port mapping disabled");
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn public(addr: &str) -> autonat::NatStatus {
        autonat::NatStatus::Public(addr.parse().unwrap())
    }

    #[test]
    fn initial_status_is_unknown() {
        let manager = NatManager::new();
        assert_eq!(manager.current_status(), &NatStatus::Unknown);
        assert!(manager.external_addresses().is_empty());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(from_libp2p_status(&public("/ip4/1.2.3.4/tcp/1")), NatStatus::Public);
        assert_eq!(from_libp2p_status(&autonat::NatStatus::Private), NatStatus::BehindNat);
        assert_eq!(from_libp2p_status(&autonat::NatStatus::Unknown), NatStatus::Unknown);
    }

    #[test]
    fn public_then_private_clears_autonat_addr() {
        let mut manager = NatManager::new();
        let changed = manager.on_autonat_event(autonat::Event::StatusChanged {
            old: autonat::NatStatus::Unknown,
            new: public("/ip4/1.2.3.4/tcp/4001"),
        });
        assert_eq!(changed, Some(NatStatus::Public));
        assert_eq!(manager.external_addresses().len(), 1);

        manager.on_autonat_event(autonat::Event::StatusChanged {
            old: public("/ip4/1.2.3.4/tcp/4001"),
            new: autonat::NatStatus::Private,
        });
        assert_eq!(manager.current_status(), &NatStatus::BehindNat);
        assert!(manager.external_addresses().is_empty());
    }

    #[test]
    fn unchanged_status_returns_none() {
        let mut manager = NatManager::new();
        let changed = manager.on_autonat_event(autonat::Event::StatusChanged {
            old: autonat::NatStatus::Unknown,
            new: autonat::NatStatus::Unknown,
        });
        assert_eq!(changed, None);
    }

    #[test]
    fn upnp_mapping_added_and_expired() {
        let mut manager = NatManager::new();
        let addr: Multiaddr = "/ip4/5.6.7.8/tcp/4001".parse().unwrap();

        assert_eq!(
            manager.on_upnp_event(upnp::Event::NewExternalAddr(addr.clone())),
            Some(addr.clone())
        );
        manager.on_upnp_event(upnp::Event::NewExternalAddr(addr.clone()));
        assert_eq!(manager.external_addresses(), vec![addr.clone()]);

        assert!(manager.on_upnp_event(upnp::Event::ExpiredExternalAddr(addr)).is_none());
        assert!(manager.external_addresses().is_empty());
        assert!(manager.on_upnp_event(upnp::Event::GatewayNotFound).is_none());
    }

    #[test]
    fn builders_respect_toggles() {
        let peer = PeerId::random();
        assert!(build_autonat_behaviour(peer, false, 3).is_none());
        assert!(build_autonat_behaviour(peer, true, 3).is_some());
        assert!(build_upnp_behaviour(false).is_none());
    }
}
