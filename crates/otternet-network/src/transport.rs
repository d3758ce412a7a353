//! Transport settings for the Otternet swarm.
//!
//! Transport construction itself lives in the `SwarmBuilder` chain in
//! [`crate::swarm::OtternetSwarm::new`]:
//!
//! ```text
//! SwarmBuilder::with_existing_identity(keypair)
//!     .with_tokio()
//!     .with_tcp(tcp_config(), noise::Config::new, yamux::Config::default)?
//!     .with_quic()
//!     .with_relay_client(noise::Config::new, yamux::Config::default)?
//!     .with_behaviour(|key, relay_client| { ... })?
//!     .build()
//! ```
//!
//! The relay client transport is what makes `/p2p-circuit` addresses
//! dialable and listenable.

/// TCP configuration used by the swarm builder.
///
/// `nodelay` disables Nagle for request/response traffic. Outbound
/// dials reuse the listening port whenever a listener exists.
pub fn tcp_config() -> libp2p::tcp::Config {
    libp2p::tcp::Config::default().nodelay(true)
}

#[cfg(test)]
mod tests {
    use libp2p::core::transport::{ListenerId, Transport};

    use super::*;

    #[tokio::test]
    async fn tcp_config_listens_on_loopback() {
        let mut transport = libp2p::tcp::tokio::Transport::new(tcp_config());
        transport
            .listen_on(ListenerId::next(), "/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .unwrap();
    }
}
