//! Otternet node runtime.
//!
//! Ties the network layer to local state: the [`session::Session`]
//! answers peers from the catalog and caches, [`node::Node`] drives the
//! lifecycle and event loop, and [`coordinator::Coordinator`] keeps a
//! single node per process.

pub mod coordinator;
mod event_loop;
pub mod market;
pub mod node;
pub mod proxy;
pub mod session;
pub mod status;
