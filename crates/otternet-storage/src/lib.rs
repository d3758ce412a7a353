//! Local persistence for the Otternet node.
//!
//! - [`provider_cache`]: bounded FIFO list of known provider peer ids,
//!   persisted as a line-delimited file.
//! - [`catalog`]: read access to the metadata of locally hosted files.
//! - [`upload_stats`]: running total of bytes served to other peers.
//! - [`atomic`]: crash-safe whole-file replacement shared by the above.

pub mod atomic;
pub mod catalog;
pub mod provider_cache;
pub mod upload_stats;
