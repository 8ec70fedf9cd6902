//! eventsync: permission-aware document sync.
//!
//! - [`server`]: central store, pull-sync service, real-time broadcaster and
//!   the HTTP/WebSocket surface.
//! - [`client`]: offline-capable device replica and sync client.
//! - [`config`]: device CLI configuration.

pub mod client;
pub mod config;
pub mod server;

pub use eventsync_core as core;
