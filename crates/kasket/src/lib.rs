//! Kasket: a transparent protocol-level proxy for the Kafka wire
//! protocol.
//!
//! Clients connect as if to a broker; the proxy terminates the
//! connection, applies a per-cluster filter chain to every request and
//! response frame, and relays traffic to the upstream cluster the
//! connection resolved to (by listener, or by SNI on TLS listeners).

pub mod backend;
pub mod chain;
pub mod codec;
pub mod config;
pub mod filters;
pub mod frontend;
pub mod logging;
pub mod metrics_server;
pub mod orderer;
pub mod registry;
pub mod resolver;
