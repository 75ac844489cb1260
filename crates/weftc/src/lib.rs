//! Weft overlay client — multiplexed RPC session over a secure transport.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Exponential backoff with jitter for reconnection.
pub mod backoff;
/// Block header follower and ledger store interface.
pub mod blocks;
/// Outbound call table and response parsing.
pub mod calls;
/// CLI parsing and TOML configuration.
pub mod config;
/// HTTP fetch front-end over overlay streams.
pub mod fetch;
/// Write/round-trip latency and byte counters.
pub mod metrics;
/// Published ports, access policy, and the stream registry.
pub mod ports;
/// The RPC session runtime: reader, writer, dispatcher, supervisor.
pub mod session;
/// Per-stream bridges between local sockets and overlay streams.
pub mod stream;
/// Optional best-effort client trace hooks.
pub mod trace;
/// Framed transport over a secure byte stream.
pub mod transport;
