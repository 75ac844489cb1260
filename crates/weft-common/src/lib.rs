//! Wire codec and core types for the weft overlay network.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Base58 encoding and decoding for device ids and fleet addresses.
pub mod base58;
/// Binary frame serialization and parsing.
pub mod frame;
/// Core type definitions and protocol constants.
pub mod types;

pub use types::{Address, DeviceId};
