//! dfs-core: configuration and wire format shared by the node's crates.
//! The transport, the store and the daemon all depend on this one.

pub mod config;
pub mod wire;

pub use config::DfsConfig;
pub use wire::{encode_frame, max_payload, WireError, WireMessage};
