//! PrintMesh Node - presence-aware broker node for networked thermal printers
//!
//! Coordination layer shared by every node:
//! - Thread-safe managers with lazily created locks and a global lock order
//! - Non-blocking single-writer log pipeline, with an interrupt-safe producer
//! - Broker connection state machine with retry, cooldown and TLS trust anchor
//! - Presence protocol: retained status, last will, `status/+` discovery, peer registry

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod logging;
pub mod manager;
pub mod mqtt;
pub mod node;
pub mod presence;
pub mod registry;
pub mod topics;
pub mod transport;

pub use error::{NodeError, NodeResult};
pub use node::Node;
