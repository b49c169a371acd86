//! Flow-hosting node runtime on top of `flowmach-core`: a registry of flow
//! logics, a bounded worker pool driving instances, inbound frame routing
//! with duplicate suppression, retry and suspension-timeout scheduling, and
//! crash recovery. Ships a loopback transport for multi-node tests in one
//! process.

pub mod node;
pub mod registry;
pub mod transport;

pub use node::{FlowHandle, Node, NodeConfig};
pub use registry::FlowRegistry;
pub use transport::LoopbackHub;
