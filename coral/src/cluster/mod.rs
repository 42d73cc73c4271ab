//! Cluster topology: nodes, immutable state snapshots and the background
//! worker which keeps them fresh.

pub(crate) mod metadata;
mod node;
mod state;
pub(crate) mod worker;

pub use node::{KnownNode, Node, NodeRef};
pub use state::ClusterState;

pub(crate) use node::resolve_contact_points;
pub(crate) use worker::Cluster;
