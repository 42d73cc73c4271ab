use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::{Node, NodeRef};

/// The coordinator of a CQL request: the node that received the request and
/// produced the response.
#[derive(Debug, Clone)]
pub struct Coordinator {
    /// The address the connection was opened against.
    connection_address: SocketAddr,
    node: Arc<Node>,
}

impl Coordinator {
    pub(crate) fn new(node: NodeRef, connection_address: SocketAddr) -> Self {
        Self {
            connection_address,
            node: Arc::clone(node),
        }
    }

    /// The address the connection was opened against.
    pub fn connection_address(&self) -> SocketAddr {
        self.connection_address
    }

    /// The node that served as the coordinator of the request.
    pub fn node(&self) -> NodeRef<'_> {
        &self.node
    }
}
