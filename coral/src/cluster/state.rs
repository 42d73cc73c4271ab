use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::cluster::metadata::Metadata;
use crate::cluster::node::{Node, NodeRef};
use crate::errors::ConnectionPoolError;
use crate::network::{PoolConfig, VerifiedKeyspaceName};
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::routing::Token;

/// An immutable snapshot of the cluster topology: known nodes and the token
/// ring.
///
/// It is replaced atomically upon a metadata refresh, so request execution
/// never takes a lock to read it. Can be accessed through
/// [`Session::cluster_state()`](crate::client::session::Session::cluster_state).
#[derive(Clone)]
pub struct ClusterState {
    /// All nodes known to be part of the cluster, accessible by their host
    /// id. Nonempty after `Cluster::new()`.
    pub(crate) known_peers: HashMap<Uuid, Arc<Node>>,

    /// The same set of nodes as `known_peers`, in a stable order.
    all_nodes: Vec<Arc<Node>>,

    /// Token ring: (token, owning node) sorted by token.
    ring: Vec<(Token, Arc<Node>)>,
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("known_peers", &self.known_peers)
            .field("ring_size", &self.ring.len())
            .finish()
    }
}

impl ClusterState {
    /// Creates a new ClusterState using information about topology held in
    /// `metadata`. Uses the provided `known_peers` map to recycle nodes,
    /// along with their pools, if possible.
    pub(crate) fn new(
        metadata: Metadata,
        pool_config: &PoolConfig,
        known_peers: &HashMap<Uuid, Arc<Node>>,
        used_keyspace: &Option<VerifiedKeyspaceName>,
        policy: &dyn LoadBalancingPolicy,
    ) -> Self {
        let mut new_known_peers: HashMap<Uuid, Arc<Node>> =
            HashMap::with_capacity(metadata.peers.len());
        let mut ring: Vec<(Token, Arc<Node>)> = Vec::new();

        for peer in &metadata.peers {
            // Take the existing Arc<Node> if possible to keep its pool.
            // A changed address or datacenter/rack means the node must be
            // recreated, connections included.
            let node: Arc<Node> = match known_peers.get(&peer.host_id) {
                Some(node)
                    if node.address == peer.address
                        && node.datacenter == peer.datacenter
                        && node.rack == peer.rack =>
                {
                    Arc::clone(node)
                }
                _ => Arc::new(Node::new(
                    peer,
                    pool_config,
                    used_keyspace.clone(),
                    policy,
                )),
            };

            new_known_peers.insert(peer.host_id, Arc::clone(&node));

            for token in &peer.tokens {
                ring.push((*token, Arc::clone(&node)));
            }
        }

        ring.sort_by_key(|(token, _)| *token);

        ClusterState {
            all_nodes: new_known_peers.values().cloned().collect(),
            known_peers: new_known_peers,
            ring,
        }
    }

    pub(crate) async fn wait_until_all_pools_are_initialized(&self) {
        for node in &self.all_nodes {
            node.wait_until_pool_initialized().await;
        }
    }

    /// Access details about nodes known to the driver.
    pub fn get_nodes_info(&self) -> &[Arc<Node>] {
        &self.all_nodes
    }

    /// One working connection to every node that has any, for requests that
    /// should reach the whole cluster (statement preparation).
    pub(crate) fn working_connections_to_all_nodes(
        &self,
    ) -> Result<Vec<Arc<crate::network::Connection>>, ConnectionPoolError> {
        let mut connections = Vec::with_capacity(self.all_nodes.len());
        let mut last_error: Option<ConnectionPoolError> = None;

        for node in &self.all_nodes {
            if !node.is_enabled() {
                continue;
            }
            match node.get_random_connection() {
                Ok(connection) => connections.push(connection),
                Err(e) => last_error = Some(e),
            }
        }

        if connections.is_empty() {
            return Err(last_error.unwrap_or(ConnectionPoolError::NodeIgnored));
        }
        Ok(connections)
    }

    /// The node owning the given token: the one whose ring token is the
    /// successor of the token, wrapping around the ring.
    pub fn primary_replica_for_token(&self, token: Token) -> Option<NodeRef<'_>> {
        if self.ring.is_empty() {
            return None;
        }
        let idx = self.ring.partition_point(|(ring_token, _)| *ring_token < token);
        let (_, node) = self.ring.get(idx).unwrap_or(&self.ring[0]);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use super::*;

    impl ClusterState {
        pub(crate) fn new_for_test(
            nodes: Vec<Arc<Node>>,
            mut ring: Vec<(Token, Arc<Node>)>,
        ) -> Self {
            ring.sort_by_key(|(token, _)| *token);
            Self {
                known_peers: nodes
                    .iter()
                    .map(|node| (node.host_id, Arc::clone(node)))
                    .collect(),
                all_nodes: nodes,
                ring,
            }
        }

        pub(crate) fn empty_for_test() -> Self {
            Self {
                known_peers: HashMap::new(),
                all_nodes: Vec::new(),
                ring: Vec::new(),
            }
        }
    }

    fn node(port: u16) -> Arc<Node> {
        Arc::new(Node::new_for_test(
            SocketAddr::from_str(&format!("127.0.0.1:{port}")).unwrap(),
            None,
            None,
        ))
    }

    #[test]
    fn ring_successor_owns_token() {
        let a = node(9042);
        let b = node(9043);
        let state = ClusterState::new_for_test(
            vec![a.clone(), b.clone()],
            vec![(Token::new(0), a.clone()), (Token::new(1000), b.clone())],
        );

        // Exact match is owned by the matching node.
        assert_eq!(
            state.primary_replica_for_token(Token::new(0)).unwrap().address,
            a.address
        );
        // A token between two ring positions belongs to the successor.
        assert_eq!(
            state.primary_replica_for_token(Token::new(1)).unwrap().address,
            b.address
        );
        // Past the last ring position the ownership wraps around.
        assert_eq!(
            state
                .primary_replica_for_token(Token::new(5000))
                .unwrap()
                .address,
            a.address
        );
    }

    #[test]
    fn empty_ring_has_no_replicas() {
        let state = ClusterState::empty_for_test();
        assert!(state.primary_replica_for_token(Token::new(42)).is_none());
    }
}
