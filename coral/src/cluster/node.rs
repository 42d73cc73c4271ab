use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::lookup_host;
use tracing::warn;
use uuid::Uuid;

use crate::cluster::metadata::Peer;
use crate::errors::{ConnectionPoolError, ExecutionError};
use crate::network::{Connection, NodeConnectionPool, PoolConfig, VerifiedKeyspaceName};
use crate::policies::load_balancing::LoadBalancingPolicy;

/// A cluster node along with its data and connections.
///
/// Note: if a node changes its broadcast address, it is no longer
/// represented by the same instance of Node, but a new instance is created
/// on the next metadata refresh.
#[derive(Debug)]
pub struct Node {
    /// Unique identifier of the node, from `system.local`/`system.peers`.
    pub host_id: Uuid,
    /// Address used to connect to the node.
    pub address: SocketAddr,
    /// Datacenter of the node, if known.
    pub datacenter: Option<String>,
    /// Rack of the node, if known.
    pub rack: Option<String>,

    /// Connection pool for this node.
    ///
    /// `None` for nodes the load balancing policy ignores.
    pool: Option<NodeConnectionPool>,

    // Set when a STATUS_CHANGE DOWN event arrives for this node, cleared on
    // the UP event. Load balancing policies use it to deprioritize the node.
    down_marker: AtomicBool,
}

/// A way that Nodes are often passed and accessed in the driver's code.
pub type NodeRef<'a> = &'a Arc<Node>;

impl Node {
    /// Creates a new node which starts connecting in the background.
    ///
    /// The pool is sized according to the distance the load balancing policy
    /// assigns to the node; ignored nodes get no pool.
    pub(crate) fn new(
        peer: &Peer,
        pool_config: &PoolConfig,
        keyspace_name: Option<VerifiedKeyspaceName>,
        policy: &dyn LoadBalancingPolicy,
    ) -> Self {
        let mut node = Node {
            host_id: peer.host_id,
            address: peer.address,
            datacenter: peer.datacenter.clone(),
            rack: peer.rack.clone(),
            pool: None,
            down_marker: AtomicBool::new(false),
        };

        let distance = policy.distance(&node);
        if let Some(target_size) = pool_config.target_size(distance) {
            // We aren't interested in the fact that the pool becomes empty,
            // so we immediately drop the receiving part.
            let (pool_empty_notifier, _) = tokio::sync::broadcast::channel(1);
            node.pool = Some(NodeConnectionPool::new(
                peer.address,
                pool_config.connection_config.clone(),
                target_size,
                keyspace_name,
                pool_empty_notifier,
            ));
        }

        node
    }

    /// Returns true if the node is marked down by a STATUS_CHANGE event.
    pub fn is_down(&self) -> bool {
        self.down_marker.load(Ordering::Relaxed)
    }

    pub(crate) fn set_down_marker(&self, down: bool) {
        self.down_marker.store(down, Ordering::Relaxed);
    }

    /// Returns true if the driver has any open connections in the pool for
    /// this node.
    pub fn is_connected(&self) -> bool {
        let Ok(pool) = self.get_pool() else {
            return false;
        };
        pool.is_connected()
    }

    /// Only enabled nodes have connections open. Nodes ignored by the load
    /// balancing policy are disabled.
    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), ExecutionError> {
        if let Some(pool) = &self.pool {
            pool.use_keyspace(keyspace_name).await?;
        }
        Ok(())
    }

    pub(crate) fn get_random_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.get_pool()?.random_connection()
    }

    pub(crate) async fn wait_until_pool_initialized(&self) {
        if let Some(pool) = &self.pool {
            pool.wait_until_initialized().await;
        }
    }

    fn get_pool(&self) -> Result<&NodeConnectionPool, ConnectionPoolError> {
        self.pool.as_ref().ok_or(ConnectionPoolError::NodeIgnored)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host_id == other.host_id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id.hash(state);
    }
}

/// Describes a database server known on `Session` startup.
///
/// The name derives from SessionBuilder's `known_node()` family of methods.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname.
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

// Resolves the given hostname using a DNS lookup if necessary.
// The resolution may return multiple IPs and the function returns one of
// them. It prefers to return IPv4s first, and only if there are none, IPv6s.
async fn resolve_hostname(hostname: &str) -> Result<SocketAddr, std::io::Error> {
    // `lookup_host` expects a "hostname:port" string, erroring out
    // immediately otherwise. In that case retry with the default port.
    let addrs: Vec<SocketAddr> = match lookup_host(hostname).await {
        Ok(addrs) => addrs.collect(),
        Err(e) => lookup_host((hostname, 9042)).await.or(Err(e))?.collect(),
    };

    addrs
        .iter()
        .find(|addr| matches!(addr, SocketAddr::V4(_)))
        .or_else(|| addrs.last())
        .copied()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Empty address list returned by DNS for {hostname}"),
            )
        })
}

/// Transforms the given [`KnownNode`]s into contact point addresses.
///
/// In case of a hostname, resolves it using a DNS lookup; hostnames that
/// fail to resolve are skipped with a warning. Returns the resolved
/// addresses along with the list of hostnames that were attempted.
pub(crate) async fn resolve_contact_points(
    known_nodes: &[KnownNode],
    hostname_resolution_timeout: Option<Duration>,
) -> (Vec<SocketAddr>, Vec<String>) {
    let mut contact_points: Vec<SocketAddr> = Vec::with_capacity(known_nodes.len());
    let mut hostnames: Vec<String> = Vec::new();

    for node in known_nodes {
        match node {
            KnownNode::Address(address) => contact_points.push(*address),
            KnownNode::Hostname(hostname) => {
                hostnames.push(hostname.clone());
                let resolution = async {
                    match hostname_resolution_timeout {
                        Some(timeout) => tokio::time::timeout(timeout, resolve_hostname(hostname))
                            .await
                            .unwrap_or_else(|_| {
                                Err(std::io::Error::new(
                                    std::io::ErrorKind::TimedOut,
                                    "DNS lookup timed out",
                                ))
                            }),
                        None => resolve_hostname(hostname).await,
                    }
                };
                match resolution.await {
                    Ok(address) => contact_points.push(address),
                    Err(e) => warn!("Hostname resolution failed for {}: {}", hostname, e),
                }
            }
        }
    }

    (contact_points, hostnames)
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Node {
        pub(crate) fn new_for_test(
            address: SocketAddr,
            datacenter: Option<String>,
            rack: Option<String>,
        ) -> Self {
            Self {
                host_id: Uuid::new_v4(),
                address,
                datacenter,
                rack,
                pool: None,
                down_marker: AtomicBool::new(false),
            }
        }

        pub(crate) fn new_with_pool_for_test(
            address: SocketAddr,
            pool: NodeConnectionPool,
        ) -> Self {
            Self {
                host_id: Uuid::new_v4(),
                address,
                datacenter: None,
                rack: None,
                pool: Some(pool),
                down_marker: AtomicBool::new(false),
            }
        }
    }

    #[test]
    fn down_marker_toggles() {
        let node =
            Node::new_for_test("127.0.0.1:9042".parse().unwrap(), None, None);
        assert!(!node.is_down());
        node.set_down_marker(true);
        assert!(node.is_down());
        node.set_down_marker(false);
        assert!(!node.is_down());
    }

    #[test]
    fn nodes_with_no_pool_report_ignored() {
        let node =
            Node::new_for_test("127.0.0.1:9042".parse().unwrap(), None, None);
        assert!(!node.is_enabled());
        assert!(!node.is_connected());
        assert_matches::assert_matches!(
            node.get_random_connection(),
            Err(ConnectionPoolError::NodeIgnored)
        );
    }
}
