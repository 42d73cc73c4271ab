use std::sync::atomic::{AtomicUsize, Ordering};

use super::{FallbackPlan, LoadBalancingPolicy, NodeDistance, NodeRef, RoutingInfo};
use crate::cluster::{ClusterState, Node};

/// The default load balancing policy: token-aware routing on top of
/// round-robin.
///
/// When the routing token and keyspace are known, the replica owning the
/// token is preferred. Otherwise requests are spread round-robin over the
/// usable nodes. With a preferred datacenter set, nodes outside it are
/// either used as a last resort (`permit_dc_failover`) or ignored entirely.
#[derive(Debug)]
pub struct DefaultPolicy {
    preferred_datacenter: Option<String>,
    is_token_aware: bool,
    permit_dc_failover: bool,
    index: AtomicUsize,
}

impl DefaultPolicy {
    pub fn builder() -> DefaultPolicyBuilder {
        DefaultPolicyBuilder::new()
    }

    fn is_usable(&self, node: &Node) -> bool {
        !node.is_down() && self.distance(node) != NodeDistance::Ignored
    }

    fn preferred_replica<'a>(
        &self,
        request: &RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>> {
        if !self.is_token_aware {
            return None;
        }
        let token = request.token?;
        request.keyspace?;
        cluster
            .primary_replica_for_token(token)
            .filter(|node| self.is_usable(node))
    }
}

impl LoadBalancingPolicy for DefaultPolicy {
    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>> {
        if let Some(replica) = self.preferred_replica(request, cluster) {
            return Some(replica);
        }

        let nodes = cluster.get_nodes_info();
        if nodes.is_empty() {
            return None;
        }
        let start = self.index.fetch_add(1, Ordering::Relaxed) % nodes.len();
        nodes[start..]
            .iter()
            .chain(nodes[..start].iter())
            .find(|node| self.is_usable(node))
    }

    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        let replica = self.preferred_replica(request, cluster);

        let nodes = cluster.get_nodes_info();
        let start = if nodes.is_empty() {
            0
        } else {
            self.index.fetch_add(1, Ordering::Relaxed) % nodes.len()
        };
        let rotated = nodes[start..].iter().chain(nodes[..start].iter());

        // Usable local nodes first, remote ones after, down nodes last in
        // case the down markers are stale.
        let mut local = Vec::new();
        let mut remote = Vec::new();
        let mut down = Vec::new();
        for node in rotated {
            match self.distance(node) {
                NodeDistance::Ignored => continue,
                _ if node.is_down() => down.push(node),
                NodeDistance::Local => local.push(node),
                NodeDistance::Remote => remote.push(node),
            }
        }

        Box::new(
            replica
                .into_iter()
                .chain(local)
                .chain(remote)
                .chain(down),
        )
    }

    fn distance(&self, node: &Node) -> NodeDistance {
        match &self.preferred_datacenter {
            None => NodeDistance::Local,
            Some(dc) if node.datacenter.as_deref() == Some(dc.as_str()) => NodeDistance::Local,
            Some(_) if self.permit_dc_failover => NodeDistance::Remote,
            Some(_) => NodeDistance::Ignored,
        }
    }

    fn name(&self) -> String {
        "DefaultPolicy".to_string()
    }
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        DefaultPolicy::builder().build()
    }
}

/// Builder for [`DefaultPolicy`].
#[derive(Debug, Clone)]
pub struct DefaultPolicyBuilder {
    preferred_datacenter: Option<String>,
    is_token_aware: bool,
    permit_dc_failover: bool,
}

impl DefaultPolicyBuilder {
    pub fn new() -> Self {
        Self {
            preferred_datacenter: None,
            is_token_aware: true,
            permit_dc_failover: false,
        }
    }

    /// Prefer nodes from the given datacenter.
    pub fn prefer_datacenter(mut self, dc: impl Into<String>) -> Self {
        self.preferred_datacenter = Some(dc.into());
        self
    }

    pub fn token_aware(mut self, token_aware: bool) -> Self {
        self.is_token_aware = token_aware;
        self
    }

    /// Allow contacting nodes outside the preferred datacenter when all
    /// local nodes failed. Without this, such nodes are ignored.
    pub fn permit_dc_failover(mut self, permit: bool) -> Self {
        self.permit_dc_failover = permit;
        self
    }

    pub fn build(self) -> DefaultPolicy {
        DefaultPolicy {
            preferred_datacenter: self.preferred_datacenter,
            is_token_aware: self.is_token_aware,
            permit_dc_failover: self.permit_dc_failover,
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for DefaultPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::Arc;

    use super::*;
    use crate::routing::Token;

    fn make_node(port: u16, dc: Option<&str>) -> Arc<Node> {
        Arc::new(Node::new_for_test(
            SocketAddr::from_str(&format!("127.0.0.1:{}", port)).unwrap(),
            dc.map(str::to_string),
            None,
        ))
    }

    fn make_cluster(nodes: Vec<Arc<Node>>, ring: Vec<(Token, Arc<Node>)>) -> ClusterState {
        ClusterState::new_for_test(nodes, ring)
    }

    #[test]
    fn round_robin_visits_all_nodes() {
        let nodes = vec![
            make_node(9042, None),
            make_node(9043, None),
            make_node(9044, None),
        ];
        let cluster = make_cluster(nodes, vec![]);
        let policy = DefaultPolicy::builder().token_aware(false).build();
        let info = RoutingInfo::default();

        let mut picked = HashSet::new();
        for _ in 0..3 {
            let node = policy.pick(&info, &cluster).unwrap();
            picked.insert(node.address);
        }
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn token_aware_prefers_ring_owner() {
        let nodes = vec![make_node(9042, None), make_node(9043, None)];
        let ring = vec![
            (Token::new(0), nodes[0].clone()),
            (Token::new(1000), nodes[1].clone()),
        ];
        let cluster = make_cluster(nodes.clone(), ring);
        let policy = DefaultPolicy::builder().build();

        let info = RoutingInfo {
            token: Some(Token::new(500)),
            keyspace: Some("ks"),
            ..Default::default()
        };

        // Token 500 falls between ring tokens 0 and 1000, so its primary
        // owner is the node at ring position 1000.
        for _ in 0..4 {
            let node = policy.pick(&info, &cluster).unwrap();
            assert_eq!(node.address, nodes[1].address);
        }
    }

    #[test]
    fn token_aware_needs_keyspace() {
        let nodes = vec![make_node(9042, None), make_node(9043, None)];
        let ring = vec![
            (Token::new(0), nodes[0].clone()),
            (Token::new(1000), nodes[1].clone()),
        ];
        let cluster = make_cluster(nodes, ring);
        let policy = DefaultPolicy::builder().build();

        let info = RoutingInfo {
            token: Some(Token::new(500)),
            keyspace: None,
            ..Default::default()
        };

        let mut picked = HashSet::new();
        for _ in 0..2 {
            picked.insert(policy.pick(&info, &cluster).unwrap().address);
        }
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn remote_nodes_ignored_without_dc_failover() {
        let local = make_node(9042, Some("dc1"));
        let remote = make_node(9043, Some("dc2"));
        let cluster = make_cluster(vec![local.clone(), remote.clone()], vec![]);

        let policy = DefaultPolicy::builder().prefer_datacenter("dc1").build();
        assert_eq!(policy.distance(&local), NodeDistance::Local);
        assert_eq!(policy.distance(&remote), NodeDistance::Ignored);

        let info = RoutingInfo::default();
        let plan: Vec<_> = policy.fallback(&info, &cluster).collect();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].address, local.address);
    }

    #[test]
    fn remote_nodes_follow_local_with_dc_failover() {
        let local = make_node(9042, Some("dc1"));
        let remote = make_node(9043, Some("dc2"));
        let cluster = make_cluster(vec![remote.clone(), local.clone()], vec![]);

        let policy = DefaultPolicy::builder()
            .prefer_datacenter("dc1")
            .permit_dc_failover(true)
            .build();
        assert_eq!(policy.distance(&remote), NodeDistance::Remote);

        let info = RoutingInfo::default();
        let plan: Vec<_> = policy.fallback(&info, &cluster).collect();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].address, local.address);
        assert_eq!(plan[1].address, remote.address);
    }
}
