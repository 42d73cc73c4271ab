//! Load balancing policies decide which nodes to contact for each request
//! and in what order. `Session` accepts any implementation of
//! [`LoadBalancingPolicy`].

use crate::cluster::{ClusterState, NodeRef};
use crate::routing::Token;
use coral_cql::frame::types;

mod default;
mod plan;
pub use default::DefaultPolicy;
pub use plan::Plan;

/// Statement properties that load balancing policies can route by.
#[derive(Default, Clone, Debug)]
pub struct RoutingInfo<'a> {
    /// Requested consistency; policies may use it to restrict the plan to a
    /// datacenter for LOCAL_* consistencies.
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,

    /// Basis of token-aware routing. Both must be known for the policy to
    /// prefer the replica owning the token.
    pub token: Option<Token>,
    pub keyspace: Option<&'a str>,
}

/// The fallback list of nodes in the request plan.
///
/// It is computed on demand, only if the most preferred node fails or when
/// speculative execution kicks in.
pub type FallbackPlan<'a> = Box<dyn Iterator<Item = NodeRef<'a>> + Send + Sync + 'a>;

/// How far away a node is from the driver's perspective. Connection pools
/// are sized per distance; `Ignored` nodes get no pool and never appear in
/// request plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDistance {
    Local,
    Remote,
    Ignored,
}

/// Produces the ordered list of nodes to contact for a request.
///
/// Most requests succeed on the first node, so the plan is split in two:
/// `pick` cheaply returns the preferred node, and `fallback` lazily yields
/// the rest of the plan. `fallback` is also consulted when `pick` returns
/// `None`.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the first node to contact for a given request.
    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>>;

    /// Returns all contact-appropriate nodes for a given request.
    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a>;

    /// Assigns a distance to a node, which determines its pool size.
    fn distance(&self, node: &crate::cluster::Node) -> NodeDistance;

    /// Returns the name of the load balancing policy.
    fn name(&self) -> String;
}
