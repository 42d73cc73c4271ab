//! A builder for [`Session`].

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use coral_cql::frame::types::{Consistency, SerialConsistency};
use coral_cql::frame::Compression;

use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::client::session::{Session, SessionConfig};
use crate::cluster::KnownNode;
use crate::errors::NewSessionError;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;
use crate::policies::speculative::SpeculativeExecutionPolicy;

/// Convenient, fluent interface for assembling a [`SessionConfig`] and
/// connecting.
///
/// # Example
///
/// ```rust,no_run
/// # use coral::client::session_builder::SessionBuilder;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .known_node("db2.example.com")
///     .tcp_nodelay(true)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::new(),
        }
    }

    /// Adds a known node with a hostname or an address string.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        let hostname = hostname.as_ref();
        match hostname.parse::<SocketAddr>() {
            Ok(address) => self.config.known_nodes.push(KnownNode::Address(address)),
            Err(_) => self
                .config
                .known_nodes
                .push(KnownNode::Hostname(hostname.to_owned())),
        }
        self
    }

    /// Adds a known node with an address.
    pub fn known_node_addr(mut self, address: SocketAddr) -> Self {
        self.config.known_nodes.push(KnownNode::Address(address));
        self
    }

    /// Adds a list of known nodes with hostnames or address strings.
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        for hostname in hostnames {
            self = self.known_node(hostname);
        }
        self
    }

    /// Sets the wire compression negotiated with every node.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Sets the timeout of establishing a single connection.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = Some(interval);
        self
    }

    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keepalive_timeout = Some(timeout);
        self
    }

    /// Sets the number of connections kept to each node, per distance
    /// assigned by the load balancing policy.
    pub fn pool_size(mut self, local: NonZeroUsize, remote: NonZeroUsize) -> Self {
        self.config.pool_size_local = local;
        self.config.pool_size_remote = remote;
        self
    }

    /// Makes the session `USE` the given keyspace right after connecting.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Authenticates with a username and a password using the SASL PLAIN
    /// mechanism.
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            password.into(),
        )));
        self
    }

    /// Authenticates with a custom [`AuthenticatorProvider`].
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Sets the consistency used by statements which do not set their own.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    pub fn default_serial_consistency(
        mut self,
        serial_consistency: Option<SerialConsistency>,
    ) -> Self {
        self.config.default_serial_consistency = serial_consistency;
        self
    }

    /// Sets the client-side timeout of a whole request execution, retries
    /// included. `None` disables it.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn load_balancing_policy(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing_policy = policy;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn speculative_execution_policy(
        mut self,
        policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    ) -> Self {
        self.config.speculative_execution_policy = policy;
        self
    }

    pub fn cluster_metadata_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.cluster_metadata_refresh_interval = interval;
        self
    }

    pub fn hostname_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.config.hostname_resolution_timeout = Some(timeout);
        self
    }

    /// Builds the session, connecting to the cluster.
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_node_parses_addresses_and_keeps_hostnames() {
        let builder = SessionBuilder::new()
            .known_node("127.0.0.1:9042")
            .known_node("db1.example.com")
            .known_node_addr("10.0.0.7:19042".parse().unwrap());

        assert_eq!(
            builder.config.known_nodes,
            vec![
                KnownNode::Address("127.0.0.1:9042".parse().unwrap()),
                KnownNode::Hostname("db1.example.com".to_owned()),
                KnownNode::Address("10.0.0.7:19042".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn settings_land_in_the_config() {
        let builder = SessionBuilder::new()
            .compression(Some(Compression::Lz4))
            .tcp_nodelay(false)
            .connection_timeout(Duration::from_secs(2))
            .use_keyspace("ks", true)
            .default_consistency(Consistency::One)
            .request_timeout(None);

        let config = &builder.config;
        assert_eq!(config.compression, Some(Compression::Lz4));
        assert!(!config.tcp_nodelay);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.used_keyspace.as_deref(), Some("ks"));
        assert!(config.keyspace_case_sensitive);
        assert_eq!(config.default_consistency, Consistency::One);
        assert_eq!(config.request_timeout, None);
    }
}
