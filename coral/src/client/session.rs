//! The session: the entry point for running CQL requests against a cluster.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::OnceCell;
use tracing::debug;

use coral_cql::frame::response::{result, NonErrorResponse};
use coral_cql::frame::types::{Consistency, SerialConsistency};
use coral_cql::frame::Compression;
use coral_cql::serialize::{serialize_values, SerializedValues};
use coral_cql::value::CqlValue;

use crate::authentication::AuthenticatorProvider;
use crate::client::pager::{PagerConfig, QueryPager};
use crate::cluster::{Cluster, ClusterState, KnownNode, NodeRef};
use crate::errors::{
    ExecutionError, MetadataError, NewSessionError, RequestAttemptError, RequestError,
    SerializationError,
};
use crate::execution::{run_request_fiber, AttemptedNodesErrors, RunRequestResult};
use crate::network::{Connection, ConnectionConfig, PoolConfig, VerifiedKeyspaceName};
use crate::policies::load_balancing::{DefaultPolicy, LoadBalancingPolicy, Plan, RoutingInfo};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::policies::speculative::{self, SpeculativeExecutionPolicy};
use crate::response::{Coordinator, NonErrorQueryResponse, QueryResult};
use crate::routing::Token;
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::prepared::PreparedStatement;
use crate::statement::{Statement, StatementConfig};

/// Configuration options for [`Session`].
/// Usually created and passed to [`Session::connect`] by [`SessionBuilder`].
///
/// [`SessionBuilder`]: crate::client::session_builder::SessionBuilder
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Initial contact points; at least one is required. The rest of the
    /// cluster is discovered from the system tables.
    pub known_nodes: Vec<KnownNode>,

    /// Wire compression negotiated with every node, if the node supports it.
    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,

    /// How often the driver sends its own keepalive requests over idle
    /// connections.
    pub keepalive_interval: Option<Duration>,
    /// How long a keepalive request may go unanswered before the connection
    /// is considered broken.
    pub keepalive_timeout: Option<Duration>,

    pub pool_size_local: NonZeroUsize,
    pub pool_size_remote: NonZeroUsize,

    /// Keyspace to USE right after connecting.
    pub used_keyspace: Option<String>,
    pub keyspace_case_sensitive: bool,

    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// Consistency used by statements which do not set their own.
    pub default_consistency: Consistency,
    pub default_serial_consistency: Option<SerialConsistency>,

    /// Client-side timeout of a whole request execution, retries and
    /// speculative executions included. `None` disables it.
    pub request_timeout: Option<Duration>,

    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,

    /// How often cluster metadata is refreshed in the absence of server
    /// events.
    pub cluster_metadata_refresh_interval: Duration,
    pub hostname_resolution_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            known_nodes: Vec::new(),
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            pool_size_local: NonZeroUsize::new(2).unwrap(),
            pool_size_remote: NonZeroUsize::new(1).unwrap(),
            used_keyspace: None,
            keyspace_case_sensitive: false,
            authenticator: None,
            default_consistency: Consistency::default(),
            default_serial_consistency: None,
            request_timeout: Some(Duration::from_secs(30)),
            load_balancing_policy: Arc::new(DefaultPolicy::default()),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            speculative_execution_policy: None,
            cluster_metadata_refresh_interval: Duration::from_secs(60),
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection to the cluster, shared by all requests of an application.
///
/// `Session` is cheap to share behind an `Arc` and all of its methods take
/// `&self`; a single session per cluster is the intended usage.
pub struct Session {
    cluster: Cluster,

    default_load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    default_retry_policy: Arc<dyn RetryPolicy>,
    default_speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,

    default_consistency: Consistency,
    default_serial_consistency: Option<SerialConsistency>,
    default_request_timeout: Option<Duration>,

    /// One cell per statement text. The cell collapses concurrent prepares
    /// of the same statement into a single round of PREPARE requests.
    prepared_statement_cache: DashMap<String, Arc<OnceCell<PreparedStatement>>>,

    /// The keyspace set by `use_keyspace`, used for token-aware routing.
    keyspace_name: ArcSwapOption<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("default_consistency", &self.default_consistency)
            .field("default_serial_consistency", &self.default_serial_consistency)
            .field("default_request_timeout", &self.default_request_timeout)
            .field("keyspace_name", &self.keyspace_name)
            .finish_non_exhaustive()
    }
}

// A plan shared by the fibers of one speculative execution. Each node is
// handed out to exactly one fiber.
struct SharedPlan<'a, I>
where
    I: Iterator<Item = NodeRef<'a>>,
{
    iter: std::sync::Mutex<I>,
}

impl<'a, I> Iterator for &SharedPlan<'a, I>
where
    I: Iterator<Item = NodeRef<'a>>,
{
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.lock().ok()?.next()
    }
}

impl Session {
    /// Estabilishes a CQL session with the cluster.
    pub async fn connect(config: SessionConfig) -> Result<Self, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let connection_config = ConnectionConfig {
            compression: config.compression,
            tcp_nodelay: config.tcp_nodelay,
            tcp_keepalive_interval: config.tcp_keepalive_interval,
            connect_timeout: config.connect_timeout,
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            authenticator: config.authenticator,
            ..ConnectionConfig::default()
        };
        let pool_config = PoolConfig {
            connection_config,
            pool_size_local: config.pool_size_local,
            pool_size_remote: config.pool_size_remote,
        };

        let cluster = Cluster::new(
            config.known_nodes,
            pool_config,
            Arc::clone(&config.load_balancing_policy),
            config.hostname_resolution_timeout,
            config.cluster_metadata_refresh_interval,
        )
        .await?;

        let session = Session {
            cluster,
            default_load_balancing_policy: config.load_balancing_policy,
            default_retry_policy: config.retry_policy,
            default_speculative_execution_policy: config.speculative_execution_policy,
            default_consistency: config.default_consistency,
            default_serial_consistency: config.default_serial_consistency,
            default_request_timeout: config.request_timeout,
            prepared_statement_cache: DashMap::new(),
            keyspace_name: ArcSwapOption::from(None),
        };

        if let Some(keyspace_name) = config.used_keyspace {
            session
                .use_keyspace(keyspace_name, config.keyspace_case_sensitive)
                .await?;
        }

        Ok(session)
    }

    /// Runs an unpaged query, returning all of its rows at once.
    ///
    /// This should only be used for requests whose result is known to be
    /// small; for anything unbounded prefer [`Session::query_iter`], which
    /// does not require the whole result set to fit in a single response.
    ///
    /// If `values` are nonempty, the statement is first prepared on the
    /// target connection, adding a round trip; statements executed
    /// repeatedly should be prepared with [`Session::prepare`] instead.
    pub async fn query_unpaged(
        &self,
        query: impl Into<Statement>,
        values: &[Option<CqlValue>],
    ) -> Result<QueryResult, ExecutionError> {
        let statement = query.into();
        let serialized_values = serialize_values(values.iter().map(Option::as_ref))?;
        let (response, coordinator) = self
            .do_query(&statement, &serialized_values, None, None)
            .await?;
        Ok(response.into_query_result(coordinator)?)
    }

    /// Fetches a single page of the result, starting from the given paging
    /// state. The returned result carries the paging state to continue from,
    /// if the result set has more pages.
    pub async fn query_single_page(
        &self,
        query: impl Into<Statement>,
        values: &[Option<CqlValue>],
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, ExecutionError> {
        let statement = query.into();
        let serialized_values = serialize_values(values.iter().map(Option::as_ref))?;
        let (response, coordinator) = self
            .do_query(
                &statement,
                &serialized_values,
                Some(statement.get_page_size()),
                paging_state,
            )
            .await?;
        Ok(response.into_paged_query_result(coordinator)?)
    }

    /// Runs the query as a lazily paged stream of rows.
    pub async fn query_iter(
        &self,
        query: impl Into<Statement>,
        values: &[Option<CqlValue>],
    ) -> Result<QueryPager, ExecutionError> {
        let statement = query.into();
        if values.is_empty() {
            let config = self.pager_config(&statement.config, None);
            Ok(QueryPager::new_for_query(
                statement,
                SerializedValues::new(),
                config,
            ))
        } else {
            // A statement with values is executed prepared under the hood.
            // Preparing once up front beats a prepare per page.
            let prepared = self.prepare(statement).await?;
            self.execute_iter(prepared, values).await
        }
    }

    /// Executes a prepared statement, returning all of its rows at once.
    /// The request is routed to a replica of the partition it touches when
    /// token-aware routing is possible.
    pub async fn execute_unpaged(
        &self,
        prepared: &PreparedStatement,
        values: &[Option<CqlValue>],
    ) -> Result<QueryResult, ExecutionError> {
        let serialized_values = serialize_values(values.iter().map(Option::as_ref))?;
        let (response, coordinator) = self
            .do_execute(prepared, &serialized_values, None, None)
            .await?;
        Ok(response.into_query_result(coordinator)?)
    }

    /// Fetches a single page of a prepared statement's result; see
    /// [`Session::query_single_page`].
    pub async fn execute_single_page(
        &self,
        prepared: &PreparedStatement,
        values: &[Option<CqlValue>],
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, ExecutionError> {
        let serialized_values = serialize_values(values.iter().map(Option::as_ref))?;
        let (response, coordinator) = self
            .do_execute(
                prepared,
                &serialized_values,
                Some(prepared.get_page_size()),
                paging_state,
            )
            .await?;
        Ok(response.into_paged_query_result(coordinator)?)
    }

    /// Executes a prepared statement as a lazily paged stream of rows.
    pub async fn execute_iter(
        &self,
        prepared: PreparedStatement,
        values: &[Option<CqlValue>],
    ) -> Result<QueryPager, ExecutionError> {
        let serialized_values = serialize_values(values.iter().map(Option::as_ref))?;
        let token = prepared.calculate_token(&serialized_values)?;
        let config = self.pager_config(&prepared.config, token);
        Ok(QueryPager::new_for_prepared_statement(
            prepared,
            serialized_values,
            config,
        ))
    }

    /// Executes a batch of statements. `values` must hold one list of bind
    /// values per statement, in order; statements without bind markers take
    /// an empty list.
    pub async fn batch(
        &self,
        batch: &Batch,
        values: &[Vec<Option<CqlValue>>],
    ) -> Result<QueryResult, ExecutionError> {
        if batch.statements.len() != values.len() {
            return Err(SerializationError::WrongBatchValuesCount {
                statements: batch.statements.len(),
                value_lists: values.len(),
            }
            .into());
        }
        // The statement count is a u16 on the wire.
        if batch.statements.len() > u16::MAX as usize {
            return Err(SerializationError::TooManyValues.into());
        }

        let serialized_values: Vec<SerializedValues> = values
            .iter()
            .map(|list| serialize_values(list.iter().map(Option::as_ref)))
            .collect::<Result<_, _>>()?;

        // The batch is routed by its first prepared statement, like the
        // whole batch touched that statement's partition.
        let token = match batch.statements.first() {
            Some(BatchStatement::PreparedStatement(prepared)) => match serialized_values.first() {
                Some(values) => prepared.calculate_token(values)?,
                None => None,
            },
            _ => None,
        };

        let keyspace_name = self.keyspace_name.load_full();
        let consistency = batch.config.consistency.unwrap_or(self.default_consistency);
        let serial_consistency = batch
            .config
            .serial_consistency
            .or(self.default_serial_consistency);
        let statement_info = RoutingInfo {
            consistency,
            serial_consistency,
            token,
            keyspace: keyspace_name.as_deref().map(String::as_str),
        };

        let (run_request_result, coordinator) = self
            .run_request(
                statement_info,
                &batch.config,
                |connection: Arc<Connection>, consistency: Consistency| {
                    let serialized_values = &serialized_values;
                    async move {
                        connection
                            .batch_with_consistency(
                                batch,
                                serialized_values,
                                consistency,
                                serial_consistency,
                            )
                            .await?
                            .into_non_error_query_response()
                    }
                },
            )
            .await?;

        match run_request_result {
            RunRequestResult::Completed(response) => {
                Ok(response.into_query_result(coordinator)?)
            }
            RunRequestResult::IgnoredWriteError => Ok(QueryResult::new(
                coordinator,
                None,
                Vec::new(),
                None,
                None,
                Vec::new(),
            )),
        }
    }

    /// Prepares the statement on all nodes of the cluster.
    ///
    /// Prepared statements are cached per statement text; preparing an
    /// already known statement costs no round trip, and concurrent prepares
    /// of the same statement are collapsed into one.
    pub async fn prepare(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<PreparedStatement, ExecutionError> {
        let statement = statement.into();

        let cell = self
            .prepared_statement_cache
            .entry(statement.contents.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        match cell
            .get_or_try_init(|| self.prepare_on_all_nodes(&statement))
            .await
        {
            Ok(prepared) => {
                // The cache shares the id and metadata; per-statement
                // execution settings come from the statement being prepared.
                let mut prepared = prepared.clone();
                prepared.config = statement.config;
                Ok(prepared)
            }
            Err(error) => {
                // Drop the failed cell so the next prepare starts afresh.
                self.prepared_statement_cache.remove(&statement.contents);
                Err(error)
            }
        }
    }

    async fn prepare_on_all_nodes(
        &self,
        statement: &Statement,
    ) -> Result<PreparedStatement, ExecutionError> {
        let cluster_state = self.cluster.get_state();
        let connections = cluster_state.working_connections_to_all_nodes()?;

        // Prepare on every reachable node, so the statement is in every
        // node's cache before the first EXECUTE lands on it.
        let results = join_all(
            connections
                .iter()
                .map(|connection| connection.prepare(statement)),
        )
        .await;

        let mut first_ok: Option<PreparedStatement> = None;
        let mut first_error: Option<RequestAttemptError> = None;

        for result in results {
            match result {
                Ok(prepared) => match &first_ok {
                    None => first_ok = Some(prepared),
                    Some(existing) if existing.get_id() != prepared.get_id() => {
                        return Err(ExecutionError::LastAttemptError(
                            RequestAttemptError::RepreparedIdChanged {
                                statement: statement.contents.clone(),
                                expected_id: existing.get_id().to_vec(),
                                reprepared_id: prepared.get_id().to_vec(),
                            },
                        ));
                    }
                    Some(_) => {}
                },
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        match (first_ok, first_error) {
            (Some(prepared), _) => Ok(prepared),
            (None, Some(error)) => Err(error.into()),
            // `connections` is nonempty, so at least one result was seen.
            (None, None) => Err(ExecutionError::EmptyPlan),
        }
    }

    /// Sends `USE keyspace_name` to all connections, current and future.
    /// Unqualified table names in subsequent requests resolve against this
    /// keyspace.
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), ExecutionError> {
        let keyspace_name = keyspace_name.into();
        let verified = VerifiedKeyspaceName::new(keyspace_name.clone(), case_sensitive)?;

        self.keyspace_name.store(Some(Arc::new(keyspace_name)));
        self.cluster.use_keyspace(verified).await
    }

    /// The keyspace set by [`Session::use_keyspace`], if any.
    pub fn get_keyspace(&self) -> Option<Arc<String>> {
        self.keyspace_name.load_full()
    }

    /// Asks the control connection to re-read cluster metadata immediately
    /// instead of waiting for the periodic refresh.
    pub async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        self.cluster.refresh_metadata().await
    }

    /// The current snapshot of cluster topology.
    pub fn cluster_state(&self) -> Arc<ClusterState> {
        self.cluster.get_state()
    }

    async fn do_query(
        &self,
        statement: &Statement,
        serialized_values: &SerializedValues,
        page_size: Option<i32>,
        paging_state: Option<Bytes>,
    ) -> Result<(NonErrorQueryResponse, Coordinator), ExecutionError> {
        let consistency = statement
            .config
            .consistency
            .unwrap_or(self.default_consistency);
        let serial_consistency = statement
            .config
            .serial_consistency
            .or(self.default_serial_consistency);
        let statement_info = RoutingInfo {
            consistency,
            serial_consistency,
            token: None,
            keyspace: None,
        };

        let (run_request_result, coordinator) = self
            .run_request(
                statement_info,
                &statement.config,
                |connection: Arc<Connection>, consistency: Consistency| {
                    let paging_state = paging_state.clone();
                    async move {
                        let response = if serialized_values.is_empty() {
                            connection
                                .query_raw_with_consistency(
                                    statement,
                                    serialized_values,
                                    consistency,
                                    serial_consistency,
                                    page_size,
                                    paging_state,
                                )
                                .await?
                        } else {
                            // Bind values require preparation; prepare on the
                            // connection the attempt runs on.
                            let prepared = connection.prepare(statement).await?;
                            connection
                                .execute_raw_with_consistency(
                                    &prepared,
                                    serialized_values,
                                    consistency,
                                    serial_consistency,
                                    page_size,
                                    paging_state,
                                )
                                .await?
                        };
                        response.into_non_error_query_response()
                    }
                },
            )
            .await?;

        self.finish_request(run_request_result, coordinator).await
    }

    async fn do_execute(
        &self,
        prepared: &PreparedStatement,
        serialized_values: &SerializedValues,
        page_size: Option<i32>,
        paging_state: Option<Bytes>,
    ) -> Result<(NonErrorQueryResponse, Coordinator), ExecutionError> {
        let token = prepared.calculate_token(serialized_values)?;
        let keyspace_name = self.keyspace_name.load_full();

        let consistency = prepared
            .config
            .consistency
            .unwrap_or(self.default_consistency);
        let serial_consistency = prepared
            .config
            .serial_consistency
            .or(self.default_serial_consistency);
        let statement_info = RoutingInfo {
            consistency,
            serial_consistency,
            token,
            keyspace: keyspace_name.as_deref().map(String::as_str),
        };

        let (run_request_result, coordinator) = self
            .run_request(
                statement_info,
                &prepared.config,
                |connection: Arc<Connection>, consistency: Consistency| {
                    let paging_state = paging_state.clone();
                    async move {
                        connection
                            .execute_raw_with_consistency(
                                prepared,
                                serialized_values,
                                consistency,
                                serial_consistency,
                                page_size,
                                paging_state,
                            )
                            .await?
                            .into_non_error_query_response()
                    }
                },
            )
            .await?;

        self.finish_request(run_request_result, coordinator).await
    }

    // Common tail of query/execute paths: reacts to SetKeyspace results and
    // turns an ignored write error into an empty Void response.
    async fn finish_request(
        &self,
        run_request_result: RunRequestResult<NonErrorQueryResponse>,
        coordinator: Coordinator,
    ) -> Result<(NonErrorQueryResponse, Coordinator), ExecutionError> {
        let response = match run_request_result {
            RunRequestResult::Completed(response) => {
                self.handle_set_keyspace_response(&response).await?;
                response
            }
            RunRequestResult::IgnoredWriteError => NonErrorQueryResponse {
                response: NonErrorResponse::Result(result::Result::Void),
                tracing_id: None,
                warnings: Vec::new(),
            },
        };
        Ok((response, coordinator))
    }

    async fn handle_set_keyspace_response(
        &self,
        response: &NonErrorQueryResponse,
    ) -> Result<(), ExecutionError> {
        if let Some(set_keyspace) = response.as_set_keyspace() {
            debug!(
                "Detected USE KEYSPACE query, setting keyspace to {}",
                set_keyspace.keyspace_name
            );
            // The server accepted the name, so it needs no re-verification;
            // pass it on quoted to preserve its exact case.
            self.use_keyspace(set_keyspace.keyspace_name.clone(), true)
                .await?;
        }
        Ok(())
    }

    fn pager_config(&self, config: &StatementConfig, token: Option<Token>) -> PagerConfig {
        let retry_policy = config
            .retry_policy
            .as_deref()
            .unwrap_or(&*self.default_retry_policy);
        PagerConfig {
            cluster_state: self.cluster.get_state(),
            policy: Arc::clone(&self.default_load_balancing_policy),
            retry_session: retry_policy.new_session(),
            consistency: config.consistency.unwrap_or(self.default_consistency),
            serial_consistency: config
                .serial_consistency
                .or(self.default_serial_consistency),
            is_idempotent: config.is_idempotent,
            token,
        }
    }

    // Runs the request over the load balancing plan, with retries, optional
    // speculative executions and the client timeout around it all.
    async fn run_request<'a, QueryFut>(
        &'a self,
        statement_info: RoutingInfo<'a>,
        statement_config: &'a StatementConfig,
        run_request_once: impl Fn(Arc<Connection>, Consistency) -> QueryFut + 'a,
    ) -> Result<(RunRequestResult<NonErrorQueryResponse>, Coordinator), ExecutionError>
    where
        QueryFut: Future<Output = Result<NonErrorQueryResponse, RequestAttemptError>>,
    {
        let cluster_state = self.cluster.get_state();
        let consistency = statement_config
            .consistency
            .unwrap_or(self.default_consistency);
        let retry_policy = statement_config
            .retry_policy
            .as_deref()
            .unwrap_or(&*self.default_retry_policy);
        let speculative_policy = statement_config
            .speculative_execution_policy
            .as_deref()
            .or(self.default_speculative_execution_policy.as_deref());

        let plan = Plan::new(
            &*self.default_load_balancing_policy,
            &statement_info,
            &cluster_state,
        );
        let node_errors = AttemptedNodesErrors::new();

        let runner = async {
            match speculative_policy {
                // Only idempotent requests may run speculatively: a slow node
                // may have applied the request after all.
                Some(speculative) if statement_config.is_idempotent => {
                    let shared_plan = SharedPlan {
                        iter: std::sync::Mutex::new(plan),
                    };
                    let request_runner_generator = |_is_speculative: bool| {
                        run_request_fiber(
                            &shared_plan,
                            &run_request_once,
                            retry_policy.new_session(),
                            statement_config.is_idempotent,
                            consistency,
                            &node_errors,
                        )
                    };
                    speculative::execute(speculative, request_runner_generator).await
                }
                _ => run_request_fiber(
                    plan,
                    &run_request_once,
                    retry_policy.new_session(),
                    statement_config.is_idempotent,
                    consistency,
                    &node_errors,
                )
                .await
                .unwrap_or(Err(RequestError::EmptyPlan)),
            }
        };

        let effective_timeout = statement_config
            .request_timeout
            .or(self.default_request_timeout);
        let result = match effective_timeout {
            Some(timeout) => tokio::time::timeout(timeout, runner)
                .await
                .unwrap_or(Err(RequestError::RequestTimeout(timeout))),
            None => runner.await,
        };

        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn default_config_has_sane_execution_defaults() {
        let config = SessionConfig::new();
        assert!(config.known_nodes.is_empty());
        assert_eq!(config.default_consistency, Consistency::LocalQuorum);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
        assert!(config.speculative_execution_policy.is_none());
        assert!(config.compression.is_none());
    }

    #[tokio::test]
    async fn connect_rejects_empty_known_nodes() {
        let result = Session::connect(SessionConfig::new()).await;
        assert_matches!(result, Err(NewSessionError::EmptyKnownNodesList));
    }
}
