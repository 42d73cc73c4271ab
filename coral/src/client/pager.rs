//! Transparent paging of large result sets.
//!
//! A [`QueryPager`] streams rows to the user while a background worker
//! fetches consecutive pages, so the next page is usually already in flight
//! while the current one is being consumed.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::{FutureExt, Stream};
use tokio::sync::mpsc;
use tracing::{trace, trace_span, Instrument};

use coral_cql::frame::response::result::{ColumnSpec, Row};
use coral_cql::frame::types::{Consistency, SerialConsistency};
use coral_cql::serialize::SerializedValues;

use crate::cluster::ClusterState;
use crate::errors::{ExecutionError, NodeRequestError, RequestAttemptError};
use crate::execution::AttemptedNodesErrors;
use crate::network::Connection;
use crate::policies::load_balancing::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::policies::retry::{RequestInfo, RetryDecision, RetrySession};
use crate::response::{Coordinator, QueryResult};
use crate::routing::Token;
use crate::statement::prepared::PreparedStatement;
use crate::statement::Statement;

/// Execution settings of a paged request, resolved by the session from the
/// statement's config and the session defaults.
pub(crate) struct PagerConfig {
    pub(crate) cluster_state: Arc<ClusterState>,
    pub(crate) policy: Arc<dyn LoadBalancingPolicy>,
    pub(crate) retry_session: Box<dyn RetrySession>,
    pub(crate) consistency: Consistency,
    pub(crate) serial_consistency: Option<SerialConsistency>,
    pub(crate) is_idempotent: bool,
    pub(crate) token: Option<Token>,
}

enum PagedRequest {
    Query {
        statement: Statement,
        values: SerializedValues,
    },
    Prepared {
        prepared: PreparedStatement,
        values: SerializedValues,
    },
}

// Fetches pages one by one and pushes them into the channel. The channel has
// capacity 1, so the worker prefetches at most one page ahead of the user.
struct PagerWorker {
    sender: mpsc::Sender<Result<QueryResult, ExecutionError>>,
    request: PagedRequest,
    serial_consistency: Option<SerialConsistency>,
    is_idempotent: bool,
    retry_session: Box<dyn RetrySession>,
    page_size: i32,
    paging_state: Option<Bytes>,
    node_errors: AttemptedNodesErrors,
}

impl PagerWorker {
    async fn work(
        mut self,
        cluster_state: Arc<ClusterState>,
        policy: Arc<dyn LoadBalancingPolicy>,
        consistency: Consistency,
        token: Option<Token>,
    ) {
        let routing_info = RoutingInfo {
            consistency,
            serial_consistency: self.serial_consistency,
            token,
            keyspace: None,
        };
        let plan = Plan::new(&*policy, &routing_info, &cluster_state);

        let mut current_consistency = consistency;
        let mut attempted_any_node = false;

        'nodes_in_plan: for node in plan {
            let span = trace_span!("Fetching pages", node = %node.address);
            attempted_any_node = true;

            'same_node_retries: loop {
                let connection = match node.get_random_connection() {
                    Ok(connection) => connection,
                    Err(e) => {
                        trace!(parent: &span, error = %e, "No connection to the node");
                        self.node_errors
                            .record(node.address, NodeRequestError::Pool(e));
                        continue 'nodes_in_plan;
                    }
                };
                let coordinator = Coordinator::new(node, connection.get_connect_address());

                // The paging state carries the position in the result set, so
                // after a mid-stream failure the next node resumes where the
                // previous one left off.
                loop {
                    let page = self
                        .fetch_page(&connection, &coordinator, current_consistency)
                        .instrument(span.clone())
                        .await;

                    let attempt_error = match page {
                        Ok(ControlFlow::Break(())) => return,
                        Ok(ControlFlow::Continue(())) => continue,
                        Err(error) => error,
                    };

                    trace!(parent: &span, error = %attempt_error, "Page fetch failed");
                    self.node_errors
                        .record(node.address, NodeRequestError::Attempt(attempt_error.clone()));

                    let retry_decision = self.retry_session.decide_should_retry(RequestInfo {
                        error: &attempt_error,
                        is_idempotent: self.is_idempotent,
                        consistency: current_consistency,
                    });
                    trace!(parent: &span, retry_decision = ?retry_decision);

                    match retry_decision {
                        RetryDecision::RetrySameTarget(new_consistency) => {
                            current_consistency = new_consistency.unwrap_or(current_consistency);
                            continue 'same_node_retries;
                        }
                        RetryDecision::RetryNextTarget(new_consistency) => {
                            current_consistency = new_consistency.unwrap_or(current_consistency);
                            continue 'nodes_in_plan;
                        }
                        // Ignoring a write error makes no sense for a read of
                        // further pages; give up like DontRetry does.
                        RetryDecision::DontRetry | RetryDecision::IgnoreWriteError => {
                            self.report_error(ExecutionError::LastAttemptError(attempt_error))
                                .await;
                            return;
                        }
                    }
                }
            }
        }

        let error = if attempted_any_node {
            ExecutionError::NoHostAvailable(self.node_errors.no_host_available())
        } else {
            ExecutionError::EmptyPlan
        };
        self.report_error(error).await;
    }

    // Fetches and forwards a single page. `Break` means fetching is over:
    // either the last page was delivered or the user dropped the pager.
    async fn fetch_page(
        &mut self,
        connection: &Arc<Connection>,
        coordinator: &Coordinator,
        consistency: Consistency,
    ) -> Result<ControlFlow<()>, RequestAttemptError> {
        let response = match &self.request {
            PagedRequest::Query { statement, values } => {
                connection
                    .query_raw_with_consistency(
                        statement,
                        values,
                        consistency,
                        self.serial_consistency,
                        Some(self.page_size),
                        self.paging_state.clone(),
                    )
                    .await?
            }
            PagedRequest::Prepared { prepared, values } => {
                connection
                    .execute_raw_with_consistency(
                        prepared,
                        values,
                        consistency,
                        self.serial_consistency,
                        Some(self.page_size),
                        self.paging_state.clone(),
                    )
                    .await?
            }
        };

        let result = response
            .into_non_error_query_response()?
            .into_paged_query_result(coordinator.clone())?;

        self.paging_state = result.paging_state().cloned();
        let is_last_page = self.paging_state.is_none();

        if self.sender.send(Ok(result)).await.is_err() {
            // The pager was dropped, nobody wants further pages.
            return Ok(ControlFlow::Break(()));
        }

        if is_last_page {
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    }

    async fn report_error(&mut self, error: ExecutionError) {
        // A send error means the pager was dropped; the error has no one to
        // go to then.
        let _ = self.sender.send(Err(error)).await;
    }
}

/// An asynchronous stream over the rows of a paged request.
///
/// Pages are fetched lazily, as the stream is polled. An error encountered
/// while fetching a page is yielded as an `Err` item at the point of
/// iteration where the page would have started.
///
/// Dropping the pager stops the background fetching.
pub struct QueryPager {
    current_page: std::vec::IntoIter<Row>,
    page_receiver: mpsc::Receiver<Result<QueryResult, ExecutionError>>,
    col_specs: Vec<ColumnSpec>,
    _worker_handle: RemoteHandle<()>,
}

impl QueryPager {
    pub(crate) fn new_for_query(
        statement: Statement,
        values: SerializedValues,
        config: PagerConfig,
    ) -> Self {
        let page_size = statement.get_page_size();
        Self::spawn(PagedRequest::Query { statement, values }, page_size, config)
    }

    pub(crate) fn new_for_prepared_statement(
        prepared: PreparedStatement,
        values: SerializedValues,
        config: PagerConfig,
    ) -> Self {
        let page_size = prepared.get_page_size();
        Self::spawn(
            PagedRequest::Prepared { prepared, values },
            page_size,
            config,
        )
    }

    fn spawn(request: PagedRequest, page_size: i32, config: PagerConfig) -> Self {
        let (sender, page_receiver) = mpsc::channel(1);

        let worker = PagerWorker {
            sender,
            request,
            serial_consistency: config.serial_consistency,
            is_idempotent: config.is_idempotent,
            retry_session: config.retry_session,
            page_size,
            paging_state: None,
            node_errors: AttemptedNodesErrors::new(),
        };

        let (fut, worker_handle) = worker
            .work(
                config.cluster_state,
                config.policy,
                config.consistency,
                config.token,
            )
            .remote_handle();
        tokio::task::spawn(fut);

        Self {
            current_page: Vec::new().into_iter(),
            page_receiver,
            col_specs: Vec::new(),
            _worker_handle: worker_handle,
        }
    }

    /// Column specifications of the result set. Empty until the first page
    /// has been received.
    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }
}

impl Stream for QueryPager {
    type Item = Result<Row, ExecutionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pager = self.get_mut();
        loop {
            if let Some(row) = pager.current_page.next() {
                return Poll::Ready(Some(Ok(row)));
            }

            match ready!(pager.page_receiver.poll_recv(cx)) {
                Some(Ok(result)) => {
                    if pager.col_specs.is_empty() {
                        pager.col_specs = result.col_specs().to_vec();
                    }
                    // Non-Rows results produce no rows but also no error; an
                    // empty page just moves the stream on to the next one.
                    pager.current_page = result.into_rows().unwrap_or_default().into_iter();
                }
                Some(Err(error)) => return Poll::Ready(Some(Err(error))),
                None => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use assert_matches::assert_matches;
    use futures::StreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use coral_cql::frame::types;
    use coral_cql::value::CqlValue;

    use crate::cluster::Node;
    use crate::errors::DbError;
    use crate::network::{ConnectionConfig, NodeConnectionPool};
    use crate::policies::load_balancing::DefaultPolicy;
    use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};

    use super::*;

    fn connected_node(port: u16) -> (Arc<Node>, DuplexStream) {
        let address = SocketAddr::from_str(&format!("127.0.0.1:{port}")).unwrap();
        let (client_end, server_end) = tokio::io::duplex(4096);
        let (connection, _error_receiver) =
            Connection::new_with_stream(address, ConnectionConfig::default(), client_end);
        let pool = NodeConnectionPool::new_for_test(vec![Arc::new(connection)]);
        (
            Arc::new(Node::new_with_pool_for_test(address, pool)),
            server_end,
        )
    }

    fn pager_config(cluster_state: ClusterState) -> PagerConfig {
        PagerConfig {
            cluster_state: Arc::new(cluster_state),
            policy: Arc::new(DefaultPolicy::default()),
            retry_session: DefaultRetryPolicy::new().new_session(),
            consistency: Consistency::One,
            serial_consistency: None,
            is_idempotent: false,
            token: None,
        }
    }

    // The body of a RESULT::Rows response with a single int column; each
    // page except the last carries a paging state.
    fn rows_body(values: &[i32], more_pages: bool) -> Vec<u8> {
        let mut body = Vec::new();
        types::write_int(0x0002, &mut body); // kind: Rows
        let flags = if more_pages { 0x0003 } else { 0x0001 };
        types::write_int(flags, &mut body);
        types::write_int(1, &mut body); // col count
        if more_pages {
            types::write_bytes(b"next-page", &mut body).unwrap();
        }
        types::write_string("ks", &mut body).unwrap();
        types::write_string("tbl", &mut body).unwrap();
        types::write_string("n", &mut body).unwrap();
        types::write_short(0x0009, &mut body); // int
        types::write_int(values.len() as i32, &mut body);
        for value in values {
            types::write_bytes(&value.to_be_bytes(), &mut body).unwrap();
        }
        body
    }

    fn error_body(code: i32, reason: &str) -> Vec<u8> {
        let mut body = Vec::new();
        types::write_int(code, &mut body);
        types::write_string(reason, &mut body).unwrap();
        body
    }

    // Reads request frames and answers each with the next prepared response
    // (opcode, body), echoing the stream id.
    async fn serve_responses(mut server_end: DuplexStream, responses: Vec<(u8, Vec<u8>)>) {
        for (opcode, body) in responses {
            let mut header = [0u8; 9];
            if server_end.read_exact(&mut header).await.is_err() {
                return;
            }
            let body_len = u32::from_be_bytes(header[5..9].try_into().unwrap()) as usize;
            let mut request_body = vec![0u8; body_len];
            if server_end.read_exact(&mut request_body).await.is_err() {
                return;
            }

            let mut frame = vec![0x84, 0x00, header[2], header[3], opcode];
            frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
            frame.extend_from_slice(&body);
            if server_end.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn rows_are_streamed_across_page_boundaries() {
        let (node, server_end) = connected_node(9042);
        tokio::task::spawn(serve_responses(
            server_end,
            vec![
                (0x08, rows_body(&[1, 2, 3], true)),
                (0x08, rows_body(&[4, 5], false)),
            ],
        ));

        let config = pager_config(ClusterState::new_for_test(vec![node], vec![]));
        let mut pager = QueryPager::new_for_query(
            Statement::new("SELECT n FROM ks.tbl"),
            SerializedValues::new(),
            config,
        );

        let mut collected = Vec::new();
        while let Some(row) = pager.next().await {
            collected.push(row.unwrap().columns[0].clone());
        }

        let expected: Vec<_> = (1..=5).map(|n| Some(CqlValue::Int(n))).collect();
        assert_eq!(collected, expected);
        assert_eq!(pager.col_specs().len(), 1);
        assert_eq!(pager.col_specs()[0].name, "n");
    }

    #[tokio::test]
    async fn fetch_error_surfaces_at_the_iteration_point() {
        let (node, server_end) = connected_node(9042);
        tokio::task::spawn(serve_responses(
            server_end,
            vec![
                (0x08, rows_body(&[7], true)),
                (0x00, error_body(0x2000, "syntax error")),
            ],
        ));

        let config = pager_config(ClusterState::new_for_test(vec![node], vec![]));
        let mut pager = QueryPager::new_for_query(
            Statement::new("SELECT n FROM ks.tbl"),
            SerializedValues::new(),
            config,
        );

        // The first page is delivered intact.
        let row = pager.next().await.unwrap().unwrap();
        assert_eq!(row.columns[0], Some(CqlValue::Int(7)));

        // The failed fetch of the second page turns into an error item.
        let error = pager.next().await.unwrap().unwrap_err();
        assert_matches!(
            error,
            ExecutionError::LastAttemptError(RequestAttemptError::DbError(
                DbError::SyntaxError,
                _
            ))
        );
        assert!(pager.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_plan_yields_an_error_item() {
        let config = pager_config(ClusterState::empty_for_test());
        let mut pager = QueryPager::new_for_query(
            Statement::new("SELECT n FROM ks.tbl"),
            SerializedValues::new(),
            config,
        );

        let error = pager.next().await.unwrap().unwrap_err();
        assert_matches!(error, ExecutionError::EmptyPlan);
        assert!(pager.next().await.is_none());
    }
}
