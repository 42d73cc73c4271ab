//! The request execution core: walks the nodes of a load-balancing plan,
//! consulting the retry policy between attempts, until an attempt is
//! decisive or the plan runs out.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{trace, trace_span, warn, Instrument};

use coral_cql::frame::types::Consistency;

use crate::cluster::NodeRef;
use crate::errors::{NoHostAvailableError, NodeRequestError, RequestAttemptError, RequestError};
use crate::network::Connection;
use crate::policies::retry::{RequestInfo, RetryDecision, RetrySession};
use crate::response::Coordinator;

/// The resolution of a single execution fiber.
#[derive(Debug)]
pub(crate) enum RunRequestResult<ResT> {
    Completed(ResT),
    IgnoredWriteError,
}

/// The last error observed on each attempted node, shared by all fibers of
/// one request execution. Turned into a [`NoHostAvailableError`] when the
/// plan is exhausted without a decisive response.
#[derive(Debug, Default)]
pub(crate) struct AttemptedNodesErrors {
    errors: Mutex<Vec<(SocketAddr, NodeRequestError)>>,
}

impl AttemptedNodesErrors {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, address: SocketAddr, error: NodeRequestError) {
        let mut errors = self.errors.lock().unwrap();
        match errors.iter_mut().find(|(addr, _)| *addr == address) {
            Some((_, slot)) => *slot = error,
            None => errors.push((address, error)),
        }
    }

    pub(crate) fn no_host_available(&self) -> NoHostAvailableError {
        NoHostAvailableError {
            errors: self.errors.lock().unwrap().clone(),
        }
    }
}

/// Executes a request, node by node, over the given plan.
///
/// `run_request_once` performs a single attempt on a single connection;
/// between failed attempts the retry session decides whether to retry on the
/// same node, move on to the next one, or give up. Nodes whose pool cannot
/// lend a connection are skipped without involving the retry session; their
/// errors are recorded in `node_errors` like failed attempts are.
///
/// Returns `None` if the plan yielded no nodes at all. Otherwise returns the
/// response together with the coordinator that produced it, or the error
/// that stopped the execution: the last attempt's error when the retry
/// session gave up, or [`RequestError::NoHostAvailable`] when every node of
/// the plan was tried in vain.
pub(crate) async fn run_request_fiber<'a, QueryFut, ResT>(
    request_plan: impl Iterator<Item = NodeRef<'a>>,
    run_request_once: impl Fn(Arc<Connection>, Consistency) -> QueryFut,
    mut retry_session: Box<dyn RetrySession>,
    is_idempotent: bool,
    consistency: Consistency,
    node_errors: &AttemptedNodesErrors,
) -> Option<Result<(RunRequestResult<ResT>, Coordinator), RequestError>>
where
    QueryFut: Future<Output = Result<ResT, RequestAttemptError>>,
{
    let mut attempted_any_node = false;
    let mut current_consistency = consistency;

    'nodes_in_plan: for node in request_plan {
        let span = trace_span!("Executing request", node = %node.address);
        attempted_any_node = true;

        'same_node_retries: loop {
            let connection = match node.get_random_connection() {
                Ok(connection) => connection,
                Err(e) => {
                    trace!(parent: &span, error = %e, "No connection to the node");
                    // The request was never sent, so the retry policy has
                    // nothing to decide about.
                    node_errors.record(node.address, NodeRequestError::Pool(e));
                    continue 'nodes_in_plan;
                }
            };
            let coordinator = Coordinator::new(node, connection.get_connect_address());

            let request_result: Result<ResT, RequestAttemptError> =
                run_request_once(connection, current_consistency)
                    .instrument(span.clone())
                    .await;

            let attempt_error = match request_result {
                Ok(response) => {
                    trace!(parent: &span, "Request succeeded");
                    return Some(Ok((RunRequestResult::Completed(response), coordinator)));
                }
                Err(e) => e,
            };

            trace!(parent: &span, error = %attempt_error, "Request attempt failed");
            node_errors.record(node.address, NodeRequestError::Attempt(attempt_error.clone()));

            let retry_decision = retry_session.decide_should_retry(RequestInfo {
                error: &attempt_error,
                is_idempotent,
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
                RetryDecision::DontRetry => {
                    return Some(Err(RequestError::LastAttemptError(attempt_error)));
                }
                RetryDecision::IgnoreWriteError => {
                    warn!("Ignoring error per retry policy: {}", attempt_error);
                    return Some(Ok((RunRequestResult::IgnoredWriteError, coordinator)));
                }
            }
        }
    }

    attempted_any_node
        .then(|| Err(RequestError::NoHostAvailable(node_errors.no_host_available())))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use tokio::io::DuplexStream;

    use crate::cluster::Node;
    use crate::errors::BrokenConnectionError;
    use crate::network::{ConnectionConfig, NodeConnectionPool};
    use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};

    use super::*;

    // The other end of the duplex stream must stay alive for the duration of
    // the test, otherwise the connection reports itself broken.
    fn connected_node(port: u16) -> (Arc<Node>, DuplexStream) {
        let address = SocketAddr::from_str(&format!("127.0.0.1:{port}")).unwrap();
        let (client_end, server_end) = tokio::io::duplex(1024);
        let (connection, _error_receiver) =
            Connection::new_with_stream(address, ConnectionConfig::default(), client_end);
        let pool = NodeConnectionPool::new_for_test(vec![Arc::new(connection)]);
        (
            Arc::new(Node::new_with_pool_for_test(address, pool)),
            server_end,
        )
    }

    fn poolless_node(port: u16) -> Arc<Node> {
        Arc::new(Node::new_for_test(
            SocketAddr::from_str(&format!("127.0.0.1:{port}")).unwrap(),
            None,
            None,
        ))
    }

    struct AlwaysNextTargetSession;
    impl RetrySession for AlwaysNextTargetSession {
        fn decide_should_retry(&mut self, _request_info: RequestInfo) -> RetryDecision {
            RetryDecision::RetryNextTarget(None)
        }
        fn reset(&mut self) {}
    }

    struct PanickingSession;
    impl RetrySession for PanickingSession {
        fn decide_should_retry(&mut self, _request_info: RequestInfo) -> RetryDecision {
            panic!("the retry policy must not be consulted about pool errors")
        }
        fn reset(&mut self) {}
    }

    #[tokio::test]
    async fn exhausted_plan_reports_every_attempted_node() {
        let (nodes, _server_ends): (Vec<_>, Vec<_>) =
            (0..3).map(|i| connected_node(9042 + i)).unzip();

        let attempts = AtomicUsize::new(0);
        let node_errors = AttemptedNodesErrors::new();
        let result = run_request_fiber(
            nodes.iter(),
            |_connection, _consistency| {
                attempts.fetch_add(1, Ordering::Relaxed);
                async { Err::<(), _>(RequestAttemptError::UnableToAllocStreamId) }
            },
            Box::new(AlwaysNextTargetSession),
            true,
            Consistency::One,
            &node_errors,
        )
        .await;

        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        let err = result.unwrap().unwrap_err();
        let RequestError::NoHostAvailable(no_host) = err else {
            panic!("expected NoHostAvailable, got {err:?}");
        };
        assert_eq!(no_host.errors.len(), 3);
        for (address, error) in &no_host.errors {
            assert!(nodes.iter().any(|node| node.address == *address));
            assert_matches!(
                error,
                NodeRequestError::Attempt(RequestAttemptError::UnableToAllocStreamId)
            );
        }
    }

    #[tokio::test]
    async fn ambiguous_errors_move_on_only_for_idempotent_requests() {
        for (is_idempotent, expected_attempts) in [(false, 1), (true, 2)] {
            let (nodes, _server_ends): (Vec<_>, Vec<_>) =
                (0..2).map(|i| connected_node(9042 + i)).unzip();

            let attempts = AtomicUsize::new(0);
            let node_errors = AttemptedNodesErrors::new();
            let result = run_request_fiber(
                nodes.iter(),
                |_connection, _consistency| {
                    attempts.fetch_add(1, Ordering::Relaxed);
                    async {
                        Err::<(), _>(RequestAttemptError::BrokenConnectionError(
                            BrokenConnectionError::ChannelsClosed,
                        ))
                    }
                },
                DefaultRetryPolicy::new().new_session(),
                is_idempotent,
                Consistency::One,
                &node_errors,
            )
            .await;

            assert_eq!(attempts.load(Ordering::Relaxed), expected_attempts);
            let err = result.unwrap().unwrap_err();
            if is_idempotent {
                assert_matches!(err, RequestError::NoHostAvailable(_));
            } else {
                assert_matches!(
                    err,
                    RequestError::LastAttemptError(RequestAttemptError::BrokenConnectionError(_))
                );
            }
        }
    }

    #[tokio::test]
    async fn success_returns_the_coordinator_that_served_the_request() {
        let (broken, _server_end_broken) = connected_node(9042);
        let (healthy, _server_end_healthy) = connected_node(9043);
        let nodes = vec![broken, Arc::clone(&healthy)];

        let node_errors = AttemptedNodesErrors::new();
        let result = run_request_fiber(
            nodes.iter(),
            |connection, _consistency| {
                let is_healthy = connection.get_connect_address() == healthy.address;
                async move {
                    if is_healthy {
                        Ok(42)
                    } else {
                        Err(RequestAttemptError::UnableToAllocStreamId)
                    }
                }
            },
            Box::new(AlwaysNextTargetSession),
            true,
            Consistency::One,
            &node_errors,
        )
        .await;

        let (response, coordinator) = result.unwrap().unwrap();
        assert_matches!(response, RunRequestResult::Completed(42));
        assert_eq!(coordinator.node().address, healthy.address);
    }

    #[tokio::test]
    async fn pool_errors_skip_the_retry_policy() {
        let nodes = vec![poolless_node(9042), poolless_node(9043)];

        let node_errors = AttemptedNodesErrors::new();
        let result = run_request_fiber(
            nodes.iter(),
            |_connection, _consistency| async { Ok::<(), _>(()) },
            Box::new(PanickingSession),
            false,
            Consistency::One,
            &node_errors,
        )
        .await;

        let err = result.unwrap().unwrap_err();
        let RequestError::NoHostAvailable(no_host) = err else {
            panic!("expected NoHostAvailable, got {err:?}");
        };
        assert_eq!(no_host.errors.len(), 2);
        for (_, error) in &no_host.errors {
            assert_matches!(error, NodeRequestError::Pool(_));
        }
    }

    #[tokio::test]
    async fn empty_plan_yields_no_result() {
        let node_errors = AttemptedNodesErrors::new();
        let result = run_request_fiber(
            std::iter::empty(),
            |_connection, _consistency| async { Ok::<(), _>(()) },
            Box::new(PanickingSession),
            false,
            Consistency::One,
            &node_errors,
        )
        .await;
        assert!(result.is_none());
    }

    // Answers every request frame with the same RESULT::Rows response
    // carrying a single int column, echoing the stream id.
    async fn serve_int_rows(mut server_end: DuplexStream, values: Vec<i32>) {
        use coral_cql::frame::types;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        loop {
            let mut header = [0u8; 9];
            if server_end.read_exact(&mut header).await.is_err() {
                return;
            }
            let body_len = u32::from_be_bytes(header[5..9].try_into().unwrap()) as usize;
            let mut request_body = vec![0u8; body_len];
            if server_end.read_exact(&mut request_body).await.is_err() {
                return;
            }

            let mut body = Vec::new();
            types::write_int(0x0002, &mut body); // kind: Rows
            types::write_int(0x0001, &mut body); // global table spec
            types::write_int(1, &mut body); // col count
            types::write_string("ks", &mut body).unwrap();
            types::write_string("tbl", &mut body).unwrap();
            types::write_string("n", &mut body).unwrap();
            types::write_short(0x0009, &mut body); // int
            types::write_int(values.len() as i32, &mut body);
            for value in &values {
                types::write_bytes(&value.to_be_bytes(), &mut body).unwrap();
            }

            let mut frame = vec![0x84, 0x00, header[2], header[3], 0x08];
            frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
            frame.extend_from_slice(&body);
            if server_end.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn rows_come_from_the_next_node_when_the_first_is_down() {
        use coral_cql::serialize::SerializedValues;
        use coral_cql::value::CqlValue;

        use crate::statement::Statement;

        let (node_a, server_end_a) = connected_node(9042);
        // Node A's end of the wire is gone, every attempt on it breaks.
        drop(server_end_a);
        let (node_b, server_end_b) = connected_node(9043);
        tokio::task::spawn(serve_int_rows(server_end_b, vec![1, 2, 3]));

        let statement = Statement::new("SELECT n FROM ks.tbl");
        let nodes = vec![Arc::clone(&node_a), Arc::clone(&node_b)];

        let node_errors = AttemptedNodesErrors::new();
        let result = run_request_fiber(
            nodes.iter(),
            |connection, consistency| {
                let statement = &statement;
                async move {
                    connection
                        .query_raw_with_consistency(
                            statement,
                            SerializedValues::EMPTY,
                            consistency,
                            None,
                            None,
                            None,
                        )
                        .await?
                        .into_non_error_query_response()
                }
            },
            DefaultRetryPolicy::new().new_session(),
            true,
            Consistency::One,
            &node_errors,
        )
        .await;

        let (response, coordinator) = result.unwrap().unwrap();
        let RunRequestResult::Completed(response) = response else {
            panic!("expected a completed request");
        };
        assert_eq!(coordinator.node().address, node_b.address);

        let query_result = response.into_query_result(coordinator).unwrap();
        assert_eq!(query_result.rows_num(), Some(3));
        let values: Vec<_> = query_result
            .rows()
            .unwrap()
            .iter()
            .map(|row| row.columns[0].clone())
            .collect();
        assert_eq!(
            values,
            vec![
                Some(CqlValue::Int(1)),
                Some(CqlValue::Int(2)),
                Some(CqlValue::Int(3)),
            ]
        );
    }

    #[tokio::test]
    async fn same_target_retries_use_the_overridden_consistency() {
        let (node, _server_end) = connected_node(9042);
        let nodes = vec![node];

        struct EscalatingSession;
        impl RetrySession for EscalatingSession {
            fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
                match request_info.consistency {
                    Consistency::Quorum => {
                        RetryDecision::RetrySameTarget(Some(Consistency::One))
                    }
                    _ => RetryDecision::DontRetry,
                }
            }
            fn reset(&mut self) {}
        }

        let seen: Mutex<Vec<Consistency>> = Mutex::new(Vec::new());
        let node_errors = AttemptedNodesErrors::new();
        let result = run_request_fiber(
            nodes.iter(),
            |_connection, consistency| {
                seen.lock().unwrap().push(consistency);
                async move {
                    if consistency == Consistency::One {
                        Ok(())
                    } else {
                        Err(RequestAttemptError::UnableToAllocStreamId)
                    }
                }
            },
            Box::new(EscalatingSession),
            true,
            Consistency::Quorum,
            &node_errors,
        )
        .await;

        assert_matches!(result, Some(Ok((RunRequestResult::Completed(()), _))));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Consistency::Quorum, Consistency::One]
        );
    }
}
