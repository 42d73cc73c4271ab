//! The background worker that keeps [`ClusterState`] fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::{join_all, RemoteHandle};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use coral_cql::frame::response::event::{Event, StatusChangeEvent};

use crate::cluster::metadata::MetadataReader;
use crate::cluster::node::KnownNode;
use crate::cluster::state::ClusterState;
use crate::errors::{
    ExecutionError, MetadataError, NewSessionError, RequestAttemptError,
};
use crate::network::{PoolConfig, VerifiedKeyspaceName};
use crate::policies::load_balancing::LoadBalancingPolicy;

// Server events coalesce into a refresh which fires after a quiet period,
// but is never deferred past the max delay.
const EVENT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);
const MAX_EVENT_DEBOUNCE_DELAY: Duration = Duration::from_secs(10);

// When the control connection is broken, reconnection is attempted this
// often instead of waiting for the full refresh interval.
const CONTROL_CONNECTION_REPAIR_INTERVAL: Duration = Duration::from_secs(1);

/// Cluster manages up to date information and connections to database nodes.
/// All state can be accessed by cloning `Arc<ClusterState>` via `get_state`.
pub(crate) struct Cluster {
    state: Arc<ArcSwap<ClusterState>>,

    refresh_channel: mpsc::Sender<RefreshRequest>,
    use_keyspace_channel: mpsc::Sender<UseKeyspaceRequest>,

    _worker_handle: RemoteHandle<()>,
}

#[derive(Debug)]
struct RefreshRequest {
    response_chan: oneshot::Sender<Result<(), MetadataError>>,
}

#[derive(Debug)]
struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_chan: oneshot::Sender<Result<(), ExecutionError>>,
}

impl Cluster {
    pub(crate) async fn new(
        known_nodes: Vec<KnownNode>,
        mut pool_config: PoolConfig,
        policy: Arc<dyn LoadBalancingPolicy>,
        hostname_resolution_timeout: Option<Duration>,
        metadata_refresh_interval: Duration,
    ) -> Result<Cluster, NewSessionError> {
        let (refresh_sender, refresh_receiver) = mpsc::channel(32);
        let (use_keyspace_sender, use_keyspace_receiver) = mpsc::channel(32);
        let (server_events_sender, server_events_receiver) = mpsc::channel(32);
        let (repair_sender, repair_receiver) = mpsc::channel(32);

        let mut metadata_reader = MetadataReader::new(
            known_nodes,
            hostname_resolution_timeout,
            pool_config.connection_config.clone(),
            server_events_sender,
            repair_sender,
        )
        .await?;

        // If the control connection downgraded the protocol version, open
        // all pool connections with the downgraded version too.
        pool_config.connection_config.protocol_version = metadata_reader.protocol_version();

        let metadata = metadata_reader.read_metadata(true).await?;
        let cluster_state = ClusterState::new(
            metadata,
            &pool_config,
            &HashMap::new(),
            &None,
            &*policy,
        );
        cluster_state.wait_until_all_pools_are_initialized().await;

        let state = Arc::new(ArcSwap::from(Arc::new(cluster_state)));

        let worker = ClusterWorker {
            cluster_state: state.clone(),
            metadata_reader,
            pool_config,
            policy,

            refresh_channel: refresh_receiver,
            use_keyspace_channel: use_keyspace_receiver,
            server_events_channel: server_events_receiver,
            control_connection_repair_channel: repair_receiver,

            used_keyspace: None,
            metadata_refresh_interval,
            debouncer: RefreshDebouncer::new(EVENT_DEBOUNCE_WINDOW, MAX_EVENT_DEBOUNCE_DELAY),
        };

        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::task::spawn(fut);

        Ok(Cluster {
            state,
            refresh_channel: refresh_sender,
            use_keyspace_channel: use_keyspace_sender,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn get_state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    pub(crate) async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.refresh_channel
            .send(RefreshRequest {
                response_chan: response_sender,
            })
            .await
            .expect("Bug in Cluster::refresh_metadata sending");
        // Other end of this channel is in the ClusterWorker, can't be
        // dropped while we have &self to Cluster with _worker_handle

        response_receiver
            .await
            .expect("Bug in Cluster::refresh_metadata receiving")
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), ExecutionError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.use_keyspace_channel
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_chan: response_sender,
            })
            .await
            .expect("Bug in Cluster::use_keyspace sending");

        response_receiver.await.unwrap() // ClusterWorker always responds
    }
}

// Works in the background to keep the cluster updated
struct ClusterWorker {
    cluster_state: Arc<ArcSwap<ClusterState>>,

    metadata_reader: MetadataReader,
    pool_config: PoolConfig,
    policy: Arc<dyn LoadBalancingPolicy>,

    refresh_channel: mpsc::Receiver<RefreshRequest>,
    use_keyspace_channel: mpsc::Receiver<UseKeyspaceRequest>,
    server_events_channel: mpsc::Receiver<Event>,
    control_connection_repair_channel: mpsc::Receiver<()>,

    // Keyspace set on every pool connection when it opens
    used_keyspace: Option<VerifiedKeyspaceName>,

    metadata_refresh_interval: Duration,
    debouncer: RefreshDebouncer,
}

impl ClusterWorker {
    async fn work(mut self) {
        let mut last_refresh_time = Instant::now();
        let mut control_connection_works = true;

        loop {
            let mut cur_request: Option<RefreshRequest> = None;

            let periodic_deadline = last_refresh_time
                .checked_add(if control_connection_works {
                    self.metadata_refresh_interval
                } else {
                    CONTROL_CONNECTION_REPAIR_INTERVAL
                })
                .unwrap_or_else(Instant::now);
            let deadline = match self.debouncer.fire_time() {
                Some(debounced) => debounced.min(periodic_deadline),
                None => periodic_deadline,
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    // Time for a periodic or debounced refresh.
                }

                maybe_refresh_request = self.refresh_channel.recv() => {
                    match maybe_refresh_request {
                        Some(request) => cur_request = Some(request),
                        // Channel closed means the Cluster was dropped.
                        None => return,
                    }
                }

                maybe_event = self.server_events_channel.recv() => {
                    let Some(event) = maybe_event else {
                        // MetadataReader was dropped, stop working.
                        return;
                    };
                    debug!("Received server event: {:?}", event);
                    match event {
                        Event::TopologyChange(_) | Event::SchemaChange(_) => {
                            self.debouncer.on_event(Instant::now());
                        }
                        Event::StatusChange(status) => {
                            apply_status_change(&self.cluster_state.load(), &status);
                        }
                    }
                    continue;
                }

                maybe_use_keyspace_request = self.use_keyspace_channel.recv() => {
                    match maybe_use_keyspace_request {
                        Some(request) => {
                            self.used_keyspace = Some(request.keyspace_name.clone());

                            let cluster_state = self.cluster_state.load_full();
                            tokio::task::spawn(async move {
                                let result =
                                    send_use_keyspace(&cluster_state, &request.keyspace_name).await;
                                // Don't care if nobody wants the result
                                let _ = request.response_chan.send(result);
                            });
                        }
                        None => return,
                    }

                    continue;
                }

                maybe_repair_request = self.control_connection_repair_channel.recv() => {
                    match maybe_repair_request {
                        Some(()) => {
                            // The control connection broke. Refresh now;
                            // the refresh reconnects it.
                        }
                        None => return,
                    }
                }
            }

            debug!("Requesting metadata refresh");
            self.debouncer.clear();
            last_refresh_time = Instant::now();
            let refresh_res = self.perform_refresh().await;

            control_connection_works = refresh_res.is_ok();

            if let Some(request) = cur_request {
                // We can ignore the sending error - if no one waits for the
                // response we can drop it
                let _ = request.response_chan.send(refresh_res);
            }
        }
    }

    async fn perform_refresh(&mut self) -> Result<(), MetadataError> {
        let metadata = self.metadata_reader.read_metadata(false).await?;
        self.pool_config.connection_config.protocol_version =
            self.metadata_reader.protocol_version();

        let cluster_state = self.cluster_state.load_full();
        let new_cluster_state = Arc::new(ClusterState::new(
            metadata,
            &self.pool_config,
            &cluster_state.known_peers,
            &self.used_keyspace,
            &*self.policy,
        ));

        new_cluster_state.wait_until_all_pools_are_initialized().await;
        self.cluster_state.store(new_cluster_state);

        Ok(())
    }
}

// Marks the node named by a STATUS_CHANGE event as down or up. Events carry
// the node's broadcast address, whose port may differ from the connect
// port, so nodes are matched by IP.
fn apply_status_change(cluster_state: &ClusterState, event: &StatusChangeEvent) {
    let (addr, down) = match event {
        StatusChangeEvent::Up(addr) => (addr, false),
        StatusChangeEvent::Down(addr) => (addr, true),
    };

    let mut matched = false;
    for node in cluster_state.get_nodes_info() {
        if node.address.ip() == addr.ip() {
            node.set_down_marker(down);
            matched = true;
        }
    }
    if !matched {
        warn!("Got {:?} for an unknown node", event);
    }
}

async fn send_use_keyspace(
    cluster_state: &ClusterState,
    keyspace_name: &VerifiedKeyspaceName,
) -> Result<(), ExecutionError> {
    let use_keyspace_futures = cluster_state
        .known_peers
        .values()
        .map(|node| node.use_keyspace(keyspace_name.clone()));
    let use_keyspace_results = join_all(use_keyspace_futures).await;

    use_keyspace_result(use_keyspace_results.into_iter())
}

/// Merges per-node results of a use_keyspace operation.
///
/// Broken connections don't fail the operation as long as at least one node
/// accepted the keyspace; the name is remembered and set on reconnect.
/// Assumes the results iterator is nonempty.
pub(crate) fn use_keyspace_result(
    use_keyspace_results: impl Iterator<Item = Result<(), ExecutionError>>,
) -> Result<(), ExecutionError> {
    let mut was_ok = false;
    let mut broken_conn_error: Option<ExecutionError> = None;

    for result in use_keyspace_results {
        match result {
            Ok(()) => was_ok = true,
            Err(err) => match err {
                ExecutionError::LastAttemptError(
                    RequestAttemptError::BrokenConnectionError(_),
                ) => broken_conn_error = Some(err),
                _ => return Err(err),
            },
        }
    }

    if was_ok {
        return Ok(());
    }

    // `use_keyspace_results` is nonempty, so a non-broken error would have
    // returned above.
    Err(broken_conn_error.unwrap())
}

// Tracks the deadline of a pending event-driven refresh.
struct RefreshDebouncer {
    window: Duration,
    max_delay: Duration,
    // (fire time, the cap it may not be deferred past)
    pending: Option<(Instant, Instant)>,
}

impl RefreshDebouncer {
    fn new(window: Duration, max_delay: Duration) -> Self {
        Self {
            window,
            max_delay,
            pending: None,
        }
    }

    fn on_event(&mut self, now: Instant) {
        match &mut self.pending {
            None => {
                let deadline = now + self.max_delay;
                self.pending = Some(((now + self.window).min(deadline), deadline));
            }
            Some((fire_at, deadline)) => {
                // Each new event pushes the refresh back to the end of the
                // quiet window, but never past the deadline.
                *fire_at = (now + self.window).min(*deadline);
            }
        }
    }

    fn fire_time(&self) -> Option<Instant> {
        self.pending.map(|(fire_at, _)| fire_at)
    }

    fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use crate::cluster::Node;
    use crate::errors::BrokenConnectionError;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn event_burst_coalesces_into_one_refresh() {
        let mut debouncer =
            RefreshDebouncer::new(EVENT_DEBOUNCE_WINDOW, MAX_EVENT_DEBOUNCE_DELAY);

        let mut fired = 0;
        for _ in 0..10 {
            debouncer.on_event(Instant::now());
            tokio::time::advance(Duration::from_millis(50)).await;
            if debouncer.fire_time().is_some_and(|at| at <= Instant::now()) {
                fired += 1;
                debouncer.clear();
            }
        }

        // Let the quiet window elapse.
        tokio::time::advance(EVENT_DEBOUNCE_WINDOW).await;
        if debouncer.fire_time().is_some_and(|at| at <= Instant::now()) {
            fired += 1;
            debouncer.clear();
        }

        assert_eq!(fired, 1);
        assert!(debouncer.fire_time().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn events_spaced_past_max_delay_refresh_twice() {
        let mut debouncer =
            RefreshDebouncer::new(EVENT_DEBOUNCE_WINDOW, MAX_EVENT_DEBOUNCE_DELAY);
        let mut fired = 0;

        debouncer.on_event(Instant::now());
        tokio::time::advance(MAX_EVENT_DEBOUNCE_DELAY + Duration::from_secs(1)).await;
        if debouncer.fire_time().is_some_and(|at| at <= Instant::now()) {
            fired += 1;
            debouncer.clear();
        }

        debouncer.on_event(Instant::now());
        tokio::time::advance(MAX_EVENT_DEBOUNCE_DELAY + Duration::from_secs(1)).await;
        if debouncer.fire_time().is_some_and(|at| at <= Instant::now()) {
            fired += 1;
            debouncer.clear();
        }

        assert_eq!(fired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_event_stream_is_capped_by_max_delay() {
        let mut debouncer =
            RefreshDebouncer::new(EVENT_DEBOUNCE_WINDOW, MAX_EVENT_DEBOUNCE_DELAY);

        let start = Instant::now();
        debouncer.on_event(start);

        // Keep producing events more often than the quiet window for longer
        // than the max delay.
        for _ in 0..30 {
            tokio::time::advance(Duration::from_millis(500)).await;
            debouncer.on_event(Instant::now());
        }

        // The fire time must not have been pushed past the cap.
        assert_eq!(
            debouncer.fire_time().unwrap(),
            start + MAX_EVENT_DEBOUNCE_DELAY
        );
    }

    fn state_with_node(addr: &str) -> (ClusterState, Arc<Node>) {
        let node = Arc::new(Node::new_for_test(
            SocketAddr::from_str(addr).unwrap(),
            None,
            None,
        ));
        let state = ClusterState::new_for_test(vec![node.clone()], vec![]);
        (state, node)
    }

    #[test]
    fn status_events_toggle_down_marker() {
        let (state, node) = state_with_node("127.0.0.3:9042");

        // The event's port differs from the connect port; matching is by IP.
        let event_addr: SocketAddr = "127.0.0.3:7000".parse().unwrap();
        apply_status_change(&state, &StatusChangeEvent::Down(event_addr));
        assert!(node.is_down());

        apply_status_change(&state, &StatusChangeEvent::Up(event_addr));
        assert!(!node.is_down());
    }

    fn broken_conn_err() -> ExecutionError {
        ExecutionError::LastAttemptError(RequestAttemptError::BrokenConnectionError(
            BrokenConnectionError::ChannelsClosed,
        ))
    }

    #[test]
    fn use_keyspace_tolerates_broken_connections_if_any_node_succeeded() {
        let results = vec![Err(broken_conn_err()), Ok(()), Err(broken_conn_err())];
        assert_matches!(use_keyspace_result(results.into_iter()), Ok(()));
    }

    #[test]
    fn use_keyspace_fails_when_no_node_succeeded() {
        let results = vec![Err(broken_conn_err()), Err(broken_conn_err())];
        assert_matches!(
            use_keyspace_result(results.into_iter()),
            Err(ExecutionError::LastAttemptError(
                RequestAttemptError::BrokenConnectionError(_)
            ))
        );
    }

    #[test]
    fn use_keyspace_propagates_real_errors() {
        let results = vec![
            Ok(()),
            Err(ExecutionError::LastAttemptError(
                RequestAttemptError::UnexpectedResponse("READY"),
            )),
        ];
        assert_matches!(
            use_keyspace_result(results.into_iter()),
            Err(ExecutionError::LastAttemptError(
                RequestAttemptError::UnexpectedResponse(_)
            ))
        );
    }
}
