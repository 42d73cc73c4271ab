//! A pool of connections to a single node, kept filled by a background
//! refiller task.
//!
//! Borrowing a connection never waits: if the pool has no working
//! connections, an error describing why is returned immediately and the
//! caller moves on to the next node of its plan.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::RemoteHandle;
use futures::stream::FuturesUnordered;
use futures::{Future, FutureExt, StreamExt};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::errors::{ConnectionError, ConnectionPoolError, ExecutionError};
use crate::network::connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName,
};
use crate::policies::load_balancing::NodeDistance;

/// Pool dimensions and the per-connection configuration shared by all pools
/// of a session.
#[derive(Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) pool_size_local: NonZeroUsize,
    pub(crate) pool_size_remote: NonZeroUsize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: ConnectionConfig::default(),
            pool_size_local: NonZeroUsize::new(2).unwrap(),
            pool_size_remote: NonZeroUsize::new(1).unwrap(),
        }
    }
}

impl PoolConfig {
    /// The number of connections to keep to a node at the given distance.
    /// Ignored nodes get no pool at all.
    pub(crate) fn target_size(&self, distance: NodeDistance) -> Option<NonZeroUsize> {
        match distance {
            NodeDistance::Local => Some(self.pool_size_local),
            NodeDistance::Remote => Some(self.pool_size_remote),
            NodeDistance::Ignored => None,
        }
    }
}

enum MaybePoolConnections {
    // The pool is being filled for the first time
    Initializing,

    // The pool is empty because either initial filling failed or all
    // connections became broken; will be asynchronously refilled.
    // Contains an error from the last connection attempt.
    Broken(ConnectionError),

    // The pool has some usable connections
    Ready(Vec<Arc<Connection>>),
}

impl std::fmt::Debug for MaybePoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybePoolConnections::Initializing => write!(f, "Initializing"),
            MaybePoolConnections::Broken(err) => write!(f, "Broken({err:?})"),
            MaybePoolConnections::Ready(conns) => f
                .debug_list()
                .entries(conns.iter().map(|conn| conn.get_connect_address()))
                .finish(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct NodeConnectionPool {
    conns: Arc<ArcSwap<MaybePoolConnections>>,
    use_keyspace_request_sender: mpsc::Sender<UseKeyspaceRequest>,
    _refiller_handle: Arc<RemoteHandle<()>>,
    pool_updated_notify: Arc<Notify>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("conns", &self.conns)
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        address: SocketAddr,
        connection_config: ConnectionConfig,
        target_size: NonZeroUsize,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_empty_notifier: broadcast::Sender<()>,
    ) -> Self {
        let (use_keyspace_request_sender, use_keyspace_request_receiver) = mpsc::channel(1);
        let pool_updated_notify = Arc::new(Notify::new());

        let refiller = PoolRefiller::new(
            address,
            connection_config,
            target_size,
            current_keyspace,
            pool_updated_notify.clone(),
            pool_empty_notifier,
        );

        let conns = refiller.get_shared_connections();
        let (fut, refiller_handle) = refiller.run(use_keyspace_request_receiver).remote_handle();
        tokio::task::spawn(fut);

        Self {
            conns,
            use_keyspace_request_sender,
            _refiller_handle: Arc::new(refiller_handle),
            pool_updated_notify,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(**self.conns.load(), MaybePoolConnections::Ready(_))
    }

    /// Borrows a random working connection. Never waits.
    pub(crate) fn random_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.with_connections(|conns| {
            // `conns` is non-empty in the Ready state.
            let idx = rand::rng().random_range(0..conns.len());
            conns[idx].clone()
        })
    }

    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        self.with_connections(|conns| conns.to_vec())
    }

    /// Sets the keyspace on all current connections and remembers it for
    /// connections opened later.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), ExecutionError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.use_keyspace_request_sender
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_sender,
            })
            .await
            .expect("Bug in NodeConnectionPool::use_keyspace sending");
        // Other end of this channel is in the PoolRefiller, can't be dropped
        // while we have &self to _refiller_handle

        response_receiver.await.unwrap() // PoolRefiller always responds
    }

    // Waits until the pool becomes initialized: either the first connection
    // has been established, or the first filling has failed.
    pub(crate) async fn wait_until_initialized(&self) {
        // First, register for the notification so that we don't miss it
        let notified = self.pool_updated_notify.notified();

        if let MaybePoolConnections::Initializing = **self.conns.load() {
            notified.await;
        }
    }

    fn with_connections<T>(
        &self,
        f: impl FnOnce(&[Arc<Connection>]) -> T,
    ) -> Result<T, ConnectionPoolError> {
        let conns = self.conns.load_full();
        match &*conns {
            MaybePoolConnections::Ready(conns) => Ok(f(conns)),
            MaybePoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
            MaybePoolConnections::Initializing => Err(ConnectionPoolError::Initializing),
        }
    }
}

const MIN_FILL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_FILL_BACKOFF: Duration = Duration::from_secs(10);
const FILL_BACKOFF_MULTIPLIER: u32 = 2;

// A simple exponential strategy for pool fill backoffs.
struct RefillDelayStrategy {
    current_delay: Duration,
}

impl RefillDelayStrategy {
    fn new() -> Self {
        Self {
            current_delay: MIN_FILL_BACKOFF,
        }
    }

    fn get_delay(&self) -> Duration {
        self.current_delay
    }

    fn on_successful_fill(&mut self) {
        self.current_delay = MIN_FILL_BACKOFF;
    }

    fn on_fill_error(&mut self) {
        self.current_delay = std::cmp::min(
            MAX_FILL_BACKOFF,
            self.current_delay * FILL_BACKOFF_MULTIPLIER,
        );
    }
}

struct PoolRefiller {
    address: SocketAddr,
    connection_config: ConnectionConfig,
    target_size: NonZeroUsize,

    // `shared_conns` is updated only after `conns` change
    shared_conns: Arc<ArcSwap<MaybePoolConnections>>,
    conns: Vec<Arc<Connection>>,

    // Set to true if there was an error since the last refill,
    // set to false when refilling starts.
    had_error_since_last_refill: bool,

    refill_delay_strategy: RefillDelayStrategy,

    // Receives connections which became ready: newly connected, or with
    // their keyspace freshly set.
    ready_connections:
        FuturesUnordered<Pin<Box<dyn Future<Output = OpenedConnectionEvent> + Send + 'static>>>,

    // Receives information about breaking connections
    connection_errors:
        FuturesUnordered<Pin<Box<dyn Future<Output = BrokenConnectionEvent> + Send + 'static>>>,

    current_keyspace: Option<VerifiedKeyspaceName>,

    // Signaled when the connection pool is updated
    pool_updated_notify: Arc<Notify>,

    // Signaled when the connection pool becomes empty
    pool_empty_notifier: broadcast::Sender<()>,
}

#[derive(Debug)]
struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_sender: oneshot::Sender<Result<(), ExecutionError>>,
}

impl PoolRefiller {
    fn new(
        address: SocketAddr,
        connection_config: ConnectionConfig,
        target_size: NonZeroUsize,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_updated_notify: Arc<Notify>,
        pool_empty_notifier: broadcast::Sender<()>,
    ) -> Self {
        let shared_conns = Arc::new(ArcSwap::new(Arc::new(MaybePoolConnections::Initializing)));

        Self {
            address,
            connection_config,
            target_size,

            shared_conns,
            conns: Vec::new(),

            had_error_since_last_refill: false,
            refill_delay_strategy: RefillDelayStrategy::new(),

            ready_connections: FuturesUnordered::new(),
            connection_errors: FuturesUnordered::new(),

            current_keyspace,

            pool_updated_notify,
            pool_empty_notifier,
        }
    }

    fn get_shared_connections(&self) -> Arc<ArcSwap<MaybePoolConnections>> {
        self.shared_conns.clone()
    }

    // The main loop of the pool refiller
    async fn run(mut self, mut use_keyspace_request_receiver: mpsc::Receiver<UseKeyspaceRequest>) {
        debug!("[{}] Started asynchronous pool worker", self.address);

        let mut next_refill_time = tokio::time::Instant::now();
        let mut refill_scheduled = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_refill_time), if refill_scheduled => {
                    self.had_error_since_last_refill = false;
                    self.start_filling();
                    refill_scheduled = false;
                }

                evt = self.ready_connections.select_next_some(), if !self.ready_connections.is_empty() => {
                    self.handle_ready_connection(evt);
                }

                evt = self.connection_errors.select_next_some(), if !self.connection_errors.is_empty() => {
                    if let Some(conn) = evt.connection.upgrade() {
                        debug!("[{}] Got error for connection {:p}: {:?}", self.address, Arc::as_ptr(&conn), evt.error);
                        self.remove_connection(conn, evt.error);
                    }
                }

                req = use_keyspace_request_receiver.recv() => {
                    match req {
                        Some(req) => {
                            debug!("[{}] Requested keyspace change: {}", self.address, req.keyspace_name.as_str());
                            self.use_keyspace(req.keyspace_name, req.response_sender);
                        }
                        None => {
                            // The keyspace request channel is dropped, which
                            // means that the corresponding pool is dropped.
                            trace!("[{}] Pool dropped, stopping asynchronous pool worker", self.address);
                            return;
                        }
                    }
                }
            }

            // Schedule refilling here
            if !refill_scheduled && self.need_filling() {
                if self.had_error_since_last_refill {
                    self.refill_delay_strategy.on_fill_error();
                } else {
                    self.refill_delay_strategy.on_successful_fill();
                }
                let delay = self.refill_delay_strategy.get_delay();
                debug!(
                    "[{}] Scheduling next refill in {} ms",
                    self.address,
                    delay.as_millis(),
                );

                next_refill_time = tokio::time::Instant::now() + delay;
                refill_scheduled = true;
            }
        }
    }

    fn is_filling(&self) -> bool {
        !self.ready_connections.is_empty()
    }

    fn is_full(&self) -> bool {
        self.conns.len() >= self.target_size.get()
    }

    fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn need_filling(&self) -> bool {
        !self.is_filling() && !self.is_full()
    }

    // Begins opening connections to fill the pool up to the target size.
    // The results are processed in the main loop as they appear on
    // `ready_connections`.
    fn start_filling(&mut self) {
        if self.is_empty() {
            // If the pool is empty, the node might not be alive at all.
            // There is no use in opening more than one connection now;
            // the rest will follow once this one succeeds.
            trace!("[{}] Will open the first connection to the node", self.address);
            self.start_opening_connection();
            return;
        }

        let to_open_count = self.target_size.get().saturating_sub(self.conns.len());
        trace!("[{}] Will open {} connections", self.address, to_open_count);
        for _ in 0..to_open_count {
            self.start_opening_connection();
        }
    }

    // Handles a newly opened connection and decides what to do with it.
    fn handle_ready_connection(&mut self, evt: OpenedConnectionEvent) {
        match evt.result {
            Err(err) => {
                self.had_error_since_last_refill = true;
                debug!("[{}] Failed to open connection: {:?}", self.address, err);

                // If all connection attempts of this fill failed and the
                // pool is empty, make the error visible to the users of
                // the pool.
                if !self.is_filling() && self.is_empty() {
                    self.update_shared_conns(Some(err));
                }
            }
            Ok((connection, error_receiver)) => {
                // Before the connection can be put into the pool, it must
                // be switched to the current keyspace.
                if let Some(keyspace) = &self.current_keyspace {
                    if evt.keyspace_name.as_ref() != Some(keyspace) {
                        self.start_setting_keyspace_for_connection(connection, error_receiver);
                        return;
                    }
                }

                if self.is_full() {
                    // A fill could have been started before the target size
                    // was reached by a previous one; drop the extra
                    // connection.
                    trace!("[{}] Pool is full, dropping excess connection", self.address);
                    return;
                }

                let conn = Arc::new(connection);
                trace!(
                    "[{}] Adding connection {:p} to the pool, total {}",
                    self.address,
                    Arc::as_ptr(&conn),
                    self.conns.len() + 1,
                );

                self.connection_errors
                    .push(wait_for_error(Arc::downgrade(&conn), error_receiver).boxed());
                self.conns.push(conn);

                self.update_shared_conns(None);
            }
        }
    }

    // Starts opening a new connection in the background. The result will be
    // available on `ready_connections`.
    fn start_opening_connection(&self) {
        let cfg = self.connection_config.clone();
        let address = self.address;

        self.ready_connections.push(
            async move {
                let result = open_connection(address, &cfg).await;
                OpenedConnectionEvent {
                    result,
                    keyspace_name: None,
                }
            }
            .boxed(),
        );
    }

    // Updates `shared_conns` based on `conns`.
    // `last_error` must not be `None` if there is a possibility of the pool
    // being empty.
    fn update_shared_conns(&mut self, last_error: Option<ConnectionError>) {
        let new_conns = if self.is_empty() {
            Arc::new(MaybePoolConnections::Broken(last_error.unwrap()))
        } else {
            Arc::new(MaybePoolConnections::Ready(self.conns.clone()))
        };

        // Make the connection list available
        self.shared_conns.store(new_conns);

        // Notify potential waiters
        self.pool_updated_notify.notify_waiters();
    }

    // Removes the given connection from the pool, if it is still there.
    fn remove_connection(&mut self, connection: Arc<Connection>, last_error: ConnectionError) {
        let ptr = Arc::as_ptr(&connection);

        let maybe_idx = self
            .conns
            .iter()
            .position(|other_conn| Arc::ptr_eq(&connection, other_conn));

        match maybe_idx {
            Some(idx) => {
                self.conns.swap_remove(idx);
                trace!(
                    "[{}] Connection {:p} removed from the pool, total {}",
                    self.address,
                    ptr,
                    self.conns.len(),
                );
                if self.is_empty() {
                    let _ = self.pool_empty_notifier.send(());
                }
                self.update_shared_conns(Some(last_error));
            }
            None => {
                trace!("[{}] Connection {:p} was already removed", self.address, ptr);
            }
        }
    }

    // Sets the current keyspace for available connections.
    // Connections which are being currently opened and future connections
    // will have this keyspace set when they appear on `ready_connections`.
    // Responds to the `response_sender` when all current connections have
    // their keyspace set.
    fn use_keyspace(
        &mut self,
        keyspace_name: VerifiedKeyspaceName,
        response_sender: oneshot::Sender<Result<(), ExecutionError>>,
    ) {
        self.current_keyspace = Some(keyspace_name.clone());

        let conns = self.conns.clone();
        let address = self.address;
        let connect_timeout = self.connection_config.connect_timeout;

        let fut = async move {
            let use_keyspace_futures = conns.iter().map(|conn| conn.use_keyspace(&keyspace_name));

            let use_keyspace_results = tokio::time::timeout(
                connect_timeout,
                futures::future::join_all(use_keyspace_futures),
            )
            .await
            .map_err(|_| ExecutionError::RequestTimeout(connect_timeout))?;

            use_keyspace_results
                .into_iter()
                .collect::<Result<(), _>>()
                .map_err(ExecutionError::LastAttemptError)
        };

        tokio::task::spawn(async move {
            let res = fut.await;
            match &res {
                Ok(()) => debug!("[{}] Successfully changed current keyspace", address),
                Err(err) => warn!("[{}] Failed to change keyspace: {:?}", address, err),
            }
            let _ = response_sender.send(res);
        });
    }

    // Requires the keyspace to be set.
    // Requires that the event is for a successful connection.
    fn start_setting_keyspace_for_connection(
        &mut self,
        connection: Connection,
        error_receiver: ErrorReceiver,
    ) {
        let keyspace_name = self.current_keyspace.as_ref().cloned().unwrap();
        self.ready_connections.push(
            async move {
                let result = connection.use_keyspace(&keyspace_name).await;
                if let Err(err) = result {
                    warn!(
                        "[{}] Failed to set keyspace for new connection: {}",
                        connection.get_connect_address().ip(),
                        err,
                    );
                }
                OpenedConnectionEvent {
                    result: Ok((connection, error_receiver)),
                    keyspace_name: Some(keyspace_name),
                }
            }
            .boxed(),
        );
    }
}

struct BrokenConnectionEvent {
    connection: Weak<Connection>,
    error: ConnectionError,
}

async fn wait_for_error(
    connection: Weak<Connection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        connection,
        error: error_receiver.await.unwrap_or_else(|_| {
            ConnectionError::BrokenConnection(
                crate::errors::BrokenConnectionError::ChannelsClosed,
            )
        }),
    }
}

struct OpenedConnectionEvent {
    result: Result<(Connection, ErrorReceiver), ConnectionError>,
    keyspace_name: Option<VerifiedKeyspaceName>,
}

#[cfg(test)]
impl NodeConnectionPool {
    /// A pool that is immediately `Ready` with the given connections and has
    /// no refiller behind it.
    pub(crate) fn new_for_test(connections: Vec<Arc<Connection>>) -> Self {
        let (use_keyspace_request_sender, use_keyspace_request_receiver) = mpsc::channel(1);
        // No refiller runs, so keyspace requests would never be answered.
        std::mem::forget(use_keyspace_request_receiver);

        let (fut, handle) = futures::future::pending::<()>().remote_handle();
        tokio::task::spawn(fut);

        Self {
            conns: Arc::new(ArcSwap::from_pointee(MaybePoolConnections::Ready(
                connections,
            ))),
            use_keyspace_request_sender,
            _refiller_handle: Arc::new(handle),
            pool_updated_notify: Arc::new(Notify::new()),
        }
    }
}
