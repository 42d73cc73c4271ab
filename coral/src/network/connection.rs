//! A single CQL connection: frame multiplexing over one TCP stream.
//!
//! All requests sent on a connection are funneled through a router task
//! which owns the stream. The router assigns a stream id to every request
//! just before the write, and routes each response frame back to the
//! requester through a oneshot channel. Stream ids are freed as soon as
//! their response arrives, so a connection can serve up to 32768 requests
//! concurrently.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use coral_cql::frame::request::batch as cql_batch;
use coral_cql::frame::request::startup::{options_keys, DEFAULT_CQL_PROTOCOL_VERSION};
use coral_cql::frame::request::{
    AuthResponse, Execute, Options, Prepare, Query, QueryParameters, Register,
    SerializableRequest, Startup,
};
use coral_cql::frame::response::authenticate::Authenticate;
use coral_cql::frame::response::error::DbError;
use coral_cql::frame::response::event::{Event, EventType};
use coral_cql::frame::response::result::{self, SetKeyspace};
use coral_cql::frame::response::{NonErrorResponse, Response, ResponseOpcode, Supported};
use coral_cql::frame::types::{Consistency, SerialConsistency};
use coral_cql::frame::{
    self, Compression, FrameParams, ProtocolVersion, SerializedRequest,
};
use coral_cql::serialize::SerializedValues;

use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, ConnectionError, ConnectionSetupRequestError,
    RequestAttemptError,
};
use crate::response::{
    NonErrorAuthResponse, NonErrorQueryResponse, NonErrorStartupResponse, QueryResponse,
};
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::prepared::PreparedStatement;
use crate::statement::Statement;

/// Yields the error that broke the connection, once it breaks.
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

const DRIVER_NAME: &str = "coral";
const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything needed to open and operate a single connection.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_timeout: Option<Duration>,
    /// Set only on the control connection; makes the connection REGISTER
    /// for server events and forward them to the cluster worker.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::DEFAULT,
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            event_sender: None,
            authenticator: None,
        }
    }
}

/// A connection to a single node.
///
/// Dropping a `Connection` drops the sender half of the task channel, which
/// stops the router task and closes the socket.
pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,
    connect_address: SocketAddr,
    config: ConnectionConfig,
    router_handle: Arc<RouterHandle>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .finish_non_exhaustive()
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
}

impl RouterHandle {
    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<TaskResponse, RequestAttemptError> {
        let serialized_request = SerializedRequest::make(request, version, compression, tracing)
            .map_err(|err| RequestAttemptError::CqlRequestSerialization(Arc::new(err)))?;
        let (response_sender, receiver) = oneshot::channel();

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler: ResponseHandler { response_sender },
            })
            .await
            .map_err(|_| {
                RequestAttemptError::BrokenConnectionError(BrokenConnectionError::ChannelsClosed)
            })?;

        receiver.await.map_err(|_| {
            RequestAttemptError::BrokenConnectionError(BrokenConnectionError::ChannelsClosed)
        })?
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, RequestAttemptError>>,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

impl Connection {
    /// Opens a TCP connection and starts its router task. No CQL-level
    /// setup is performed here; see [`open_connection`].
    pub(crate) async fn new(
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        };
        if config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        Ok(Self::new_with_stream(addr, config, stream))
    }

    /// Starts the router task over an already-established stream. Tests use
    /// this with an in-memory duplex stream instead of a TCP socket.
    pub(crate) fn new_with_stream(
        connect_address: SocketAddr,
        config: ConnectionConfig,
        stream: impl AsyncRead + AsyncWrite + Send + 'static,
    ) -> (Self, ErrorReceiver) {
        // 1024 is enough for all the requests sent with one lock of a connection
        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
        });

        let (task, handle) = Self::router(
            config.clone(),
            connect_address,
            stream,
            receiver,
            error_sender,
            Arc::clone(&router_handle),
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle: handle,
            connect_address,
            config,
            router_handle,
        };

        (connection, error_receiver)
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // It may be surprising why we call `with_interval()` with `tcp_keepalive_interval`
        // and `with_interval` with some other value. This is due to inconsistent naming:
        // our interval means time after connection becomes idle until keepalives
        // begin to be sent (they call it "time"), and their interval is time between
        // sending keepalives.
        // We insist on our naming for consistency with other drivers.

        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // These cfg values are taken from socket2 sources, on the basis of support
        // for the `with_interval()` call.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            // If the connection is idle for longer than `tcp_keepalive_interval`,
            // start sending keepalives every 1 second and consider the connection
            // dead after 10 unacknowledged keepalives.
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));

            #[cfg(not(target_os = "windows"))]
            {
                tcp_keepalive = tcp_keepalive.with_retries(10);
            }
        }

        let sf = SockRef::from(stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let task_response = self
            .router_handle
            .send_request(request, self.config.protocol_version, compression, tracing)
            .await?;

        Self::parse_response(
            task_response,
            self.config.compression,
            self.config.protocol_version,
        )
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
        version: ProtocolVersion,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )
        .map_err(|err| RequestAttemptError::BodyExtensionsParseError(Arc::new(err)))?;

        for warning in &body_with_ext.warnings {
            warn!("Server warning: {}", warning);
        }

        let response =
            Response::deserialize(version, task_response.opcode, &mut &*body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    // Setup requests are never compressed: compression is only in effect
    // for frames that follow a successful STARTUP exchange.
    async fn send_setup_request(
        &self,
        request: &impl SerializableRequest,
    ) -> Result<Response, ConnectionError> {
        let query_response = self
            .send_request(request, None, false)
            .await
            .map_err(|err| match err {
                RequestAttemptError::BrokenConnectionError(err) => {
                    ConnectionError::BrokenConnection(err)
                }
                RequestAttemptError::CqlRequestSerialization(err)
                | RequestAttemptError::BodyExtensionsParseError(err) => {
                    ConnectionSetupRequestError::FrameError(err).into()
                }
                _ => ConnectionSetupRequestError::UnexpectedResponse.into(),
            })?;

        Ok(query_response.response)
    }

    pub(crate) async fn get_options(&self) -> Result<Supported, ConnectionError> {
        match self.send_setup_request(&Options).await? {
            Response::Supported(supported) => Ok(supported),
            Response::Error(err) => {
                Err(ConnectionSetupRequestError::DbError(err.error, err.reason).into())
            }
            _ => Err(ConnectionSetupRequestError::UnexpectedResponse.into()),
        }
    }

    pub(crate) async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<NonErrorStartupResponse, ConnectionError> {
        match self.send_setup_request(&Startup { options }).await? {
            Response::Ready => Ok(NonErrorStartupResponse::Ready),
            Response::Authenticate(auth) => Ok(NonErrorStartupResponse::Authenticate(auth)),
            Response::Error(err) => {
                Err(ConnectionSetupRequestError::DbError(err.error, err.reason).into())
            }
            _ => Err(ConnectionSetupRequestError::UnexpectedResponse.into()),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionError> {
        let authenticator_name = &authenticate.authenticator_name;

        let provider = self.config.authenticator.as_ref().ok_or_else(|| {
            ConnectionError::Setup(ConnectionSetupRequestError::MissingAuthentication {
                authenticator_name: authenticator_name.clone(),
            })
        })?;

        let (mut response, mut auth_session) = provider
            .start_authentication_session(authenticator_name)
            .await
            .map_err(|err| {
                ConnectionError::Setup(ConnectionSetupRequestError::AuthenticationError(err))
            })?;

        loop {
            match self.authenticate_response(response).await? {
                NonErrorAuthResponse::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(|err| {
                            ConnectionError::Setup(ConnectionSetupRequestError::AuthenticationError(
                                err,
                            ))
                        })?;
                }
                NonErrorAuthResponse::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(|err| {
                            ConnectionError::Setup(ConnectionSetupRequestError::AuthenticationError(
                                err,
                            ))
                        })?;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn authenticate_response(
        &self,
        response: Option<Vec<u8>>,
    ) -> Result<NonErrorAuthResponse, ConnectionError> {
        match self.send_setup_request(&AuthResponse { response }).await? {
            Response::AuthChallenge(challenge) => {
                Ok(NonErrorAuthResponse::AuthChallenge(challenge))
            }
            Response::AuthSuccess(success) => Ok(NonErrorAuthResponse::AuthSuccess(success)),
            Response::Error(err) => {
                Err(ConnectionSetupRequestError::DbError(err.error, err.reason).into())
            }
            _ => Err(ConnectionSetupRequestError::UnexpectedResponse.into()),
        }
    }

    pub(crate) async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionError> {
        let register_frame = Register {
            event_types_to_register_for,
        };

        match self.send_setup_request(&register_frame).await? {
            Response::Ready => Ok(()),
            Response::Error(err) => {
                Err(ConnectionSetupRequestError::DbError(err.error, err.reason).into())
            }
            _ => Err(ConnectionSetupRequestError::UnexpectedResponse.into()),
        }
    }

    pub(crate) async fn prepare(
        &self,
        statement: &Statement,
    ) -> Result<PreparedStatement, RequestAttemptError> {
        let query_response = self
            .send_request(
                &Prepare {
                    query: &statement.contents,
                },
                self.config.compression,
                false,
            )
            .await?;

        match query_response.into_non_error_query_response()?.response {
            NonErrorResponse::Result(result::Result::Prepared(p)) => Ok(PreparedStatement::new(
                p.id,
                statement.contents.clone(),
                p.prepared_metadata,
                p.result_metadata,
                statement.config.clone(),
            )),
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    /// Prepares the statement again after the server reported it unknown.
    /// The statement id is an md5 of the statement text, so repreparation
    /// must yield the same id; a different one means the server and the
    /// driver disagree about what is being executed.
    async fn reprepare(
        &self,
        statement_text: &str,
        previous_prepared: &PreparedStatement,
    ) -> Result<(), RequestAttemptError> {
        let reprepared = self.prepare(&Statement::new(statement_text)).await?;

        if reprepared.get_id() != previous_prepared.get_id() {
            Err(RequestAttemptError::RepreparedIdChanged {
                statement: statement_text.to_string(),
                expected_id: previous_prepared.get_id().to_vec(),
                reprepared_id: reprepared.get_id().to_vec(),
            })
        } else {
            Ok(())
        }
    }

    pub(crate) async fn query_raw_with_consistency(
        &self,
        statement: &Statement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        page_size: Option<i32>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query_frame = Query {
            contents: Cow::Borrowed(&statement.contents),
            parameters: QueryParameters {
                consistency,
                serial_consistency,
                timestamp: statement.get_timestamp(),
                page_size,
                paging_state,
                skip_metadata: false,
                values: Cow::Borrowed(values),
            },
        };

        self.send_request(&query_frame, self.config.compression, false)
            .await
    }

    /// Sends an EXECUTE for a previously prepared statement. If the server
    /// responds with `Unprepared` (e.g. after a restart that wiped its
    /// prepared statement cache), the statement is transparently prepared
    /// again and the EXECUTE is resent, once. The retry policy is not
    /// involved; this recovery is invisible to the execution layer.
    pub(crate) async fn execute_raw_with_consistency(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        page_size: Option<i32>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let execute_frame = Execute {
            id: prepared.get_id().clone(),
            parameters: QueryParameters {
                consistency,
                serial_consistency,
                timestamp: prepared.get_timestamp(),
                page_size,
                paging_state,
                skip_metadata: false,
                values: Cow::Borrowed(values),
            },
        };

        let query_response = self
            .send_request(&execute_frame, self.config.compression, false)
            .await?;

        if let Response::Error(err) = &query_response.response {
            if let DbError::Unprepared { statement_id } = &err.error {
                debug!(
                    "Connection::execute: got DbError::Unprepared - repreparing statement with id {:?}",
                    statement_id
                );
                self.reprepare(prepared.get_statement(), prepared).await?;
                return self
                    .send_request(&execute_frame, self.config.compression, false)
                    .await;
            }
        }

        Ok(query_response)
    }

    /// Sends a BATCH. `values` must hold one `SerializedValues` per batch
    /// statement, in order. Unprepared errors are recovered from the same
    /// way as in [`Self::execute_raw_with_consistency`].
    pub(crate) async fn batch_with_consistency(
        &self,
        batch: &Batch,
        values: &[SerializedValues],
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let statements: Vec<cql_batch::BatchStatement<'_>> = batch
            .statements
            .iter()
            .zip(values.iter())
            .map(|(statement, values)| match statement {
                BatchStatement::Query(q) => cql_batch::BatchStatement::Query {
                    text: &q.contents,
                    values,
                },
                BatchStatement::PreparedStatement(p) => cql_batch::BatchStatement::Prepared {
                    id: p.get_id().as_ref(),
                    values,
                },
            })
            .collect();

        let batch_frame = cql_batch::Batch {
            statements,
            batch_type: batch.get_type(),
            consistency,
            serial_consistency,
            timestamp: batch.get_timestamp(),
        };

        let query_response = self
            .send_request(&batch_frame, self.config.compression, false)
            .await?;

        if let Response::Error(err) = &query_response.response {
            if let DbError::Unprepared { statement_id } = &err.error {
                let to_reprepare = batch.statements.iter().find_map(|s| match s {
                    BatchStatement::PreparedStatement(p) if p.get_id() == statement_id => Some(p),
                    _ => None,
                });
                if let Some(p) = to_reprepare {
                    debug!(
                        "Connection::batch: got DbError::Unprepared - repreparing statement with id {:?}",
                        statement_id
                    );
                    self.reprepare(p.get_statement(), p).await?;
                    return self
                        .send_request(&batch_frame, self.config.compression, false)
                        .await;
                }
            }
        }

        Ok(query_response)
    }

    /// Switches the connection to the given keyspace by sending a `USE`
    /// statement and verifying the name echoed back in the SetKeyspace
    /// result.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), RequestAttemptError> {
        // Trigger a SetKeyspace result so the server confirms the switch.
        let query = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()),
            false => format!("USE {}", keyspace_name.as_str()),
        };

        let query_response = self
            .query_raw_with_consistency(
                &Statement::new(query),
                SerializedValues::EMPTY,
                Consistency::default(),
                None,
                None,
                None,
            )
            .await?;

        let non_error_response = query_response.into_non_error_query_response()?;
        match non_error_response.as_set_keyspace() {
            Some(set_keyspace) => {
                Self::verify_use_keyspace_result(keyspace_name, set_keyspace)
            }
            None => Err(RequestAttemptError::UnexpectedResponse(
                non_error_response.response.to_response_kind(),
            )),
        }
    }

    fn verify_use_keyspace_result(
        keyspace_name: &VerifiedKeyspaceName,
        set_keyspace: &SetKeyspace,
    ) -> Result<(), RequestAttemptError> {
        // Servers differ in the case of the name they echo back; unless the
        // keyspace name was quoted, compare case-insensitively.
        let name_matches = if keyspace_name.is_case_sensitive {
            set_keyspace.keyspace_name == keyspace_name.as_str()
        } else {
            set_keyspace
                .keyspace_name
                .eq_ignore_ascii_case(keyspace_name.as_str())
        };

        if name_matches {
            Ok(())
        } else {
            Err(RequestAttemptError::KeyspaceNameMismatch {
                expected: keyspace_name.as_str().to_string(),
                received: set_keyspace.keyspace_name.clone(),
            })
        }
    }

    /// Runs an unpaged query outside of the execution core, for internal
    /// queries on the control connection (system tables, keepalives).
    pub(crate) async fn query_unpaged(
        &self,
        query: impl Into<Statement>,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        let statement = query.into();
        let query_response = self
            .query_raw_with_consistency(
                &statement,
                SerializedValues::EMPTY,
                statement.config.consistency.unwrap_or_default(),
                None,
                None,
                None,
            )
            .await?;
        query_response.into_non_error_query_response()
    }

    async fn router(
        config: ConnectionConfig,
        node_address: SocketAddr,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        router_handle: Arc<RouterHandle>,
    ) {
        let (read_half, write_half) = split(stream);

        // reader and writer futures are run on the same task and never hold
        // the lock across an .await point, so the mutex is uncontended. It is
        // a mutex at all only because a RefCell would make the future !Sync.
        let handler_map = StdMutex::new(ResponseHandlerMap::new());

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            config.event_sender,
            config.compression,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            receiver,
        );
        let k = Self::keepaliver(
            router_handle,
            config.protocol_version,
            config.keepalive_interval,
            config.keepalive_timeout,
            node_address,
        );

        let result = futures::try_join!(r, w, k);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, nothing to clean up
            Err(err) => err,
        };

        // Respond to all pending requests with the error that broke the
        // connection.
        let response_handlers: HashMap<i16, ResponseHandler> =
            handler_map.into_inner().unwrap().into_handlers();

        for (_, handler) in response_handlers {
            // Ignore sending error, the request future may have been dropped
            let _ = handler
                .response_sender
                .send(Err(error.clone().into()));
        }

        // If someone is listening for connection errors, notify them
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half).await?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                Ordering::Less => {
                    // Negative stream ids are reserved for server-generated
                    // frames; only -1 is in use today. Skip anything else.
                    continue;
                }
                Ordering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, compression, event_sender).await?;
                    }
                    continue;
                }
                _ => {}
            }

            let handler = {
                // We are guaranteed here that handler_map will not be locked
                // by anybody else, so we can do try_lock().unwrap()
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                handler_map_guard.lookup(params.stream)
            };

            match handler {
                Some(handler) => {
                    // Don't care if sending of the response fails. This must
                    // mean that the receiver side was impatient and is not
                    // waiting for the result anymore.
                    let _ = handler.response_sender.send(Ok(response));
                }
                None => {
                    // An unsolicited frame indicates a bug on one of the
                    // sides; the stream cannot be trusted anymore.
                    debug!("Received response with unexpected stream id {}", params.stream);
                    return Err(BrokenConnectionError::UnexpectedStreamId(params.stream));
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        // We are guaranteed here that handler_map will not be locked
        // by anybody else, so we can do try_lock().unwrap()
        let mut handler_map_guard = handler_map.try_lock().unwrap();
        match handler_map_guard.allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                error!("Could not allocate stream id");
                let _ = response_handler
                    .response_sender
                    .send(Err(RequestAttemptError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection object is dropped, the sender half of the
        // channel is dropped too, this loop ends and the whole router stops.
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            while let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler) {
                let mut req = task.serialized_request;
                req.set_stream(stream_id);
                let req_data: &[u8] = req.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half
                    .write_all(req_data)
                    .await
                    .map_err(|err| BrokenConnectionError::WriteError(Arc::new(err)))?;

                // Coalesce subsequent requests into the same flush.
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => break,
                };
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(|err| BrokenConnectionError::WriteError(Arc::new(err)))?;
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        protocol_version: ProtocolVersion,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        node_address: SocketAddr, // used for logging only
    ) -> Result<(), BrokenConnectionError> {
        async fn issue_keepalive_request(
            router_handle: &RouterHandle,
            protocol_version: ProtocolVersion,
        ) -> Result<(), BrokenConnectionError> {
            router_handle
                .send_request(&Options, protocol_version, None, false)
                .await
                .map(|_| ())
                .map_err(|req_err| {
                    BrokenConnectionError::KeepaliveRequestError(Arc::new(req_err))
                })
        }

        let Some(keepalive_interval) = keepalive_interval else {
            // No keepalives are to be sent.
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Use up the first, instant tick.

        // Default behaviour (Burst) is not suitable for sending keepalives.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let keepalive_request = issue_keepalive_request(&router_handle, protocol_version);
            let request_result = if let Some(timeout) = keepalive_timeout {
                match tokio::time::timeout(timeout, keepalive_request).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to keepalive request on connection to node {}",
                            node_address
                        );
                        return Err(BrokenConnectionError::KeepaliveTimeout);
                    }
                }
            } else {
                keepalive_request.await
            };

            if let Err(err) = request_result {
                warn!(
                    "Failed to execute keepalive request on connection to node {} - {}",
                    node_address, err
                );
                return Err(err);
            }

            trace!(
                "Keepalive request successful on connection to node {}",
                node_address
            );
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), BrokenConnectionError> {
        if task_response.opcode != ResponseOpcode::Event {
            error!(
                "Expected to receive EVENT response on stream -1, got {:?}",
                task_response.opcode
            );
            return Err(BrokenConnectionError::UnexpectedResponseOnEventStream(
                task_response.opcode,
            ));
        }

        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        let event = Event::deserialize(&mut &*body_with_ext.body)
            .map_err(|err| BrokenConnectionError::from(frame::frame_errors::FrameError::Parse(err)))?;

        // A dropped receiver means the cluster worker is shutting down;
        // the event can be discarded.
        let _ = event_sender.send(event).await;

        Ok(())
    }
}

/// Opens a connection and performs its setup on the CQL level:
/// OPTIONS/STARTUP handshake, optional authentication, and REGISTER for
/// server events if this is a control connection.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (connection, error_receiver) = Connection::new(addr, config.clone()).await?;

    /* Perform the OPTIONS/SUPPORTED/STARTUP handshake. */
    let mut supported = connection.get_options().await?;
    let supported_compression = supported
        .options
        .remove(options_keys::COMPRESSION)
        .unwrap_or_default();

    let mut options = HashMap::new();
    options.insert(
        Cow::Borrowed(options_keys::CQL_VERSION),
        Cow::Borrowed(DEFAULT_CQL_PROTOCOL_VERSION),
    );
    options.insert(
        Cow::Borrowed(options_keys::DRIVER_NAME),
        Cow::Borrowed(DRIVER_NAME),
    );
    options.insert(
        Cow::Borrowed(options_keys::DRIVER_VERSION),
        Cow::Borrowed(DRIVER_VERSION),
    );

    if let Some(compression) = config.compression {
        let compression_str = compression.as_str();
        if supported_compression.iter().any(|c| c == compression_str) {
            options.insert(
                Cow::Borrowed(options_keys::COMPRESSION),
                Cow::Borrowed(compression_str),
            );
        } else {
            return Err(ConnectionSetupRequestError::CompressionNotSupported(compression).into());
        }
    }

    match connection.startup(options).await? {
        NonErrorStartupResponse::Ready => {}
        NonErrorStartupResponse::Authenticate(authenticate) => {
            connection.perform_authenticate(&authenticate).await?;
        }
    }

    /* If this is a control connection, REGISTER to receive all event types. */
    if connection.config.event_sender.is_some() {
        connection
            .register(vec![
                EventType::TopologyChange,
                EventType::StatusChange,
                EventType::SchemaChange,
            ])
            .await?;
    }

    Ok((connection, error_receiver))
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            stream_set: StreamIdSet::new(),
            handlers: HashMap::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        if let Some(stream_id) = self.stream_set.allocate() {
            let prev_handler = self.handlers.insert(stream_id, response_handler);
            assert!(prev_handler.is_none());
            Ok(stream_id)
        } else {
            Err(response_handler)
        }
    }

    fn lookup(&mut self, stream_id: i16) -> Option<ResponseHandler> {
        self.stream_set.free(stream_id);
        self.handlers.remove(&stream_id)
    }

    // Retrieves the map of handlers, used after connection breaks
    // and we have to respond to all of them with an error.
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

/// Tracks which of the 32768 non-negative stream ids are in flight.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
}

impl StreamIdSet {
    fn new() -> Self {
        const BITMAP_SIZE: usize = (i16::MAX as usize + 1) / 64;
        Self {
            used_bitmap: vec![0; BITMAP_SIZE].into_boxed_slice(),
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                let stream_id = off as i16 + block_id as i16 * 64;
                return Some(stream_id);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

/// This type can only hold a valid keyspace name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Keyspace names can have up to 48 alphanumeric characters and contain
    // underscores. The servers additionally accept an underscore as the
    // first character, so we do too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        // Only ascii is allowed, so char count equals byte count
        let keyspace_name_len: usize = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ));
                }
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    use coral_cql::frame::response::result::PreparedMetadata;
    use coral_cql::frame::types;

    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:9042".parse().unwrap()
    }

    async fn read_request_frame(stream: &mut DuplexStream) -> (u8, i16, Vec<u8>) {
        let mut header = [0u8; 9];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x04);
        let stream_id = i16::from_be_bytes([header[2], header[3]]);
        let opcode = header[4];
        let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await.unwrap();
        (opcode, stream_id, body)
    }

    fn make_response_frame(stream_id: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x84, 0];
        frame.extend_from_slice(&stream_id.to_be_bytes());
        frame.push(opcode);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    fn void_result_body() -> Vec<u8> {
        let mut body = Vec::new();
        types::write_int(0x0001, &mut body);
        body
    }

    fn set_keyspace_result_body(name: &str) -> Vec<u8> {
        let mut body = Vec::new();
        types::write_int(0x0003, &mut body);
        types::write_string(name, &mut body).unwrap();
        body
    }

    fn prepared_result_body(id: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        types::write_int(0x0004, &mut body);
        types::write_short_bytes(id, &mut body).unwrap();
        // prepared metadata: no flags, no columns, no pk indexes
        types::write_int(0, &mut body);
        types::write_int(0, &mut body);
        types::write_int(0, &mut body);
        // result metadata: no flags, no columns
        types::write_int(0, &mut body);
        types::write_int(0, &mut body);
        body
    }

    fn unprepared_error_body(id: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        types::write_int(0x2500, &mut body);
        types::write_string("Unknown prepared statement", &mut body).unwrap();
        types::write_short_bytes(id, &mut body).unwrap();
        body
    }

    fn make_prepared_statement(id: &'static [u8]) -> PreparedStatement {
        PreparedStatement::new(
            Bytes::from_static(id),
            "SELECT a FROM ks.t WHERE b = ?".to_string(),
            PreparedMetadata {
                col_count: 0,
                pk_indexes: vec![],
                col_specs: vec![],
            },
            Default::default(),
            Default::default(),
        )
    }

    #[tokio::test]
    async fn responses_are_routed_by_stream_id() {
        let (client_end, mut server_end) = tokio::io::duplex(1024 * 1024);
        let (connection, _error_receiver) =
            Connection::new_with_stream(test_addr(), ConnectionConfig::default(), client_end);
        let connection = Arc::new(connection);

        let server = tokio::spawn(async move {
            let mut stream_ids = Vec::new();
            for _ in 0..10 {
                let (opcode, stream_id, _body) = read_request_frame(&mut server_end).await;
                assert_eq!(opcode, 0x07); // QUERY
                stream_ids.push(stream_id);
            }

            let unique: HashSet<i16> = stream_ids.iter().copied().collect();
            assert_eq!(unique.len(), stream_ids.len());

            // Respond in reverse order; each response must still reach the
            // request that carried its stream id.
            for stream_id in stream_ids.iter().rev() {
                let frame = make_response_frame(*stream_id, 0x08, &void_result_body());
                server_end.write_all(&frame).await.unwrap();
            }
            server_end.flush().await.unwrap();
            server_end
        });

        let requests = (0..10).map(|i| {
            let connection = Arc::clone(&connection);
            async move {
                let statement = Statement::new(format!("SELECT {i}"));
                connection
                    .query_raw_with_consistency(
                        &statement,
                        SerializedValues::EMPTY,
                        Consistency::One,
                        None,
                        None,
                        None,
                    )
                    .await
            }
        });

        let responses = futures::future::join_all(requests).await;
        for response in responses {
            assert_matches!(
                response.unwrap().response,
                Response::Result(result::Result::Void)
            );
        }

        server.await.unwrap();
    }

    #[tokio::test]
    async fn execute_reprepares_on_unprepared_error() {
        let (client_end, mut server_end) = tokio::io::duplex(1024 * 1024);
        let (connection, _error_receiver) =
            Connection::new_with_stream(test_addr(), ConnectionConfig::default(), client_end);

        let prepared = make_prepared_statement(b"stmt-id");

        let server = tokio::spawn(async move {
            // First EXECUTE is answered with an Unprepared error.
            let (opcode, stream_id, _body) = read_request_frame(&mut server_end).await;
            assert_eq!(opcode, 0x0A); // EXECUTE
            let frame = make_response_frame(stream_id, 0x00, &unprepared_error_body(b"stmt-id"));
            server_end.write_all(&frame).await.unwrap();

            // The driver reprepares the statement.
            let (opcode, stream_id, _body) = read_request_frame(&mut server_end).await;
            assert_eq!(opcode, 0x09); // PREPARE
            let frame = make_response_frame(stream_id, 0x08, &prepared_result_body(b"stmt-id"));
            server_end.write_all(&frame).await.unwrap();

            // And resends the EXECUTE.
            let (opcode, stream_id, _body) = read_request_frame(&mut server_end).await;
            assert_eq!(opcode, 0x0A);
            let frame = make_response_frame(stream_id, 0x08, &void_result_body());
            server_end.write_all(&frame).await.unwrap();
            server_end
        });

        let response = connection
            .execute_raw_with_consistency(
                &prepared,
                SerializedValues::EMPTY,
                Consistency::One,
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert_matches!(response.response, Response::Result(result::Result::Void));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn repreparation_with_different_id_is_an_error() {
        let (client_end, mut server_end) = tokio::io::duplex(1024 * 1024);
        let (connection, _error_receiver) =
            Connection::new_with_stream(test_addr(), ConnectionConfig::default(), client_end);

        let prepared = make_prepared_statement(b"stmt-id");

        let server = tokio::spawn(async move {
            let (opcode, stream_id, _body) = read_request_frame(&mut server_end).await;
            assert_eq!(opcode, 0x0A);
            let frame = make_response_frame(stream_id, 0x00, &unprepared_error_body(b"stmt-id"));
            server_end.write_all(&frame).await.unwrap();

            // Reprepare, but answer with a different statement id.
            let (opcode, stream_id, _body) = read_request_frame(&mut server_end).await;
            assert_eq!(opcode, 0x09);
            let frame = make_response_frame(stream_id, 0x08, &prepared_result_body(b"other-id"));
            server_end.write_all(&frame).await.unwrap();
            server_end
        });

        let result = connection
            .execute_raw_with_consistency(
                &prepared,
                SerializedValues::EMPTY,
                Consistency::One,
                None,
                None,
                None,
            )
            .await;
        assert_matches!(
            result,
            Err(RequestAttemptError::RepreparedIdChanged { .. })
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn broken_connection_fails_all_pending_requests() {
        let (client_end, mut server_end) = tokio::io::duplex(1024 * 1024);
        let (connection, error_receiver) =
            Connection::new_with_stream(test_addr(), ConnectionConfig::default(), client_end);
        let connection = Arc::new(connection);

        let server = tokio::spawn(async move {
            for _ in 0..3 {
                read_request_frame(&mut server_end).await;
            }
            // Drop the stream without answering; the reader sees EOF.
        });

        let requests = (0..3).map(|_| {
            let connection = Arc::clone(&connection);
            async move {
                let statement = Statement::new("SELECT 1");
                connection
                    .query_raw_with_consistency(
                        &statement,
                        SerializedValues::EMPTY,
                        Consistency::One,
                        None,
                        None,
                        None,
                    )
                    .await
            }
        });

        let results = futures::future::join_all(requests).await;
        for result in results {
            assert_matches!(
                result,
                Err(RequestAttemptError::BrokenConnectionError(_))
            );
        }

        let error = error_receiver.await.unwrap();
        assert_matches!(error, ConnectionError::BrokenConnection(_));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn use_keyspace_verifies_result_name() {
        let (client_end, mut server_end) = tokio::io::duplex(1024 * 1024);
        let (connection, _error_receiver) =
            Connection::new_with_stream(test_addr(), ConnectionConfig::default(), client_end);

        let server = tokio::spawn(async move {
            // Confirm the first USE with a matching keyspace name (uppercased
            // by the server, which must be fine for case-insensitive names).
            let (opcode, stream_id, _body) = read_request_frame(&mut server_end).await;
            assert_eq!(opcode, 0x07);
            let frame = make_response_frame(stream_id, 0x08, &set_keyspace_result_body("KS_ONE"));
            server_end.write_all(&frame).await.unwrap();

            // Answer the second USE with a different name.
            let (opcode, stream_id, _body) = read_request_frame(&mut server_end).await;
            assert_eq!(opcode, 0x07);
            let frame = make_response_frame(stream_id, 0x08, &set_keyspace_result_body("other"));
            server_end.write_all(&frame).await.unwrap();
            server_end
        });

        let ks = VerifiedKeyspaceName::new("ks_one".to_string(), false).unwrap();
        connection.use_keyspace(&ks).await.unwrap();

        let result = connection.use_keyspace(&ks).await;
        assert_matches!(
            result,
            Err(RequestAttemptError::KeyspaceNameMismatch { expected, received })
                if expected == "ks_one" && received == "other"
        );

        server.await.unwrap();
    }

    #[tokio::test]
    async fn events_are_forwarded_to_the_event_channel() {
        let (client_end, mut server_end) = tokio::io::duplex(1024 * 1024);
        let (event_sender, mut event_receiver) = mpsc::channel(32);
        let config = ConnectionConfig {
            event_sender: Some(event_sender),
            ..Default::default()
        };
        let (_connection, _error_receiver) =
            Connection::new_with_stream(test_addr(), config, client_end);

        let mut body = Vec::new();
        types::write_string("STATUS_CHANGE", &mut body).unwrap();
        types::write_string("UP", &mut body).unwrap();
        types::write_inet("10.0.0.1:9042".parse().unwrap(), &mut body);

        // Server events arrive unsolicited on stream -1.
        let frame = make_response_frame(-1, 0x0C, &body);
        server_end.write_all(&frame).await.unwrap();

        let event = event_receiver.recv().await.unwrap();
        assert_matches!(
            event,
            Event::StatusChange(coral_cql::frame::response::event::StatusChangeEvent::Up(addr))
                if addr == "10.0.0.1:9042".parse().unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_timeout_breaks_the_connection() {
        let (client_end, server_end) = tokio::io::duplex(1024);
        let config = ConnectionConfig {
            keepalive_interval: Some(Duration::from_secs(1)),
            keepalive_timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let (_connection, error_receiver) =
            Connection::new_with_stream(test_addr(), config, client_end);

        // Nobody answers the OPTIONS keepalive, so the timeout must fire.
        let error = error_receiver.await.unwrap();
        assert_matches!(
            error,
            ConnectionError::BrokenConnection(BrokenConnectionError::KeepaliveTimeout)
        );

        drop(server_end);
    }

    #[test]
    fn stream_ids_are_reused_after_free() {
        let mut set = StreamIdSet::new();
        for expected in 0..=i16::MAX {
            assert_eq!(set.allocate(), Some(expected));
        }
        // All 32768 ids are in flight now.
        assert_eq!(set.allocate(), None);

        set.free(17);
        assert_eq!(set.allocate(), Some(17));
        assert_eq!(set.allocate(), None);
    }

    #[test]
    fn handler_map_rejects_allocation_when_full() {
        let mut map = ResponseHandlerMap::new();
        for _ in 0..=i16::MAX {
            let (response_sender, _receiver) = oneshot::channel();
            assert!(map.allocate(ResponseHandler { response_sender }).is_ok());
        }

        let (response_sender, mut receiver) = oneshot::channel();
        assert!(map.allocate(ResponseHandler { response_sender }).is_err());
        // The caller is responsible for failing the handler; the map only
        // hands it back.
        assert!(receiver.try_recv().is_err());

        assert!(map.lookup(42).is_some());
        let (response_sender, _receiver) = oneshot::channel();
        assert_eq!(map.allocate(ResponseHandler { response_sender }).ok(), Some(42));
    }

    #[test]
    fn keyspace_name_validation() {
        assert!(VerifiedKeyspaceName::new("valid_name_1".to_string(), false).is_ok());
        assert!(VerifiedKeyspaceName::new("_underscore_first".to_string(), false).is_ok());

        assert_matches!(
            VerifiedKeyspaceName::new("".to_string(), false),
            Err(BadKeyspaceName::Empty)
        );
        assert_matches!(
            VerifiedKeyspaceName::new("a".repeat(49), false),
            Err(BadKeyspaceName::TooLong(_, 49))
        );
        assert_matches!(
            VerifiedKeyspaceName::new("no-dashes".to_string(), false),
            Err(BadKeyspaceName::IllegalCharacter(_, '-'))
        );
    }
}
