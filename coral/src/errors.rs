//! Errors returned by the driver, layered the way requests flow through it:
//! frame-level parse errors become connection-level errors, connection-level
//! errors become per-attempt errors, and per-attempt errors aggregate into
//! the user-facing execution errors.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use coral_cql::frame::frame_errors::{FrameError, ParseError};
pub use coral_cql::frame::response::error::{DbError, WriteType};
pub use coral_cql::serialize::SerializationError;

use coral_cql::frame::response::ResponseOpcode;
use coral_cql::frame::Compression;

/// An error that occurred during `Session` creation.
#[derive(Debug, Error)]
pub enum NewSessionError {
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    #[error(transparent)]
    MetadataError(#[from] MetadataError),

    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error(transparent)]
    ExecutionError(#[from] ExecutionError),
}

/// An error that prevented reading cluster metadata over the control
/// connection.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Could not connect to any known node, per-node errors: {0:?}")]
    UnableToConnect(Vec<(SocketAddr, ConnectionError)>),

    #[error("Failed to query system tables: {0}")]
    FetchError(#[from] RequestAttemptError),

    #[error("Malformed system table response: {0}")]
    Malformed(String),
}

/// An error that occurred when opening a connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    #[error("Connection setup failed: {0}")]
    Setup(#[from] ConnectionSetupRequestError),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(err))
    }
}

/// An error that occurred during the OPTIONS/STARTUP/AUTH/REGISTER phase
/// of connection setup.
#[derive(Debug, Clone, Error)]
pub enum ConnectionSetupRequestError {
    #[error(transparent)]
    FrameError(Arc<FrameError>),

    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    #[error("Received unexpected response from the server during setup")]
    UnexpectedResponse,

    #[error("Server does not support {0} compression")]
    CompressionNotSupported(Compression),

    #[error(
        "Server requires authentication with {authenticator_name}, \
        but no authenticator was configured"
    )]
    MissingAuthentication { authenticator_name: String },

    #[error("Authentication error: {0}")]
    AuthenticationError(String),
}

impl From<FrameError> for ConnectionSetupRequestError {
    fn from(err: FrameError) -> Self {
        ConnectionSetupRequestError::FrameError(Arc::new(err))
    }
}

/// An error that broke an established connection. All operations pending on
/// the connection at that moment fail with the same error.
#[derive(Debug, Clone, Error)]
pub enum BrokenConnectionError {
    #[error("Failed to read a response frame: {0}")]
    FrameError(Arc<FrameError>),

    #[error("Failed to write a request frame: {0}")]
    WriteError(Arc<std::io::Error>),

    #[error("Timed out waiting for a keepalive response")]
    KeepaliveTimeout,

    #[error("Keepalive request failed: {0}")]
    KeepaliveRequestError(Arc<RequestAttemptError>),

    #[error("Received a response with an unexpected stream id {0}")]
    UnexpectedStreamId(i16),

    #[error("Received a response with opcode {0:?} on the event stream")]
    UnexpectedResponseOnEventStream(ResponseOpcode),

    #[error("Connection router task has stopped")]
    ChannelsClosed,
}

impl From<FrameError> for BrokenConnectionError {
    fn from(err: FrameError) -> Self {
        BrokenConnectionError::FrameError(Arc::new(err))
    }
}

/// An error returned when a connection cannot be borrowed from a node's
/// pool. Never blocks: the execution core reacts by moving on to the next
/// node in the plan.
#[derive(Debug, Clone, Error)]
pub enum ConnectionPoolError {
    #[error("The pool is still being initialized")]
    Initializing,

    #[error("The pool is broken; Last connection failed with: {last_connection_error}")]
    Broken {
        last_connection_error: ConnectionError,
    },

    #[error("The node is ignored by the load balancing policy and has no pool")]
    NodeIgnored,
}

/// An error that occurred during a single attempt of a request on a single
/// connection. The retry policy classifies these.
#[derive(Debug, Clone, Error)]
pub enum RequestAttemptError {
    #[error("Failed to serialize statement values: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Failed to serialize the request frame: {0}")]
    CqlRequestSerialization(Arc<FrameError>),

    #[error(transparent)]
    BrokenConnectionError(#[from] BrokenConnectionError),

    #[error("Unable to allocate a stream id; all stream ids on the connection are in use")]
    UnableToAllocStreamId,

    #[error("Failed to parse response frame extensions: {0}")]
    BodyExtensionsParseError(Arc<FrameError>),

    #[error("Failed to parse response body: {0}")]
    CqlResultParseError(Arc<ParseError>),

    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(&'static str),

    #[error(
        "Prepared statement id changed after repreparation; md5 sum should stay the same; \
        statement: \"{statement}\"; expected id: {expected_id:?}; reprepared id: {reprepared_id:?}"
    )]
    RepreparedIdChanged {
        statement: String,
        expected_id: Vec<u8>,
        reprepared_id: Vec<u8>,
    },

    #[error(
        "USE {expected} returned a SetKeyspace result with a mismatched \
        keyspace name: {received}"
    )]
    KeyspaceNameMismatch { expected: String, received: String },

    #[error("Driver tried to reuse a paging state of a finished result set")]
    NonfinishedPagingState,
}

impl From<ParseError> for RequestAttemptError {
    fn from(err: ParseError) -> Self {
        RequestAttemptError::CqlResultParseError(Arc::new(err))
    }
}

/// An error of a single execution fiber: one pass over the load-balancing
/// plan. Not directly user-facing.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("Load balancing policy returned an empty plan")]
    EmptyPlan,

    #[error("Request execution exceeded the client timeout {0:?}")]
    RequestTimeout(Duration),

    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailableError),
}

/// The last error observed for one node of an execution plan, stored in
/// [`NoHostAvailableError`]. Pool errors are kept apart from attempt errors
/// because the retry policy never sees them.
#[derive(Debug, Clone, Error)]
pub enum NodeRequestError {
    #[error(transparent)]
    Pool(#[from] ConnectionPoolError),

    #[error(transparent)]
    Attempt(#[from] RequestAttemptError),
}

/// Every node of the execution plan was attempted and none produced a
/// decisive response. Carries the last error seen on each attempted node.
#[derive(Debug, Clone, Error)]
#[error("No host could execute the request; per-node errors: {errors:?}")]
pub struct NoHostAvailableError {
    pub errors: Vec<(SocketAddr, NodeRequestError)>,
}

/// A user-facing error of a request execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailableError),

    #[error(transparent)]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("Load balancing policy returned an empty plan")]
    EmptyPlan,

    #[error("Request execution exceeded the client timeout {0:?}")]
    RequestTimeout(Duration),

    #[error("Failed to serialize statement values: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Failed to calculate a routing token: {0}")]
    TokenCalculationError(#[from] crate::routing::TokenCalculationError),

    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error(transparent)]
    MetadataError(#[from] MetadataError),
}

impl From<RequestError> for ExecutionError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::EmptyPlan => ExecutionError::EmptyPlan,
            RequestError::RequestTimeout(timeout) => ExecutionError::RequestTimeout(timeout),
            RequestError::LastAttemptError(e) => ExecutionError::LastAttemptError(e),
            RequestError::NoHostAvailable(e) => ExecutionError::NoHostAvailable(e),
        }
    }
}

/// Invalid keyspace name given to `Session::use_keyspace()`.
#[derive(Debug, Error, Clone)]
pub enum BadKeyspaceName {
    #[error("Keyspace name is empty")]
    Empty,

    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters: {0}")]
    TooLong(String, usize),

    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed: {0}")]
    IllegalCharacter(String, char),
}
