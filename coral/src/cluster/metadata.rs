//! Fetching cluster topology over the control connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use coral_cql::frame::response::event::Event;
use coral_cql::frame::response::result::Row;
use coral_cql::frame::ProtocolVersion;
use coral_cql::value::CqlValue;

use crate::cluster::node::{resolve_contact_points, KnownNode};
use crate::errors::{
    ConnectionError, ConnectionSetupRequestError, DbError, MetadataError, NewSessionError,
};
use crate::network::{open_connection, Connection, ConnectionConfig};
use crate::routing::Token;

/// Cluster topology as read from the system tables.
#[derive(Debug, Clone)]
pub(crate) struct Metadata {
    pub(crate) peers: Vec<Peer>,
}

/// A single node of the cluster, as described by a `system.local` or
/// `system.peers` row.
#[derive(Debug, Clone)]
pub(crate) struct Peer {
    pub(crate) host_id: Uuid,
    pub(crate) address: SocketAddr,
    pub(crate) tokens: Vec<Token>,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
}

impl Metadata {
    /// Replaces real metadata with a hardcoded dummy based on the known peer
    /// addresses. Used as a fallback when the initial metadata query fails,
    /// so that the session can still serve requests to the contact points.
    fn new_dummy(known_peers: &[SocketAddr]) -> Metadata {
        let peers = known_peers
            .iter()
            .map(|&address| Peer {
                host_id: Uuid::new_v4(),
                address,
                tokens: vec![Token::new(rand::rng().random::<i64>())],
                datacenter: None,
                rack: None,
            })
            .collect();
        Metadata { peers }
    }
}

enum ControlConnectionState {
    Working(Arc<Connection>),
    Broken { last_error: ConnectionError },
}

/// Reads current metadata from the cluster over a dedicated control
/// connection, which is also the connection server events arrive on.
pub(crate) struct MetadataReader {
    // Has `event_sender` set, so that the control connection REGISTERs for
    // server events and forwards them to the cluster worker.
    connection_config: ConnectionConfig,

    control_connection_address: SocketAddr,
    control_connection: ControlConnectionState,

    // Signalled when the control connection breaks, so that the cluster
    // worker can trigger a reconnecting refresh right away.
    repair_sender: mpsc::Sender<()>,

    // When the control connection fails, the reader tries to connect to one
    // of these.
    known_peers: Vec<SocketAddr>,

    // When no known peer is reachable, initial known nodes are resolved once
    // again as a fallback.
    initial_known_nodes: Vec<KnownNode>,
    hostname_resolution_timeout: Option<Duration>,
}

const LOCAL_QUERY: &str =
    "select host_id, rpc_address, data_center, rack, tokens from system.local WHERE key='local'";
const PEERS_QUERY: &str =
    "select host_id, rpc_address, data_center, rack, tokens from system.peers";

impl MetadataReader {
    /// Creates a new MetadataReader and opens the initial control connection
    /// to a random contact point.
    pub(crate) async fn new(
        initial_known_nodes: Vec<KnownNode>,
        hostname_resolution_timeout: Option<Duration>,
        mut connection_config: ConnectionConfig,
        server_event_sender: mpsc::Sender<Event>,
        repair_sender: mpsc::Sender<()>,
    ) -> Result<Self, NewSessionError> {
        let (initial_peers, resolved_hostnames) =
            resolve_contact_points(&initial_known_nodes, hostname_resolution_timeout).await;
        if initial_peers.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(
                resolved_hostnames,
            ));
        }

        // Setting the event sender makes the control connection REGISTER for
        // server events and forward them on this channel.
        connection_config.event_sender = Some(server_event_sender);

        let control_connection_address = *initial_peers
            .choose(&mut rand::rng())
            .expect("nonempty by the check above");

        let mut reader = MetadataReader {
            connection_config,
            control_connection_address,
            control_connection: ControlConnectionState::Broken {
                last_error: ConnectionError::ConnectTimeout,
            },
            repair_sender,
            known_peers: initial_peers,
            initial_known_nodes,
            hostname_resolution_timeout,
        };
        reader.reconnect(control_connection_address).await;

        Ok(reader)
    }

    /// The protocol version the control connection settled on. After a
    /// downgrade, pools opened later should use the same version.
    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.connection_config.protocol_version
    }

    /// Fetches current metadata from the cluster, failing over to other
    /// known peers when the current control connection does not work.
    pub(crate) async fn read_metadata(&mut self, initial: bool) -> Result<Metadata, MetadataError> {
        let mut result = self.fetch_metadata(initial).await;
        let prev_err = match result {
            Ok(metadata) => {
                debug!("Fetched new metadata");
                self.update_known_peers(&metadata);
                return Ok(metadata);
            }
            Err(err) => err,
        };

        // Fetching metadata on the current control connection failed, so
        // try the other known peers, in random order.
        self.known_peers.shuffle(&mut rand::rng());

        let failed_address = self.control_connection_address;
        let other_peers: Vec<SocketAddr> = self
            .known_peers
            .iter()
            .copied()
            .filter(|peer| *peer != failed_address)
            .collect();

        result = self
            .retry_fetch_metadata_on_nodes(initial, other_peers, prev_err)
            .await;

        if let Err(prev_err) = result {
            if !initial {
                // If no known peer is reachable, fall back to the initial
                // contact points, in hope that some hostname resolves to a
                // reachable new address.
                warn!(
                    "Failed to fetch metadata on all known peers. \
                    Falling back to initial contact points."
                );
                let (initial_peers, _hostnames) = resolve_contact_points(
                    &self.initial_known_nodes,
                    self.hostname_resolution_timeout,
                )
                .await;
                result = self
                    .retry_fetch_metadata_on_nodes(initial, initial_peers, prev_err)
                    .await;
            } else {
                result = Err(prev_err);
            }
        }

        match &result {
            Ok(metadata) => {
                self.update_known_peers(metadata);
                debug!("Fetched new metadata");
            }
            Err(err) => error!(
                error = %err,
                control_connection_address = %self.control_connection_address,
                "Could not fetch metadata"
            ),
        }

        result
    }

    async fn retry_fetch_metadata_on_nodes(
        &mut self,
        initial: bool,
        nodes: Vec<SocketAddr>,
        prev_err: MetadataError,
    ) -> Result<Metadata, MetadataError> {
        let mut result = Err(prev_err);
        for peer in nodes {
            let err = match result {
                Ok(_) => break,
                Err(err) => err,
            };

            warn!(
                control_connection_address = %self.control_connection_address,
                error = %err,
                "Failed to fetch metadata using current control connection"
            );
            debug!("Retrying to establish the control connection on {}", peer);

            self.reconnect(peer).await;
            result = self.fetch_metadata(initial).await;
        }
        result
    }

    async fn fetch_metadata(&self, initial: bool) -> Result<Metadata, MetadataError> {
        let conn = match &self.control_connection {
            ControlConnectionState::Working(conn) => conn,
            ControlConnectionState::Broken { last_error } => {
                return Err(MetadataError::UnableToConnect(vec![(
                    self.control_connection_address,
                    last_error.clone(),
                )]));
            }
        };

        let res = self.query_peers(conn).await;

        if initial {
            if let Err(err) = res {
                warn!(
                    error = ?err,
                    "Initial metadata read failed, proceeding with metadata \
                    consisting only of the initial peer list and dummy tokens. \
                    This might result in suboptimal performance."
                );
                return Ok(Metadata::new_dummy(&self.known_peers));
            }
        }

        res
    }

    async fn query_peers(&self, conn: &Connection) -> Result<Metadata, MetadataError> {
        let local_query = conn.query_unpaged(LOCAL_QUERY);
        let peers_query = conn.query_unpaged(PEERS_QUERY);
        let (local_response, peers_response) = tokio::try_join!(local_query, peers_query)
            .map_err(MetadataError::FetchError)?;

        let local_rows = local_response
            .into_query_result_with_unknown_coordinator()
            .map_err(MetadataError::FetchError)?
            .into_rows()
            .ok_or_else(|| {
                MetadataError::Malformed("system.local returned a non-Rows result".to_string())
            })?;
        let peers_rows = peers_response
            .into_query_result_with_unknown_coordinator()
            .map_err(MetadataError::FetchError)?
            .into_rows()
            .ok_or_else(|| {
                MetadataError::Malformed("system.peers returned a non-Rows result".to_string())
            })?;

        let local_address = self.control_connection_address;

        let peers: Vec<Peer> = local_rows
            .iter()
            .map(|row| (NodeInfoSource::Local, row))
            .chain(peers_rows.iter().map(|row| (NodeInfoSource::Peer, row)))
            .filter_map(|(source, row)| create_peer_from_row(source, row, local_address))
            .collect();

        if peers.is_empty() {
            return Err(MetadataError::Malformed(
                "system.local and system.peers yielded no usable peers".to_string(),
            ));
        }

        Ok(Metadata { peers })
    }

    fn update_known_peers(&mut self, metadata: &Metadata) {
        self.known_peers = metadata.peers.iter().map(|peer| peer.address).collect();
    }

    async fn reconnect(&mut self, address: SocketAddr) {
        self.control_connection_address = address;
        self.control_connection = match Self::open_control_connection(
            address,
            &mut self.connection_config,
            &self.repair_sender,
        )
        .await
        {
            Ok(conn) => ControlConnectionState::Working(conn),
            Err(last_error) => ControlConnectionState::Broken { last_error },
        };
    }

    // Opens the control connection, downgrading the protocol version when
    // the server rejects the STARTUP with a ProtocolError.
    async fn open_control_connection(
        address: SocketAddr,
        config: &mut ConnectionConfig,
        repair_sender: &mpsc::Sender<()>,
    ) -> Result<Arc<Connection>, ConnectionError> {
        loop {
            match open_connection(address, config).await {
                Ok((connection, error_receiver)) => {
                    // Forward connection breakage to the cluster worker, so
                    // that it can reconnect promptly instead of waiting for
                    // the next periodic refresh.
                    let repair_sender = repair_sender.clone();
                    tokio::task::spawn(async move {
                        let _ = error_receiver.await;
                        let _ = repair_sender.send(()).await;
                    });
                    return Ok(Arc::new(connection));
                }
                Err(ConnectionError::Setup(ConnectionSetupRequestError::DbError(
                    DbError::ProtocolError,
                    message,
                ))) => {
                    let Some(downgraded) = config.protocol_version.downgrade() else {
                        return Err(ConnectionError::Setup(
                            ConnectionSetupRequestError::DbError(DbError::ProtocolError, message),
                        ));
                    };
                    warn!(
                        "Server {} rejected protocol version {}: {}. \
                        Retrying with version {}.",
                        address, config.protocol_version, message, downgraded
                    );
                    config.protocol_version = downgraded;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Clone, Copy)]
enum NodeInfoSource {
    Local,
    Peer,
}

impl NodeInfoSource {
    fn describe(&self) -> &'static str {
        match self {
            Self::Local => "local node",
            Self::Peer => "peer",
        }
    }
}

// Builds a Peer from a system.local/system.peers row; malformed rows are
// skipped with a warning rather than failing the whole refresh.
fn create_peer_from_row(
    source: NodeInfoSource,
    row: &Row,
    local_address: SocketAddr,
) -> Option<Peer> {
    let [host_id, rpc_address, datacenter, rack, tokens] = row.columns.as_slice() else {
        warn!(
            "system table row for a {} has {} columns, expected 5; skipping it",
            source.describe(),
            row.columns.len()
        );
        return None;
    };

    let host_id = match host_id.as_ref().and_then(CqlValue::as_uuid) {
        Some(host_id) => host_id,
        None => {
            warn!("{} has Host ID set to null; skipping node.", source.describe());
            return None;
        }
    };

    let address = match source {
        // For the local node the connection's address is used instead of
        // rpc_address, because rpc_address in system.local can be wrong.
        NodeInfoSource::Local => local_address,
        NodeInfoSource::Peer => {
            let ip = match rpc_address.as_ref().and_then(CqlValue::as_inet) {
                Some(ip) => ip,
                None => {
                    warn!("peer {} has rpc_address set to null; skipping node.", host_id);
                    return None;
                }
            };
            SocketAddr::new(ip, local_address.port())
        }
    };

    let datacenter = datacenter.as_ref().and_then(CqlValue::as_text).cloned();
    let rack = rack.as_ref().and_then(CqlValue::as_text).cloned();

    let token_strings = tokens
        .as_ref()
        .and_then(|v| v.as_list().or_else(|| v.as_set()))
        .map(Vec::as_slice)
        .unwrap_or_default();

    let tokens: Vec<Token> = match token_strings
        .iter()
        .map(|v| {
            v.as_text()
                .ok_or(())
                .and_then(|s| s.parse::<i64>().map_err(|_| ()))
                .map(Token::new)
        })
        .collect::<Result<Vec<Token>, ()>>()
    {
        Ok(tokens) if !tokens.is_empty() => tokens,
        _ => {
            // A dummy token keeps the node usable for routing even when its
            // token list is missing or not made of 64-bit integers.
            debug!(
                "{} {} has no parsable tokens, assigning a dummy token",
                source.describe(),
                host_id
            );
            vec![Token::new(rand::rng().random::<i64>())]
        }
    };

    Some(Peer {
        host_id,
        address,
        tokens,
        datacenter,
        rack,
    })
}
