//! Connections to individual nodes and the per-node connection pools.

pub(crate) mod connection;
pub(crate) mod connection_pool;

pub(crate) use connection::{open_connection, Connection, ConnectionConfig, VerifiedKeyspaceName};
pub(crate) use connection_pool::{NodeConnectionPool, PoolConfig};
