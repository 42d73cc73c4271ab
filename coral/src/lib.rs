//! Async CQL driver for Cassandra-compatible databases.
//!
//! The driver multiplexes requests over a small number of connections per
//! node, keeps an immutable snapshot of cluster topology refreshed in the
//! background, and routes each request through pluggable load-balancing,
//! retry and speculative-execution policies.
//!
//! The entry point is [`Session`](client::session::Session), usually built
//! through [`SessionBuilder`](client::session_builder::SessionBuilder):
//!
//! ```rust,no_run
//! use coral::client::session_builder::SessionBuilder;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = SessionBuilder::new()
//!     .known_node("127.0.0.1:9042")
//!     .build()
//!     .await?;
//! let result = session.query_unpaged("SELECT name FROM ks.users", &[]).await?;
//! # Ok(())
//! # }
//! ```

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub(crate) mod execution;
pub(crate) mod network;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

pub use coral_cql::frame::types::{Consistency, SerialConsistency};
pub use coral_cql::value::CqlValue;

pub use client::session::{Session, SessionConfig};
pub use client::session_builder::SessionBuilder;
pub use response::query_result::QueryResult;
