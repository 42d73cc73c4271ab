use std::sync::Arc;
use std::time::Duration;

pub use coral_cql::frame::request::batch::BatchType;

use super::prepared::PreparedStatement;
use super::{Consistency, SerialConsistency, Statement, StatementConfig};
use crate::policies::retry::RetryPolicy;
use crate::policies::speculative::SpeculativeExecutionPolicy;

/// A batch of CQL statements executed as a unit.
///
/// Consistency, timestamp and the execution policies are batch-wide; the
/// per-statement settings of the contained statements are ignored.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub(crate) config: StatementConfig,
    pub statements: Vec<BatchStatement>,
    batch_type: BatchType,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            ..Default::default()
        }
    }

    /// Appends a statement to the batch.
    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = sc;
    }

    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.config.serial_consistency
    }

    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    pub fn get_timestamp(&self) -> Option<i64> {
        self.config.timestamp
    }

    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.config.request_timeout = timeout;
    }

    pub fn get_request_timeout(&self) -> Option<Duration> {
        self.config.request_timeout
    }

    pub fn set_retry_policy(&mut self, retry_policy: Option<Arc<dyn RetryPolicy>>) {
        self.config.retry_policy = retry_policy;
    }

    pub fn get_retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.config.retry_policy.as_ref()
    }

    pub fn set_speculative_execution_policy(
        &mut self,
        policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    ) {
        self.config.speculative_execution_policy = policy;
    }
}

/// A single statement of a batch.
#[derive(Clone, Debug)]
pub enum BatchStatement {
    Query(Statement),
    PreparedStatement(PreparedStatement),
}

impl From<&str> for BatchStatement {
    fn from(s: &str) -> Self {
        BatchStatement::Query(Statement::from(s))
    }
}

impl From<Statement> for BatchStatement {
    fn from(s: Statement) -> Self {
        BatchStatement::Query(s)
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(p: PreparedStatement) -> Self {
        BatchStatement::PreparedStatement(p)
    }
}
