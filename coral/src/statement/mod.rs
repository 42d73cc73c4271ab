//! Statements to be executed: unprepared, prepared and batches, together
//! with their per-statement execution settings.

pub mod batch;
pub mod prepared;

pub use coral_cql::frame::types::{Consistency, SerialConsistency};

use std::sync::Arc;
use std::time::Duration;

use crate::policies::retry::RetryPolicy;
use crate::policies::speculative::SpeculativeExecutionPolicy;

/// Default page size used when the statement does not set one.
pub(crate) const DEFAULT_PAGE_SIZE: i32 = 5000;

/// Per-statement overrides of the session-level execution defaults.
#[derive(Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<SerialConsistency>,
    pub(crate) is_idempotent: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
}

impl std::fmt::Debug for StatementConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementConfig")
            .field("consistency", &self.consistency)
            .field("serial_consistency", &self.serial_consistency)
            .field("is_idempotent", &self.is_idempotent)
            .field("timestamp", &self.timestamp)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// An unprepared CQL statement: query text plus execution settings.
#[derive(Clone)]
pub struct Statement {
    pub contents: String,
    pub(crate) config: StatementConfig,
    page_size: i32,
}

impl Statement {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            config: StatementConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
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

    /// Marks the statement as safe to re-execute on ambiguous failures.
    /// Retrying on another node after a possible partial execution is only
    /// allowed for idempotent statements.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    pub fn set_page_size(&mut self, page_size: i32) {
        assert!(page_size > 0, "page size must be positive, got {page_size}");
        self.page_size = page_size;
    }

    pub fn get_page_size(&self) -> i32 {
        self.page_size
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

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl<'a> From<&'a str> for Statement {
    fn from(s: &'a str) -> Statement {
        Statement::new(s.to_owned())
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("contents", &self.contents)
            .field("page_size", &self.page_size)
            .finish()
    }
}
