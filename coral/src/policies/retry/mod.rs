//! Classification of failed request attempts into retry decisions.

mod default;
mod fallthrough;

pub use default::DefaultRetryPolicy;
pub use fallthrough::FallthroughRetryPolicy;

use crate::errors::RequestAttemptError;
use coral_cql::frame::types::Consistency;

/// Information about a failed request attempt, passed to the retry policy.
pub struct RequestInfo<'a> {
    pub error: &'a RequestAttemptError,
    pub is_idempotent: bool,
    pub consistency: Consistency,
}

/// What to do after a failed attempt. A carried consistency, if present,
/// overrides the statement's consistency for the retried attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetrySameTarget(Option<Consistency>),
    RetryNextTarget(Option<Consistency>),
    DontRetry,
    IgnoreWriteError,
}

/// Produces a fresh [`RetrySession`] for every request execution.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Decides, attempt by attempt, whether a failed request should be retried.
/// Sessions are stateful; `reset` reverts to the initial state so the session
/// can be reused for the next execution of the same request.
pub trait RetrySession: Send + Sync {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;

    fn reset(&mut self);
}
