use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::errors::{DbError, RequestAttemptError, WriteType};

/// The default retry policy. Retries only when there is a high chance that
/// the retry will succeed and, for non-idempotent statements, only when it
/// is certain the previous attempt did not reach any replica.
#[derive(Debug)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> DefaultRetryPolicy {
        DefaultRetryPolicy::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::new())
    }
}

pub struct DefaultRetrySession {
    was_unavailable_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
}

impl DefaultRetrySession {
    pub fn new() -> DefaultRetrySession {
        DefaultRetrySession {
            was_unavailable_retry: false,
            was_read_timeout_retry: false,
            was_write_timeout_retry: false,
        }
    }
}

impl Default for DefaultRetrySession {
    fn default() -> DefaultRetrySession {
        DefaultRetrySession::new()
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        // Conditional statements are never retried, a retry could apply the
        // write twice.
        if request_info.consistency.is_serial() {
            return RetryDecision::DontRetry;
        };
        match request_info.error {
            // The contacted node has generic problems. Whether the request
            // reached a replica is unknown, so retrying (on another node) is
            // safe only for idempotent statements.
            RequestAttemptError::BrokenConnectionError(_)
            | RequestAttemptError::DbError(DbError::Overloaded, _)
            | RequestAttemptError::DbError(DbError::ServerError, _)
            | RequestAttemptError::DbError(DbError::TruncateError, _) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The coordinator believes too few replicas are alive. Another
            // coordinator may have a healthier view, try one other node once.
            RequestAttemptError::DbError(DbError::Unavailable { .. }, _) => {
                if !self.was_unavailable_retry {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Enough replicas replied but none sent data, so the replica
            // chosen for the data response was unresponsive. A single retry
            // on the same coordinator will pick a different data replica.
            RequestAttemptError::DbError(
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                },
                _,
            ) => {
                if !self.was_read_timeout_retry && received >= required && !*data_present {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // A timed out batch log write means the batch was not applied
            // anywhere, so it is retriable for idempotent statements.
            RequestAttemptError::DbError(DbError::WriteTimeout { write_type, .. }, _) => {
                if !self.was_write_timeout_retry
                    && request_info.is_idempotent
                    && *write_type == WriteType::BatchLog
                {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The node cannot serve requests yet, but others can.
            RequestAttemptError::DbError(DbError::IsBootstrapping, _) => {
                RetryDecision::RetryNextTarget(None)
            }
            // All stream ids on the connection are taken, the node is
            // overloaded by this client alone.
            RequestAttemptError::UnableToAllocStreamId => RetryDecision::RetryNextTarget(None),
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::new();
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
    use crate::errors::{BrokenConnectionError, DbError, RequestAttemptError, WriteType};
    use coral_cql::frame::types::Consistency;

    fn make_request_info(
        error: &RequestAttemptError,
        is_idempotent: bool,
    ) -> RequestInfo<'_> {
        RequestInfo {
            error,
            is_idempotent,
            consistency: Consistency::One,
        }
    }

    // Errors that should never be retried, no matter the idempotence.
    #[test]
    fn default_never_retries() {
        let never_retried_errors = vec![
            RequestAttemptError::DbError(DbError::SyntaxError, String::new()),
            RequestAttemptError::DbError(DbError::Invalid, String::new()),
            RequestAttemptError::DbError(
                DbError::AlreadyExists {
                    keyspace: String::new(),
                    table: String::new(),
                },
                String::new(),
            ),
            RequestAttemptError::DbError(
                DbError::FunctionFailure {
                    keyspace: String::new(),
                    function: String::new(),
                    arg_types: vec![],
                },
                String::new(),
            ),
            RequestAttemptError::DbError(DbError::AuthenticationError, String::new()),
            RequestAttemptError::DbError(DbError::Unauthorized, String::new()),
            RequestAttemptError::DbError(DbError::ConfigError, String::new()),
            RequestAttemptError::DbError(
                DbError::ReadFailure {
                    consistency: Consistency::Two,
                    received: 2,
                    required: 1,
                    numfailures: 1,
                    data_present: false,
                },
                String::new(),
            ),
            RequestAttemptError::DbError(
                DbError::WriteFailure {
                    consistency: Consistency::Two,
                    received: 1,
                    required: 2,
                    numfailures: 1,
                    write_type: WriteType::BatchLog,
                },
                String::new(),
            ),
            RequestAttemptError::DbError(
                DbError::Unprepared {
                    statement_id: bytes::Bytes::from_static(b"deadbeef"),
                },
                String::new(),
            ),
            RequestAttemptError::DbError(DbError::ProtocolError, String::new()),
        ];

        for error in never_retried_errors {
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, false)),
                RetryDecision::DontRetry
            );

            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, true)),
                RetryDecision::DontRetry
            );
        }
    }

    // Broken connections and node-level errors retry only if idempotent.
    #[test]
    fn default_idempotent_next_retries() {
        let idempotent_next_errors = vec![
            RequestAttemptError::DbError(DbError::Overloaded, String::new()),
            RequestAttemptError::DbError(DbError::TruncateError, String::new()),
            RequestAttemptError::DbError(DbError::ServerError, String::new()),
            RequestAttemptError::BrokenConnectionError(BrokenConnectionError::ChannelsClosed),
        ];

        for error in idempotent_next_errors {
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, false)),
                RetryDecision::DontRetry
            );

            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, true)),
                RetryDecision::RetryNextTarget(None)
            );
        }
    }

    // Bootstrapping nodes always cause a retry on the next node.
    #[test]
    fn default_bootstrapping() {
        let error = RequestAttemptError::DbError(DbError::IsBootstrapping, String::new());

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::RetryNextTarget(None)
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::RetryNextTarget(None)
        );
    }

    // Unavailable is retried on the next node, exactly once.
    #[test]
    fn default_unavailable() {
        let error = RequestAttemptError::DbError(
            DbError::Unavailable {
                consistency: Consistency::Two,
                required: 2,
                alive: 1,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::RetryNextTarget(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::DontRetry
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::RetryNextTarget(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::DontRetry
        );
    }

    // ReadTimeout is retried once on the same node, but only when enough
    // replicas responded and none of them sent data.
    #[test]
    fn default_read_timeout() {
        let enough_responses_no_data = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: false,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&enough_responses_no_data, false)),
            RetryDecision::RetrySameTarget(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&enough_responses_no_data, false)),
            RetryDecision::DontRetry
        );

        let enough_responses_with_data = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: true,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&enough_responses_with_data, false)),
            RetryDecision::DontRetry
        );

        let not_enough_responses = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                data_present: false,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&not_enough_responses, false)),
            RetryDecision::DontRetry
        );
    }

    // WriteTimeout is retried once on the same node, for idempotent batch
    // log writes only.
    #[test]
    fn default_write_timeout() {
        let batch_log_error = RequestAttemptError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                write_type: WriteType::BatchLog,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&batch_log_error, true)),
            RetryDecision::RetrySameTarget(None)
        );
        assert_eq!(
            policy.decide_should_retry(make_request_info(&batch_log_error, true)),
            RetryDecision::DontRetry
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&batch_log_error, false)),
            RetryDecision::DontRetry
        );

        let simple_error = RequestAttemptError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                write_type: WriteType::Simple,
            },
            String::new(),
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&simple_error, true)),
            RetryDecision::DontRetry
        );
    }

    // Conditional statements are never retried.
    #[test]
    fn default_serial_consistency_never_retries() {
        let retriable_error =
            RequestAttemptError::DbError(DbError::IsBootstrapping, String::new());

        let mut policy = DefaultRetryPolicy::new().new_session();
        let request_info = RequestInfo {
            error: &retriable_error,
            is_idempotent: true,
            consistency: Consistency::Serial,
        };
        assert_eq!(
            policy.decide_should_retry(request_info),
            RetryDecision::DontRetry
        );
    }
}
