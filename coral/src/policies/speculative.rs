//! Speculative execution sends the same request to further nodes of the plan
//! when the current one takes too long to respond, and keeps whichever
//! response arrives first.

use futures::{
    future::FutureExt,
    stream::{FuturesUnordered, StreamExt},
};
use std::{future::Future, time::Duration};
use tracing::{trace_span, Instrument};

use crate::errors::{RequestAttemptError, RequestError};
use crate::response::Coordinator;

/// Decides if and how often speculative requests are fired while the current
/// target has not responded yet.
pub trait SpeculativeExecutionPolicy: std::fmt::Debug + Send + Sync {
    /// The maximum number of speculative executions triggered for a single
    /// request, not counting the initial one.
    fn max_retry_count(&self) -> usize;

    /// The delay between consecutive speculative executions.
    fn retry_interval(&self) -> Duration;
}

/// Schedules a fixed number of speculative executions separated by a fixed
/// delay.
#[derive(Debug, Clone)]
pub struct SimpleSpeculativeExecutionPolicy {
    pub max_retry_count: usize,
    pub retry_interval: Duration,
}

impl SpeculativeExecutionPolicy for SimpleSpeculativeExecutionPolicy {
    fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

/// Checks if a result produced by one execution fiber can be ignored in
/// favor of results still pending on other fibers.
///
/// An error is ignorable when its presence on one node does not imply that
/// the same error will appear on the other nodes of the plan.
fn can_be_ignored<ResT>(result: &Result<ResT, RequestError>) -> bool {
    match result {
        Ok(_) => false,
        // Do not remove this lint!
        // It's there for a reason - we don't want new variants
        // automatically fall under `_` pattern when they are introduced.
        #[deny(clippy::wildcard_enum_match_arm)]
        Err(e) => match e {
            RequestError::EmptyPlan => false,

            RequestError::RequestTimeout(_) => false,

            // The fiber exhausted the shared plan, but fibers already
            // running on other nodes may still come back with a response.
            RequestError::NoHostAvailable(_) => true,

            RequestError::LastAttemptError(e) => {
                // Do not remove this lint!
                // It's there for a reason - we don't want new variants
                // automatically fall under `_` pattern when they are introduced.
                #[deny(clippy::wildcard_enum_match_arm)]
                match e {
                    // Errors that will almost certainly appear for other nodes as well
                    RequestAttemptError::SerializationError(_)
                    | RequestAttemptError::CqlRequestSerialization(_)
                    | RequestAttemptError::BodyExtensionsParseError(_)
                    | RequestAttemptError::CqlResultParseError(_)
                    | RequestAttemptError::UnexpectedResponse(_)
                    | RequestAttemptError::RepreparedIdChanged { .. }
                    | RequestAttemptError::KeyspaceNameMismatch { .. }
                    | RequestAttemptError::NonfinishedPagingState => false,

                    // Errors that can be ignored
                    RequestAttemptError::BrokenConnectionError(_)
                    | RequestAttemptError::UnableToAllocStreamId => true,

                    RequestAttemptError::DbError(db_error, _) => db_error.can_speculative_retry(),
                }
            }
        },
    }
}

const EMPTY_PLAN_ERROR: RequestError = RequestError::EmptyPlan;

pub(crate) async fn execute<QueryFut, ResT>(
    policy: &dyn SpeculativeExecutionPolicy,
    mut query_runner_generator: impl FnMut(bool) -> QueryFut,
) -> Result<(ResT, Coordinator), RequestError>
where
    QueryFut: Future<Output = Option<Result<(ResT, Coordinator), RequestError>>>,
{
    let mut retries_remaining = policy.max_retry_count();
    let retry_interval = policy.retry_interval();

    let mut async_tasks = FuturesUnordered::new();
    async_tasks.push(
        query_runner_generator(false)
            .instrument(trace_span!("Speculative execution: original query")),
    );

    let sleep = tokio::time::sleep(retry_interval).fuse();
    tokio::pin!(sleep);

    let mut last_error = None;
    loop {
        futures::select! {
            _ = &mut sleep => {
                if retries_remaining > 0 {
                    async_tasks.push(query_runner_generator(true).instrument(trace_span!("Speculative execution", retries_remaining = retries_remaining)));
                    retries_remaining -= 1;

                    // reset the timeout
                    sleep.set(tokio::time::sleep(retry_interval).fuse());
                }
            }
            res = async_tasks.select_next_some() => {
                if let Some(r) = res {
                    if !can_be_ignored(&r) {
                        return r;
                    } else {
                        last_error = Some(r)
                    }
                } else {
                    // A fiber returns None only when the execution plan was
                    // exhausted. Starting further fibers is pointless then,
                    // but the ones already running may still succeed.
                    retries_remaining = 0;
                }
                if async_tasks.is_empty() && retries_remaining == 0 {
                    return last_error.unwrap_or({
                        Err(EMPTY_PLAN_ERROR)
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // These tests start with a paused clock. Pausing after the runtime has
    // started makes `sleep` advance the timer slightly inaccurately, adding
    // a few ms of clock advancement at the end of the test. Pausing requires
    // the current_thread executor.

    use std::time::Duration;

    use assert_matches::assert_matches;

    use crate::errors::{RequestAttemptError, RequestError};
    use crate::policies::speculative::SimpleSpeculativeExecutionPolicy;
    use crate::response::Coordinator;

    static IGNORABLE_ERROR: Option<Result<((), Coordinator), RequestError>> = Some(Err(
        RequestError::LastAttemptError(RequestAttemptError::UnableToAllocStreamId),
    ));

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_plan_with_running_fibers() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 5,
            retry_interval: Duration::from_secs(1),
        };

        let generator = {
            // Index of the fiber, 0 for first execution.
            let mut counter = 0;
            move |_first: bool| {
                let future = {
                    let fiber_idx = counter;
                    async move {
                        match fiber_idx.cmp(&4) {
                            std::cmp::Ordering::Less => {
                                tokio::time::sleep(Duration::from_secs(5)).await;
                                IGNORABLE_ERROR.clone()
                            }
                            std::cmp::Ordering::Equal => None,
                            std::cmp::Ordering::Greater => {
                                panic!("Too many speculative executions - expected 4")
                            }
                        }
                    }
                };
                counter += 1;
                future
            }
        };

        let now = tokio::time::Instant::now();
        let res = super::execute(&policy, generator).await;
        assert_matches!(
            res,
            Err(RequestError::LastAttemptError(
                RequestAttemptError::UnableToAllocStreamId
            ))
        );
        // t - now
        // First execution is started at t
        // Speculative executions - at t+1, t+2, t+3, t+4
        // The one at t+4 returns first, with None, preventing a new start at
        // t+5. Then execute waits on the running fibers; the last one was
        // spawned at t+3 and finishes at t+8.
        assert_eq!(
            tokio::time::Instant::now(),
            now.checked_add(Duration::from_secs(8)).unwrap()
        )
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_plan_last_running_fiber() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 5,
            // Each attempt will finish before next starts
            retry_interval: Duration::from_secs(6),
        };

        let generator = {
            // Index of the fiber, 0 for first execution.
            let mut counter = 0;
            move |_first: bool| {
                let future = {
                    let fiber_idx = counter;
                    async move {
                        match fiber_idx.cmp(&4) {
                            std::cmp::Ordering::Less => {
                                tokio::time::sleep(Duration::from_secs(5)).await;
                                IGNORABLE_ERROR.clone()
                            }
                            std::cmp::Ordering::Equal => None,
                            std::cmp::Ordering::Greater => {
                                panic!("Too many speculative executions - expected 4")
                            }
                        }
                    }
                };
                counter += 1;
                future
            }
        };

        let now = tokio::time::Instant::now();
        let res = super::execute(&policy, generator).await;
        assert_matches!(
            res,
            Err(RequestError::LastAttemptError(
                RequestAttemptError::UnableToAllocStreamId
            ))
        );
        // t - now
        // First execution is started at t
        // Speculative executions - at t+6, t+12, t+18, t+24
        // Each execution finishes before the next starts. The one at t+24
        // finishes instantly with None, so no further one is started.
        assert_eq!(
            tokio::time::Instant::now(),
            now.checked_add(Duration::from_secs(24)).unwrap()
        )
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn all_fibers_return_ignorable_errors() {
        let policy = SimpleSpeculativeExecutionPolicy {
            max_retry_count: 5,
            retry_interval: Duration::from_secs(1),
        };

        let generator = {
            move |_first: bool| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                IGNORABLE_ERROR.clone()
            }
        };

        let now = tokio::time::Instant::now();
        let res = super::execute(&policy, generator).await;
        assert_matches!(
            res,
            Err(RequestError::LastAttemptError(
                RequestAttemptError::UnableToAllocStreamId
            ))
        );
        // t - now
        // First execution is started at t
        // Speculative executions - at t+1, t+2, t+3, t+4, t+5
        // Each execution sleeps 5 seconds and returns an ignorable error.
        // The last one finishes at t+10.
        assert_eq!(
            tokio::time::Instant::now(),
            now.checked_add(Duration::from_secs(10)).unwrap()
        )
    }
}
