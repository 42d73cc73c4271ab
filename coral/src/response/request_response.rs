use std::collections::HashMap;

use bytes::Bytes;
use tracing::error;
use uuid::Uuid;

use coral_cql::frame::response::result;
use coral_cql::frame::response::{authenticate, NonErrorResponse, Response};

use crate::errors::RequestAttemptError;
use crate::response::query_result::QueryResult;
use crate::response::Coordinator;

#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
    // Not exposed to the user (yet?)
    #[allow(dead_code)]
    pub(crate) custom_payload: Option<HashMap<String, Bytes>>,
}

// A QueryResponse in which response can not be Response::Error
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        let response = self
            .response
            .into_non_error_response()
            .map_err(|err| RequestAttemptError::DbError(err.error, err.reason))?;

        Ok(NonErrorQueryResponse {
            response,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn as_set_keyspace(&self) -> Option<&result::SetKeyspace> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(sk)) => Some(sk),
            _ => None,
        }
    }

    fn into_query_result_with_maybe_unknown_coordinator(
        self,
        coordinator: Option<Coordinator>,
        allow_paging_state: bool,
    ) -> Result<QueryResult, RequestAttemptError> {
        let Self {
            response,
            tracing_id,
            warnings,
        } = self;

        let (rows, col_specs, paging_state) = match response {
            NonErrorResponse::Result(result::Result::Rows(rows)) => (
                Some(rows.rows),
                rows.metadata.col_specs,
                rows.metadata.paging_state,
            ),
            NonErrorResponse::Result(_) => (None, Vec::new(), None),
            _ => {
                return Err(RequestAttemptError::UnexpectedResponse(
                    response.to_response_kind(),
                ));
            }
        };

        if !allow_paging_state && paging_state.is_some() {
            error!(
                "Internal driver API misuse or a server bug: a nonfinished paging state \
                would be discarded"
            );
            return Err(RequestAttemptError::NonfinishedPagingState);
        }

        Ok(match coordinator {
            Some(coordinator) => QueryResult::new(
                coordinator,
                rows,
                col_specs,
                paging_state,
                tracing_id,
                warnings,
            ),
            None => QueryResult::new_with_unknown_coordinator(rows, col_specs, tracing_id, warnings),
        })
    }

    /// As [`Self::into_query_result`], for requests issued outside of the
    /// execution core, where no coordinator is tracked. Used by the control
    /// connection.
    pub(crate) fn into_query_result_with_unknown_coordinator(
        self,
    ) -> Result<QueryResult, RequestAttemptError> {
        self.into_query_result_with_maybe_unknown_coordinator(None, false)
    }

    /// Converts the response into a [`QueryResult`], asserting that the
    /// result set has no more pages. Intended for unpaged requests.
    pub(crate) fn into_query_result(
        self,
        coordinator: Coordinator,
    ) -> Result<QueryResult, RequestAttemptError> {
        self.into_query_result_with_maybe_unknown_coordinator(Some(coordinator), false)
    }

    /// Converts the response into a [`QueryResult`] carrying the paging
    /// state of the result set, if any.
    pub(crate) fn into_paged_query_result(
        self,
        coordinator: Coordinator,
    ) -> Result<QueryResult, RequestAttemptError> {
        self.into_query_result_with_maybe_unknown_coordinator(Some(coordinator), true)
    }
}

pub(crate) enum NonErrorStartupResponse {
    Ready,
    Authenticate(authenticate::Authenticate),
}

pub(crate) enum NonErrorAuthResponse {
    AuthChallenge(authenticate::AuthChallenge),
    AuthSuccess(authenticate::AuthSuccess),
}
