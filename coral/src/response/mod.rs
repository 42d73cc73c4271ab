//! Responses to driver requests, as seen by the user.

mod coordinator;
pub mod query_result;
mod request_response;

pub use coordinator::Coordinator;
pub use query_result::QueryResult;

pub(crate) use request_response::{
    NonErrorAuthResponse, NonErrorQueryResponse, NonErrorStartupResponse, QueryResponse,
};
