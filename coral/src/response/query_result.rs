use bytes::Bytes;
use uuid::Uuid;

use coral_cql::frame::response::result::{ColumnSpec, Row};

use super::Coordinator;

/// The result of a single request: rows (for RESULT::Rows responses),
/// response metadata, and the coordinator that produced it.
#[derive(Debug)]
pub struct QueryResult {
    rows: Option<Vec<Row>>,
    col_specs: Vec<ColumnSpec>,
    paging_state: Option<Bytes>,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
    // Absent for results assembled outside a request, e.g. merged pager
    // results.
    coordinator: Option<Coordinator>,
}

impl QueryResult {
    pub(crate) fn new(
        coordinator: Coordinator,
        rows: Option<Vec<Row>>,
        col_specs: Vec<ColumnSpec>,
        paging_state: Option<Bytes>,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            rows,
            col_specs,
            paging_state,
            tracing_id,
            warnings,
            coordinator: Some(coordinator),
        }
    }

    pub(crate) fn new_with_unknown_coordinator(
        rows: Option<Vec<Row>>,
        col_specs: Vec<ColumnSpec>,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            rows,
            col_specs,
            paging_state: None,
            tracing_id,
            warnings,
            coordinator: None,
        }
    }

    /// Rows of the result, or `None` if the response was not RESULT::Rows
    /// (e.g. a Void result of an INSERT).
    pub fn rows(&self) -> Option<&[Row]> {
        self.rows.as_deref()
    }

    /// Consumes the result, returning its rows.
    pub fn into_rows(self) -> Option<Vec<Row>> {
        self.rows
    }

    /// The first row, if the result has any.
    pub fn first_row(&self) -> Option<&Row> {
        self.rows().and_then(<[Row]>::first)
    }

    /// Number of rows, or `None` for non-Rows results.
    pub fn rows_num(&self) -> Option<usize> {
        self.rows.as_ref().map(Vec::len)
    }

    /// Column specifications of the result set.
    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    /// Paging state to continue the query from, if the result set has more
    /// pages.
    pub fn paging_state(&self) -> Option<&Bytes> {
        self.paging_state.as_ref()
    }

    /// Tracing id of the request, if tracing was enabled.
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Warnings the server attached to the response.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }

    /// The node that coordinated the request, when known.
    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.coordinator.as_ref()
    }
}
