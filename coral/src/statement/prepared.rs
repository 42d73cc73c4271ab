use bytes::Bytes;
use coral_cql::frame::response::result::{PreparedMetadata, ResultMetadata};
use coral_cql::frame::types::RawValue;
use coral_cql::serialize::SerializedValues;

use std::sync::Arc;
use std::time::Duration;

use super::{Consistency, SerialConsistency, StatementConfig, DEFAULT_PAGE_SIZE};
use crate::policies::retry::RetryPolicy;
use crate::routing::{Murmur3Hasher, Token, TokenCalculationError};

/// A statement prepared on the server, identified by its statement id.
///
/// The id is only valid together with the bind-marker metadata returned at
/// preparation time; both travel together in this struct. Cloning is cheap,
/// the metadata is behind an `Arc`.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) id: Bytes,
    pub(crate) config: StatementConfig,
    statement_text: String,
    page_size: i32,
    prepared_metadata: Arc<PreparedMetadata>,
    #[allow(dead_code)]
    result_metadata: Arc<ResultMetadata>,
}

impl PreparedStatement {
    pub(crate) fn new(
        id: Bytes,
        statement_text: String,
        prepared_metadata: PreparedMetadata,
        result_metadata: ResultMetadata,
        config: StatementConfig,
    ) -> Self {
        Self {
            id,
            config,
            statement_text,
            page_size: DEFAULT_PAGE_SIZE,
            prepared_metadata: Arc::new(prepared_metadata),
            result_metadata: Arc::new(result_metadata),
        }
    }

    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub fn get_statement(&self) -> &str {
        &self.statement_text
    }

    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.prepared_metadata
    }

    /// Computes the Murmur3 token of the partition key formed by the given
    /// bind values.
    ///
    /// Returns `Ok(None)` when the token cannot be computed: the server did
    /// not send partition key indexes (protocol v3), or a partition key
    /// component is null/unset.
    pub fn calculate_token(
        &self,
        values: &SerializedValues,
    ) -> Result<Option<Token>, TokenCalculationError> {
        let pk_indexes = &self.prepared_metadata.pk_indexes;
        if pk_indexes.is_empty() {
            return Ok(None);
        }

        let all_values: Vec<RawValue> = values.iter().collect();

        let mut pk_values = Vec::with_capacity(pk_indexes.len());
        for index in pk_indexes {
            match all_values.get(*index as usize) {
                Some(RawValue::Value(v)) => pk_values.push(*v),
                _ => return Ok(None),
            }
        }

        let mut hasher = Murmur3Hasher::new();
        if let [single] = pk_values.as_slice() {
            hasher.write(single);
        } else {
            for val in &pk_values {
                let val_len_u16: u16 = val
                    .len()
                    .try_into()
                    .map_err(|_| TokenCalculationError::ValueTooLong(val.len()))?;
                hasher.write(&val_len_u16.to_be_bytes());
                hasher.write(val);
                hasher.write(&[0u8]);
            }
        }
        Ok(Some(hasher.finish()))
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use coral_cql::frame::response::result::PreparedMetadata;
    use coral_cql::value::CqlValue;

    fn make_prepared(pk_indexes: Vec<u16>) -> PreparedStatement {
        PreparedStatement::new(
            Bytes::from_static(b"id"),
            "INSERT INTO ks.t (a, b) VALUES (?, ?)".to_string(),
            PreparedMetadata {
                col_count: 2,
                pk_indexes,
                col_specs: vec![],
            },
            Default::default(),
            Default::default(),
        )
    }

    #[test]
    fn token_matches_single_value_hash() {
        let prepared = make_prepared(vec![0]);

        let mut values = SerializedValues::new();
        values
            .add_value(Some(&CqlValue::Text("test".to_string())))
            .unwrap();
        values.add_value(Some(&CqlValue::Int(42))).unwrap();

        let token = prepared.calculate_token(&values).unwrap().unwrap();
        assert_eq!(token.value(), -6017608668500074083);
    }

    #[test]
    fn no_token_without_pk_indexes_or_with_null_pk() {
        let prepared = make_prepared(vec![]);
        let mut values = SerializedValues::new();
        values
            .add_value(Some(&CqlValue::Text("test".to_string())))
            .unwrap();
        assert_eq!(prepared.calculate_token(&values).unwrap(), None);

        let prepared = make_prepared(vec![0]);
        let mut values = SerializedValues::new();
        values.add_value(None).unwrap();
        assert_eq!(prepared.calculate_token(&values).unwrap(), None);
    }
}
