use crate::frame::frame_errors::ParseError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, Consistency, SerialConsistency};
use crate::serialize::SerializedValues;
use bytes::BufMut;

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

/// One statement inside a BATCH body. Each statement carries its own bind
/// values, so a count mismatch between statements and value lists cannot
/// be expressed.
pub enum BatchStatement<'a> {
    Query {
        text: &'a str,
        values: &'a SerializedValues,
    },
    Prepared {
        id: &'a [u8],
        values: &'a SerializedValues,
    },
}

pub struct Batch<'a> {
    pub statements: Vec<BatchStatement<'a>>,
    pub batch_type: BatchType,
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        buf.put_u8(self.batch_type as u8);

        types::write_short_length(self.statements.len(), buf)?;
        for statement in &self.statements {
            match statement {
                BatchStatement::Query { text, values } => {
                    buf.put_u8(0);
                    types::write_long_string(text, buf)?;
                    values.write_to_request(buf);
                }
                BatchStatement::Prepared { id, values } => {
                    buf.put_u8(1);
                    types::write_short_bytes(id, buf)?;
                    values.write_to_request(buf);
                }
            }
        }

        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}
