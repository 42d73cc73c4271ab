//! Serialization of CQL values into request frames.
//!
//! Dispatch from value to wire bytes is a single exhaustive `match` over the
//! closed [`CqlValue`] enum, so an unsupported value is a compile-time
//! impossibility rather than a runtime lookup failure.

use crate::frame::types::{self, RawValue};
use crate::value::CqlValue;
use bytes::BufMut;
use thiserror::Error;

/// An error that occurred when serializing values for a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Too many values to add, max 65535 values can be sent in a request")]
    TooManyValues,
    #[error("Value too big to be sent in a request, max 2GiB allowed")]
    ValueTooBig,
    #[error("Batch has {statements} statements, but {value_lists} value lists were provided")]
    WrongBatchValuesCount { statements: usize, value_lists: usize },
}

/// Bind parameters of a single statement, already laid out in wire format:
/// a value count followed by `[value]`-framed payloads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    values_num: u16,
}

impl SerializedValues {
    pub const EMPTY: &'static SerializedValues = &SerializedValues {
        serialized_values: Vec::new(),
        values_num: 0,
    };

    pub fn new() -> Self {
        SerializedValues {
            serialized_values: Vec::new(),
            values_num: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values_num == 0
    }

    pub fn len(&self) -> u16 {
        self.values_num
    }

    /// Appends one bind value; `None` is serialized as NULL (length -1).
    pub fn add_value(&mut self, value: Option<&CqlValue>) -> Result<(), SerializationError> {
        if self.values_num == u16::MAX {
            return Err(SerializationError::TooManyValues);
        }

        match value {
            None => types::write_int(-1, &mut self.serialized_values),
            Some(value) => {
                let len_pos = self.serialized_values.len();
                types::write_int(0, &mut self.serialized_values);
                ser_cql_value(value, &mut self.serialized_values)?;
                let written = self.serialized_values.len() - len_pos - 4;
                let written: i32 = written
                    .try_into()
                    .map_err(|_| SerializationError::ValueTooBig)?;
                self.serialized_values[len_pos..len_pos + 4]
                    .copy_from_slice(&written.to_be_bytes());
            }
        }

        self.values_num += 1;
        Ok(())
    }

    /// Appends an unset bind marker (length -2).
    pub fn add_unset(&mut self) -> Result<(), SerializationError> {
        if self.values_num == u16::MAX {
            return Err(SerializationError::TooManyValues);
        }
        types::write_int(-2, &mut self.serialized_values);
        self.values_num += 1;
        Ok(())
    }

    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.values_num);
        buf.put_slice(&self.serialized_values);
    }

    /// Iterates over the `[value]`-framed payloads in wire order.
    pub fn iter(&self) -> impl Iterator<Item = RawValue<'_>> {
        SerializedValuesIterator {
            serialized_values: &self.serialized_values,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SerializedValuesIterator<'a> {
    serialized_values: &'a [u8],
}

impl<'a> Iterator for SerializedValuesIterator<'a> {
    type Item = RawValue<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.serialized_values.is_empty() {
            return None;
        }

        // The buffer was validated when the values were added.
        types::read_value(&mut self.serialized_values).ok()
    }
}

/// Helper for building [`SerializedValues`] out of optional [`CqlValue`]s.
pub fn serialize_values<'a>(
    values: impl IntoIterator<Item = Option<&'a CqlValue>>,
) -> Result<SerializedValues, SerializationError> {
    let mut serialized = SerializedValues::new();
    for value in values {
        serialized.add_value(value)?;
    }
    Ok(serialized)
}

/// Writes the raw body of a single value (without the `[value]` length
/// prefix) in the wire format of its type.
pub fn ser_cql_value(value: &CqlValue, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => buf.extend_from_slice(s.as_bytes()),
        CqlValue::Blob(b) => buf.extend_from_slice(b),
        CqlValue::Boolean(b) => buf.put_u8(*b as u8),
        CqlValue::TinyInt(v) => buf.put_i8(*v),
        CqlValue::SmallInt(v) => buf.put_i16(*v),
        CqlValue::Int(v) => buf.put_i32(*v),
        CqlValue::BigInt(v) => buf.put_i64(*v),
        CqlValue::Counter(c) => buf.put_i64(c.0),
        CqlValue::Float(v) => buf.put_f32(*v),
        CqlValue::Double(v) => buf.put_f64(*v),
        CqlValue::Date(d) => buf.put_u32(d.0),
        CqlValue::Time(t) => buf.put_i64(t.0),
        CqlValue::Timestamp(t) => buf.put_i64(t.0),
        CqlValue::Duration(d) => {
            types::vint_encode(d.months as i64, buf);
            types::vint_encode(d.days as i64, buf);
            types::vint_encode(d.nanoseconds, buf);
        }
        CqlValue::Uuid(u) => buf.extend_from_slice(u.as_bytes()),
        CqlValue::Timeuuid(u) => buf.extend_from_slice(u.as_bytes()),
        CqlValue::Inet(addr) => match addr {
            std::net::IpAddr::V4(v4) => buf.extend_from_slice(&v4.octets()),
            std::net::IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
        },
        CqlValue::Varint(v) => buf.extend_from_slice(v.as_signed_bytes_be_slice()),
        CqlValue::Decimal(d) => {
            let (digits, scale) = d.as_signed_be_bytes_slice_and_exponent();
            buf.put_i32(scale);
            buf.extend_from_slice(digits);
        }
        CqlValue::List(elements) | CqlValue::Set(elements) => {
            write_collection_len(elements.len(), buf)?;
            for element in elements {
                ser_value_framed(Some(element), buf)?;
            }
        }
        CqlValue::Map(entries) => {
            write_collection_len(entries.len(), buf)?;
            for (key, value) in entries {
                ser_value_framed(Some(key), buf)?;
                ser_value_framed(Some(value), buf)?;
            }
        }
        CqlValue::Tuple(elements) => {
            for element in elements {
                ser_value_framed(element.as_ref(), buf)?;
            }
        }
        CqlValue::UserDefinedType { fields, .. } => {
            for (_, field_value) in fields {
                ser_value_framed(field_value.as_ref(), buf)?;
            }
        }
        CqlValue::Empty => {}
    }
    Ok(())
}

// A `[bytes]`-framed value inside a collection/tuple/UDT body.
fn ser_value_framed(
    value: Option<&CqlValue>,
    buf: &mut Vec<u8>,
) -> Result<(), SerializationError> {
    match value {
        None => types::write_int(-1, buf),
        Some(value) => {
            let len_pos = buf.len();
            types::write_int(0, buf);
            ser_cql_value(value, buf)?;
            let written = buf.len() - len_pos - 4;
            let written: i32 = written
                .try_into()
                .map_err(|_| SerializationError::ValueTooBig)?;
            buf[len_pos..len_pos + 4].copy_from_slice(&written.to_be_bytes());
        }
    }
    Ok(())
}

fn write_collection_len(len: usize, buf: &mut Vec<u8>) -> Result<(), SerializationError> {
    let len: i32 = len.try_into().map_err(|_| SerializationError::ValueTooBig)?;
    types::write_int(len, buf);
    Ok(())
}
