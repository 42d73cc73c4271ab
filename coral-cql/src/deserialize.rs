//! Deserialization of CQL values from response frames.
//!
//! The wire type code has already been resolved into a [`ColumnType`] when
//! result metadata was parsed; dispatch from type to codec is a single
//! exhaustive `match` over that closed enum. Unknown and custom types are a
//! hard error, never a silent fallback.

use crate::frame::frame_errors::ParseError;
use crate::frame::response::result::ColumnType;
use crate::frame::types;
use crate::value::{
    Counter, CqlDate, CqlDecimal, CqlDuration, CqlTime, CqlTimestamp, CqlTimeuuid, CqlValue,
    CqlVarint,
};
use byteorder::{BigEndian, ReadBytesExt};
use std::net::IpAddr;

/// Decodes the raw body of a single non-null column value.
///
/// A zero-length buffer decodes to [`CqlValue::Empty`] for types whose wire
/// format is never empty; this is distinct from column-level NULL, which is
/// signalled by a negative length one framing layer above.
pub fn deser_cql_value(typ: &ColumnType, buf: &mut &[u8]) -> Result<CqlValue, ParseError> {
    use ColumnType::*;

    if buf.is_empty() && !matches!(typ, Ascii | Blob | Text) {
        return Ok(CqlValue::Empty);
    }

    Ok(match typ {
        Custom(name) => {
            return Err(ParseError::BadIncomingData(format!(
                "Support for custom types is not implemented: {}",
                name
            )));
        }
        Ascii => {
            let s = std::str::from_utf8(buf)?;
            if !s.is_ascii() {
                return Err(ParseError::BadIncomingData(
                    "String is not ascii!".to_string(),
                ));
            }
            CqlValue::Ascii(s.to_owned())
        }
        Text => CqlValue::Text(std::str::from_utf8(buf)?.to_owned()),
        Blob => CqlValue::Blob(buf.to_vec()),
        Boolean => {
            expect_len(buf, 1, "Boolean")?;
            CqlValue::Boolean(buf[0] != 0)
        }
        TinyInt => {
            expect_len(buf, 1, "TinyInt")?;
            CqlValue::TinyInt(buf.read_i8()?)
        }
        SmallInt => {
            expect_len(buf, 2, "SmallInt")?;
            CqlValue::SmallInt(buf.read_i16::<BigEndian>()?)
        }
        Int => {
            expect_len(buf, 4, "Int")?;
            CqlValue::Int(buf.read_i32::<BigEndian>()?)
        }
        BigInt => {
            expect_len(buf, 8, "BigInt")?;
            CqlValue::BigInt(buf.read_i64::<BigEndian>()?)
        }
        Counter => {
            expect_len(buf, 8, "Counter")?;
            CqlValue::Counter(self::Counter(buf.read_i64::<BigEndian>()?))
        }
        Float => {
            expect_len(buf, 4, "Float")?;
            CqlValue::Float(buf.read_f32::<BigEndian>()?)
        }
        Double => {
            expect_len(buf, 8, "Double")?;
            CqlValue::Double(buf.read_f64::<BigEndian>()?)
        }
        Date => {
            expect_len(buf, 4, "Date")?;
            CqlValue::Date(CqlDate(buf.read_u32::<BigEndian>()?))
        }
        Time => {
            expect_len(buf, 8, "Time")?;
            let nanoseconds = buf.read_i64::<BigEndian>()?;
            if !(0..=86399999999999).contains(&nanoseconds) {
                return Err(ParseError::BadIncomingData(format!(
                    "Invalid time value: {}",
                    nanoseconds
                )));
            }
            CqlValue::Time(CqlTime(nanoseconds))
        }
        Timestamp => {
            expect_len(buf, 8, "Timestamp")?;
            CqlValue::Timestamp(CqlTimestamp(buf.read_i64::<BigEndian>()?))
        }
        Duration => {
            let months = i32::try_from(types::vint_decode(buf)?).map_err(|_| {
                ParseError::BadIncomingData("Duration months out of range".to_string())
            })?;
            let days = i32::try_from(types::vint_decode(buf)?).map_err(|_| {
                ParseError::BadIncomingData("Duration days out of range".to_string())
            })?;
            let nanoseconds = types::vint_decode(buf)?;
            CqlValue::Duration(CqlDuration {
                months,
                days,
                nanoseconds,
            })
        }
        Uuid => {
            expect_len(buf, 16, "Uuid")?;
            CqlValue::Uuid(types::read_uuid(buf)?)
        }
        Timeuuid => {
            expect_len(buf, 16, "Timeuuid")?;
            CqlValue::Timeuuid(CqlTimeuuid::from(types::read_uuid(buf)?))
        }
        Inet => match buf.len() {
            4 => {
                let raw: [u8; 4] = buf[0..4].try_into().unwrap();
                CqlValue::Inet(IpAddr::from(raw))
            }
            16 => {
                let raw: [u8; 16] = buf[0..16].try_into().unwrap();
                CqlValue::Inet(IpAddr::from(raw))
            }
            v => {
                return Err(ParseError::BadIncomingData(format!(
                    "Invalid inet bytes length: {}",
                    v
                )));
            }
        },
        Varint => CqlValue::Varint(CqlVarint::from_signed_bytes_be(buf.to_vec())),
        Decimal => {
            let scale = types::read_int(buf)?;
            CqlValue::Decimal(CqlDecimal::from_signed_be_bytes_and_exponent(
                buf.to_vec(),
                scale,
            ))
        }
        List(elem_type) => {
            let count = types::read_int_length(buf)?;
            let mut elements = Vec::with_capacity(count);
            for _ in 0..count {
                let mut element_buf = types::read_bytes(buf)?;
                elements.push(deser_cql_value(elem_type, &mut element_buf)?);
            }
            CqlValue::List(elements)
        }
        Set(elem_type) => {
            let count = types::read_int_length(buf)?;
            let mut elements = Vec::with_capacity(count);
            for _ in 0..count {
                let mut element_buf = types::read_bytes(buf)?;
                elements.push(deser_cql_value(elem_type, &mut element_buf)?);
            }
            CqlValue::Set(elements)
        }
        Map(key_type, value_type) => {
            let count = types::read_int_length(buf)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let mut key_buf = types::read_bytes(buf)?;
                let key = deser_cql_value(key_type, &mut key_buf)?;
                let mut value_buf = types::read_bytes(buf)?;
                let value = deser_cql_value(value_type, &mut value_buf)?;
                entries.push((key, value));
            }
            CqlValue::Map(entries)
        }
        Tuple(elem_types) => {
            let mut elements = Vec::with_capacity(elem_types.len());
            for elem_type in elem_types {
                // The protocol permits a tuple shorter than its declared
                // arity; missing trailing elements are null.
                let element = if buf.is_empty() {
                    None
                } else {
                    types::read_bytes_opt(buf)?
                        .map(|mut element_buf| deser_cql_value(elem_type, &mut element_buf))
                        .transpose()?
                };
                elements.push(element);
            }
            CqlValue::Tuple(elements)
        }
        UserDefinedType {
            keyspace,
            type_name,
            field_types,
        } => {
            let mut fields = Vec::with_capacity(field_types.len());
            for (field_name, field_type) in field_types {
                // Fields added by a later ALTER TYPE may be absent from
                // values written before the alteration.
                let value = if buf.is_empty() {
                    None
                } else {
                    types::read_bytes_opt(buf)?
                        .map(|mut field_buf| deser_cql_value(field_type, &mut field_buf))
                        .transpose()?
                };
                fields.push((field_name.clone(), value));
            }
            CqlValue::UserDefinedType {
                keyspace: keyspace.clone(),
                name: type_name.clone(),
                fields,
            }
        }
    })
}

fn expect_len(buf: &[u8], expected: usize, type_name: &str) -> Result<(), ParseError> {
    if buf.len() != expected {
        return Err(ParseError::BadIncomingData(format!(
            "Buffer length should be {} for {}, not {}",
            expected,
            type_name,
            buf.len()
        )));
    }
    Ok(())
}
