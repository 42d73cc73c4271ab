use crate::deserialize::deser_cql_value;
use crate::frame::frame_errors::ParseError;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::frame::ProtocolVersion;
use crate::value::CqlValue;
use bytes::Bytes;

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

/// The type of a single column, resolved from the wire type id when result
/// metadata is parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    /// A server-side custom type, carried only as its fully qualified Java
    /// class name. Values of such columns cannot be decoded.
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        /// Order of fields matches the order in the type definition.
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default)]
pub struct ResultMetadata {
    col_count: usize,
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub col_count: usize,
    /// Positions of partition-key columns among the bind markers.
    /// Empty when the server does not send them (protocol v3).
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

#[derive(Debug)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();

    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => Custom(types::read_string(buf)?.to_owned()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace_name = types::read_string(buf)?.to_string();
            let type_name = types::read_string(buf)?.to_string();
            let fields_size = types::read_short_length(buf)?;

            let mut field_types = Vec::with_capacity(fields_size);

            for _ in 0..fields_size {
                let field_name = types::read_string(buf)?.to_string();
                let field_type = deser_type(buf)?;

                field_types.push((field_name, field_type));
            }

            UserDefinedType {
                keyspace: keyspace_name,
                type_name,
                field_types,
            }
        }
        0x0031 => {
            let len = types::read_short_length(buf)?;
            let mut types = Vec::with_capacity(len);
            for _ in 0..len {
                types.push(deser_type(buf)?);
            }
            Tuple(types)
        }
        id => return Err(ParseError::TypeNotSupported(id)),
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ParseError> {
    // Capacity hint is capped; col_count comes from the network.
    let mut col_specs = Vec::with_capacity(std::cmp::min(col_count, 4096));
    for _ in 0..col_count {
        let table_spec = if let Some(spec) = global_table_spec {
            spec.clone()
        } else {
            deser_table_spec(buf)?
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(buf: &mut &[u8]) -> StdResult<ResultMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;
    let has_more_pages = flags & 0x0002 != 0;
    let no_metadata = flags & 0x0004 != 0;

    let col_count = types::read_int_length(buf)?;

    let paging_state = if has_more_pages {
        Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
    } else {
        None
    };

    if no_metadata {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            col_specs: vec![],
        });
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn deser_prepared_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> StdResult<PreparedMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & 0x0001 != 0;

    let col_count = types::read_int_length(buf)?;

    // The partition key index list was added to PREPARED metadata in
    // protocol v4.
    let pk_indexes = if version >= ProtocolVersion::V4 {
        let pk_count: usize = types::read_int_length(buf)?;
        let mut pk_indexes = Vec::with_capacity(pk_count);
        for _ in 0..pk_count {
            pk_indexes.push(types::read_short(buf)?);
        }
        pk_indexes
    } else {
        Vec::new()
    };

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_rows(buf: &mut &[u8]) -> StdResult<Rows, ParseError> {
    let metadata = deser_result_metadata(buf)?;

    // The driver never requests metadata to be skipped, so every Rows
    // response must describe all of its columns.
    if metadata.col_specs.len() != metadata.col_count {
        return Err(ParseError::BadIncomingData(format!(
            "Rows result declares {} columns but describes {}",
            metadata.col_count,
            metadata.col_specs.len()
        )));
    }

    let rows_count = types::read_int_length(buf)?;

    // Capacity hint is capped; rows_count comes from the network.
    let mut rows = Vec::with_capacity(std::cmp::min(rows_count, 4096));
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_specs.len());
        for spec in &metadata.col_specs {
            let v = if let Some(mut b) = types::read_bytes_opt(buf)? {
                Some(deser_cql_value(&spec.typ, &mut b)?)
            } else {
                None
            };
            columns.push(v);
        }
        rows.push(Row { columns });
    }
    Ok(Rows {
        metadata,
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Prepared, ParseError> {
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
    let prepared_metadata = deser_prepared_metadata(version, buf)?;
    let result_metadata = deser_result_metadata(buf)?;
    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> StdResult<SchemaChange, ParseError> {
    Ok(SchemaChange {
        event: SchemaChangeEvent::deserialize(buf)?,
    })
}

pub fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf)?),
        0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Prepared(deser_prepared(version, buf)?),
        0x0005 => SchemaChange(deser_schema_change(buf)?),
        k => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown query result id: {}",
                k
            )))
        }
    })
}

type StdResult<T, E> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_rows_body(global_spec: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(0x0002, &mut buf); // kind: Rows

        let flags = if global_spec { 0x0001 } else { 0 };
        types::write_int(flags, &mut buf);
        types::write_int(2, &mut buf); // col count

        if global_spec {
            types::write_string("ks", &mut buf).unwrap();
            types::write_string("tbl", &mut buf).unwrap();
        }

        for name in ["a", "b"] {
            if !global_spec {
                types::write_string("ks", &mut buf).unwrap();
                types::write_string("tbl", &mut buf).unwrap();
            }
            types::write_string(name, &mut buf).unwrap();
            types::write_short(0x0009, &mut buf); // int
        }

        types::write_int(1, &mut buf); // rows count
        types::write_bytes(&7_i32.to_be_bytes(), &mut buf).unwrap();
        types::write_int(-1, &mut buf); // null column

        buf
    }

    #[test]
    fn deserialize_rows_with_global_table_spec() {
        for global_spec in [true, false] {
            let body = make_rows_body(global_spec);
            let result = deserialize(ProtocolVersion::V4, &mut body.as_slice()).unwrap();

            let rows = match result {
                Result::Rows(rows) => rows,
                other => panic!("expected Rows, got {:?}", other),
            };
            assert_eq!(rows.rows_count, 1);
            assert_eq!(rows.metadata.col_specs.len(), 2);
            assert_eq!(rows.metadata.col_specs[0].table_spec.ks_name, "ks");
            assert_eq!(rows.metadata.col_specs[1].typ, ColumnType::Int);
            assert_eq!(
                rows.rows[0],
                Row {
                    columns: vec![Some(CqlValue::Int(7)), None],
                }
            );
        }
    }

    #[test]
    fn rows_without_column_metadata_are_rejected() {
        let mut body = Vec::new();
        types::write_int(0x0002, &mut body); // kind: Rows
        types::write_int(0x0004, &mut body); // flags: no metadata
        types::write_int(1, &mut body); // col count
        types::write_int(1, &mut body); // rows count
        types::write_bytes(&7_i32.to_be_bytes(), &mut body).unwrap();

        // We never ask the server to skip metadata, so a response without
        // column specs is malformed and must not get anywhere near decoding.
        let res = deserialize(ProtocolVersion::V4, &mut body.as_slice());
        assert_matches!(res, Err(ParseError::BadIncomingData(_)));
    }

    #[test]
    fn deserialize_set_keyspace() {
        let mut body = Vec::new();
        types::write_int(0x0003, &mut body);
        types::write_string("some_keyspace", &mut body).unwrap();

        let result = deserialize(ProtocolVersion::V4, &mut body.as_slice()).unwrap();
        assert_matches!(result, Result::SetKeyspace(ks) if ks.keyspace_name == "some_keyspace");
    }

    fn make_prepared_body(version: ProtocolVersion) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(0x0004, &mut buf); // kind: Prepared
        types::write_short_bytes(b"stmt-id", &mut buf).unwrap();

        // prepared metadata
        types::write_int(0x0001, &mut buf); // global table spec
        types::write_int(1, &mut buf); // col count
        if version >= ProtocolVersion::V4 {
            types::write_int(1, &mut buf); // pk count
            types::write_short(0, &mut buf); // pk index
        }
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("tbl", &mut buf).unwrap();
        types::write_string("a", &mut buf).unwrap();
        types::write_short(0x000D, &mut buf); // text

        // result metadata: no columns
        types::write_int(0, &mut buf);
        types::write_int(0, &mut buf);

        buf
    }

    #[test]
    fn deserialize_prepared_with_and_without_pk_indexes() {
        let body = make_prepared_body(ProtocolVersion::V4);
        let result = deserialize(ProtocolVersion::V4, &mut body.as_slice()).unwrap();
        let prepared = match result {
            Result::Prepared(p) => p,
            other => panic!("expected Prepared, got {:?}", other),
        };
        assert_eq!(&prepared.id[..], b"stmt-id");
        assert_eq!(prepared.prepared_metadata.pk_indexes, vec![0]);
        assert_eq!(prepared.prepared_metadata.col_specs[0].name, "a");

        let body = make_prepared_body(ProtocolVersion::V3);
        let result = deserialize(ProtocolVersion::V3, &mut body.as_slice()).unwrap();
        let prepared = match result {
            Result::Prepared(p) => p,
            other => panic!("expected Prepared, got {:?}", other),
        };
        assert!(prepared.prepared_metadata.pk_indexes.is_empty());
    }

    #[test]
    fn unknown_type_id_is_error() {
        let mut buf = Vec::new();
        types::write_short(0x1234, &mut buf);
        let res = deser_type(&mut buf.as_slice());
        assert_matches!(res, Err(ParseError::TypeNotSupported(0x1234)));
    }

    #[test]
    fn nested_collection_type_parses() {
        let mut buf = Vec::new();
        types::write_short(0x0021, &mut buf); // map
        types::write_short(0x000D, &mut buf); // text
        types::write_short(0x0020, &mut buf); // list
        types::write_short(0x0009, &mut buf); // int

        let typ = deser_type(&mut buf.as_slice()).unwrap();
        assert_eq!(
            typ,
            ColumnType::Map(
                Box::new(ColumnType::Text),
                Box::new(ColumnType::List(Box::new(ColumnType::Int)))
            )
        );
    }
}
