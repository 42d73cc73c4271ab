use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use std::net::SocketAddr;
use std::str::FromStr;

/// An event category a connection can REGISTER for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        };
        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(Self::TopologyChange),
            "STATUS_CHANGE" => Ok(Self::StatusChange),
            "SCHEMA_CHANGE" => Ok(Self::SchemaChange),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type event type: {}",
                s
            ))),
        }
    }
}

/// A server-pushed EVENT, delivered on the reserved stream id -1.
#[derive(Debug)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

#[derive(Debug)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

#[derive(Debug)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type: String = types::read_string(buf)?.to_string();
        match event_type.as_str() {
            "TOPOLOGY_CHANGE" => Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(
                buf,
            )?)),
            "STATUS_CHANGE" => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            "SCHEMA_CHANGE" => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Unknown event type: {}",
                event_type
            ))),
        }
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change: String = types::read_string(buf)?.to_string();
        let addr = types::read_inet(buf)?;

        match type_of_change.as_str() {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of change ({}) in TopologyChangeEvent",
                type_of_change
            ))),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change: String = types::read_string(buf)?.to_string();
        let addr = types::read_inet(buf)?;

        match type_of_change.as_str() {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid type of status change ({}) in StatusChangeEvent",
                type_of_change
            ))),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let type_of_change_string = types::read_string(buf)?;
        let type_of_change = match type_of_change_string {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target = types::read_string(buf)?;
        let keyspace_affected = types::read_string(buf)?.to_string();

        match target {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
            }),
            "TABLE" => {
                let table_name = types::read_string(buf)?.to_string();
                Ok(Self::TableChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    object_name: table_name,
                })
            }
            "TYPE" => {
                let changed_type = types::read_string(buf)?.to_string();
                Ok(Self::TypeChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    type_name: changed_type,
                })
            }
            "FUNCTION" => {
                let function = types::read_string(buf)?.to_string();
                let arguments = types::read_string_list(buf)?;
                Ok(Self::FunctionChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    function_name: function,
                    arguments,
                })
            }
            "AGGREGATE" => {
                let name = types::read_string(buf)?.to_string();
                let arguments = types::read_string_list(buf)?;
                Ok(Self::AggregateChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    aggregate_name: name,
                    arguments,
                })
            }
            _ => Err(ParseError::BadIncomingData(format!(
                "Invalid target type in SchemaChangeEvent: {}",
                target
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_event_body(event_type: &str, change: &str, addr: SocketAddr) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_string(event_type, &mut buf).unwrap();
        types::write_string(change, &mut buf).unwrap();
        types::write_inet(addr, &mut buf);
        buf
    }

    #[test]
    fn deserialize_status_and_topology_events() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9042);

        let body = make_event_body("STATUS_CHANGE", "UP", addr);
        let event = Event::deserialize(&mut body.as_slice()).unwrap();
        assert_matches!(event, Event::StatusChange(StatusChangeEvent::Up(a)) if a == addr);

        let body = make_event_body("TOPOLOGY_CHANGE", "NEW_NODE", addr);
        let event = Event::deserialize(&mut body.as_slice()).unwrap();
        assert_matches!(
            event,
            Event::TopologyChange(TopologyChangeEvent::NewNode(a)) if a == addr
        );
    }

    #[test]
    fn deserialize_schema_change_event() {
        let mut body = Vec::new();
        types::write_string("SCHEMA_CHANGE", &mut body).unwrap();
        types::write_string("CREATED", &mut body).unwrap();
        types::write_string("TABLE", &mut body).unwrap();
        types::write_string("ks", &mut body).unwrap();
        types::write_string("tbl", &mut body).unwrap();

        let event = Event::deserialize(&mut body.as_slice()).unwrap();
        assert_matches!(
            event,
            Event::SchemaChange(SchemaChangeEvent::TableChange {
                change_type: SchemaChangeType::Created,
                keyspace_name,
                object_name,
            }) if keyspace_name == "ks" && object_name == "tbl"
        );
    }

    #[test]
    fn unknown_event_type_is_error() {
        let mut body = Vec::new();
        types::write_string("SOMETHING_ELSE", &mut body).unwrap();
        let res = Event::deserialize(&mut body.as_slice());
        assert_matches!(res, Err(ParseError::BadIncomingData(_)));
    }
}
