use std::borrow::Cow;
use std::collections::HashMap;

use crate::frame::frame_errors::ParseError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;
use bytes::BufMut;

pub mod options_keys {
    pub const CQL_VERSION: &str = "CQL_VERSION";
    pub const COMPRESSION: &str = "COMPRESSION";
    pub const DRIVER_NAME: &str = "DRIVER_NAME";
    pub const DRIVER_VERSION: &str = "DRIVER_VERSION";
}

/// The CQL dialect version advertised in STARTUP. Not to be confused with
/// the binary protocol version in the frame header.
pub const DEFAULT_CQL_PROTOCOL_VERSION: &str = "3.0.0";

/// The first frame sent on every connection; carries the option map
/// negotiated from the server's SUPPORTED response.
pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}
