use crate::frame::frame_errors::ParseError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use bytes::BufMut;

/// OPTIONS has an empty body; the server answers with SUPPORTED.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut impl BufMut) -> Result<(), ParseError> {
        Ok(())
    }
}
