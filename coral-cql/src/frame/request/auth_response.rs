use crate::frame::frame_errors::ParseError;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::write_bytes_opt;
use bytes::BufMut;

/// An answer to an AUTHENTICATE or AUTH_CHALLENGE message. The token is
/// opaque to the driver; its format is up to the authenticator.
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        write_bytes_opt(self.response.as_ref(), buf)?;
        Ok(())
    }
}
