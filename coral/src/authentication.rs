//! Support for authenticating connections against servers that require it.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Error message returned by an authenticator.
pub type AuthError = String;

/// Handles the challenge-response cycle of a single connection.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Computes the response to an AUTH_CHALLENGE token.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called on AUTH_SUCCESS with the final server token.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Produces a fresh [`AuthenticatorSession`] and the initial AUTH_RESPONSE
/// token for every connection that receives an AUTHENTICATE message.
#[async_trait]
pub trait AuthenticatorProvider: Send + Sync {
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during PlainTextAuthentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Default authenticator implementing the SASL PLAIN mechanism, matching
/// the server-side `PasswordAuthenticator`.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: String, password: String) -> Self {
        PlainTextAuthenticator { username, password }
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        let mut response = BytesMut::new();
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());

        Ok((
            Some(response.to_vec()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_initial_response_layout() {
        let auth = PlainTextAuthenticator::new("cassandra".to_string(), "pass".to_string());
        let (initial, _session) = auth
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();

        let expected = b"\x00cassandra\x00pass".to_vec();
        assert_eq!(initial, Some(expected));
    }
}
