//! Pluggable authentication.
//!
//! The connection calls an [`Authenticator`] during every handshake,
//! passing the server-issued nonce when one was announced, and merges the
//! returned [`Credentials`] into the `CONNECT` body. Loading credential
//! files or signing nonces is the authenticator's business, not the
//! connection's.

use std::sync::Arc;

/// Credential fields merged into the `CONNECT` handshake body.
///
/// Absent fields are omitted from the JSON entirely.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Username for user/password auth.
    pub user: Option<String>,
    /// Password for user/password auth.
    pub pass: Option<String>,
    /// Authentication token.
    pub token: Option<String>,
    /// User JWT for decentralized auth.
    pub jwt: Option<String>,
    /// Public NKey.
    pub nkey: Option<String>,
    /// Signature over the server nonce.
    pub sig: Option<String>,
}

/// Produces credential fields for a handshake, given the server nonce.
pub type Authenticator = Arc<dyn Fn(Option<&str>) -> Credentials + Send + Sync>;

/// Authenticator sending a username and password.
pub fn user_pass(user: impl Into<String>, pass: impl Into<String>) -> Authenticator {
    let user = user.into();
    let pass = pass.into();
    Arc::new(move |_nonce| Credentials {
        user: Some(user.clone()),
        pass: Some(pass.clone()),
        ..Credentials::default()
    })
}

/// Authenticator sending a bare token.
pub fn token(token: impl Into<String>) -> Authenticator {
    let token = token.into();
    Arc::new(move |_nonce| Credentials {
        token: Some(token.clone()),
        ..Credentials::default()
    })
}
