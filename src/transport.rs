//! Seams to the attested transport.
//!
//! Negotiating an encrypted channel with a specific enclave measurement is the connector's
//! job. The engine only opens connections, sends [`Request`]s on them, and closes them.

use async_trait::async_trait;
use bincode::{Decode, Encode};

use crate::enclave::EnclaveIdentity;
use crate::error::TransportError;
use crate::protocol::{Request, Response};

/// Credential proving the client's identity to the enclave service.
#[derive(Encode, Decode, Clone, PartialEq, Eq)]
pub struct AuthCredential {
    pub username: String,
    pub password: String,
}

impl AuthCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCredential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// How to authenticate when opening a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Use the cached credential for the current user if there is one, otherwise let the
    /// connector obtain one.
    Implicit,
    /// Use this credential; on a failed handshake it is evicted and `fallback` is tried once.
    Credential {
        credential: AuthCredential,
        fallback: Option<Box<AuthStrategy>>,
    },
}

impl AuthStrategy {
    pub fn credential(credential: AuthCredential) -> Self {
        Self::Credential {
            credential,
            fallback: None,
        }
    }

    pub fn with_fallback(credential: AuthCredential, fallback: AuthStrategy) -> Self {
        Self::Credential {
            credential,
            fallback: Some(Box::new(fallback)),
        }
    }
}

/// One authenticated, encrypted connection to one enclave.
#[async_trait]
pub trait EnclaveConnection: Send + Sync {
    /// The credential the handshake succeeded with.
    fn credential(&self) -> &AuthCredential;

    /// One wire round-trip. Callers guarantee at most one call in flight.
    async fn send(&self, request: Request) -> Result<Response, TransportError>;

    /// Closes the underlying socket; `error` is `None` for a normal closure.
    fn close(&self, error: Option<&TransportError>);
}

#[async_trait]
pub trait EnclaveConnector: Send + Sync {
    /// Performs the attested handshake. With `credential == None` the connector obtains a
    /// credential itself from the account service.
    async fn connect(
        &self,
        enclave: &EnclaveIdentity,
        credential: Option<&AuthCredential>,
    ) -> Result<Box<dyn EnclaveConnection>, TransportError>;

    /// Fetches a fresh credential from the account service, bypassing any cache.
    async fn fetch_credential(&self) -> Result<AuthCredential, TransportError>;
}
