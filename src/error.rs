//! Error types for the recovery engine.
//!
//! Every failure is classified once, at the boundary where it happens, into one of the
//! variants of [`Error`]. Callers never see raw transport or storage errors.

use thiserror::Error;

use crate::crypt::CryptoError;
use crate::kv::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a connection to an enclave, or of a single round-trip on it.
///
/// `Clone` so a channel can hand the same terminal error to every request still queued on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("connection closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("engine terminated")]
    Terminated,
}

impl TransportError {
    pub fn is_network_failure_or_timeout(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_) | Self::Closed)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Transient; safe to retry from scratch.
    #[error("network failure or timeout: {0}")]
    Network(TransportError),

    /// Protocol-level denial. Never retry a backup with the same material after this.
    #[error("server rejected request: {0}")]
    ServerRejected(String),

    #[error("local persistence failure: {0}")]
    LocalPersistence(#[from] StoreError),

    #[error("local crypto failure: {0}")]
    LocalCrypto(#[from] CryptoError),

    #[error("invalid pin, {remaining_attempts} attempts remaining")]
    InvalidPin { remaining_attempts: u32 },

    #[error("no backup exists")]
    BackupMissing,

    #[error("recovery engine terminated")]
    LifecycleTerminated,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn is_network_failure_or_timeout(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Terminated => Self::LifecycleTerminated,
            TransportError::Handshake(msg) | TransportError::Protocol(msg) => {
                Self::ServerRejected(msg)
            }
            other => Self::Network(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(matches!(
            Error::from(TransportError::Timeout),
            Error::Network(TransportError::Timeout)
        ));
        assert!(matches!(
            Error::from(TransportError::Handshake("bad auth".into())),
            Error::ServerRejected(_)
        ));
        assert!(matches!(
            Error::from(TransportError::Terminated),
            Error::LifecycleTerminated
        ));
        assert!(Error::from(TransportError::Closed).is_network_failure_or_timeout());
        assert!(!Error::from(TransportError::Protocol("x".into())).is_network_failure_or_timeout());
    }
}
