//! PIN-gated escrow of a device master secret with remote attested enclaves.
//!
//! The [`RecoveryEngine`] backs a locally generated [`MasterSecret`] up to the current enclave
//! in two phases (backup, then expose), restores it by PIN across enclave generations, migrates
//! backups off retired enclaves and deletes them there. Progress is checkpointed in a sled
//! database so a crash at any point resumes without granting the server extra PIN guesses.

pub mod account;
mod backup;
pub mod channel;
pub mod config;
pub mod crypt;
mod delete;
pub mod enclave;
pub mod engine;
pub mod error;
pub mod kv;
pub mod lifecycle;
pub mod pin;
pub mod protocol;
pub mod registry;
pub mod restore;
pub mod secret;
#[cfg(any(test, feature = "software"))]
pub mod software;
pub mod transport;

pub use config::EngineConfig;
pub use enclave::EnclaveIdentity;
pub use engine::{Collaborators, RecoveryEngine};
pub use error::{Error, Result, TransportError};
pub use pin::PinType;
pub use restore::RestoreOutcome;
pub use secret::MasterSecret;
pub use transport::{AuthCredential, AuthStrategy};
