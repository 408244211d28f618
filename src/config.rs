//! Engine configuration.
//!
//! Loaded from TOML, every field optional:
//!
//! ```toml
//! current_enclave = "a6622ad4656e1abcd0bc0ff17c229477747d2ded0495c4ebee7ed35c1789fa97"
//! previous_enclaves = []
//! max_pin_attempts = 10
//! idle_grace_ms = 100
//! request_timeout_ms = 30000
//! app_version = "7.1.0"
//! is_main_app = true
//! collection = "svr2"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::enclave::EnclaveIdentity;
use crate::{Error, Result};

/// Measurement of the production enclave at the time of writing.
pub const DEFAULT_ENCLAVE: EnclaveIdentity = EnclaveIdentity::new([
    0xa6, 0x62, 0x2a, 0xd4, 0x65, 0x6e, 0x1a, 0xbc, 0xd0, 0xbc, 0x0f, 0xf1, 0x7c, 0x22, 0x94, 0x77,
    0x74, 0x7d, 0x2d, 0xed, 0x04, 0x95, 0xc4, 0xeb, 0xee, 0x7e, 0xd3, 0x5c, 0x17, 0x89, 0xfa, 0x97,
]);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The enclave every backup goes to.
    pub current_enclave: EnclaveIdentity,
    /// Retired enclaves, newest first. Only used for restore fallback and deletion.
    pub previous_enclaves: Vec<EnclaveIdentity>,
    /// Guess budget sent with each backup.
    pub max_pin_attempts: u32,
    /// How long an idle channel stays open waiting for another request.
    pub idle_grace_ms: u64,
    pub request_timeout_ms: u64,
    pub app_version: String,
    /// Migration only runs in the main process, never in extensions.
    pub is_main_app: bool,
    /// Key prefix for every record this engine owns.
    pub collection: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            current_enclave: DEFAULT_ENCLAVE,
            previous_enclaves: Vec::new(),
            max_pin_attempts: 10,
            idle_grace_ms: 100,
            request_timeout_ms: 30_000,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            is_main_app: true,
            collection: "svr2".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("reading {}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pin_attempts == 0 {
            return Err(Error::Config("max_pin_attempts must be at least 1".into()));
        }
        if self.collection.is_empty() || self.collection.contains('/') {
            return Err(Error::Config(format!(
                "collection {:?} must be non-empty and contain no '/'",
                self.collection
            )));
        }
        Ok(())
    }

    /// Previous enclaves, newest first, without the current one.
    pub fn retired_enclaves(&self) -> impl Iterator<Item = &EnclaveIdentity> {
        self.previous_enclaves
            .iter()
            .filter(move |enclave| **enclave != self.current_enclave)
    }

    /// Restore candidates: the current enclave, then retired ones newest to oldest.
    pub fn restore_candidates(&self) -> Vec<EnclaveIdentity> {
        std::iter::once(&self.current_enclave)
            .chain(self.retired_enclaves())
            .copied()
            .collect()
    }

    pub fn is_retired(&self, enclave: &EnclaveIdentity) -> bool {
        self.retired_enclaves().any(|e| e == enclave)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
