//! Identity of one generation of the remote attested environment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

/// Length of an enclave measurement in bytes.
pub const ENCLAVE_IDENTITY_LEN: usize = 32;

/// An opaque, fixed-size measurement naming one enclave generation.
///
/// Rendered and persisted as lowercase hex, the same form it is configured in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnclaveIdentity([u8; ENCLAVE_IDENTITY_LEN]);

impl EnclaveIdentity {
    pub const fn new(bytes: [u8; ENCLAVE_IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value.trim())
            .map_err(|e| Error::Config(format!("enclave identity is not hex: {e}")))?;
        let bytes: [u8; ENCLAVE_IDENTITY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::Config(format!(
                "enclave identity must be {ENCLAVE_IDENTITY_LEN} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ENCLAVE_IDENTITY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for EnclaveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EnclaveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnclaveIdentity({})", self.to_hex())
    }
}

impl FromStr for EnclaveIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for EnclaveIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EnclaveIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROD: &str = "a6622ad4656e1abcd0bc0ff17c229477747d2ded0495c4ebee7ed35c1789fa97";

    #[test]
    fn test_hex_parsing() {
        let enclave: EnclaveIdentity = PROD.parse().unwrap();
        assert_eq!(enclave.to_string(), PROD);
        assert_eq!(enclave.as_bytes()[0], 0xa6);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(matches!(
            EnclaveIdentity::from_hex("a6622ad4"),
            Err(Error::Config(_))
        ));
        assert!(EnclaveIdentity::from_hex("not hex at all").is_err());
    }
}
