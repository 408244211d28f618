use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use zeroize::Zeroize;

use crate::crypt::CryptoError;

/// Length of a master secret in bytes.
pub const MASTER_SECRET_LEN: usize = 32;

/// The root secret this engine escrows.
///
/// Generated once per installation and never rotated on a primary device once it exists.
/// Held in a [`SecretSlice`] so it is zeroized on drop and redacted in `Debug` output.
#[derive(Clone, Debug)]
pub struct MasterSecret {
    bytes: SecretSlice<u8>,
}

impl MasterSecret {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; MASTER_SECRET_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self {
            bytes: SecretSlice::new(bytes.into()),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != MASTER_SECRET_LEN {
            return Err(CryptoError::InvalidSecretLength(bytes.len()));
        }
        Ok(Self {
            bytes: SecretSlice::new(bytes.to_vec().into()),
        })
    }

    /// Takes ownership of decrypted or decoded bytes, wiping the buffer on a length mismatch.
    pub fn from_vec(mut bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != MASTER_SECRET_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(CryptoError::InvalidSecretLength(len));
        }
        Ok(Self {
            bytes: SecretSlice::new(bytes.into()),
        })
    }

    pub fn expose(&self) -> &[u8] {
        self.bytes.expose_secret()
    }
}

impl PartialEq for MasterSecret {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for MasterSecret {}
