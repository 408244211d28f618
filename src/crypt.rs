use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretSlice};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::enclave::EnclaveIdentity;
use crate::secret::MasterSecret;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("kdf failed: {0}")]
    Kdf(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid secret length {0}")]
    InvalidSecretLength(usize),

    #[error("crypto worker failed: {0}")]
    Worker(String),
}

/// Material derived from a PIN for one enclave and one authenticated user.
///
/// Never persisted. The access key proves knowledge of the PIN to the enclave; the
/// encryption key wraps the [`MasterSecret`] before it leaves the device.
pub struct PinDerivedMaterial {
    access_key: [u8; 32],
    encryption_key: SecretSlice<u8>,
}

impl PinDerivedMaterial {
    pub fn new(access_key: [u8; 32], encryption_key: [u8; 32]) -> Self {
        let mut encryption_key = encryption_key;
        let material = Self {
            access_key,
            encryption_key: SecretSlice::new(encryption_key.to_vec().into()),
        };
        encryption_key.zeroize();
        material
    }

    pub fn access_key(&self) -> &[u8; 32] {
        &self.access_key
    }

    /// Encrypts the secret as `nonce || ciphertext` with AES-256-GCM.
    pub fn encrypt_secret(&self, secret: &MasterSecret) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(self.encryption_key.expose_secret())
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        let nonce: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), secret.expose())
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut sealed = nonce.to_vec();
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    pub fn decrypt_secret(&self, sealed: &[u8]) -> Result<MasterSecret, CryptoError> {
        if sealed.len() <= NONCE_LEN {
            return Err(CryptoError::Decryption("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(self.encryption_key.expose_secret())
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        MasterSecret::from_vec(plaintext)
    }
}

impl Zeroize for PinDerivedMaterial {
    fn zeroize(&mut self) {
        self.access_key.zeroize();
        self.encryption_key.zeroize();
    }
}

impl ZeroizeOnDrop for PinDerivedMaterial {}

impl Drop for PinDerivedMaterial {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Derives [`PinDerivedMaterial`] from a normalized PIN.
///
/// Implementations may be slow on purpose; the engine always calls them on a blocking worker.
pub trait PinHasher: Send + Sync {
    fn derive(
        &self,
        normalized_pin: &str,
        enclave: &EnclaveIdentity,
        username: &str,
    ) -> Result<PinDerivedMaterial, CryptoError>;
}

/// Default hasher: argon2id stretches the PIN with a salt bound to the enclave and user,
/// then HKDF-SHA256 splits the stretched key into the access and encryption keys.
#[derive(Clone, Debug)]
pub struct Argon2PinHasher {
    params: Params,
}

impl Argon2PinHasher {
    pub fn new(params: Params) -> Self {
        Self { params }
    }

    fn salt(enclave: &EnclaveIdentity, username: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"enclave-escrow:pin-salt:v1");
        hasher.update(enclave.as_bytes());
        hasher.update(username.as_bytes());
        hasher.finalize().into()
    }
}

impl Default for Argon2PinHasher {
    fn default() -> Self {
        // 16 MiB, 32 passes; tuned for commodity phones
        let params = Params::new(16 * 1024, 32, 1, Some(32)).unwrap_or_default();
        Self { params }
    }
}

impl PinHasher for Argon2PinHasher {
    fn derive(
        &self,
        normalized_pin: &str,
        enclave: &EnclaveIdentity,
        username: &str,
    ) -> Result<PinDerivedMaterial, CryptoError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut stretched = [0u8; 32];
        argon2
            .hash_password_into(
                normalized_pin.as_bytes(),
                &Self::salt(enclave, username),
                &mut stretched,
            )
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;

        let hkdf = Hkdf::<Sha256>::new(Some(enclave.as_bytes().as_slice()), &stretched);
        stretched.zeroize();

        let mut access_key = [0u8; 32];
        let mut encryption_key = [0u8; 32];
        hkdf.expand(b"access-key", &mut access_key)
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;
        hkdf.expand(b"encryption-key", &mut encryption_key)
            .map_err(|e| CryptoError::Kdf(e.to_string()))?;

        let material = PinDerivedMaterial::new(access_key, encryption_key);
        access_key.zeroize();
        encryption_key.zeroize();
        Ok(material)
    }
}

/// Runs CPU-bound crypto on the blocking pool and hands the result back to the caller.
pub async fn offload<T, F>(work: F) -> Result<T, CryptoError>
where
    F: FnOnce() -> Result<T, CryptoError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CryptoError::Worker(e.to_string()))?
}

#[cfg(test)]
pub(crate) fn fast_hasher() -> Argon2PinHasher {
    // minimal cost, tests only
    Argon2PinHasher::new(Params::new(64, 1, 1, Some(32)).unwrap_or_default())
}

/// A hasher whose derivation always fails.
#[cfg(test)]
pub(crate) struct FailingHasher;

#[cfg(test)]
impl PinHasher for FailingHasher {
    fn derive(
        &self,
        _normalized_pin: &str,
        _enclave: &EnclaveIdentity,
        _username: &str,
    ) -> Result<PinDerivedMaterial, CryptoError> {
        Err(CryptoError::Kdf("derivation unavailable".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enclave(byte: u8) -> EnclaveIdentity {
        EnclaveIdentity::new([byte; 32])
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let hasher = fast_hasher();
        let a = hasher.derive("1234", &enclave(1), "alice").unwrap();
        let b = hasher.derive("1234", &enclave(1), "alice").unwrap();
        assert_eq!(a.access_key(), b.access_key());

        let other_pin = hasher.derive("1235", &enclave(1), "alice").unwrap();
        let other_enclave = hasher.derive("1234", &enclave(2), "alice").unwrap();
        let other_user = hasher.derive("1234", &enclave(1), "bob").unwrap();
        assert_ne!(a.access_key(), other_pin.access_key());
        assert_ne!(a.access_key(), other_enclave.access_key());
        assert_ne!(a.access_key(), other_user.access_key());
    }

    #[test]
    fn test_secret_encryption() {
        let hasher = fast_hasher();
        let material = hasher.derive("1234", &enclave(1), "alice").unwrap();
        let secret = MasterSecret::generate();

        let sealed = material.encrypt_secret(&secret).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], secret.expose());
        let opened = material.decrypt_secret(&sealed).unwrap();
        assert_eq!(opened, secret);

        let wrong = hasher.derive("9999", &enclave(1), "alice").unwrap();
        assert!(matches!(
            wrong.decrypt_secret(&sealed),
            Err(CryptoError::Decryption(_))
        ));
        assert!(material.decrypt_secret(&sealed[..NONCE_LEN]).is_err());
    }

    #[tokio::test]
    async fn test_offload() {
        let hasher = fast_hasher();
        let material = offload(move || hasher.derive("1234", &enclave(3), "carol"))
            .await
            .unwrap();
        assert_eq!(material.access_key().len(), 32);
    }
}
