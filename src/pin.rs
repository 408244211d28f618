//! PIN normalization, classification and the local verification string.
//!
//! The verification string lets the device check a PIN without touching the network. It is an
//! argon2 PHC string over the normalized PIN, so it is safe to persist.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::crypt::CryptoError;

#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinType {
    Numeric = 1,
    Alphanumeric = 2,
}

impl PinType {
    pub fn for_pin(pin: &str) -> Self {
        let normalized = normalize_pin(pin);
        if !normalized.is_empty() && normalized.bytes().all(|b| b.is_ascii_digit()) {
            Self::Numeric
        } else {
            Self::Alphanumeric
        }
    }
}

// First code point of each ten-digit block we map down to ASCII.
const DIGIT_BLOCKS: [u32; 5] = [
    0x0660, // arabic-indic
    0x06F0, // extended arabic-indic
    0x0966, // devanagari
    0x09E6, // bengali
    0xFF10, // fullwidth
];

fn ascii_digit(c: char) -> Option<char> {
    let code = c as u32;
    DIGIT_BLOCKS
        .iter()
        .find(|start| (**start..**start + 10).contains(&code))
        .and_then(|start| char::from_digit(code - start, 10))
}

/// Trims surrounding whitespace and maps non-ASCII decimal digits to ASCII.
pub fn normalize_pin(pin: &str) -> String {
    pin.trim()
        .chars()
        .map(|c| ascii_digit(c).unwrap_or(c))
        .collect()
}

pub fn derive_verification_string(pin: &str) -> Result<String, CryptoError> {
    let normalized = normalize_pin(pin);
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(normalized.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CryptoError::Kdf(e.to_string()))
}

/// Checks `pin` against a stored verification string. Malformed strings never verify.
pub fn verify_pin(pin: &str, verification_string: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(verification_string) else {
        return false;
    };
    Argon2::default()
        .verify_password(normalize_pin(pin).as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_pin("  1234\n"), "1234");
        assert_eq!(normalize_pin("\u{0661}\u{0662}\u{0663}\u{0664}"), "1234");
        assert_eq!(normalize_pin("\u{FF15}\u{FF16}"), "56");
        assert_eq!(normalize_pin(" hunter2 "), "hunter2");
    }

    #[test]
    fn test_pin_type() {
        assert_eq!(PinType::for_pin("1234"), PinType::Numeric);
        assert_eq!(PinType::for_pin(" \u{06F1}\u{06F2}\u{06F3}\u{06F4} "), PinType::Numeric);
        assert_eq!(PinType::for_pin("12ab"), PinType::Alphanumeric);
        assert_eq!(PinType::for_pin(""), PinType::Alphanumeric);
    }

    #[test]
    fn test_verification_string() {
        let encoded = derive_verification_string("1234").unwrap();
        assert!(encoded.starts_with("$argon2"));
        assert!(verify_pin("1234", &encoded));
        assert!(verify_pin(" 1234 ", &encoded));
        assert!(verify_pin("\u{0661}\u{0662}\u{0663}\u{0664}", &encoded));
        assert!(!verify_pin("4321", &encoded));
        assert!(!verify_pin("1234", "garbage"));
    }
}
