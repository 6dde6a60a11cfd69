//! Key material for encrypted databases.
//!
//! Keys are 32 random bytes carried as base64 text, which is what goes into
//! the `key` connection option.
//!
//! # Example
//!
//! ```rust
//! use sealed_sql::crypto::{decode_key, encode_key, generate_key};
//!
//! let key = generate_key().expect("system random source");
//! let encoded = encode_key(&key);
//! assert_eq!(decode_key(&encoded).unwrap(), key);
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// The length of a generated key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Result type for key operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The system random source failed.
    #[error("failed to generate random key")]
    RandomUnavailable,

    /// The provided key has an invalid length (must be 32 bytes).
    #[error("invalid key length: expected {KEY_LENGTH} bytes")]
    InvalidKeyLength,

    /// The key is not valid base64.
    #[error("invalid key encoding: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
}

/// Generates a cryptographically secure 32-byte key.
///
/// Uses `ring::rand::SystemRandom`.
pub fn generate_key() -> CryptoResult<[u8; KEY_LENGTH]> {
    let rng = SystemRandom::new();
    let mut key = [0u8; KEY_LENGTH];
    rng.fill(&mut key)
        .map_err(|_| CryptoError::RandomUnavailable)?;
    Ok(key)
}

/// Encodes a key as a base64 string.
pub fn encode_key(key: &[u8; KEY_LENGTH]) -> String {
    BASE64.encode(key)
}

/// Decodes a base64-encoded key.
pub fn decode_key(encoded: &str) -> CryptoResult<[u8; KEY_LENGTH]> {
    let bytes = BASE64.decode(encoded.trim())?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength)
}

/// A fresh key, ready for the `key` connection option.
pub fn generate_encoded_key() -> CryptoResult<String> {
    generate_key().map(|key| encode_key(&key))
}
