//! Key derivation and management.
//!
//! All keys used by the engine are derived from the single collective secret
//! shared by every device, using HKDF-SHA256 with a distinct `info` label per
//! purpose.

use crate::error::{CryptoError, CryptoResult};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of encryption keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

/// HKDF label for the patch encryption key.
pub const CIPHER_KEY_INFO: &[u8] = b"collective-txlog-cipher-v0";

/// HKDF label for the key used to hash device IDs into remote paths.
pub const KEY_ID_INFO: &[u8] = b"collective-txlog-keyid-v0";

/// A derived encryption key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    /// Creates a new derived key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derives a purpose-bound key from the collective secret.
///
/// The same `secret` and `info` always produce the same key; different
/// labels produce unrelated keys.
pub fn derive_subkey(secret: &[u8], info: &[u8]) -> CryptoResult<DerivedKey> {
    if secret.is_empty() {
        return Err(CryptoError::InvalidSecret("secret is empty".to_string()));
    }

    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut bytes = [0u8; KEY_SIZE];
    hk.expand(info, &mut bytes)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let key = DerivedKey::from_bytes(bytes);
    bytes.zeroize();
    Ok(key)
}

/// Generates a random key. Used for fresh collective secrets and in tests.
pub fn generate_random_key() -> DerivedKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    DerivedKey::from_bytes(bytes)
}
