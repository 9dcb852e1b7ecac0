//! Encryption interface used by the sync layer.
//!
//! The sync engine depends on `Arc<dyn Encryptor>` and never sees raw keys.
//! Besides sealing and opening patch files, an encryptor maps each device ID
//! to a key ID: an opaque directory name that hides which devices belong to
//! the collective from anyone browsing the remote store.

use crate::cipher::{EncryptedData, decrypt, encrypt};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{CIPHER_KEY_INFO, DerivedKey, KEY_ID_INFO, derive_subkey};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use collective_types::InstanceId;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Trait for encrypting patch files and deriving remote key IDs.
///
/// Implementations own the key material.
pub trait Encryptor: Send + Sync {
    /// Encrypts `plaintext`, returning an opaque blob.
    fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Decrypts a blob produced by [`Encryptor::encrypt`].
    fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Returns the remote directory name for `device`.
    fn key_id(&self, device: &InstanceId) -> String;
}

/// The encryptor shared by every device of a collective.
///
/// Blobs are laid out as `nonce(12) || ChaCha20-Poly1305 ciphertext+tag`.
/// Key IDs are `base64url(HMAC-SHA256(key_id_key, device))` without padding.
pub struct CollectiveEncryptor {
    cipher_key: DerivedKey,
    key_id_mac: Hmac<Sha256>,
}

impl CollectiveEncryptor {
    /// Derives both keys from the collective `secret`.
    pub fn new(secret: &[u8]) -> CryptoResult<Self> {
        let cipher_key = derive_subkey(secret, CIPHER_KEY_INFO)?;
        let key_id_key = derive_subkey(secret, KEY_ID_INFO)?;
        let key_id_mac = Hmac::<Sha256>::new_from_slice(key_id_key.as_bytes())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(Self {
            cipher_key,
            key_id_mac,
        })
    }
}

impl std::fmt::Debug for CollectiveEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectiveEncryptor")
            .field("cipher_key", &self.cipher_key)
            .finish_non_exhaustive()
    }
}

impl Encryptor for CollectiveEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(encrypt(&self.cipher_key, plaintext)?.to_bytes())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let encrypted = EncryptedData::from_bytes(ciphertext)?;
        decrypt(&self.cipher_key, &encrypted)
    }

    fn key_id(&self, device: &InstanceId) -> String {
        let mut mac = self.key_id_mac.clone();
        mac.update(device.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}
