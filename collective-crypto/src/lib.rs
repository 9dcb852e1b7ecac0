//! Encryption layer for the collective sync engine.
//!
//! - [`CollectiveEncryptor`] seals patch files and derives key IDs
//! - [`encrypt`]/[`decrypt`]: ChaCha20-Poly1305 with random nonces
//! - [`derive_subkey`]: HKDF-SHA256 from the collective secret
//!
//! Key material is zeroized on drop.

mod cipher;
mod encryptor;
mod error;
mod key;

pub use cipher::{EncryptedData, NONCE_SIZE, TAG_SIZE, decrypt, encrypt};
pub use encryptor::{CollectiveEncryptor, Encryptor};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    CIPHER_KEY_INFO, DerivedKey, KEY_ID_INFO, KEY_SIZE, derive_subkey, generate_random_key,
};
