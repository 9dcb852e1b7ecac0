use collective_crypto::{CollectiveEncryptor, CryptoError, Encryptor};
use collective_types::InstanceId;
use std::sync::Arc;

fn encryptor(secret: &[u8]) -> CollectiveEncryptor {
    CollectiveEncryptor::new(secret).unwrap()
}

#[test]
fn roundtrip_between_devices_sharing_a_secret() {
    let alice = encryptor(b"shared identity");
    let bob = encryptor(b"shared identity");

    let sealed = alice.encrypt(b"{\"k\":1}").unwrap();
    assert_eq!(bob.decrypt(&sealed).unwrap(), b"{\"k\":1}");
}

#[test]
fn other_collective_cannot_decrypt() {
    let ours = encryptor(b"ours");
    let theirs = encryptor(b"theirs");

    let sealed = ours.encrypt(b"private").unwrap();
    assert!(matches!(theirs.decrypt(&sealed), Err(CryptoError::Decryption(_))));
}

#[test]
fn truncated_blob_rejected() {
    let enc = encryptor(b"secret");
    let sealed = enc.encrypt(b"data").unwrap();
    assert!(enc.decrypt(&sealed[..10]).is_err());
    assert!(enc.decrypt(&sealed[..sealed.len() - 1]).is_err());
}

#[test]
fn empty_secret_rejected() {
    assert!(CollectiveEncryptor::new(b"").is_err());
}

// ── Key IDs ──────────────────────────────────────────────────────

#[test]
fn key_id_is_stable_across_instances() {
    let device = InstanceId::from_bytes([7; 8]);
    assert_eq!(
        encryptor(b"secret").key_id(&device),
        encryptor(b"secret").key_id(&device)
    );
}

#[test]
fn key_id_depends_on_device_and_secret() {
    let a = InstanceId::from_bytes([1; 8]);
    let b = InstanceId::from_bytes([2; 8]);
    let enc = encryptor(b"secret");

    assert_ne!(enc.key_id(&a), enc.key_id(&b));
    assert_ne!(enc.key_id(&a), encryptor(b"other").key_id(&a));
}

#[test]
fn key_id_is_path_safe() {
    let enc = encryptor(b"secret");
    for _ in 0..32 {
        let id = enc.key_id(&InstanceId::new());
        // 32-byte MAC, base64url without padding
        assert_eq!(id.len(), 43);
        assert!(
            id.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "{id}"
        );
    }
}

#[test]
fn usable_as_trait_object() {
    let enc: Arc<dyn Encryptor> = Arc::new(encryptor(b"secret"));
    let sealed = enc.encrypt(b"x").unwrap();
    assert_eq!(enc.decrypt(&sealed).unwrap(), b"x");
}

#[test]
fn debug_does_not_leak_keys() {
    let debug = format!("{:?}", encryptor(b"secret"));
    assert!(debug.contains("REDACTED"));
}
