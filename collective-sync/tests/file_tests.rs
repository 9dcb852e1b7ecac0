use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use collective_sync::{FILE_MAGIC, Header, SyncError, decode_file, encode_file, log_path};
use collective_types::InstanceId;
use proptest::prelude::*;

fn device() -> InstanceId {
    InstanceId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8])
}

// ── Layout ──────────────────────────────────────────────────────

#[test]
fn encoded_file_starts_with_magic() {
    let file = encode_file(&Header::new(device()), b"ciphertext").unwrap();
    assert!(file.starts_with(FILE_MAGIC.as_bytes()));
}

#[test]
fn encoded_header_is_json_with_version_and_device() {
    let file = encode_file(&Header::new(device()), b"ciphertext").unwrap();
    let rest = &file[FILE_MAGIC.len()..];
    let newline = rest.iter().position(|b| *b == b'\n').unwrap();

    let header_json = URL_SAFE.decode(&rest[..newline]).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&header_json).unwrap();
    assert_eq!(value["version"], 0);
    assert_eq!(value["device"], "0102030405060708");

    let body = URL_SAFE.decode(&rest[newline + 1..]).unwrap();
    assert_eq!(body, b"ciphertext");
}

#[test]
fn empty_ciphertext_round_trips() {
    let file = encode_file(&Header::new(device()), b"").unwrap();
    let (header, body) = decode_file(&file).unwrap();
    assert_eq!(header.device, device());
    assert!(body.is_empty());
}

// ── Rejections ──────────────────────────────────────────────────

#[test]
fn missing_magic_is_rejected() {
    let file = encode_file(&Header::new(device()), b"x").unwrap();
    let err = decode_file(&file[1..]).unwrap_err();
    assert!(matches!(err, SyncError::Codec(_)));
}

#[test]
fn missing_delimiter_is_rejected() {
    let mut file = FILE_MAGIC.as_bytes().to_vec();
    file.extend_from_slice(URL_SAFE.encode(b"{}").as_bytes());
    assert!(matches!(decode_file(&file), Err(SyncError::Codec(_))));
}

#[test]
fn bad_header_encoding_is_rejected() {
    let mut file = FILE_MAGIC.as_bytes().to_vec();
    file.extend_from_slice(b"***\nAAAA");
    assert!(matches!(decode_file(&file), Err(SyncError::Codec(_))));
}

#[test]
fn bad_header_json_is_rejected() {
    let mut file = FILE_MAGIC.as_bytes().to_vec();
    file.extend_from_slice(URL_SAFE.encode(b"not json").as_bytes());
    file.push(b'\n');
    assert!(matches!(decode_file(&file), Err(SyncError::Codec(_))));
}

#[test]
fn unknown_version_is_rejected() {
    let header = Header {
        version: 7,
        device: device(),
    };
    let file = encode_file(&header, b"x").unwrap();
    let err = decode_file(&file).unwrap_err();
    assert!(err.to_string().contains("version 7"));
}

#[test]
fn bad_body_encoding_is_rejected() {
    let mut file = encode_file(&Header::new(device()), b"").unwrap();
    file.extend_from_slice(b"!!");
    assert!(matches!(decode_file(&file), Err(SyncError::Codec(_))));
}

// ── Paths ───────────────────────────────────────────────────────

#[test]
fn log_path_layout() {
    assert_eq!(
        log_path("collective", "KEYID", &device()),
        "collective/KEYID/0102030405060708"
    );
}

proptest! {
    #[test]
    fn encode_decode_round_trip(
        id in any::<[u8; 8]>(),
        ciphertext in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let header = Header::new(InstanceId::from_bytes(id));
        let file = encode_file(&header, &ciphertext).unwrap();
        let (decoded_header, decoded_body) = decode_file(&file).unwrap();
        prop_assert_eq!(decoded_header, header);
        prop_assert_eq!(decoded_body, ciphertext);
    }
}
