use collective_types::{FIELD_SEPARATOR, KEY_DESIGNATOR, KeyError, StoreKey, map_element_prefix};
use proptest::prelude::*;

// ── Encoding ─────────────────────────────────────────────────────

#[test]
fn plain_key_is_verbatim() {
    let key = StoreKey::plain("profile/name").unwrap();
    assert_eq!(key.encode(), "profile/name");
}

#[test]
fn non_plain_keys_start_with_designator() {
    let keys = [
        StoreKey::map_index("contacts").unwrap(),
        StoreKey::map_element("contacts", "bob").unwrap(),
        StoreKey::internal("instance_id").unwrap(),
    ];
    for key in keys {
        assert!(key.encode().starts_with(KEY_DESIGNATOR), "{key}");
    }
}

#[test]
fn decode_recovers_every_variant() {
    let keys = [
        StoreKey::plain("a").unwrap(),
        StoreKey::map_index("m").unwrap(),
        StoreKey::map_element("m", "e").unwrap(),
        StoreKey::internal("txlog/collective").unwrap(),
    ];
    for key in keys {
        assert_eq!(StoreKey::decode(&key.encode()).unwrap(), key);
    }
}

#[test]
fn element_that_looks_like_old_suffix_is_still_plain() {
    // An application key ending in a map-like suffix is never mistaken for
    // an element.
    let key = StoreKey::decode("contacts_map_element").unwrap();
    assert!(!key.is_map_element());
    assert_eq!(key, StoreKey::Plain("contacts_map_element".into()));
}

#[test]
fn element_prefix_matches_elements_of_that_map_only() {
    let prefix = map_element_prefix("m");
    assert!(StoreKey::map_element("m", "x").unwrap().encode().starts_with(&prefix));
    assert!(!StoreKey::map_element("mm", "x").unwrap().encode().starts_with(&prefix));
    assert!(!StoreKey::map_index("m").unwrap().encode().starts_with(&prefix));
}

// ── Validation ───────────────────────────────────────────────────

#[test]
fn empty_names_rejected() {
    assert_eq!(StoreKey::plain(""), Err(KeyError::Empty));
    assert_eq!(StoreKey::map_index(""), Err(KeyError::Empty));
    assert_eq!(StoreKey::map_element("m", ""), Err(KeyError::Empty));
}

#[test]
fn reserved_characters_rejected() {
    let bad = format!("a{KEY_DESIGNATOR}b");
    assert!(matches!(
        StoreKey::plain(bad),
        Err(KeyError::ReservedCharacter { character, .. }) if character == KEY_DESIGNATOR
    ));

    let bad = format!("a{FIELD_SEPARATOR}b");
    assert!(matches!(
        StoreKey::map_element("m", bad),
        Err(KeyError::ReservedCharacter { character, .. }) if character == FIELD_SEPARATOR
    ));
}

#[test]
fn malformed_encodings_rejected() {
    let cases = [
        format!("{KEY_DESIGNATOR}"),
        format!("{KEY_DESIGNATOR}m"),
        format!("{KEY_DESIGNATOR}zfoo"),
        format!("{KEY_DESIGNATOR}x{FIELD_SEPARATOR}foo"),
        format!("{KEY_DESIGNATOR}e{FIELD_SEPARATOR}only_map"),
        format!("{KEY_DESIGNATOR}m{FIELD_SEPARATOR}a{FIELD_SEPARATOR}b"),
    ];
    for case in cases {
        assert!(StoreKey::decode(&case).is_err(), "{case:?}");
    }
}

#[test]
fn error_messages_are_descriptive() {
    let err = StoreKey::plain(format!("x{FIELD_SEPARATOR}")).unwrap_err();
    assert!(err.to_string().contains("reserved character"));
}

proptest! {
    #[test]
    fn valid_names_roundtrip(map in "[a-z0-9/_.-]{1,16}", element in "[a-z0-9/_.-]{1,16}") {
        let key = StoreKey::map_element(map.clone(), element.clone()).unwrap();
        let decoded = StoreKey::decode(&key.encode()).unwrap();
        prop_assert_eq!(decoded, StoreKey::MapElement { map, element });
    }
}
