use collective_crdt::{Mutate, Patch};
use collective_types::InstanceId;
use pretty_assertions::assert_eq;

fn id(n: u8) -> InstanceId {
    InstanceId::from_bytes([n; 8])
}

// ── Basic operations ─────────────────────────────────────────────

#[test]
fn new_patch_is_empty() {
    let patch = Patch::new(id(1));
    assert!(patch.is_empty());
    assert_eq!(patch.len(), 0);
    assert_eq!(patch.owner(), id(1));
    assert_eq!(patch.latest_timestamp(), None);
}

#[test]
fn add_replaces_earlier_mutate() {
    let mut patch = Patch::new(id(1));
    patch.add("k", Mutate::set(10, b"first".to_vec()));
    patch.add("k", Mutate::set(5, b"second".to_vec()));

    assert_eq!(patch.len(), 1);
    // arrival order wins within one device, even with an older timestamp
    assert_eq!(patch.get("k").unwrap().value(), Some(&b"second"[..]));
}

#[test]
fn latest_timestamp_is_max() {
    let mut patch = Patch::new(id(1));
    patch.add("a", Mutate::set(7, b"x".to_vec()));
    patch.add("b", Mutate::delete(12));
    patch.add("c", Mutate::set(3, b"y".to_vec()));
    assert_eq!(patch.latest_timestamp(), Some(12));
}

// ── Serialization ────────────────────────────────────────────────

#[test]
fn serialized_form_matches_wire_layout() {
    let mut patch = Patch::new(id(1));
    patch.add("b", Mutate::delete(2));
    patch.add("a", Mutate::set(1, b"hi".to_vec()));

    let json = String::from_utf8(patch.serialize().unwrap()).unwrap();
    assert_eq!(
        json,
        r#"{"a":{"Timestamp":1,"Value":"aGk=","Deletion":false},"b":{"Timestamp":2,"Value":null,"Deletion":true}}"#
    );
}

#[test]
fn serialize_is_deterministic_across_insert_order() {
    let mut a = Patch::new(id(1));
    a.add("x", Mutate::set(1, b"1".to_vec()));
    a.add("y", Mutate::set(2, b"2".to_vec()));
    a.add("z", Mutate::delete(3));

    let mut b = Patch::new(id(1));
    b.add("z", Mutate::delete(3));
    b.add("x", Mutate::set(1, b"1".to_vec()));
    b.add("y", Mutate::set(2, b"2".to_vec()));

    assert_eq!(a.serialize().unwrap(), b.serialize().unwrap());
}

#[test]
fn deserialize_restores_patch() {
    let mut patch = Patch::new(id(3));
    patch.add("k", Mutate::set(-4, vec![0, 255, 17]));
    patch.add("gone", Mutate::delete(9));
    patch.add("marker", Mutate::marker(9));

    let bytes = patch.serialize().unwrap();
    let restored = Patch::deserialize(id(3), &bytes).unwrap();
    assert_eq!(restored, patch);
}

#[test]
fn deserialize_rejects_garbage() {
    assert!(Patch::deserialize(id(1), b"not json").is_err());
    assert!(Patch::deserialize(id(1), br#"{"k":{"Timestamp":1,"Value":"!!!","Deletion":false}}"#).is_err());
}

#[test]
fn deserialize_accepts_empty_object() {
    let patch = Patch::deserialize(id(1), b"{}").unwrap();
    assert!(patch.is_empty());
}
