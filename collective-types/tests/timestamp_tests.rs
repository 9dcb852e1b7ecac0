use collective_types::now_nanos;
use collective_types::timestamp::{from_nanos, to_nanos};
use std::time::{Duration, UNIX_EPOCH};

#[test]
fn now_is_after_2020() {
    // 2020-01-01T00:00:00Z
    assert!(now_nanos() > 1_577_836_800_000_000_000);
}

#[test]
fn now_is_monotone_enough() {
    let a = now_nanos();
    let b = now_nanos();
    assert!(b >= a);
}

#[test]
fn epoch_is_zero() {
    assert_eq!(to_nanos(UNIX_EPOCH), 0);
    assert_eq!(from_nanos(0), UNIX_EPOCH);
}

#[test]
fn system_time_roundtrip() {
    let t = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789);
    assert_eq!(to_nanos(t), 1_700_000_000_123_456_789);
    assert_eq!(from_nanos(1_700_000_000_123_456_789), t);
}

#[test]
fn before_epoch_is_negative() {
    let t = UNIX_EPOCH - Duration::from_nanos(5);
    assert_eq!(to_nanos(t), -5);
    assert_eq!(from_nanos(-5), t);
}
