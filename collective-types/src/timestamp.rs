//! Wall-clock timestamps for mutates.
//!
//! Every timestamp in a patch is a signed count of nanoseconds since the Unix
//! epoch. Devices do not correct for clock skew between each other; a skewed
//! device can win a last-writer-wins race it "should" have lost.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current wall time in Unix nanoseconds.
#[must_use]
pub fn now_nanos() -> i64 {
    to_nanos(SystemTime::now())
}

/// Converts a `SystemTime` into Unix nanoseconds, saturating at the bounds of
/// `i64`. Times before the epoch become negative.
#[must_use]
pub fn to_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_nanos())
            .map(|n| -n)
            .unwrap_or(i64::MIN),
    }
}

/// Converts Unix nanoseconds back into a `SystemTime`.
#[must_use]
pub fn from_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}
