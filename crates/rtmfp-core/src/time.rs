//! Scaled 16-bit timestamps
//!
//! Packet headers carry the sender's clock divided by [`TIMESTAMP_SCALE`] and
//! truncated to 16 bits, so the value wraps every 2^16 * 4 ms (about 262 s).
//! Timestamps are only meaningful as short deltas; compare them with
//! [`compare`] or [`elapsed`], never with plain subtraction.

use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::TIMESTAMP_SCALE;

/// Scaled wire timestamp
pub type Timestamp = u16;

/// Milliseconds covered by one full wrap
pub const WRAP_PERIOD_MS: i64 = (1 << 16) * TIMESTAMP_SCALE;

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Scale a millisecond clock reading to a wire timestamp
pub fn time(ms: i64) -> Timestamp {
    ((ms / TIMESTAMP_SCALE) & 0xFFFF) as Timestamp
}

/// Wire timestamp for the current time
pub fn time_now() -> Timestamp {
    time(now_ms())
}

/// Wire timestamp for a duration, e.g. the time since an echo was received
pub fn from_duration(duration: Duration) -> Timestamp {
    time(duration.as_millis() as i64)
}

/// Units elapsed from `older` to `newer`, across at most one wrap
pub fn elapsed(newer: Timestamp, older: Timestamp) -> Timestamp {
    newer.wrapping_sub(older)
}

/// Order two timestamps known to be within half a wrap period of each other
pub fn compare(a: Timestamp, b: Timestamp) -> Ordering {
    let diff = a.wrapping_sub(b) as i16;
    diff.cmp(&0)
}

/// Convert a wire delta back to milliseconds
pub fn to_millis(units: Timestamp) -> u64 {
    units as u64 * TIMESTAMP_SCALE as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale() {
        assert_eq!(time(0), 0);
        assert_eq!(time(3), 0);
        assert_eq!(time(4), 1);
        assert_eq!(time(1000), 250);
    }

    #[test]
    fn test_compare_across_wrap() {
        assert_eq!(compare(2, 0xFFFE), Ordering::Greater);
        assert_eq!(compare(0xFFFE, 2), Ordering::Less);
        assert_eq!(compare(7, 7), Ordering::Equal);
    }

    #[test]
    fn test_elapsed_across_wrap() {
        assert_eq!(elapsed(3, 0xFFFF), 4);
        assert_eq!(to_millis(elapsed(3, 0xFFFF)), 16);
    }
}
