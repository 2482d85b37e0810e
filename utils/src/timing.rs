// Helpers for timestamping log lines and input samples
use std::time::{SystemTime, UNIX_EPOCH};

/// Helper to get the current time in milliseconds
pub fn get_current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Error getting system time")
        .as_millis() as u64
}

/// Helper to get the current time in nanoseconds
///
/// Input samples are stamped in nanoseconds so that pose
/// interpolation has enough resolution to work with.
pub fn get_current_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Error getting system time")
        .as_nanos() as i64
}
