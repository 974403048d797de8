//! Microsecond wall clock shared by message timestamps and call timers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_usecs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Absolute deadline `millis` milliseconds from now, in microseconds.
pub fn deadline_ms(millis: u64) -> u64 {
    now_usecs() + millis * 1000
}
