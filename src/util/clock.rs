use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock nanoseconds since the Unix epoch, as carried in a packet's `timestamp` field.
///
/// NB: 0 means 'no timestamp' on the wire, so a clock before the epoch is reported as 1
pub fn unix_nanos_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(_) => 1,
    }
}
