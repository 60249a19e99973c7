//! Timestamp helpers.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

static LAST_TOKEN: AtomicI64 = AtomicI64::new(0);

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// # Examples
///
/// ```
/// use deployflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Returns a token derived from the current time in milliseconds.
///
/// Tokens are strictly increasing within a process: two calls in the same
/// millisecond still yield different tokens.
#[must_use]
pub fn time_token() -> String {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_TOKEN.load(Ordering::SeqCst);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_TOKEN.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next.to_string(),
            Err(actual) => last = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_token_strictly_increases() {
        let tokens: Vec<i64> = (0..100)
            .map(|_| time_token().parse().unwrap())
            .collect();
        assert!(tokens.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_time_token_tracks_wall_clock() {
        let token: i64 = time_token().parse().unwrap();
        let now = Utc::now().timestamp_millis();
        // Within a generous window of the wall clock
        assert!((now - token).abs() < 60_000);
    }
}
