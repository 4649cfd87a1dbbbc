//! Time utilities for safe timestamp handling.
//!
//! All stored timestamps are Unix milliseconds (`i64`). Services read the
//! current time through a [`TimeProviderFn`] so tests can substitute a
//! controllable clock.

use crate::credential::error::CredentialError;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A function that provides the current time in Unix milliseconds.
pub type TimeProviderFn = Arc<dyn Fn() -> Result<i64, CredentialError> + Send + Sync>;

/// Get current timestamp in milliseconds since Unix epoch.
///
/// In the extremely rare case where system time is before Unix epoch,
/// it returns an error instead of panicking.
pub fn current_timestamp_millis() -> Result<i64, CredentialError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .map_err(|_| CredentialError::CryptoError("System time is before Unix epoch".to_string()))
}

/// The default time provider, backed by the system clock.
pub fn system_time_provider() -> TimeProviderFn {
    Arc::new(current_timestamp_millis)
}

/// Returns `true` when more than `ttl` has elapsed between `created_at` and
/// `now` (both Unix milliseconds). Exactly `ttl` is still valid.
pub(crate) fn is_expired(created_at: i64, now: i64, ttl: Duration) -> bool {
    now.saturating_sub(created_at) > ttl.as_millis() as i64
}

/// Parses a period such as `10d` into a duration.
///
/// Accepted units: `m` (minutes), `h` (hours), `d` (days), `w` (weeks) and
/// `y` (365-day years).
pub fn parse_period(period: &str) -> Result<Duration, CredentialError> {
    let invalid = || {
        CredentialError::InvalidConfiguration(format!(
            "Invalid period '{period}', expected <number><unit> with unit one of m, h, d, w, y"
        ))
    };

    let unit = period.chars().last().ok_or_else(invalid)?;
    let amount = &period[..period.len() - unit.len_utf8()];
    if amount.is_empty() || !amount.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let amount: u64 = amount.parse().map_err(|_| invalid())?;

    let unit_secs = match unit {
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        'w' => 7 * 24 * 60 * 60,
        'y' => 365 * 24 * 60 * 60,
        _ => return Err(invalid()),
    };

    amount
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_timestamp_millis() {
        let ts = current_timestamp_millis().unwrap();
        // Should be a reasonable timestamp (after year 2020)
        assert!(ts > 1_577_836_800_000);
    }

    #[test]
    fn test_is_expired() {
        let now = current_timestamp_millis().unwrap();
        let ttl = Duration::from_secs(60);

        assert!(!is_expired(now - 10_000, now, ttl));
        assert!(!is_expired(now - 60_000, now, ttl));
        assert!(is_expired(now - 60_001, now, ttl));
        // Clock skew: a record from the future is not expired.
        assert!(!is_expired(now + 5_000, now, ttl));
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_period("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_period("10d").unwrap(), Duration::from_secs(864_000));
        assert_eq!(parse_period("1w").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_period("1y").unwrap(), Duration::from_secs(31_536_000));
    }

    #[test]
    fn test_parse_period_rejects_malformed_input() {
        for bad in ["", "d", "10", "10s", "-1d", "1.5h", "ten d", "10dd"] {
            assert!(
                matches!(
                    parse_period(bad),
                    Err(CredentialError::InvalidConfiguration(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }
}
