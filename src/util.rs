//! Small helpers shared across modules.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Everything except RFC 3986 unreserved characters.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `token=<value>` query pair with the value percent-encoded.
pub fn token_query(token: &str) -> String {
    format!("token={}", utf8_percent_encode(token, QUERY_VALUE))
}

/// Duration as fractional milliseconds.
pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs() as f64 * 1000.0 + f64::from(d.subsec_nanos()) / 1_000_000.0
}

/// Human-friendly "ago" string for a millisecond age.
///
/// - `< 60s` → `"12s ago"`
/// - `< 1h`  → `"5m ago"`
/// - else    → `"3h ago"`
pub fn format_age(age_ms: u64) -> String {
    let secs = age_ms / 1000;
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_age_buckets() {
        assert_eq!(format_age(12_000), "12s ago");
        assert_eq!(format_age(5 * 60_000), "5m ago");
        assert_eq!(format_age(3 * 3_600_000), "3h ago");
    }

    #[test]
    fn token_query_encodes_reserved_characters() {
        assert_eq!(token_query("abc.DEF-1_2~"), "token=abc.DEF-1_2~");
        assert_eq!(token_query("0123456789abc#de&x+y"), "token=0123456789abc%23de%26x%2By");
        assert_eq!(token_query("a b=c/d"), "token=a%20b%3Dc%2Fd");
    }

    #[test]
    fn duration_ms_is_fractional() {
        assert!((duration_ms(Duration::from_micros(1500)) - 1.5).abs() < f64::EPSILON);
    }
}
