//! Window math for time-boxed binary markets.
//!
//! Every market settles on a fixed wall-clock bucket (15 minutes or one
//! hour). All functions here are pure: wall-clock in, window facts out.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Settlement cadence of a market series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "15m")]
    FifteenMinute,
    #[serde(rename = "hourly")]
    Hourly,
}

impl Granularity {
    /// Window length in seconds.
    pub fn period_secs(&self) -> u32 {
        match self {
            Granularity::FifteenMinute => 900,
            Granularity::Hourly => 3600,
        }
    }
}

/// Start of the window containing `now`.
pub fn window_start(now: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    let minute = match granularity {
        Granularity::FifteenMinute => (now.minute() / 15) * 15,
        Granularity::Hourly => 0,
    };

    now.with_minute(minute)
        .unwrap()
        .with_second(0)
        .unwrap()
        .with_nanosecond(0)
        .unwrap()
}

/// End of the window containing `now` (= start of the next window).
pub fn window_end(now: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    window_start(now, granularity) + chrono::Duration::seconds(granularity.period_secs() as i64)
}

/// Opaque key identifying the window containing `now`.
///
/// Keys sort lexicographically in wall-clock order. A position's window key
/// is fixed at entry time and never recomputed.
pub fn window_key(now: DateTime<Utc>, granularity: Granularity) -> String {
    window_start(now, granularity).format("%Y%m%d-%H%M").to_string()
}

/// Seconds elapsed since the window opened.
pub fn seconds_elapsed(now: DateTime<Utc>, granularity: Granularity) -> u32 {
    let elapsed = now.signed_duration_since(window_start(now, granularity));
    elapsed.num_seconds().max(0) as u32
}

/// Seconds until the window settles.
pub fn seconds_remaining(now: DateTime<Utc>, granularity: Granularity) -> u32 {
    granularity
        .period_secs()
        .saturating_sub(seconds_elapsed(now, granularity))
}

/// Minutes until the window settles, fractional.
pub fn minutes_remaining(now: DateTime<Utc>, granularity: Granularity) -> f64 {
    seconds_remaining(now, granularity) as f64 / 60.0
}

/// Exchange ticker for a market series in the window containing `now`,
/// e.g. `BTC-15M-20260806-1415`.
pub fn ticker_for_window(series: &str, now: DateTime<Utc>, granularity: Granularity) -> String {
    format!("{}-{}", series, window_key(now, granularity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_start_quarter_hour() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 14, 22, 31).unwrap();
        let start = window_start(now, Granularity::FifteenMinute);
        assert_eq!(start.minute(), 15);
        assert_eq!(start.second(), 0);
    }

    #[test]
    fn test_window_start_hourly() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 14, 59, 59).unwrap();
        let start = window_start(now, Granularity::Hourly);
        assert_eq!(start.minute(), 0);
        assert_eq!(start.hour(), 14);
    }

    #[test]
    fn test_window_key_is_stable_within_window() {
        let a = Utc.with_ymd_and_hms(2026, 8, 6, 14, 15, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 8, 6, 14, 29, 59).unwrap();
        assert_eq!(
            window_key(a, Granularity::FifteenMinute),
            window_key(b, Granularity::FifteenMinute)
        );
        assert_eq!(window_key(a, Granularity::FifteenMinute), "20260806-1415");
    }

    #[test]
    fn test_window_key_changes_on_rollover() {
        let a = Utc.with_ymd_and_hms(2026, 8, 6, 14, 29, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 8, 6, 14, 30, 0).unwrap();
        assert_ne!(
            window_key(a, Granularity::FifteenMinute),
            window_key(b, Granularity::FifteenMinute)
        );
    }

    #[test]
    fn test_keys_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2026, 8, 6, 9, 45, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 8, 6, 10, 0, 0).unwrap();
        assert!(
            window_key(early, Granularity::FifteenMinute)
                < window_key(late, Granularity::FifteenMinute)
        );
    }

    #[test]
    fn test_seconds_remaining() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 14, 10, 0).unwrap();
        assert_eq!(seconds_remaining(now, Granularity::FifteenMinute), 300);
        assert_eq!(seconds_remaining(now, Granularity::Hourly), 3000);
    }

    #[test]
    fn test_minutes_remaining() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 14, 13, 30).unwrap();
        let m = minutes_remaining(now, Granularity::FifteenMinute);
        assert!((m - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_ticker_for_window() {
        let now = Utc.with_ymd_and_hms(2026, 8, 6, 14, 22, 0).unwrap();
        assert_eq!(
            ticker_for_window("BTC-15M", now, Granularity::FifteenMinute),
            "BTC-15M-20260806-1415"
        );
        assert_eq!(
            ticker_for_window("BTC-1H", now, Granularity::Hourly),
            "BTC-1H-20260806-1400"
        );
    }
}
