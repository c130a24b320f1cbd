//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Out-of-range values clamp instead of panicking.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            if ms.is_negative() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            }
        }
    }
}

/// Monday 00:00 of the week containing `now`, in `tz`, as epoch milliseconds.
pub fn start_of_week_ms(now: DateTime<Utc>, tz: Tz) -> i64 {
    let local = now.with_timezone(&tz);
    let days_from_monday = i64::from(local.weekday().num_days_from_monday());
    let monday = local.date_naive() - Duration::days(days_from_monday);
    let midnight = monday.and_time(NaiveTime::MIN);

    match tz.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) => dt.timestamp_millis(),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        // Midnight skipped by a DST jump; fall back to the UTC reading.
        chrono::LocalResult::None => midnight.and_utc().timestamp_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_roundtrip() {
        let dt = ms_to_datetime(1_700_000_000_000);
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_start_of_week_seoul() {
        // 2025-06-04 is a Wednesday. 10:00 UTC is 19:00 in Seoul.
        let now = Utc.with_ymd_and_hms(2025, 6, 4, 10, 0, 0).unwrap();
        let start = start_of_week_ms(now, chrono_tz::Asia::Seoul);
        // Monday 2025-06-02 00:00 KST == 2025-06-01 15:00 UTC.
        let expected = Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap();
        assert_eq!(start, expected.timestamp_millis());
    }

    #[test]
    fn test_start_of_week_on_monday_is_same_day() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 0, 30, 0).unwrap();
        let start = start_of_week_ms(now, chrono_tz::UTC);
        let expected = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        assert_eq!(start, expected.timestamp_millis());
    }
}
