//! Conversions between engine instants (`Ms`) and wall-clock time in a zone.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::Ms;

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Wall-clock view of an instant. Out-of-range instants clamp to the epoch.
pub fn to_local(ms: Ms, tz: Tz) -> DateTime<Tz> {
    DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .with_timezone(&tz)
}

pub fn local_date(ms: Ms, tz: Tz) -> NaiveDate {
    to_local(ms, tz).date_naive()
}

/// Instant of a local wall-clock time.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times inside a
/// spring-forward gap are shifted forward by the gap, so 02:30 on a day that
/// jumps from 02:00 to 03:00 becomes 03:30.
pub fn resolve_local(naive: NaiveDateTime, tz: Tz) -> Ms {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.timestamp_millis())
                .unwrap_or_else(|| naive.and_utc().timestamp_millis())
        }
    }
}

/// Start of a local calendar day.
pub fn start_of_day(date: NaiveDate, tz: Tz) -> Ms {
    resolve_local(date.and_time(chrono::NaiveTime::MIN), tz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Timelike};

    fn naive(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_time(NaiveTime::from_hms_opt(h, min, 0).unwrap())
    }

    #[test]
    fn utc_roundtrip() {
        let ms = resolve_local(naive(2026, 3, 2, 9, 0), Tz::UTC);
        assert_eq!(to_local(ms, Tz::UTC).hour(), 9);
    }

    #[test]
    fn spring_forward_gap_shifts_forward() {
        // Berlin jumps 02:00 -> 03:00 on 2026-03-29.
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let ms = resolve_local(naive(2026, 3, 29, 2, 30), tz);
        let local = to_local(ms, tz);
        assert_eq!((local.hour(), local.minute()), (3, 30));
    }

    #[test]
    fn fall_back_takes_earliest() {
        // Berlin repeats 02:00-03:00 on 2026-10-25; first pass is still CEST (+2).
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let ms = resolve_local(naive(2026, 10, 25, 2, 30), tz);
        assert_eq!(ms, resolve_local(naive(2026, 10, 25, 0, 30), Tz::UTC));
    }
}
