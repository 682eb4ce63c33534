//! Timezone engine
//!
//! Computes the UTC instant of 09:00 local time in a user's IANA zone and
//! decides whether a stored event date falls "today" in that zone. DST gaps
//! and ambiguities are resolved by fixed, deterministic policies; an
//! unresolvable zone is always an error, never silently UTC.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{DeliveryError, DeliveryResult};

/// Parse an IANA timezone string (e.g., "America/New_York", "Asia/Singapore")
pub fn parse_timezone(tz_str: &str) -> DeliveryResult<Tz> {
    tz_str
        .parse::<Tz>()
        .map_err(|_| DeliveryError::InvalidZone(tz_str.to_string()))
}

/// Validate that a timezone string resolves
pub fn validate_timezone(tz_str: &str) -> DeliveryResult<()> {
    parse_timezone(tz_str)?;
    Ok(())
}

/// Resolve a naive local wall-clock time in `tz` to a UTC instant.
///
/// Policies:
/// - ambiguous (clocks fell back): the earlier, pre-transition occurrence
/// - nonexistent (clocks jumped forward): the first valid instant at or after
///   the requested wall-clock time, scanning forward in one-minute steps
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _later) => Some(earlier.with_timezone(&Utc)),
        LocalResult::None => {
            // Skipped wall-clock time. Real offset transitions are at most a
            // few hours; a 48h scan also covers zones that skipped an entire
            // calendar day (e.g. Pacific/Apia on 2011-12-30).
            let mut candidate = local;
            for _ in 0..(48 * 60) {
                candidate += Duration::minutes(1);
                if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
                    return Some(dt.with_timezone(&Utc));
                }
            }
            None
        }
    }
}

/// The UTC instant of 09:00:00 local on `date` in IANA zone `tz_str`
pub fn nine_am_local_to_utc(date: NaiveDate, tz_str: &str) -> DeliveryResult<DateTime<Utc>> {
    let tz = parse_timezone(tz_str)?;
    let local = date
        .and_hms_opt(9, 0, 0)
        .ok_or(DeliveryError::UnmappableLocalTime {
            date,
            zone: tz_str.to_string(),
        })?;
    resolve_local(tz, local).ok_or(DeliveryError::UnmappableLocalTime {
        date,
        zone: tz_str.to_string(),
    })
}

/// The calendar day on which an event stored as `event_date` is observed in
/// `year`. Feb-29 events are observed on Feb-28 in non-leap years.
pub fn event_day_in_year(event_date: NaiveDate, year: i32) -> DeliveryResult<NaiveDate> {
    let (month, day) = (event_date.month(), event_date.day());
    if let Some(d) = NaiveDate::from_ymd_opt(year, month, day) {
        return Ok(d);
    }
    if (month, day) == (2, 29) {
        return NaiveDate::from_ymd_opt(year, 2, 28)
            .ok_or(DeliveryError::InvalidEventDate { year, month, day });
    }
    Err(DeliveryError::InvalidEventDate { year, month, day })
}

/// True iff the event is observed today, where "today" is `now` rendered in
/// the user's zone
pub fn is_event_today(
    event_date: NaiveDate,
    tz_str: &str,
    now: DateTime<Utc>,
) -> DeliveryResult<bool> {
    let tz = parse_timezone(tz_str)?;
    let today_local = now.with_timezone(&tz).date_naive();
    let observed = event_day_in_year(event_date, today_local.year())?;
    Ok(observed == today_local)
}

/// Today's calendar date as seen from `tz_str`
pub fn today_in_zone(tz_str: &str, now: DateTime<Utc>) -> DeliveryResult<NaiveDate> {
    let tz = parse_timezone(tz_str)?;
    Ok(now.with_timezone(&tz).date_naive())
}

/// UTC offset of `tz_str` at `instant`, in minutes. For observability and
/// assertions.
pub fn offset_minutes(instant: DateTime<Utc>, tz_str: &str) -> DeliveryResult<i32> {
    let tz = parse_timezone(tz_str)?;
    Ok(instant.with_timezone(&tz).offset().fix().local_minus_utc() / 60)
}

/// The (month, day) pairs that are "today" somewhere on Earth at `now`.
///
/// Local "today" across all zones spans the current UTC date ± 14 hours, so
/// the three UTC-adjacent calendar dates cover every zone. When one of those
/// dates is Feb-28 of a non-leap year, Feb-29 is added so that leap-day
/// events surface as candidates; the per-user [`is_event_today`] check makes
/// the final call.
pub fn candidate_month_days(now: DateTime<Utc>) -> Vec<(u32, u32)> {
    let today = now.date_naive();
    let mut out = Vec::with_capacity(4);
    for date in [today - Duration::days(1), today, today + Duration::days(1)] {
        let pair = (date.month(), date.day());
        if !out.contains(&pair) {
            out.push(pair);
        }
        if pair == (2, 28) && !is_leap_year(date.year()) && !out.contains(&(2, 29)) {
            out.push((2, 29));
        }
    }
    out
}

fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_parse_timezone_valid() {
        assert!(parse_timezone("America/New_York").is_ok());
        assert!(parse_timezone("Asia/Singapore").is_ok());
    }

    #[test]
    fn test_parse_timezone_invalid() {
        match parse_timezone("Invalid/Timezone") {
            Err(DeliveryError::InvalidZone(s)) => assert_eq!(s, "Invalid/Timezone"),
            other => panic!("Expected InvalidZone error, got {other:?}"),
        }
    }

    #[test]
    fn test_nine_am_new_york_summer() {
        // EDT is UTC-4: 09:00 local = 13:00 UTC
        let instant = nine_am_local_to_utc(date(2025, 6, 15), "America/New_York").unwrap();
        assert_eq!(instant, utc(2025, 6, 15, 13, 0));
    }

    #[test]
    fn test_nine_am_across_spring_forward() {
        // US DST springs forward 2025-03-09 (02:00 -> 03:00); 09:00 is
        // unambiguous but the offset shifts from EST to EDT overnight.
        let before = nine_am_local_to_utc(date(2025, 3, 8), "America/New_York").unwrap();
        let after = nine_am_local_to_utc(date(2025, 3, 9), "America/New_York").unwrap();
        assert_eq!(before, utc(2025, 3, 8, 14, 0));
        assert_eq!(after, utc(2025, 3, 9, 13, 0));
    }

    #[test]
    fn test_nine_am_half_hour_zone() {
        // IST is UTC+5:30
        let instant = nine_am_local_to_utc(date(2025, 6, 15), "Asia/Kolkata").unwrap();
        assert_eq!(instant, utc(2025, 6, 15, 3, 30));
    }

    #[test]
    fn test_nine_am_skipped_day_takes_first_valid_instant() {
        // Samoa skipped 2011-12-30 entirely when crossing the date line.
        // Policy: first valid instant at or after the requested wall clock,
        // which is 2011-12-31 00:00 local (UTC+14) = 2011-12-30 10:00 UTC.
        let instant = nine_am_local_to_utc(date(2011, 12, 30), "Pacific/Apia").unwrap();
        assert_eq!(instant, utc(2011, 12, 30, 10, 0));
    }

    #[test]
    fn test_ambiguous_wall_clock_resolves_to_earlier() {
        // US DST falls back 2025-11-02; 01:30 local occurs twice.
        // The earlier (EDT, UTC-4) occurrence wins: 05:30 UTC.
        let tz: Tz = "America/New_York".parse().unwrap();
        let local = date(2025, 11, 2).and_hms_opt(1, 30, 0).unwrap();
        let resolved = resolve_local(tz, local).unwrap();
        assert_eq!(resolved, utc(2025, 11, 2, 5, 30));
    }

    #[test]
    fn test_gap_wall_clock_scans_forward() {
        // 02:30 does not exist on 2025-03-09 in New York; the first valid
        // instant is 03:00 EDT = 07:00 UTC.
        let tz: Tz = "America/New_York".parse().unwrap();
        let local = date(2025, 3, 9).and_hms_opt(2, 30, 0).unwrap();
        let resolved = resolve_local(tz, local).unwrap();
        assert_eq!(resolved, utc(2025, 3, 9, 7, 0));
    }

    #[test]
    fn test_event_day_leap_fallback() {
        let leap_event = date(1992, 2, 29);
        assert_eq!(event_day_in_year(leap_event, 2024).unwrap(), date(2024, 2, 29));
        assert_eq!(event_day_in_year(leap_event, 2025).unwrap(), date(2025, 2, 28));
    }

    #[test]
    fn test_is_event_today_basic() {
        let event = date(1990, 6, 15);
        let now = utc(2025, 6, 15, 12, 0);
        assert!(is_event_today(event, "UTC", now).unwrap());
        assert!(!is_event_today(event, "UTC", utc(2025, 6, 16, 12, 0)).unwrap());
    }

    #[test]
    fn test_is_event_today_respects_user_zone() {
        // 2025-06-15 23:30 UTC is already June 16 in Tokyo
        let event = date(1990, 6, 16);
        let now = utc(2025, 6, 15, 23, 30);
        assert!(is_event_today(event, "Asia/Tokyo", now).unwrap());
        assert!(!is_event_today(event, "UTC", now).unwrap());
    }

    #[test]
    fn test_is_event_today_leap_day() {
        let event = date(1992, 2, 29);
        // Observed on Feb-29 in leap years
        assert!(is_event_today(event, "UTC", utc(2024, 2, 29, 12, 0)).unwrap());
        // Observed on Feb-28 in non-leap years
        assert!(is_event_today(event, "UTC", utc(2025, 2, 28, 12, 0)).unwrap());
        // Never on Mar-01, and not on Feb-28 of a leap year
        assert!(!is_event_today(event, "UTC", utc(2025, 3, 1, 12, 0)).unwrap());
        assert!(!is_event_today(event, "UTC", utc(2024, 2, 28, 12, 0)).unwrap());
    }

    #[test]
    fn test_offset_minutes() {
        let summer = utc(2025, 6, 15, 12, 0);
        let winter = utc(2025, 1, 15, 12, 0);
        assert_eq!(offset_minutes(summer, "America/New_York").unwrap(), -240);
        assert_eq!(offset_minutes(winter, "America/New_York").unwrap(), -300);
        assert_eq!(offset_minutes(summer, "Asia/Kolkata").unwrap(), 330);
    }

    #[test]
    fn test_candidate_month_days_covers_adjacent_dates() {
        let pairs = candidate_month_days(utc(2025, 6, 15, 0, 0));
        assert_eq!(pairs, vec![(6, 14), (6, 15), (6, 16)]);
    }

    #[test]
    fn test_candidate_month_days_includes_leap_day_on_feb_28() {
        let pairs = candidate_month_days(utc(2025, 2, 28, 12, 0));
        assert!(pairs.contains(&(2, 28)));
        assert!(pairs.contains(&(2, 29)));
        assert!(pairs.contains(&(3, 1)));
    }

    #[test]
    fn test_candidate_month_days_year_boundary() {
        let pairs = candidate_month_days(utc(2025, 1, 1, 2, 0));
        assert_eq!(pairs, vec![(12, 31), (1, 1), (1, 2)]);
    }

    #[test]
    fn test_resolved_instants_are_nine_local() {
        // Sanity: rendering the resolved instant back into the zone shows 9am
        for zone in ["Europe/London", "Australia/Lord_Howe", "Pacific/Auckland"] {
            let instant = nine_am_local_to_utc(date(2025, 6, 15), zone).unwrap();
            let tz: Tz = zone.parse().unwrap();
            assert_eq!(instant.with_timezone(&tz).hour(), 9, "zone {zone}");
        }
    }
}
