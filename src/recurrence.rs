//! Interval normalisation and weekly expansion.
//!
//! Recurrence is wall-clock based: each weekly occurrence keeps the local
//! start/end time of the first one in the configured zone, so the UTC offset
//! between consecutive occurrences changes across DST transitions.

use chrono::{Days, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::*;

/// Validate `[start, end)` and expand it into the occurrence sequence the
/// recurrence asks for. The result is strictly ordered by start.
pub fn expand_occurrences(
    start: Ts,
    end: Ts,
    recurrence: Recurrence,
    tz: Tz,
    max_duration: TimeDelta,
) -> Result<Vec<Span>, EngineError> {
    let first = validate_interval(start, end, max_duration)?;

    let count = recurrence.occurrence_count();
    if !(1..=MAX_OCCURRENCES).contains(&count) {
        return Err(EngineError::InvalidRecurrence {
            count,
            max: MAX_OCCURRENCES,
        });
    }

    let mut out = Vec::with_capacity(count as usize);
    out.push(first);
    for week in 1..count {
        let shifted_start = shift_weeks(first.start, week, tz)
            .ok_or_else(|| EngineError::InvalidInterval("recurrence runs past supported dates".into()))?;
        // A gap can swallow the end wall-clock time; keep the original length then.
        let shifted_end = shift_weeks(first.end, week, tz)
            .filter(|e| *e > shifted_start)
            .unwrap_or(shifted_start + first.duration());
        let occ = validate_interval(shifted_start, shifted_end, max_duration)?;
        out.push(occ);
    }
    Ok(out)
}

pub fn validate_interval(start: Ts, end: Ts, max_duration: TimeDelta) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or_else(|| {
        EngineError::InvalidInterval(format!(
            "start {} must be before end {}",
            start.to_rfc3339(),
            end.to_rfc3339()
        ))
    })?;
    if span.duration() > max_duration {
        return Err(EngineError::InvalidInterval(format!(
            "duration {}m exceeds maximum {}m",
            span.duration().num_minutes(),
            max_duration.num_minutes()
        )));
    }
    Ok(span)
}

/// Move `t` forward by `weeks` weeks keeping its local wall-clock time in `tz`.
pub fn shift_weeks(t: Ts, weeks: u32, tz: Tz) -> Option<Ts> {
    let local = t.with_timezone(&tz).naive_local();
    let target = local.checked_add_days(Days::new(7 * u64::from(weeks)))?;
    Some(resolve_local(target, tz))
}

/// Map a local wall-clock time to UTC.
///
/// Ambiguous times (DST fall-back) take the earlier instant. Times inside a
/// gap (spring-forward) move to the first valid instant after it.
pub fn resolve_local(naive: NaiveDateTime, tz: Tz) -> Ts {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // The offset in effect before the gap maps the missing wall-clock
            // time onto the instant the clocks jumped at (or just after it).
            let before = tz
                .offset_from_utc_datetime(&(naive - TimeDelta::days(1)))
                .fix()
                .local_minus_utc();
            Utc.from_utc_datetime(&(naive - TimeDelta::seconds(i64::from(before))))
        }
    }
}

/// The local calendar day `date` in `tz` as a UTC span (23/24/25 hours long).
pub fn day_bounds(date: NaiveDate, tz: Tz) -> Span {
    let start = resolve_local(date.and_time(NaiveTime::MIN), tz);
    let next = date.succ_opt().unwrap_or(date);
    let end = resolve_local(next.and_time(NaiveTime::MIN), tz);
    Span::try_new(start, end).unwrap_or(Span {
        start,
        end: start + TimeDelta::days(1),
    })
}

/// Local calendar date of `now` in `tz`.
pub fn local_date(now: Ts, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// A listing window requested by a `query` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryWindow {
    Day(NaiveDate),
    Days { from: NaiveDate, days: i64 },
}

impl QueryWindow {
    /// Accepts `today`, `tomorrow`, `weekly`, or `YYYY-MM-DD`. Empty means today.
    pub fn parse(text: &str, today: NaiveDate) -> Result<Self, EngineError> {
        match text.trim() {
            "" | "today" => Ok(QueryWindow::Day(today)),
            "tomorrow" => today
                .succ_opt()
                .map(QueryWindow::Day)
                .ok_or_else(|| EngineError::invalid("when", "date out of range")),
            "weekly" => Ok(QueryWindow::Days {
                from: today,
                days: WEEKLY_QUERY_DAYS,
            }),
            other => NaiveDate::parse_from_str(other, "%Y-%m-%d")
                .map(QueryWindow::Day)
                .map_err(|_| {
                    EngineError::invalid("when", "expected today, tomorrow, weekly or YYYY-MM-DD")
                }),
        }
    }

    pub fn span(&self, tz: Tz) -> Span {
        match *self {
            QueryWindow::Day(date) => day_bounds(date, tz),
            QueryWindow::Days { from, days } => {
                let days = days.clamp(1, MAX_QUERY_DAYS);
                let first = day_bounds(from, tz);
                let last_day = from
                    .checked_add_days(Days::new((days - 1) as u64))
                    .unwrap_or(from);
                Span {
                    start: first.start,
                    end: day_bounds(last_day, tz).end,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    fn max() -> TimeDelta {
        TimeDelta::minutes(DEFAULT_MAX_DURATION_MINUTES)
    }

    fn local(tz: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ts {
        tz.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn single_occurrence_passthrough() {
        let tz = chrono_tz::UTC;
        let s = local(tz, 2024, 1, 15, 10, 0);
        let e = local(tz, 2024, 1, 15, 11, 0);
        let out = expand_occurrences(s, e, Recurrence::None, tz, max()).unwrap();
        assert_eq!(out, vec![Span::new(s, e)]);
    }

    #[test]
    fn weekly_count_and_spacing() {
        let tz = chrono_tz::Asia::Seoul;
        let s = local(tz, 2024, 1, 15, 10, 0);
        let e = local(tz, 2024, 1, 15, 11, 0);
        for n in 1..=MAX_OCCURRENCES {
            let out = expand_occurrences(s, e, Recurrence::Weekly { count: n }, tz, max()).unwrap();
            assert_eq!(out.len(), n as usize);
            for pair in out.windows(2) {
                assert!(pair[0].start < pair[1].start);
                assert_eq!(pair[1].start - pair[0].start, TimeDelta::days(7));
            }
        }
    }

    #[test]
    fn weekly_preserves_wall_clock_across_dst() {
        let tz = chrono_tz::America::New_York;
        // 2024-03-10 is the spring-forward date in New York.
        let s = local(tz, 2024, 3, 4, 10, 0);
        let e = local(tz, 2024, 3, 4, 11, 30);
        let out = expand_occurrences(s, e, Recurrence::Weekly { count: 3 }, tz, max()).unwrap();

        for occ in &out {
            let ls = occ.start.with_timezone(&tz);
            let le = occ.end.with_timezone(&tz);
            assert_eq!((ls.hour(), ls.minute()), (10, 0));
            assert_eq!((le.hour(), le.minute()), (11, 30));
            assert_eq!(ls.weekday(), chrono::Weekday::Mon);
        }
        // Only 167 real hours between the first two occurrences.
        assert_eq!(out[1].start - out[0].start, TimeDelta::hours(7 * 24 - 1));
    }

    #[test]
    fn recurrence_bounds() {
        let tz = chrono_tz::UTC;
        let s = local(tz, 2024, 1, 15, 10, 0);
        let e = local(tz, 2024, 1, 15, 11, 0);
        for bad in [0, MAX_OCCURRENCES + 1] {
            let err = expand_occurrences(s, e, Recurrence::Weekly { count: bad }, tz, max()).unwrap_err();
            assert!(matches!(err, EngineError::InvalidRecurrence { count, .. } if count == bad));
        }
    }

    #[test]
    fn invalid_intervals_rejected() {
        let tz = chrono_tz::UTC;
        let s = local(tz, 2024, 1, 15, 10, 0);
        let err = expand_occurrences(s, s, Recurrence::None, tz, max()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInterval(_)));

        let before = local(tz, 2024, 1, 15, 9, 0);
        let err = expand_occurrences(s, before, Recurrence::None, tz, max()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInterval(_)));

        let too_long = s + TimeDelta::hours(13);
        let err = expand_occurrences(s, too_long, Recurrence::None, tz, max()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInterval(_)));
    }

    #[test]
    fn start_inside_gap_keeps_duration() {
        let tz = chrono_tz::Europe::Berlin;
        // 2024-03-31 02:00–03:00 does not exist in Berlin.
        let s = local(tz, 2024, 3, 24, 2, 30);
        let e = local(tz, 2024, 3, 24, 3, 30);
        let out = expand_occurrences(s, e, Recurrence::Weekly { count: 2 }, tz, max()).unwrap();
        assert_eq!(out[1].duration(), TimeDelta::hours(1));
        assert!(out[1].start > out[0].start);
        let ls = out[1].start.with_timezone(&tz);
        assert_eq!((ls.day(), ls.hour(), ls.minute()), (31, 3, 30));
    }

    #[test]
    fn ambiguous_time_takes_earliest() {
        let tz = chrono_tz::America::New_York;
        let naive = NaiveDate::from_ymd_opt(2024, 11, 3)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        let t = resolve_local(naive, tz);
        // EDT (UTC-4) is the earlier of the two readings.
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap());
    }

    #[test]
    fn day_bounds_handle_short_days() {
        let tz = chrono_tz::Europe::Berlin;
        let date = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let day = day_bounds(date, tz);
        assert_eq!(day.duration(), TimeDelta::hours(23));
        assert_eq!(day.start, Utc.with_ymd_and_hms(2024, 3, 30, 23, 0, 0).unwrap());
    }

    #[test]
    fn query_window_parsing() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(QueryWindow::parse("", today).unwrap(), QueryWindow::Day(today));
        assert_eq!(QueryWindow::parse("today", today).unwrap(), QueryWindow::Day(today));
        assert_eq!(
            QueryWindow::parse("tomorrow", today).unwrap(),
            QueryWindow::Day(NaiveDate::from_ymd_opt(2024, 1, 16).unwrap())
        );
        assert_eq!(
            QueryWindow::parse(" 2024-02-01 ", today).unwrap(),
            QueryWindow::Day(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap())
        );
        assert!(QueryWindow::parse("next tuesday", today).is_err());

        let weekly = QueryWindow::parse("weekly", today).unwrap();
        let span = weekly.span(chrono_tz::UTC);
        assert_eq!(span.duration(), TimeDelta::days(WEEKLY_QUERY_DAYS));
    }
}
