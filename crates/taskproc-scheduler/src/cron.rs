//! Six-field cron evaluation: `sec min hour day-of-month month day-of-week`.
//!
//! Fields accept `*`, values, `a-b` ranges, `*/n` / `a/n` / `a-b/n` steps and
//! comma lists. `?` means "no restriction" in the two day fields. Months take
//! `JAN`..`DEC`, weekdays `SUN`..`SAT`; weekday numbers run 0-7 with both 0 and
//! 7 meaning Sunday. When both day fields are restricted a day matches if
//! either one does.
//!
//! Evaluation happens in local civil time of the schedule's zone. A matching
//! local time that falls into a DST gap fires at the first instant after the
//! gap; a local time repeated by a fall-back overlap fires once, at its
//! earlier occurrence.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

/// How far ahead a search may look before the expression is declared dead.
/// Ten years covers Feb 29 across a skipped century leap year.
const SEARCH_YEARS: i64 = 10;

/// Longest stretch of non-existent local time we step across.
const MAX_GAP_MINUTES: i64 = 24 * 60;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Symbolic names, the first one mapping to `min`.
    names: &'static [&'static str],
    /// Whether `?` is accepted.
    day_field: bool,
}

const SECONDS: FieldSpec = FieldSpec { name: "seconds", min: 0, max: 59, names: &[], day_field: false };
const MINUTES: FieldSpec = FieldSpec { name: "minutes", min: 0, max: 59, names: &[], day_field: false };
const HOURS: FieldSpec = FieldSpec { name: "hours", min: 0, max: 23, names: &[], day_field: false };
const DAYS_OF_MONTH: FieldSpec =
    FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], day_field: true };
const MONTHS: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, day_field: false };
const DAYS_OF_WEEK: FieldSpec =
    FieldSpec { name: "day-of-week", min: 0, max: 7, names: &WEEKDAY_NAMES, day_field: true };

/// A parsed cron expression. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    /// Bit 0 = Sunday.
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| SchedulerError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(invalid(format!("expected 6 fields, found {}", fields.len())));
        }

        let (seconds, _) = parse_field(fields[0], &SECONDS).map_err(invalid)?;
        let (minutes, _) = parse_field(fields[1], &MINUTES).map_err(invalid)?;
        let (hours, _) = parse_field(fields[2], &HOURS).map_err(invalid)?;
        let (days_of_month, dom_restricted) = parse_field(fields[3], &DAYS_OF_MONTH).map_err(invalid)?;
        let (months, _) = parse_field(fields[4], &MONTHS).map_err(invalid)?;
        let (mut days_of_week, dow_restricted) = parse_field(fields[5], &DAYS_OF_WEEK).map_err(invalid)?;

        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: expression.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`, evaluated in `zone`.
    ///
    /// `None` when the expression has no occurrence within the search horizon
    /// (e.g. February 30th).
    pub fn next_after(&self, zone: &ScheduleZone, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match zone {
            ScheduleZone::Named(tz) => self.next_after_in(tz, after),
            ScheduleZone::Fixed(offset) => self.next_after_in(offset, after),
        }
    }

    fn next_after_in<Z: TimeZone>(&self, tz: &Z, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after.date_naive() + Duration::days(366 * SEARCH_YEARS);
        let mut cursor = after.with_timezone(tz).naive_local();

        loop {
            let candidate = self.next_local(cursor, limit)?;
            let instant = match tz.from_local_datetime(&candidate) {
                LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
                // Fall-back overlap: only the earlier occurrence counts.
                LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
                LocalResult::None => first_instant_after_gap(tz, candidate),
            };
            if let Some(instant) = instant.filter(|i| *i > after) {
                return Some(instant);
            }
            cursor = candidate;
        }
    }

    /// Next matching local wall-clock time strictly after `after`.
    fn next_local(&self, after: NaiveDateTime, limit: NaiveDate) -> Option<NaiveDateTime> {
        let mut t = after.with_nanosecond(0)? + Duration::seconds(1);

        loop {
            if t.date() > limit {
                return None;
            }
            if !has_bit(self.months, t.month()) {
                let (y, m) = if t.month() == 12 { (t.year() + 1, 1) } else { (t.year(), t.month() + 1) };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has_bit(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !has_bit(self.minutes, t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !has_bit(self.seconds, t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has_bit(self.days_of_month, date.day());
        let dow = has_bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Zone a schedule's fields are evaluated in: an IANA zone or a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl ScheduleZone {
    pub fn utc() -> Self {
        ScheduleZone::Named(Tz::UTC)
    }

    /// Accepts IANA names (`Europe/Budapest`, `UTC`) and offsets (`+02:00`).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(tz) = s.parse::<Tz>() {
            return Ok(ScheduleZone::Named(tz));
        }
        if s.starts_with('+') || s.starts_with('-') {
            if let Ok(offset) = s.parse::<FixedOffset>() {
                return Ok(ScheduleZone::Fixed(offset));
            }
        }
        Err(SchedulerError::InvalidTimezone(s.to_string()))
    }
}

impl Default for ScheduleZone {
    fn default() -> Self {
        Self::utc()
    }
}

impl FromStr for ScheduleZone {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ScheduleZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleZone::Named(tz) => write!(f, "{}", tz.name()),
            ScheduleZone::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}

/// Compute the next fire time for `expression` in `timezone` strictly after
/// `after`. Stateless; safe to call from anywhere.
pub fn next_fire_time(expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = CronExpression::parse(expression)?;
    let zone = ScheduleZone::parse(timezone)?;
    cron.next_after(&zone, after)
        .ok_or_else(|| SchedulerError::InvalidCronExpression {
            expression: expression.to_string(),
            reason: format!("no fire time after {after}"),
        })
}

fn first_instant_after_gap<Z: TimeZone>(tz: &Z, inside_gap: NaiveDateTime) -> Option<DateTime<Utc>> {
    let mut t = inside_gap.with_second(0)?;
    for _ in 0..MAX_GAP_MINUTES {
        t += Duration::minutes(1);
        match tz.from_local_datetime(&t) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => return Some(dt.with_timezone(&Utc)),
            LocalResult::None => {}
        }
    }
    None
}

fn has_bit(bits: u64, value: u32) -> bool {
    bits & (1u64 << value) != 0
}

/// Parse one field into a bitset. The flag is false when the field does not
/// restrict anything (`*`, `?`, or a `*`-based step).
fn parse_field(field: &str, spec: &FieldSpec) -> std::result::Result<(u64, bool), String> {
    if field == "?" {
        if !spec.day_field {
            return Err(format!("'?' is only allowed in the day fields, not {}", spec.name));
        }
        return Ok((range_bits(spec.min, spec.max, 1), false));
    }

    let mut bits = 0u64;
    for item in field.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in {} field '{field}'", spec.name));
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let v = parse_value(range, spec)?;
            // `a/n` runs from a to the end of the field.
            if step.is_some() {
                (v, spec.max)
            } else {
                (v, v)
            }
        };
        if lo > hi {
            return Err(format!("range {lo}-{hi} is reversed in {} field", spec.name));
        }
        bits |= range_bits(lo, hi, step.unwrap_or(1));
    }

    Ok((bits, !field.starts_with('*')))
}

fn parse_value(raw: &str, spec: &FieldSpec) -> std::result::Result<u32, String> {
    let value = match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(raw))
            .map(|i| spec.min + i as u32)
            .ok_or_else(|| format!("unsupported value '{raw}' in {} field", spec.name))?,
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "value {value} out of range {}-{} in {} field",
            spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

fn range_bits(lo: u32, hi: u32, step: u32) -> u64 {
    (lo..=hi).step_by(step as usize).fold(0u64, |acc, v| acc | (1u64 << v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, tz: &str, after: &str) -> DateTime<Utc> {
        next_fire_time(expr, tz, utc(after)).unwrap()
    }

    #[test]
    fn noon_daily_utc() {
        assert_eq!(next("0 0 12 * * ?", "UTC", "2024-01-01T00:00:00Z"), utc("2024-01-01T12:00:00Z"));
        assert_eq!(next("0 0 12 * * ?", "UTC", "2024-01-01T13:00:00Z"), utc("2024-01-02T12:00:00Z"));
    }

    #[test]
    fn result_is_strictly_after_input() {
        // exactly on a fire time: the next one is returned
        assert_eq!(next("0 0 12 * * ?", "UTC", "2024-01-01T12:00:00Z"), utc("2024-01-02T12:00:00Z"));
        assert_eq!(next("* * * * * ?", "UTC", "2024-01-01T12:00:00.500Z"), utc("2024-01-01T12:00:01Z"));
    }

    #[test]
    fn sequences_strictly_increase_across_dst() {
        for (expr, tz, start) in [
            ("0 */30 * * * ?", "America/New_York", "2024-03-09T00:00:00Z"),
            ("0 */30 * * * ?", "America/New_York", "2024-11-02T00:00:00Z"),
            ("*/20 * 1-3 * * ?", "Europe/Budapest", "2024-10-26T20:00:00Z"),
            ("0 15 10 ? * MON-FRI", "Asia/Kolkata", "2024-01-01T00:00:00Z"),
        ] {
            let cron = CronExpression::parse(expr).unwrap();
            let zone = ScheduleZone::parse(tz).unwrap();
            let mut t = utc(start);
            for _ in 0..300 {
                let n = cron.next_after(&zone, t).unwrap();
                assert!(n > t, "{expr} in {tz}: {n} not after {t}");
                t = n;
            }
        }
    }

    #[test]
    fn evaluates_in_schedule_timezone() {
        // CET is UTC+1 in January
        assert_eq!(
            next("0 0 12 * * ?", "Europe/Budapest", "2024-01-01T00:00:00Z"),
            utc("2024-01-01T11:00:00Z")
        );
        assert_eq!(next("0 0 12 * * ?", "+02:00", "2024-01-01T00:00:00Z"), utc("2024-01-01T10:00:00Z"));
    }

    #[test]
    fn spring_forward_gap_fires_after_the_gap() {
        // 02:30 does not exist on 2024-03-10 in New York; 03:00 EDT is 07:00Z
        let first = next("0 30 2 * * ?", "America/New_York", "2024-03-10T05:00:00Z");
        assert_eq!(first, utc("2024-03-10T07:00:00Z"));
        let second = next_fire_time("0 30 2 * * ?", "America/New_York", first).unwrap();
        assert_eq!(second, utc("2024-03-11T06:30:00Z"));
    }

    #[test]
    fn fall_back_overlap_fires_once() {
        // 01:30 happens twice on 2024-11-03 in New York (EDT then EST)
        let first = next("0 30 1 * * ?", "America/New_York", "2024-11-03T04:00:00Z");
        assert_eq!(first, utc("2024-11-03T05:30:00Z"));
        let second = next_fire_time("0 30 1 * * ?", "America/New_York", first).unwrap();
        assert_eq!(second, utc("2024-11-04T06:30:00Z"));
        // from inside the repeated hour the second 01:30 is not a fire time
        assert_eq!(
            next("0 30 1 * * ?", "America/New_York", "2024-11-03T06:00:00Z"),
            utc("2024-11-04T06:30:00Z")
        );
    }

    #[test]
    fn half_hour_gap_fires_at_its_end() {
        // Lord Howe moves from +10:30 to +11:00 at 02:00 on 2024-10-06;
        // 02:15 is skipped and 02:30 local is 15:30Z, the same day, not the next
        assert_eq!(
            next("0 15 2 * * ?", "Australia/Lord_Howe", "2024-10-05T12:00:00Z"),
            utc("2024-10-05T15:30:00Z")
        );
    }

    #[test]
    fn restricted_day_fields_are_or_combined() {
        // 2024-09-06 is a Friday, 2024-09-13 is both Friday and the 13th
        let expr = "0 0 0 13 * FRI";
        assert_eq!(next(expr, "UTC", "2024-09-01T00:00:00Z"), utc("2024-09-06T00:00:00Z"));
        assert_eq!(next(expr, "UTC", "2024-09-06T00:00:00Z"), utc("2024-09-13T00:00:00Z"));
        assert_eq!(next(expr, "UTC", "2024-09-13T00:00:00Z"), utc("2024-09-20T00:00:00Z"));
    }

    #[test]
    fn unrestricted_day_field_is_and_combined() {
        assert_eq!(next("0 0 0 * * MON", "UTC", "2024-09-01T00:00:00Z"), utc("2024-09-02T00:00:00Z"));
        assert_eq!(next("0 0 0 ? * 1", "UTC", "2024-09-01T00:00:00Z"), utc("2024-09-02T00:00:00Z"));
        assert_eq!(next("0 0 0 15 * ?", "UTC", "2024-09-01T00:00:00Z"), utc("2024-09-15T00:00:00Z"));
    }

    #[test]
    fn seven_is_sunday() {
        assert_eq!(next("0 0 0 * * 7", "UTC", "2024-09-01T00:00:00Z"), utc("2024-09-08T00:00:00Z"));
        assert_eq!(next("0 0 0 * * 0", "UTC", "2024-09-01T00:00:00Z"), utc("2024-09-08T00:00:00Z"));
    }

    #[test]
    fn names_ranges_steps_and_lists() {
        // weekdays at 09:00 in January and July only
        let expr = "0 0 9 * jan,JUL MON-FRI";
        assert_eq!(next(expr, "UTC", "2024-02-01T00:00:00Z"), utc("2024-07-01T09:00:00Z"));
        // every 10 minutes starting at 5
        assert_eq!(next("0 5/10 * * * ?", "UTC", "2024-01-01T00:06:00Z"), utc("2024-01-01T00:15:00Z"));
        // ranged step
        assert_eq!(next("0 0 8-18/5 * * ?", "UTC", "2024-01-01T13:01:00Z"), utc("2024-01-01T18:00:00Z"));
        assert_eq!(next("0 0 8-18/5 * * ?", "UTC", "2024-01-01T18:00:00Z"), utc("2024-01-02T08:00:00Z"));
        // explicit seconds list
        assert_eq!(next("10,40 * * * * ?", "UTC", "2024-01-01T00:00:10Z"), utc("2024-01-01T00:00:40Z"));
    }

    #[test]
    fn leap_day_is_found() {
        assert_eq!(next("0 0 0 29 2 ?", "UTC", "2024-03-01T00:00:00Z"), utc("2028-02-29T00:00:00Z"));
    }

    #[test]
    fn impossible_date_has_no_fire_time() {
        let cron = CronExpression::parse("0 0 0 30 2 ?").unwrap();
        assert!(cron.next_after(&ScheduleZone::utc(), utc("2024-01-01T00:00:00Z")).is_none());
        assert!(matches!(
            next_fire_time("0 0 0 30 2 ?", "UTC", utc("2024-01-01T00:00:00Z")),
            Err(SchedulerError::InvalidCronExpression { .. })
        ));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expr in [
            "0 0 12 * *",
            "0 0 12 * * ? 2024",
            "60 * * * * ?",
            "0 0 24 * * ?",
            "0 0 5-1 * * ?",
            "0 */0 * * * ?",
            "0 0 ? * * ?",
            "0 0 0 L * ?",
            "0 0 12 ? * 2#1",
            "0 0 12 15W * ?",
            "0 0 12 * FOO ?",
            "0 0 12 1,,2 * ?",
            "",
        ] {
            assert!(
                matches!(CronExpression::parse(expr), Err(SchedulerError::InvalidCronExpression { .. })),
                "expected '{expr}' to be rejected"
            );
        }
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(matches!(ScheduleZone::parse("Mars/Olympus"), Err(SchedulerError::InvalidTimezone(_))));
        assert_eq!(ScheduleZone::parse("UTC").unwrap(), ScheduleZone::utc());
        assert_eq!(ScheduleZone::parse("Europe/Budapest").unwrap().to_string(), "Europe/Budapest");
    }
}
