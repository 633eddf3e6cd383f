//! Granularity algebra, date normalization and date-bucket series.
//!
//! All date arithmetic happens on naive wall-clock timestamps. Timezone
//! conversion is left to the SQL side through `Dialect::convert_tz`, so the
//! literals produced here are compared against converted columns.

use std::fmt;

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CubePlanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "second" => Ok(Granularity::Second),
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            "year" => Ok(Granularity::Year),
            _ => Err(CubePlanError::Validation(format!(
                "unsupported time granularity: '{value}'"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    /// Every granularity this one is composed of, finest first, ending with itself.
    pub fn parent_hierarchy(&self) -> &'static [Granularity] {
        use Granularity::*;
        match self {
            Second => &[Second],
            Minute => &[Second, Minute],
            Hour => &[Second, Minute, Hour],
            Day => &[Second, Minute, Hour, Day],
            Week => &[Second, Minute, Hour, Day, Week],
            Month => &[Second, Minute, Hour, Day, Month],
            Quarter => &[Second, Minute, Hour, Day, Month, Quarter],
            Year => &[Second, Minute, Hour, Day, Month, Quarter, Year],
        }
    }

    /// True when buckets of `self` can be rolled up into buckets of `coarser`.
    pub fn divides(&self, coarser: Granularity) -> bool {
        coarser.parent_hierarchy().contains(self)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The coarsest granularity both inputs can be expressed in.
pub fn min_granularity(a: Granularity, b: Granularity) -> Granularity {
    let a_parents = a.parent_hierarchy();
    let b_parents = b.parent_hierarchy();
    let common = a_parents
        .iter()
        .zip(b_parents.iter())
        .take_while(|(x, y)| x == y)
        .count();
    // Every hierarchy starts at second, so there is always a common prefix.
    a_parents[common.max(1) - 1]
}

pub fn min_granularity_opt(a: Option<Granularity>, b: Option<Granularity>) -> Option<Granularity> {
    match (a, b) {
        (Some(a), Some(b)) => Some(min_granularity(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

// ============================================================================
// Date parsing and normalization
// ============================================================================

static DATE_ONLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid date regex"));

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

pub fn parse_date_time(value: &str) -> Result<NaiveDateTime> {
    let trimmed = value.trim().trim_end_matches('Z');
    if DATE_ONLY.is_match(trimmed) {
        let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .map_err(|e| CubePlanError::Validation(format!("invalid date '{value}': {e}")))?;
        return Ok(date.and_time(NaiveTime::MIN));
    }
    DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| CubePlanError::Validation(format!("invalid date '{value}'")))
}

pub fn format_date_time(value: NaiveDateTime, precision: usize) -> String {
    if precision >= 6 {
        value.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    } else {
        value.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
    }
}

/// Start-of-range literal: a bare date becomes midnight.
pub fn format_from_date(value: &str, precision: usize) -> Result<String> {
    Ok(format_date_time(parse_date_time(value)?, precision))
}

/// End-of-range literal: a bare date becomes the last instant of that day.
pub fn format_to_date(value: &str, precision: usize) -> Result<String> {
    let parsed = parse_date_time(value)?;
    if DATE_ONLY.is_match(value.trim()) {
        return Ok(format_date_time(end_of(parsed, precision), precision));
    }
    Ok(format_date_time(parsed, precision))
}

fn smallest_step(precision: usize) -> Duration {
    if precision >= 6 {
        Duration::microseconds(1)
    } else {
        Duration::milliseconds(1)
    }
}

fn end_of(day_start: NaiveDateTime, precision: usize) -> NaiveDateTime {
    day_start + Duration::days(1) - smallest_step(precision)
}

/// Coarsest granularity whose bucket boundary `value` sits on.
pub fn granularity_for(value: NaiveDateTime) -> Option<Granularity> {
    let midnight = value.time() == NaiveTime::MIN;
    if midnight && value.month() == 1 && value.day() == 1 {
        Some(Granularity::Year)
    } else if midnight && value.day() == 1 {
        Some(Granularity::Month)
    } else if midnight && value.weekday() == Weekday::Mon {
        Some(Granularity::Week)
    } else if midnight {
        Some(Granularity::Day)
    } else if value.minute() == 0 && value.second() == 0 && value.nanosecond() == 0 {
        Some(Granularity::Hour)
    } else if value.second() == 0 && value.nanosecond() == 0 {
        Some(Granularity::Minute)
    } else if value.nanosecond() == 0 {
        Some(Granularity::Second)
    } else {
        None
    }
}

/// Coarsest granularity whose buckets exactly tile the inclusive range.
pub fn date_range_granularity(from: &str, to: &str, precision: usize) -> Result<Option<Granularity>> {
    let start = parse_date_time(from)?;
    let end = parse_date_time(to)? + smallest_step(precision);
    Ok(min_granularity_opt(
        granularity_for(start),
        granularity_for(end),
    ))
}

// ============================================================================
// Bucket arithmetic and time series
// ============================================================================

pub fn truncate(value: NaiveDateTime, granularity: Granularity) -> NaiveDateTime {
    let date = value.date();
    let time = value.time();
    let at = |d: NaiveDate, h: u32, m: u32, s: u32| {
        d.and_hms_opt(h, m, s).unwrap_or_else(|| d.and_time(NaiveTime::MIN))
    };
    match granularity {
        Granularity::Second => at(date, time.hour(), time.minute(), time.second()),
        Granularity::Minute => at(date, time.hour(), time.minute(), 0),
        Granularity::Hour => at(date, time.hour(), 0, 0),
        Granularity::Day => date.and_time(NaiveTime::MIN),
        Granularity::Week => {
            let back = date.weekday().num_days_from_monday() as i64;
            (date - Duration::days(back)).and_time(NaiveTime::MIN)
        }
        Granularity::Month => first_of_month(date.year(), date.month()),
        Granularity::Quarter => first_of_month(date.year(), ((date.month() - 1) / 3) * 3 + 1),
        Granularity::Year => first_of_month(date.year(), 1),
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_time(NaiveTime::MIN)
}

/// Start of the bucket after the one starting at `start`.
pub fn next_bucket(start: NaiveDateTime, granularity: Granularity) -> NaiveDateTime {
    let months = |n: u32| {
        start
            .checked_add_months(Months::new(n))
            .unwrap_or(NaiveDateTime::MAX)
    };
    match granularity {
        Granularity::Second => start + Duration::seconds(1),
        Granularity::Minute => start + Duration::minutes(1),
        Granularity::Hour => start + Duration::hours(1),
        Granularity::Day => start + Duration::days(1),
        Granularity::Week => start + Duration::weeks(1),
        Granularity::Month => months(1),
        Granularity::Quarter => months(3),
        Granularity::Year => months(12),
    }
}

/// Contiguous `[start, end]` buckets covering the range, both ends inclusive.
pub fn time_series(
    granularity: Granularity,
    from: &str,
    to: &str,
    precision: usize,
    max_buckets: usize,
) -> Result<Vec<(String, String)>> {
    let end = parse_date_time(to)?;
    let mut start = truncate(parse_date_time(from)?, granularity);
    let step = smallest_step(precision);
    let mut buckets = Vec::new();
    while start <= end {
        if buckets.len() >= max_buckets {
            return Err(CubePlanError::Validation(format!(
                "time series for '{from}' to '{to}' by {granularity} exceeds {max_buckets} buckets"
            )));
        }
        let next = next_bucket(start, granularity);
        buckets.push((
            format_date_time(start, precision),
            format_date_time(next - step, precision),
        ));
        start = next;
    }
    Ok(buckets)
}

/// Partition table suffix for the bucket starting at `start`.
pub fn partition_suffix(start: NaiveDateTime, granularity: Granularity) -> String {
    let fmt = match granularity {
        Granularity::Year => "%Y",
        Granularity::Quarter | Granularity::Month => "%Y%m",
        Granularity::Week | Granularity::Day => "%Y%m%d",
        Granularity::Hour => "%Y%m%d%H",
        Granularity::Minute => "%Y%m%d%H%M",
        Granularity::Second => "%Y%m%d%H%M%S",
    };
    start.format(fmt).to_string()
}

// ============================================================================
// Intervals
// ============================================================================

static INTERVAL_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(-?\d+)\s+(second|minute|hour|day|week|month|quarter|year)s?")
        .expect("valid interval regex")
});

static EVERY_INTERVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+) (second|minute|hour|day|week)s?$").expect("valid every regex")
});

/// A SQL interval such as `7 days` or `1 month 2 days`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlInterval {
    pub parts: Vec<(i64, Granularity)>,
}

impl SqlInterval {
    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let parts: Vec<(i64, Granularity)> = INTERVAL_PART
            .captures_iter(&normalized)
            .map(|cap| {
                let amount = cap[1]
                    .parse::<i64>()
                    .map_err(|e| CubePlanError::Validation(format!("invalid interval '{value}': {e}")))?;
                Ok((amount, Granularity::parse(&cap[2])?))
            })
            .collect::<Result<_>>()?;
        if parts.is_empty() {
            return Err(CubePlanError::Validation(format!(
                "invalid interval '{value}'"
            )));
        }
        Ok(Self { parts })
    }

    /// Finest unit the interval is expressed in.
    pub fn granularity(&self) -> Granularity {
        self.parts
            .iter()
            .map(|(_, unit)| *unit)
            .reduce(min_granularity)
            .unwrap_or(Granularity::Day)
    }

    pub fn negate(&self) -> Self {
        Self {
            parts: self.parts.iter().map(|(n, u)| (-n, *u)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|(n, _)| *n == 0)
    }
}

impl fmt::Display for SqlInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .parts
            .iter()
            .map(|(n, unit)| format!("{n} {unit}"))
            .collect();
        f.write_str(&rendered.join(" "))
    }
}

/// Seconds in a refresh-key `every` clause like `1 hour`.
pub fn parse_every_interval(value: &str) -> Result<u64> {
    let cap = EVERY_INTERVAL
        .captures(value.trim())
        .ok_or_else(|| CubePlanError::Validation(format!("invalid interval: {value}")))?;
    let amount: u64 = cap[1]
        .parse()
        .map_err(|_| CubePlanError::Validation(format!("invalid interval: {value}")))?;
    if amount == 0 {
        return Err(CubePlanError::Validation(format!(
            "duration should be positive: {value}"
        )));
    }
    let unit = match &cap[2] {
        "second" => 1,
        "minute" => 60,
        "hour" => 3_600,
        "day" => 86_400,
        _ => 604_800,
    };
    Ok(amount * unit)
}

/// Accept only IANA zone names; the zone ends up inside SQL text.
pub fn validate_timezone(timezone: &str) -> Result<()> {
    timezone
        .parse::<chrono_tz::Tz>()
        .map(|_| ())
        .map_err(|_| CubePlanError::Validation(format!("unknown timezone '{timezone}'")))
}

// ============================================================================
// Relative date ranges
// ============================================================================

static LAST_N: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^last (\d+) (day|week|month|quarter|year)s?$").expect("valid relative regex")
});
static THIS_OR_LAST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(this|last) (day|week|month|quarter|year)$").expect("valid relative regex")
});
static FROM_TO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^from (.+) to (.+)$").expect("valid relative regex"));

/// Resolve phrases like `last 7 days` into an absolute inclusive range.
pub fn resolve_relative_range(
    phrase: &str,
    now: NaiveDateTime,
    precision: usize,
) -> Result<(String, String)> {
    let phrase_lc = phrase.trim().to_ascii_lowercase();
    let bucket = |start: NaiveDateTime, end_exclusive: NaiveDateTime| {
        (
            format_date_time(start, precision),
            format_date_time(end_exclusive - smallest_step(precision), precision),
        )
    };
    let today = truncate(now, Granularity::Day);
    let out_of_range = |start: Option<NaiveDateTime>| {
        start.ok_or_else(|| CubePlanError::Validation(format!("invalid date range '{phrase}'")))
    };

    if phrase_lc == "today" {
        return Ok(bucket(today, today + Duration::days(1)));
    }
    if phrase_lc == "yesterday" {
        return Ok(bucket(today - Duration::days(1), today));
    }
    if let Some(cap) = THIS_OR_LAST.captures(&phrase_lc) {
        let granularity = Granularity::parse(&cap[2])?;
        let current = truncate(now, granularity);
        return Ok(if &cap[1] == "this" {
            bucket(current, next_bucket(current, granularity))
        } else {
            bucket(out_of_range(previous_bucket(current, granularity, 1))?, current)
        });
    }
    if let Some(cap) = LAST_N.captures(&phrase_lc) {
        let amount: u32 = cap[1]
            .parse()
            .map_err(|_| CubePlanError::Validation(format!("invalid date range '{phrase}'")))?;
        let granularity = Granularity::parse(&cap[2])?;
        let current = truncate(now, granularity);
        return Ok(bucket(out_of_range(previous_bucket(current, granularity, amount))?, current));
    }
    if let Some(cap) = FROM_TO.captures(phrase.trim()) {
        return Ok((
            format_from_date(&cap[1], precision)?,
            format_to_date(&cap[2], precision)?,
        ));
    }
    Err(CubePlanError::Validation(format!(
        "can't parse date range: '{phrase}'"
    )))
}

fn previous_bucket(start: NaiveDateTime, granularity: Granularity, count: u32) -> Option<NaiveDateTime> {
    let months = |n: u32| start.checked_sub_months(Months::new(n.checked_mul(count)?));
    match granularity {
        Granularity::Month => months(1),
        Granularity::Quarter => months(3),
        Granularity::Year => months(12),
        other => {
            let step = next_bucket(start, other) - start;
            let span = step.checked_mul(i32::try_from(count).ok()?)?;
            start.checked_sub_signed(span)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(value: &str) -> NaiveDateTime {
        parse_date_time(value).unwrap()
    }

    #[test]
    fn min_granularity_is_commutative_and_idempotent() {
        use Granularity::*;
        let all = [Second, Minute, Hour, Day, Week, Month, Quarter, Year];
        for a in all {
            assert_eq!(min_granularity(a, a), a);
            for b in all {
                assert_eq!(min_granularity(a, b), min_granularity(b, a));
            }
        }
        assert_eq!(min_granularity(Year, Month), Month);
        assert_eq!(min_granularity(Week, Month), Day);
        assert_eq!(min_granularity(Quarter, Year), Quarter);
        assert_eq!(min_granularity(Hour, Week), Hour);
    }

    #[test]
    fn hierarchy_lookups() {
        let day = Granularity::Day.parent_hierarchy();
        for g in [Granularity::Hour, Granularity::Minute, Granularity::Second] {
            assert!(day.contains(&g));
        }
        let year = Granularity::Year.parent_hierarchy();
        assert!(year.contains(&Granularity::Month));
        assert!(year.contains(&Granularity::Day));
        assert!(!year.contains(&Granularity::Week));
        assert!(Granularity::Day.divides(Granularity::Month));
        assert!(!Granularity::Week.divides(Granularity::Month));
    }

    #[test]
    fn unknown_granularity_is_rejected() {
        let err = Granularity::parse("fortnight").unwrap_err();
        assert!(err.to_string().contains("fortnight"));
    }

    #[test]
    fn normalizes_bare_dates() {
        assert_eq!(format_from_date("2020-01-01", 3).unwrap(), "2020-01-01T00:00:00.000");
        assert_eq!(format_to_date("2020-01-01", 3).unwrap(), "2020-01-01T23:59:59.999");
        assert_eq!(format_to_date("2020-01-01", 6).unwrap(), "2020-01-01T23:59:59.999999");
        assert_eq!(
            format_to_date("2020-01-01T10:30:00", 3).unwrap(),
            "2020-01-01T10:30:00.000"
        );
        assert_eq!(
            format_from_date("2020-01-01T10:30:00.123Z", 3).unwrap(),
            "2020-01-01T10:30:00.123"
        );
    }

    #[test]
    fn day_series_has_three_contiguous_buckets() {
        let series = time_series(Granularity::Day, "2020-01-01", "2020-01-03T23:59:59.999", 3, 100)
            .unwrap();
        assert_eq!(
            series,
            vec![
                ("2020-01-01T00:00:00.000".to_string(), "2020-01-01T23:59:59.999".to_string()),
                ("2020-01-02T00:00:00.000".to_string(), "2020-01-02T23:59:59.999".to_string()),
                ("2020-01-03T00:00:00.000".to_string(), "2020-01-03T23:59:59.999".to_string()),
            ]
        );
    }

    #[test]
    fn week_and_quarter_series_snap_to_period_start() {
        let weeks = time_series(Granularity::Week, "2020-01-01", "2020-01-10", 3, 100).unwrap();
        assert_eq!(weeks[0].0, "2019-12-30T00:00:00.000");
        assert_eq!(weeks[0].1, "2020-01-05T23:59:59.999");
        assert_eq!(weeks.len(), 2);

        let quarters = time_series(Granularity::Quarter, "2020-02-15", "2020-05-01", 3, 100).unwrap();
        assert_eq!(quarters[0].0, "2020-01-01T00:00:00.000");
        assert_eq!(quarters[0].1, "2020-03-31T23:59:59.999");
        assert_eq!(quarters[1].0, "2020-04-01T00:00:00.000");
    }

    #[test]
    fn series_respects_bucket_limit() {
        let err = time_series(Granularity::Hour, "2020-01-01", "2020-12-31", 3, 10).unwrap_err();
        assert!(matches!(err, CubePlanError::Validation(_)));
    }

    #[test]
    fn granularity_of_ranges() {
        assert_eq!(granularity_for(dt("2020-01-01")), Some(Granularity::Year));
        assert_eq!(granularity_for(dt("2020-03-01")), Some(Granularity::Month));
        assert_eq!(granularity_for(dt("2020-01-06")), Some(Granularity::Week));
        assert_eq!(granularity_for(dt("2020-01-07")), Some(Granularity::Day));
        assert_eq!(granularity_for(dt("2020-01-07T10:00:00")), Some(Granularity::Hour));
        assert_eq!(
            date_range_granularity("2020-01-01T00:00:00.000", "2020-01-31T23:59:59.999", 3).unwrap(),
            Some(Granularity::Month)
        );
        assert_eq!(
            date_range_granularity("2020-01-01T00:00:00.000", "2020-01-01T23:59:59.999", 3).unwrap(),
            Some(Granularity::Day)
        );
    }

    #[test]
    fn parses_intervals() {
        let interval = SqlInterval::parse("1 month 2 days").unwrap();
        assert_eq!(interval.parts, vec![(1, Granularity::Month), (2, Granularity::Day)]);
        assert_eq!(interval.granularity(), Granularity::Day);
        assert_eq!(interval.to_string(), "1 month 2 day");
        assert!(SqlInterval::parse("soon").is_err());
    }

    #[test]
    fn every_intervals() {
        assert_eq!(parse_every_interval("10 seconds").unwrap(), 10);
        assert_eq!(parse_every_interval("1 hour").unwrap(), 3_600);
        assert_eq!(parse_every_interval("2 weeks").unwrap(), 1_209_600);
        assert!(parse_every_interval("1 fortnight")
            .unwrap_err()
            .to_string()
            .contains("invalid interval"));
        assert!(parse_every_interval("0 days")
            .unwrap_err()
            .to_string()
            .contains("positive"));
    }

    #[test]
    fn relative_ranges() {
        let now = dt("2020-03-18T15:20:00");
        assert_eq!(
            resolve_relative_range("today", now, 3).unwrap(),
            ("2020-03-18T00:00:00.000".to_string(), "2020-03-18T23:59:59.999".to_string())
        );
        assert_eq!(
            resolve_relative_range("last 7 days", now, 3).unwrap(),
            ("2020-03-11T00:00:00.000".to_string(), "2020-03-17T23:59:59.999".to_string())
        );
        assert_eq!(
            resolve_relative_range("last month", now, 3).unwrap(),
            ("2020-02-01T00:00:00.000".to_string(), "2020-02-29T23:59:59.999".to_string())
        );
        assert_eq!(
            resolve_relative_range("this quarter", now, 3).unwrap().0,
            "2020-01-01T00:00:00.000"
        );
        assert!(resolve_relative_range("next decade", now, 3).is_err());
    }

    #[test]
    fn timezones_must_be_iana_names() {
        assert!(validate_timezone("UTC").is_ok());
        assert!(validate_timezone("America/Los_Angeles").is_ok());
        let err = validate_timezone("UTC'; DROP TABLE orders; --").unwrap_err();
        assert!(matches!(err, CubePlanError::Validation(_)));
        assert!(validate_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn oversized_relative_ranges_are_rejected() {
        let now = dt("2020-03-18T15:20:00");
        for phrase in [
            "last 400000000 years",
            "last 99999999 days",
            "last 4000000000 weeks",
            "last 99999999999 months",
        ] {
            let err = resolve_relative_range(phrase, now, 3).unwrap_err();
            assert!(matches!(err, CubePlanError::Validation(_)), "{phrase}: {err}");
        }
    }

    #[test]
    fn partition_suffixes() {
        assert_eq!(partition_suffix(dt("2020-03-01"), Granularity::Month), "202003");
        assert_eq!(partition_suffix(dt("2020-03-05"), Granularity::Day), "20200305");
        assert_eq!(partition_suffix(dt("2020-03-05T07:00:00"), Granularity::Hour), "2020030507");
    }
}
