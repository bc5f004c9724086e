//! Natural-language time expressions.
//!
//! Converts phrases like `last week`, `3 days ago`, `January 2024`, or
//! `last summer` into half-open `[start, end)` UTC ranges. Parsing is
//! deterministic given a reference instant, which callers inject.
//!
//! Conventions (fixed, not configurable):
//! - Weeks start Monday 00:00 UTC.
//! - Seasons use astronomical Northern-hemisphere boundaries:
//!   spring Mar 20, summer Jun 21, autumn Sep 22, winter Dec 21 (00:00 UTC).
//! - `N <unit>s ago` denotes a point, expanded to a 1-unit window centered
//!   on it, half-open to the right. Months count as 30 days and years as
//!   365 for this construct.
//!
//! Unrecognized phrases are an error; the parser never guesses.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};

use crate::error::{MemoryError, Result};

// ============================================================================
// TIME RANGE
// ============================================================================

/// A half-open instant range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whether an instant falls inside the range.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    /// Whether the whole range lies at or after the reference instant.
    pub fn is_entirely_future(&self, now: DateTime<Utc>) -> bool {
        self.start >= now
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Parse a phrase into one or more ranges. `a and b` unions two ranges;
/// everything else yields exactly one.
pub fn parse_phrase(phrase: &str, now: DateTime<Utc>) -> Result<Vec<TimeRange>> {
    let words = tokenize(phrase);
    if words.is_empty() {
        return Err(invalid(phrase));
    }
    parse_words(&words, now).ok_or_else(|| invalid(phrase))
}

/// Locate the longest contiguous fragment of `phrase` that parses as a time
/// expression. Returns the ranges and the residual words (possibly empty).
/// Longest fragment wins; ties go to the leftmost.
pub fn extract(phrase: &str, now: DateTime<Utc>) -> Option<(Vec<TimeRange>, String)> {
    let words = tokenize(phrase);
    let n = words.len();
    for len in (1..=n).rev() {
        for start in 0..=(n - len) {
            let window = &words[start..start + len];
            if let Some(ranges) = parse_words(window, now) {
                let residual: Vec<&str> = words[..start]
                    .iter()
                    .chain(words[start + len..].iter())
                    .map(|s| s.as_str())
                    .collect();
                return Some((ranges, residual.join(" ")));
            }
        }
    }
    None
}

fn invalid(phrase: &str) -> MemoryError {
    MemoryError::Invalid(format!("unrecognized time expression: '{phrase}'"))
}

fn tokenize(phrase: &str) -> Vec<String> {
    phrase
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn parse_words(words: &[String], now: DateTime<Utc>) -> Option<Vec<TimeRange>> {
    // Compound: split on a top-level "and" where both sides parse.
    if let Some(pos) = words.iter().position(|w| w == "and") {
        let (left, right) = (&words[..pos], &words[pos + 1..]);
        if !left.is_empty() && !right.is_empty() {
            if let (Some(mut a), Some(b)) = (parse_words(left, now), parse_words(right, now)) {
                a.extend(b);
                return Some(a);
            }
        }
        return None;
    }
    parse_single(words, now).map(|r| vec![r])
}

fn parse_single(words: &[String], now: DateTime<Utc>) -> Option<TimeRange> {
    match words {
        [w] => parse_one_word(w, now),
        [first, second] => parse_modified(first, second, now).or_else(|| {
            let m = month_number(first)?;
            let year: i32 = second.parse().ok().filter(|y| (1970..=9999).contains(y))?;
            Some(month_range(year, m))
        }),
        [n, unit, ago] if ago == "ago" => parse_units_ago(n, unit, now),
        _ => None,
    }
}

fn parse_one_word(word: &str, now: DateTime<Utc>) -> Option<TimeRange> {
    let today = day_start(now);
    match word {
        "today" => Some(TimeRange::new(today, today + Duration::days(1))),
        "yesterday" => Some(TimeRange::new(
            today - Duration::days(1),
            today,
        )),
        "tomorrow" => Some(TimeRange::new(
            today + Duration::days(1),
            today + Duration::days(2),
        )),
        _ => {
            if let Some(m) = month_number(word) {
                return Some(most_recent_month(m, now));
            }
            if let Some(wd) = weekday_of(word) {
                return Some(most_recent_weekday(wd, now));
            }
            if season_index(word).is_some() {
                return Some(most_recent_season(word, now)?);
            }
            None
        }
    }
}

fn parse_modified(modifier: &str, rest: &str, now: DateTime<Utc>) -> Option<TimeRange> {
    match (modifier, rest) {
        ("last", "week") => Some(shift_week(now, -1)),
        ("this", "week") => Some(shift_week(now, 0)),
        ("next", "week") => Some(shift_week(now, 1)),
        ("last", "month") => Some(shift_month(now, -1)),
        ("this", "month") => Some(shift_month(now, 0)),
        ("next", "month") => Some(shift_month(now, 1)),
        ("last", "year") => Some(year_range(now.year() - 1)),
        ("this", "year") => Some(year_range(now.year())),
        ("next", "year") => Some(year_range(now.year() + 1)),
        ("last", day) if weekday_of(day).is_some() => {
            let wd = weekday_of(day)?;
            let this = most_recent_weekday(wd, now);
            Some(TimeRange::new(
                this.start - Duration::days(7),
                this.end - Duration::days(7),
            ))
        }
        ("this", day) if weekday_of(day).is_some() => {
            // The named day within the current Monday-started week.
            let wd = weekday_of(day)?;
            let week = shift_week(now, 0);
            let start = week.start + Duration::days(wd.num_days_from_monday() as i64);
            Some(TimeRange::new(start, start + Duration::days(1)))
        }
        ("last", season) if season_index(season).is_some() => {
            let idx = season_index(season)?;
            let this = most_recent_season(season, now)?;
            Some(season_occurrence(idx, this.start.year() - 1))
        }
        ("this", season) if season_index(season).is_some() => most_recent_season(season, now),
        _ => None,
    }
}

fn parse_units_ago(n: &str, unit: &str, now: DateTime<Utc>) -> Option<TimeRange> {
    let n: i64 = n.parse().ok().filter(|n| *n >= 0)?;
    let unit_secs = match unit.trim_end_matches('s') {
        "minute" => 60,
        "hour" => 3600,
        "day" => 86_400,
        "week" => 7 * 86_400,
        "month" => 30 * 86_400,
        "year" => 365 * 86_400,
        _ => return None,
    };
    let point = now - Duration::seconds(n * unit_secs);
    let half = Duration::seconds(unit_secs / 2);
    Some(TimeRange::new(point - half, point - half + Duration::seconds(unit_secs)))
}

// ============================================================================
// CALENDAR HELPERS
// ============================================================================

fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// Monday 00:00 UTC of the week containing `now`, shifted by `weeks`.
fn shift_week(now: DateTime<Utc>, weeks: i64) -> TimeRange {
    let today = day_start(now);
    let monday = today - Duration::days(now.weekday().num_days_from_monday() as i64);
    let start = monday + Duration::weeks(weeks);
    TimeRange::new(start, start + Duration::weeks(1))
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is always valid")
}

fn month_range(year: i32, month: u32) -> TimeRange {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    TimeRange::new(month_start(year, month), month_start(ny, nm))
}

fn shift_month(now: DateTime<Utc>, delta: i32) -> TimeRange {
    let total = now.year() * 12 + now.month() as i32 - 1 + delta;
    let (year, month) = (total.div_euclid(12), total.rem_euclid(12) as u32 + 1);
    month_range(year, month)
}

fn year_range(year: i32) -> TimeRange {
    TimeRange::new(month_start(year, 1), month_start(year + 1, 1))
}

fn month_number(word: &str) -> Option<u32> {
    Some(match word {
        "january" => 1,
        "february" => 2,
        "march" => 3,
        "april" => 4,
        "may" => 5,
        "june" => 6,
        "july" => 7,
        "august" => 8,
        "september" => 9,
        "october" => 10,
        "november" => 11,
        "december" => 12,
        _ => return None,
    })
}

/// The most recent occurrence of a month whose start is not after `now`.
fn most_recent_month(month: u32, now: DateTime<Utc>) -> TimeRange {
    let year = if month_start(now.year(), month) <= now {
        now.year()
    } else {
        now.year() - 1
    };
    month_range(year, month)
}

fn weekday_of(word: &str) -> Option<Weekday> {
    Some(match word {
        "monday" => Weekday::Mon,
        "tuesday" => Weekday::Tue,
        "wednesday" => Weekday::Wed,
        "thursday" => Weekday::Thu,
        "friday" => Weekday::Fri,
        "saturday" => Weekday::Sat,
        "sunday" => Weekday::Sun,
        _ => return None,
    })
}

/// Most recent past occurrence of a weekday; today counts if it matches.
fn most_recent_weekday(wd: Weekday, now: DateTime<Utc>) -> TimeRange {
    let today = day_start(now);
    let back = (now.weekday().num_days_from_monday() as i64
        - wd.num_days_from_monday() as i64)
        .rem_euclid(7);
    let start = today - Duration::days(back);
    TimeRange::new(start, start + Duration::days(1))
}

/// Season boundaries: (start month, start day), in year order.
const SEASONS: [(&str, (u32, u32), (u32, u32)); 4] = [
    ("spring", (3, 20), (6, 21)),
    ("summer", (6, 21), (9, 22)),
    ("autumn", (9, 22), (12, 21)),
    ("winter", (12, 21), (3, 20)),
];

fn season_index(word: &str) -> Option<usize> {
    let word = if word == "fall" { "autumn" } else { word };
    SEASONS.iter().position(|(name, _, _)| *name == word)
}

fn date_utc(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, day)
        .expect("season boundary is a valid date")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
        .and_utc()
}

/// Occurrence of a season anchored at the year its start falls in.
fn season_occurrence(idx: usize, start_year: i32) -> TimeRange {
    let (_, (sm, sd), (em, ed)) = SEASONS[idx];
    let end_year = if idx == 3 { start_year + 1 } else { start_year };
    TimeRange::new(date_utc(start_year, sm, sd), date_utc(end_year, em, ed))
}

/// The most recent occurrence of a season whose start is not after `now`.
fn most_recent_season(word: &str, now: DateTime<Utc>) -> Option<TimeRange> {
    let idx = season_index(word)?;
    let mut occurrence = season_occurrence(idx, now.year());
    if occurrence.start > now {
        occurrence = season_occurrence(idx, now.year() - 1);
    }
    Some(occurrence)
}

// ============================================================================
// TESTS
// ============================================================================
