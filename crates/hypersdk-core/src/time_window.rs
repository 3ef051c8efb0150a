//! Time-Window Manager: a pure, stateless evaluator over day-of-week,
//! timezone, and HH:MM ranges.

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single day-of-week + local-time range gating a scheduled job's fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: Vec<DayOfWeek>,
    pub start: HourMinute,
    pub end: HourMinute,
    pub timezone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    /// Parse the three-letter English abbreviation. Any other value is a
    /// validation error.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "Mon" => Ok(DayOfWeek::Mon),
            "Tue" => Ok(DayOfWeek::Tue),
            "Wed" => Ok(DayOfWeek::Wed),
            "Thu" => Ok(DayOfWeek::Thu),
            "Fri" => Ok(DayOfWeek::Fri),
            "Sat" => Ok(DayOfWeek::Sat),
            "Sun" => Ok(DayOfWeek::Sun),
            other => Err(format!("invalid day abbreviation: {other:?}")),
        }
    }

    fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => DayOfWeek::Mon,
            Weekday::Tue => DayOfWeek::Tue,
            Weekday::Wed => DayOfWeek::Wed,
            Weekday::Thu => DayOfWeek::Thu,
            Weekday::Fri => DayOfWeek::Fri,
            Weekday::Sat => DayOfWeek::Sat,
            Weekday::Sun => DayOfWeek::Sun,
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DayOfWeek::Mon => "Mon",
            DayOfWeek::Tue => "Tue",
            DayOfWeek::Wed => "Wed",
            DayOfWeek::Thu => "Thu",
            DayOfWeek::Fri => "Fri",
            DayOfWeek::Sat => "Sat",
            DayOfWeek::Sun => "Sun",
        };
        write!(f, "{s}")
    }
}

/// HH:MM, validated on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HourMinute {
    pub hour: u8,
    pub minute: u8,
}

impl HourMinute {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid HH:MM value: {s:?}"))?;
        let hour: u8 = h.parse().map_err(|_| format!("invalid hour in {s:?}"))?;
        let minute: u8 = m.parse().map_err(|_| format!("invalid minute in {s:?}"))?;
        if hour > 23 || minute > 59 {
            return Err(format!("HH:MM out of range: {s:?}"));
        }
        Ok(Self { hour, minute })
    }

    fn to_naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0).unwrap()
    }
}

impl TimeWindow {
    /// Validate the window's timezone, HH:MM values, and day list. Called
    /// at schedule insert time; evaluation-time malformed windows are
    /// skipped with a warning instead of erroring.
    pub fn validate(&self) -> Result<(), String> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| format!("invalid IANA timezone: {}", self.timezone))?;
        if self.days.is_empty() {
            return Err("time window must name at least one day".into());
        }
        Ok(())
    }

    /// Whether `now` (an instant in UTC) falls inside this window,
    /// evaluated in the window's declared timezone.
    fn contains(&self, now: DateTime<Utc>) -> bool {
        let tz: Tz = match self.timezone.parse() {
            Ok(tz) => tz,
            Err(_) => return false,
        };
        let local = now.with_timezone(&tz);
        let today = DayOfWeek::from_chrono(local.weekday());
        if !self.days.contains(&today) {
            // Overnight windows can still be active if *yesterday* was a
            // matching day and we're in the wrapped portion before `end`.
            return self.contains_overnight_spillover(local, tz);
        }

        let clock = local.time();
        if self.end == self.start {
            return false; // empty window
        }
        if self.end > self.start {
            clock >= self.start.to_naive() && clock < self.end.to_naive()
        } else {
            // Overnight: [start, 24:00) today.
            clock >= self.start.to_naive()
        }
    }

    fn contains_overnight_spillover(&self, local: DateTime<Tz>, _tz: Tz) -> bool {
        if self.end >= self.start {
            return false; // not an overnight window
        }
        let yesterday = match local.weekday().pred() {
            w => DayOfWeek::from_chrono(w),
        };
        if !self.days.contains(&yesterday) {
            return false;
        }
        local.time() < self.end.to_naive()
    }
}

/// Returns `(in_window, reason)`. True if no windows are configured, or
/// any window matches `now`.
pub fn in_window(windows: &[TimeWindow], now: DateTime<Utc>) -> (bool, &'static str) {
    if windows.is_empty() {
        return (true, "no time windows configured");
    }
    for window in windows {
        if window.validate().is_err() {
            tracing::warn!(timezone = %window.timezone, "skipping malformed time window");
            continue;
        }
        if window.contains(now) {
            return (true, "matched an active time window");
        }
    }
    (false, "outside all configured time windows")
}

/// Searches up to 7 days ahead across all windows, returning the
/// earliest local-time start strictly after `now`.
pub fn next_window_start(windows: &[TimeWindow], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut best: Option<DateTime<Utc>> = None;
    for window in windows {
        if window.validate().is_err() {
            continue;
        }
        let Ok(tz) = window.timezone.parse::<Tz>() else {
            continue;
        };
        if window.end == window.start {
            continue; // empty window, never starts
        }
        for day_offset in 0..=7 {
            let candidate_date = (now.with_timezone(&tz) + chrono::Duration::days(day_offset)).date_naive();
            if !window.days.contains(&DayOfWeek::from_chrono(candidate_date.weekday())) {
                continue;
            }
            let naive_start = candidate_date.and_time(window.start.to_naive());
            let Some(local_start) = tz.from_local_datetime(&naive_start).single() else {
                continue;
            };
            let utc_start = local_start.with_timezone(&Utc);
            if utc_start > now && best.map(|b| utc_start < b).unwrap_or(true) {
                best = Some(utc_start);
            }
        }
    }
    best
}
