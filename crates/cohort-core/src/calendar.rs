//! # Calendar Arithmetic
//!
//! Cycles are identified by their ISO-8601 week: `year * 100 + week`.
//! Streak continuity must go through [`are_adjacent`]; plain integer
//! subtraction breaks at every year boundary (`202452 -> 202501`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Ordinal identifier of a weekly cycle, e.g. `202405` for ISO week 5 of 2024.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct CycleId(u32);

impl CycleId {
    /// Builds an identifier, rejecting weeks the ISO calendar does not have
    /// (week 0, or week 53 in a 52-week year).
    pub fn new(year: i32, week: u32) -> Option<Self> {
        if !(1..=9999).contains(&year) || week == 0 || week > weeks_in_iso_year(year) {
            return None;
        }
        Some(Self(year as u32 * 100 + week))
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::new((raw / 100) as i32, raw % 100)
    }

    /// The cycle containing `instant`, as observed on the wall clock of `tz`.
    pub fn containing(instant: DateTime<Utc>, tz: Tz) -> Self {
        let iso = instant.with_timezone(&tz).iso_week();
        Self(iso.year() as u32 * 100 + iso.week())
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn year(self) -> i32 {
        (self.0 / 100) as i32
    }

    pub fn week(self) -> u32 {
        self.0 % 100
    }

    /// The cycle that immediately follows this one.
    pub fn next(self) -> Self {
        if self.week() >= weeks_in_iso_year(self.year()) {
            Self((self.year() as u32 + 1) * 100 + 1)
        } else {
            Self(self.0 + 1)
        }
    }

    /// Monday 00:00 (local) of this ISO week.
    pub fn monday(self) -> NaiveDate {
        // Constructed through `new`/`containing`, so the week always exists.
        NaiveDate::from_isoywd_opt(self.year(), self.week(), Weekday::Mon)
            .unwrap_or(NaiveDate::MIN)
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year(), self.week())
    }
}

impl From<CycleId> for u32 {
    fn from(id: CycleId) -> Self {
        id.0
    }
}

impl TryFrom<u32> for CycleId {
    type Error = AppError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
            .ok_or_else(|| AppError::ValidationError(format!("{raw} is not a valid ISO year-week")))
    }
}

impl FromStr for CycleId {
    type Err = AppError;

    /// Accepts both `202405` and `2024-W05`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::ValidationError(format!("'{s}' is not a cycle identifier"));
        let s = s.trim();
        if let Some((year, week)) = s.split_once("-W") {
            let year: i32 = year.parse().map_err(|_| invalid())?;
            let week: u32 = week.parse().map_err(|_| invalid())?;
            return Self::new(year, week).ok_or_else(invalid);
        }
        let raw: u32 = s.parse().map_err(|_| invalid())?;
        Self::from_raw(raw).ok_or_else(invalid)
    }
}

/// Number of ISO weeks in `year` (52 or 53). December 28th always falls in
/// the last ISO week of its year.
pub fn weeks_in_iso_year(year: i32) -> u32 {
    NaiveDate::from_ymd_opt(year, 12, 28)
        .map(|d| d.iso_week().week())
        .unwrap_or(52)
}

/// `cycleId(instant, timezone)`.
pub fn cycle_id(instant: DateTime<Utc>, tz: Tz) -> CycleId {
    CycleId::containing(instant, tz)
}

/// True iff `b` is the cycle immediately following `a`.
pub fn are_adjacent(a: CycleId, b: CycleId) -> bool {
    let last_week = weeks_in_iso_year(a.year());
    if a.year() == b.year() {
        return b.week() == a.week() + 1 && b.week() <= last_week;
    }
    a.week() == last_week && b.year() == a.year() + 1 && b.week() == 1
}

/// The configured weekly window: when a cycle opens and when submissions
/// stop being accepted, in the cohort's local timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSchedule {
    pub timezone: Tz,
    pub opens_on: Weekday,
    pub open_hour: u32,
    pub closes_on: Weekday,
    pub close_hour: u32,
}

impl Default for CycleSchedule {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            opens_on: Weekday::Mon,
            open_hour: 9,
            closes_on: Weekday::Thu,
            close_hour: 17,
        }
    }
}

/// Concrete instants for one cycle's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleWindow {
    pub cycle: CycleId,
    pub opens_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl CycleSchedule {
    /// Resolves the window of the ISO week containing `instant`.
    pub fn window_for(&self, instant: DateTime<Utc>) -> Result<CycleWindow, AppError> {
        let cycle = CycleId::containing(instant, self.timezone);
        let monday = cycle.monday();

        let open_date = monday + Duration::days(self.opens_on.num_days_from_monday() as i64);
        let opens_at = self.resolve_local(open_date, self.open_hour)?;

        let close_date = monday + Duration::days(self.closes_on.num_days_from_monday() as i64);
        let mut deadline = self.resolve_local(close_date, self.close_hour)?;
        if deadline <= opens_at {
            deadline = self.resolve_local(close_date + Duration::days(7), self.close_hour)?;
        }

        Ok(CycleWindow { cycle, opens_at, deadline })
    }

    /// Local wall-clock date and hour to a UTC instant. Ambiguous times take
    /// the earlier reading; times inside a DST gap move forward one hour.
    fn resolve_local(&self, date: NaiveDate, hour: u32) -> Result<DateTime<Utc>, AppError> {
        let naive = date.and_hms_opt(hour, 0, 0).ok_or_else(|| {
            AppError::ValidationError(format!("hour {hour} is outside 0..=23"))
        })?;
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
            })
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| {
                AppError::ValidationError(format!("{naive} does not exist in {}", self.timezone))
            })
    }
}
