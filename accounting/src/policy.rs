use crate::error::{AccountingError, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RESET_DAY: u32 = 1;
pub const DEFAULT_RESET_HOUR: u32 = 0;
pub const DEFAULT_RESET_MINUTE: u32 = 0;

/// Monthly anchor (day, hour, minute) at which a billing cycle begins.
///
/// All calendar arithmetic is performed in the billing offset handed to each
/// method, never in the host's local timezone. A `day` past the end of a
/// short month resolves to that month's last day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetPolicy {
    day: u32,
    hour: u32,
    minute: u32,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            day: DEFAULT_RESET_DAY,
            hour: DEFAULT_RESET_HOUR,
            minute: DEFAULT_RESET_MINUTE,
        }
    }
}

/// Outcome of evaluating a policy against the last reset instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetDecision {
    pub due: bool,
    /// Start of the cycle `now` falls in. Recorded as the new last reset
    /// instant when `due` is set.
    pub boundary: DateTime<Utc>,
}

impl ResetPolicy {
    pub fn new(day: u32, hour: u32, minute: u32) -> Result<Self> {
        if !(1..=31).contains(&day) {
            return Err(AccountingError::InvalidPolicy(format!(
                "reset day {day} is outside 1..=31"
            )));
        }
        if hour > 23 {
            return Err(AccountingError::InvalidPolicy(format!(
                "reset hour {hour} is outside 0..=23"
            )));
        }
        if minute > 59 {
            return Err(AccountingError::InvalidPolicy(format!(
                "reset minute {minute} is outside 0..=59"
            )));
        }
        Ok(Self { day, hour, minute })
    }

    /// Build a policy from optional parts, using the defaults for absent ones.
    pub fn from_parts(day: Option<u32>, hour: Option<u32>, minute: Option<u32>) -> Result<Self> {
        Self::new(
            day.unwrap_or(DEFAULT_RESET_DAY),
            hour.unwrap_or(DEFAULT_RESET_HOUR),
            minute.unwrap_or(DEFAULT_RESET_MINUTE),
        )
    }

    /// Replace the given parts, keeping the current value for absent ones.
    pub fn with_overrides(
        &self,
        day: Option<u32>,
        hour: Option<u32>,
        minute: Option<u32>,
    ) -> Result<Self> {
        Self::new(
            day.unwrap_or(self.day),
            hour.unwrap_or(self.hour),
            minute.unwrap_or(self.minute),
        )
    }

    pub fn is_valid(&self) -> bool {
        Self::new(self.day, self.hour, self.minute).is_ok()
    }

    /// Pull out-of-range parts back into range.
    pub fn normalized(&self) -> Self {
        Self {
            day: self.day.clamp(1, 31),
            hour: self.hour.min(23),
            minute: self.minute.min(59),
        }
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    /// The anchor instant inside the given calendar month.
    pub fn anchor_in(&self, year: i32, month: u32, offset: &FixedOffset) -> DateTime<Utc> {
        let day = self.day.clamp(1, days_in_month(year, month));
        let local = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(self.hour.min(23), self.minute.min(59), 0))
            .unwrap_or(NaiveDateTime::MIN);
        local_to_utc(local, offset)
    }

    /// Start of the billing cycle containing `now`.
    pub fn current_cycle_start(&self, now: DateTime<Utc>, offset: &FixedOffset) -> DateTime<Utc> {
        let (year, month) = self.cycle_month(now, offset);
        self.anchor_in(year, month, offset)
    }

    /// Start of the billing cycle following the one containing `now`.
    pub fn next_cycle_start(&self, now: DateTime<Utc>, offset: &FixedOffset) -> DateTime<Utc> {
        let (year, month) = self.cycle_month(now, offset);
        let (year, month) = next_month(year, month);
        self.anchor_in(year, month, offset)
    }

    /// Decide whether a reset is due.
    ///
    /// The comparison is against the calendar boundary rather than the time
    /// of the previous check, so any number of evaluations within one cycle
    /// agree and at most one reset is produced per crossed boundary.
    pub fn evaluate(
        &self,
        now: DateTime<Utc>,
        last_reset: Option<DateTime<Utc>>,
        offset: &FixedOffset,
    ) -> ResetDecision {
        let boundary = self.current_cycle_start(now, offset);
        let due = last_reset.is_none_or(|last| last < boundary);
        ResetDecision { due, boundary }
    }

    fn cycle_month(&self, now: DateTime<Utc>, offset: &FixedOffset) -> (i32, u32) {
        let local = now.with_timezone(offset);
        let (year, month) = (local.year(), local.month());
        if now < self.anchor_in(year, month, offset) {
            previous_month(year, month)
        } else {
            (year, month)
        }
    }
}

/// Parse a billing offset such as `+08:00`, `-0530`, `Z` or `UTC`.
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed.eq_ignore_ascii_case("z") {
        return Ok(Utc.fix());
    }
    trimmed
        .parse::<FixedOffset>()
        .map_err(|e| AccountingError::InvalidPolicy(format!("invalid UTC offset '{value}': {e}")))
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        4 | 6 | 9 | 11 => 30,
        2 if NaiveDate::from_ymd_opt(year, 2, 29).is_some() => 29,
        2 => 28,
        _ => 31,
    }
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month <= 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn local_to_utc(local: NaiveDateTime, offset: &FixedOffset) -> DateTime<Utc> {
    local
        .checked_sub_signed(TimeDelta::seconds(i64::from(offset.local_minus_utc())))
        .unwrap_or(local)
        .and_utc()
}
