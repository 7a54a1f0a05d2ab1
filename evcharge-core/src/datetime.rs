//! Date and time helpers.
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Timelike, Utc};
use thiserror::Error;

/// An error parsing a time of day.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeOfDayError {
    /// The string is not `HH` or `HH:MM`.
    #[error("Invalid time of day: {0}")]
    Invalid(String),
}

/// Parse a time of day given as `HH` or `HH:MM`.
///
/// # Errors
///
/// If the hour or minute is missing, not a number, or out of range.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, TimeOfDayError> {
    let invalid = || TimeOfDayError::Invalid(s.to_string());

    let mut splits = s.trim().splitn(2, ':');
    let hour = splits
        .next()
        .and_then(|h| h.parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let minute = match splits.next() {
        Some(m) => m.parse::<u32>().map_err(|_| invalid())?,
        None => 0,
    };

    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

/// Serde serialization deserialization for a time of day as `HH:MM`.
pub mod with_time_of_day {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Deserialize a time of day.
    ///
    /// # Errors
    ///
    /// If the time of day is invalid.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<chrono::NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        super::parse_time_of_day(&s).map_err(serde::de::Error::custom)
    }

    /// Serialize a time of day.
    ///
    /// # Errors
    ///
    /// Never.
    pub fn serialize<S>(time: &chrono::NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }
}

/// Convert a local date and time to UTC, picking a sensible answer around DST changes.
///
/// Ambiguous times resolve to the earliest instant. Times inside a DST gap move forward one
/// hour.
pub fn local_to_utc<T: TimeZone>(date: NaiveDate, time: NaiveTime, timezone: &T) -> DateTime<Utc> {
    let datetime = NaiveDateTime::new(date, time);
    let convert =
        |dt: &NaiveDateTime| timezone.from_local_datetime(dt).earliest().map(|dt| dt.to_utc());

    convert(&datetime)
        .or_else(|| convert(&(datetime + TimeDelta::hours(1))))
        .unwrap_or_else(|| Utc.from_utc_datetime(&datetime))
}

/// Truncate a timestamp to the start of its hour in the given timezone.
pub fn start_of_hour<T: TimeZone>(dt: DateTime<Utc>, timezone: &T) -> DateTime<Utc> {
    let local = dt.with_timezone(timezone);
    local
        .with_minute(0)
        .and_then(|dt| dt.with_second(0))
        .and_then(|dt| dt.with_nanosecond(0))
        .map_or(dt, |dt| dt.to_utc())
}

/// Create a constant `TimeDelta`, panicking at compile time if out of range.
#[macro_export]
macro_rules! unsafe_time_delta {
    (hours: $hours:expr) => {
        match ::chrono::TimeDelta::try_hours($hours) {
            Some(duration) => duration,
            None => panic!("hours is invalid"),
        }
    };
    (minutes: $minutes:expr) => {
        match ::chrono::TimeDelta::try_minutes($minutes) {
            Some(duration) => duration,
            None => panic!("minutes is invalid"),
        }
    };
    (seconds: $seconds:expr) => {
        match ::chrono::TimeDelta::try_seconds($seconds) {
            Some(duration) => duration,
            None => panic!("seconds is invalid"),
        }
    };
}

/// Convert fractional hours to a `TimeDelta`, with millisecond precision.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn hours_to_time_delta(hours: f64) -> TimeDelta {
    TimeDelta::milliseconds((hours * 3_600_000.0).round() as i64)
}

/// Convert a `TimeDelta` to fractional hours.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn time_delta_to_hours(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 3_600_000.0
}

/// Format a `TimeDelta` as `HH:MM`, dropping seconds and wrapping at 24 hours.
#[must_use]
pub fn time_delta_to_hh_mm(delta: TimeDelta) -> String {
    let minutes = delta.num_minutes().max(0);
    let hours = (minutes / 60) % 24;
    let minutes = minutes % 60;
    format!("{hours:02}:{minutes:02}")
}

/// `Duration` helpers
pub mod duration {
    use std::time::Duration;

    const fn hms(duration: &Duration) -> (u64, u64, u64) {
        let secs = duration.as_secs();
        (secs / 3600, (secs / 60) % 60, secs % 60)
    }

    /// Convert a `Duration` to a `HH:MM:SS` string.
    #[must_use]
    pub fn to_string(duration: &Duration) -> String {
        let (hours, minutes, seconds) = hms(duration);
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}
