//! Partial PIT timestamps
//!
//! A PIT timestamp names an image by as much time as is needed to tell it
//! apart from the others: `YYYY-MM-DD`, optionally followed by `HH`,
//! `HH:MM` or `HH:MM:SS` and an optional `AM`/`PM` marker. Without a marker
//! the hour is read as 24-hour time. The sentinels `newest` and `oldest`
//! select by sequence number instead of by time.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SnapError};

/// Parsed `pit_timestamp` argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PitTimestamp {
    /// Group's last sequence number
    Newest,
    /// Group's first sequence number
    Oldest,
    /// Literal (possibly partial) point in time
    At(TimestampSpec),
}

/// Calendar date with optional time-of-day components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampSpec {
    pub date: NaiveDate,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub second: Option<u32>,
}

impl TimestampSpec {
    /// Whether `at` matches every component this spec defines
    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        self.date.year() == at.year()
            && self.date.month() == at.month()
            && self.date.day() == at.day()
            && self.hour.map_or(true, |h| h == at.hour())
            && self.minute.map_or(true, |m| m == at.minute())
            && self.second.map_or(true, |s| s == at.second())
    }

    /// Number of components given (3 = date only, 6 = down to the second)
    pub fn precision(&self) -> usize {
        3 + [self.hour, self.minute, self.second]
            .iter()
            .filter(|c| c.is_some())
            .count()
    }
}

/// Convert an image's unix timestamp into calendar time (UTC)
pub fn image_time(unix_secs: u64) -> Option<NaiveDateTime> {
    let secs = i64::try_from(unix_secs).ok()?;
    DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

fn invalid(input: &str) -> SnapError {
    SnapError::Validation(format!(
        "Invalid pit_timestamp [{}]; expected YYYY-MM-DD HH:MM:SS (AM|PM) with optional time portion, newest or oldest",
        input
    ))
}

fn two_digits(field: &str) -> Option<u32> {
    if field.len() == 2 && field.bytes().all(|b| b.is_ascii_digit()) {
        field.parse().ok()
    } else {
        None
    }
}

fn parse_date(token: &str) -> Option<NaiveDate> {
    let shaped = token.len() == 10
        && token.bytes().enumerate().all(|(i, b)| match i {
            4 | 7 => b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shaped {
        return None;
    }
    NaiveDate::parse_from_str(token, "%Y-%m-%d").ok()
}

impl FromStr for PitTimestamp {
    type Err = SnapError;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        match trimmed {
            "newest" => return Ok(PitTimestamp::Newest),
            "oldest" => return Ok(PitTimestamp::Oldest),
            _ => {}
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.is_empty() || tokens.len() > 3 {
            return Err(invalid(input));
        }

        let date = parse_date(tokens[0]).ok_or_else(|| invalid(input))?;
        let mut spec = TimestampSpec {
            date,
            hour: None,
            minute: None,
            second: None,
        };

        let Some(time) = tokens.get(1) else {
            return Ok(PitTimestamp::At(spec));
        };

        let fields: Vec<&str> = time.split(':').collect();
        if fields.len() > 3 {
            return Err(invalid(input));
        }
        let mut values = Vec::with_capacity(fields.len());
        for field in &fields {
            values.push(two_digits(field).ok_or_else(|| invalid(input))?);
        }

        let mut hour = values[0];
        match tokens.get(2).map(|m| m.to_ascii_uppercase()) {
            Some(marker) if marker == "AM" || marker == "PM" => {
                if !(1..=12).contains(&hour) {
                    return Err(invalid(input));
                }
                hour = match (marker.as_str(), hour) {
                    ("AM", 12) => 0,
                    ("AM", h) => h,
                    ("PM", 12) => 12,
                    (_, h) => h + 12,
                };
            }
            Some(_) => return Err(invalid(input)),
            None if hour > 23 => return Err(invalid(input)),
            None => {}
        }

        spec.hour = Some(hour);
        if let Some(&minute) = values.get(1) {
            if minute > 59 {
                return Err(invalid(input));
            }
            spec.minute = Some(minute);
        }
        if let Some(&second) = values.get(2) {
            if second > 59 {
                return Err(invalid(input));
            }
            spec.second = Some(second);
        }

        Ok(PitTimestamp::At(spec))
    }
}

impl fmt::Display for PitTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PitTimestamp::Newest => f.write_str("newest"),
            PitTimestamp::Oldest => f.write_str("oldest"),
            PitTimestamp::At(spec) => {
                write!(f, "{}", spec.date.format("%Y-%m-%d"))?;
                if let Some(h) = spec.hour {
                    write!(f, " {:02}", h)?;
                }
                if let Some(m) = spec.minute {
                    write!(f, ":{:02}", m)?;
                }
                if let Some(s) = spec.second {
                    write!(f, ":{:02}", s)?;
                }
                Ok(())
            }
        }
    }
}
