//! Five-field cron patterns.
//!
//! Each field is either `*` or one fixed value, and a time matches when every
//! fixed field matches. Day-of-week counts from Sunday = 0; 7 is accepted as
//! Sunday too.

use std::fmt;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Timelike};

use crate::config::ConfigError;

/// Far enough to reach any valid day/month/weekday combination, Feb 29 on a Monday included.
const SEARCH_DAYS: i64 = 366 * 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CronPattern {
    pub minute: Option<u32>,
    pub hour: Option<u32>,
    pub day: Option<u32>,
    pub month: Option<u32>,
    pub weekday: Option<u32>,
}

impl CronPattern {
    pub fn new(
        minute: Option<u32>,
        hour: Option<u32>,
        day: Option<u32>,
        month: Option<u32>,
        weekday: Option<u32>,
    ) -> Result<Self, ConfigError> {
        let pattern = Self {
            minute,
            hour,
            day,
            month,
            weekday: weekday.map(|w| w % 7),
        };
        pattern.validate(&pattern.to_string())?;
        Ok(pattern)
    }

    /// Parse `"min hour day month weekday"`, each field `*` or a number.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let fields: Vec<&str> = pattern.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(pattern, format!("expected 5 fields, got {}", fields.len())));
        }

        let mut values = [None; 5];
        for (slot, field) in values.iter_mut().zip(&fields) {
            *slot = match *field {
                "*" => None,
                number => Some(
                    number
                        .parse::<u32>()
                        .map_err(|_| invalid(pattern, format!("'{}' is not * or a number", number)))?,
                ),
            };
        }

        let parsed = Self {
            minute: values[0],
            hour: values[1],
            day: values[2],
            month: values[3],
            weekday: values[4].map(|w| w % 7),
        };
        parsed.validate(pattern)?;
        Ok(parsed)
    }

    fn validate(&self, pattern: &str) -> Result<(), ConfigError> {
        let checks = [
            ("minute", self.minute, 0, 59),
            ("hour", self.hour, 0, 23),
            ("day", self.day, 1, 31),
            ("month", self.month, 1, 12),
            ("weekday", self.weekday, 0, 6),
        ];
        for (name, value, low, high) in checks {
            if let Some(value) = value {
                if value < low || value > high {
                    return Err(invalid(
                        pattern,
                        format!("{} {} outside {}..={}", name, value, low, high),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn matches_date(&self, date: NaiveDate) -> bool {
        field_matches(self.day, date.day())
            && field_matches(self.month, date.month())
            && field_matches(self.weekday, date.weekday().num_days_from_sunday())
    }

    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        self.matches_date(at.date())
            && field_matches(self.hour, at.hour())
            && field_matches(self.minute, at.minute())
    }

    /// First matching minute strictly after `after`, in local wall-clock terms.
    pub fn next_after_naive(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = after.date();
        let after_minute = after.hour() * 60 + after.minute();

        for offset in 0..SEARCH_DAYS {
            let date = start.checked_add_signed(ChronoDuration::days(offset))?;
            if !self.matches_date(date) {
                continue;
            }
            for hour in candidates(self.hour, 24) {
                for minute in candidates(self.minute, 60) {
                    if offset == 0 && hour * 60 + minute <= after_minute {
                        continue;
                    }
                    return date.and_hms_opt(hour, minute, 0);
                }
            }
        }
        None
    }

    /// Next fire time after `after` in `after`'s time zone. Local times that
    /// do not exist (skipped by a DST change) are passed over.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let zone = after.timezone();
        let mut cursor = after.naive_local();
        for _ in 0..4 {
            let next = self.next_after_naive(cursor)?;
            if let Some(resolved) = zone.from_local_datetime(&next).earliest() {
                return Some(resolved);
            }
            cursor = next;
        }
        None
    }
}

impl fmt::Display for CronPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [self.minute, self.hour, self.day, self.month, self.weekday];
        let rendered: Vec<String> = fields
            .iter()
            .map(|field| match field {
                Some(value) => value.to_string(),
                None => "*".to_string(),
            })
            .collect();
        write!(f, "{}", rendered.join(" "))
    }
}

fn field_matches(field: Option<u32>, value: u32) -> bool {
    field.is_none_or(|expected| expected == value)
}

fn candidates(field: Option<u32>, range: u32) -> Vec<u32> {
    match field {
        Some(value) => vec![value],
        None => (0..range).collect(),
    }
}

fn invalid(pattern: &str, reason: String) -> ConfigError {
    ConfigError::Cron {
        pattern: pattern.to_string(),
        reason,
    }
}
