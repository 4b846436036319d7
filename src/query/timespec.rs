//! Query timestamps: `now`, absolute milliseconds, or relative expressions
//! like `1w 2d` counted back from now.

use std::{fmt, str::FromStr};

use crate::db::StoreError;

const SECOND: i64 = 1000;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const MONTH: i64 = 30 * DAY;
const YEAR: i64 = 365 * DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeSpec {
    Now,
    /// Absolute milliseconds since the epoch. `At(0)` on a start bound means
    /// "from the item's earliest record".
    At(i64),
    /// Milliseconds before now.
    Ago(i64),
}

impl TimeSpec {
    /// Concrete timestamp relative to `now`; future instants clamp to `now`.
    pub fn resolve(&self, now: i64) -> i64 {
        match self {
            TimeSpec::Now => now,
            TimeSpec::At(time) => (*time).min(now),
            TimeSpec::Ago(duration) => now - duration,
        }
    }

    pub fn is_origin(&self) -> bool {
        matches!(self, TimeSpec::At(0))
    }

    fn parse_frame(frame: &str) -> Result<i64, StoreError> {
        if let Ok(ms) = frame.parse::<i64>() {
            return Ok(ms);
        }

        let invalid = || StoreError::InvalidQuery(format!("malformed time frame '{frame}'"));
        let unit = frame.chars().last().ok_or_else(invalid)?;
        let factor = match unit {
            's' => SECOND,
            'i' => MINUTE,
            'h' => HOUR,
            'd' => DAY,
            'w' => WEEK,
            'm' => MONTH,
            'y' => YEAR,
            _ => return Err(invalid()),
        };
        let amount: i64 = frame[..frame.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;
        amount.checked_mul(factor).ok_or_else(invalid)
    }
}

impl Default for TimeSpec {
    fn default() -> Self {
        TimeSpec::Now
    }
}

impl FromStr for TimeSpec {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() || value == "now" {
            return Ok(TimeSpec::Now);
        }
        if let Ok(time) = value.parse::<i64>() {
            return Ok(TimeSpec::At(time));
        }

        let mut duration: i64 = 0;
        for frame in value.split_whitespace().filter(|frame| *frame != "now") {
            duration = duration.saturating_add(Self::parse_frame(frame)?);
        }
        Ok(TimeSpec::Ago(duration.max(0)))
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSpec::Now => f.write_str("now"),
            TimeSpec::At(time) => write!(f, "{time}"),
            TimeSpec::Ago(duration) if duration % SECOND == 0 => {
                write!(f, "{}s", duration / SECOND)
            }
            // A lone integer would read back as an absolute time.
            TimeSpec::Ago(duration) => write!(f, "0s {duration}"),
        }
    }
}

impl From<i64> for TimeSpec {
    fn from(time: i64) -> Self {
        TimeSpec::At(time)
    }
}
