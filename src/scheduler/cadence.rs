use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid cadence {input:?}: {reason}")]
pub struct CadenceError {
    input: String,
    reason: &'static str,
}

/// How often a recurring job fires.
///
/// Parsed from cron-style descriptors: `@hourly`, `@daily`, `@weekly`, or
/// `@every <duration>` with a humantime duration (e.g. `@every 1h30m`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cadence {
    interval: Duration,
}

impl Cadence {
    pub fn every(interval: Duration) -> Result<Self, CadenceError> {
        if interval.is_zero() {
            return Err(CadenceError {
                input: humantime::format_duration(interval).to_string(),
                reason: "interval must be non-zero",
            });
        }
        Ok(Self { interval })
    }

    pub fn hourly() -> Self {
        Self {
            interval: Duration::from_secs(HOUR),
        }
    }

    pub fn daily() -> Self {
        Self {
            interval: Duration::from_secs(DAY),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The next due time when computed from `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.interval) {
            Ok(step) => now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC),
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }
}

impl FromStr for Cadence {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| CadenceError {
            input: s.to_string(),
            reason,
        };

        let interval = match s.trim() {
            "@hourly" => Duration::from_secs(HOUR),
            "@daily" | "@midnight" => Duration::from_secs(DAY),
            "@weekly" => Duration::from_secs(7 * DAY),
            other => {
                let every = other
                    .strip_prefix("@every")
                    .ok_or_else(|| err("expected @hourly, @daily, @weekly or @every <duration>"))?;
                humantime::parse_duration(every.trim()).map_err(|_| err("malformed duration"))?
            }
        };

        if interval.is_zero() {
            return Err(err("interval must be non-zero"));
        }
        Ok(Self { interval })
    }
}

impl TryFrom<String> for Cadence {
    type Error = CadenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cadence> for String {
    fn from(cadence: Cadence) -> Self {
        cadence.to_string()
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.interval.as_secs();
        if self.interval.subsec_nanos() != 0 {
            return write!(f, "@every {}ms", self.interval.as_millis());
        }
        match secs {
            HOUR => write!(f, "@hourly"),
            DAY => write!(f, "@daily"),
            s if s == 7 * DAY => write!(f, "@weekly"),
            s if s % HOUR == 0 => write!(f, "@every {}h", s / HOUR),
            s if s % MINUTE == 0 => write!(f, "@every {}m", s / MINUTE),
            s => write!(f, "@every {}s", s),
        }
    }
}
