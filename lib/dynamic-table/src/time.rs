use std::ops::{Add, Sub};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::TableError;

/// Storage timestamp with microsecond precision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageDatetime(pub DateTime<Utc>);

// Serialized as the RFC 3339 string with microseconds that rows carry.
impl Serialize for StorageDatetime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for StorageDatetime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StorageDatetime::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl StorageDatetime {
    /// The current time, truncated to microseconds.
    pub fn now() -> Self {
        StorageDatetime(Utc::now().trunc_subsecs(6))
    }

    pub fn parse(s: &str) -> Result<Self, TableError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| StorageDatetime(dt.with_timezone(&Utc)))
            .map_err(|e| TableError::StorageError(format!("Invalid datetime {s:?}: {e}")))
    }

    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }

    /// Midnight UTC of the same day.
    pub fn start_of_day(&self) -> Self {
        let date = self.0.date_naive();
        match date.and_hms_opt(0, 0, 0) {
            Some(midnight) => StorageDatetime(midnight.and_utc()),
            None => self.clone(),
        }
    }

    pub fn inner(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl Default for StorageDatetime {
    fn default() -> Self {
        Self::now()
    }
}

fn signed(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl Add<Duration> for StorageDatetime {
    type Output = StorageDatetime;

    fn add(self, rhs: Duration) -> Self::Output {
        match self.0.checked_add_signed(signed(rhs)) {
            Some(dt) => StorageDatetime(dt),
            None => self,
        }
    }
}

impl Sub<Duration> for StorageDatetime {
    type Output = StorageDatetime;

    fn sub(self, rhs: Duration) -> Self::Output {
        match self.0.checked_sub_signed(signed(rhs)) {
            Some(dt) => StorageDatetime(dt),
            None => self,
        }
    }
}

impl std::fmt::Display for StorageDatetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for StorageDatetime {
    fn from(dt: DateTime<Utc>) -> Self {
        StorageDatetime(dt.trunc_subsecs(6))
    }
}

impl From<StorageDatetime> for DateTime<Utc> {
    fn from(dt: StorageDatetime) -> Self {
        dt.0
    }
}

/// Text of an interval built from a number of seconds, as PostgreSQL's
/// `interval::text` prints it: all of it in the time part, hours unbounded,
/// trailing zeros of the fraction dropped. `93784` is `26:03:04`, `-1` is
/// `-00:00:01`.
pub fn format_interval(seconds: f64) -> String {
    let total = (seconds * 1_000_000.0).round() as i64;
    let sign = if total < 0 { "-" } else { "" };
    let micros = total.unsigned_abs();
    let whole = micros / 1_000_000;
    let mut text = format!(
        "{}{:02}:{:02}:{:02}",
        sign,
        whole / 3600,
        (whole % 3600) / 60,
        whole % 60
    );
    let fraction = micros % 1_000_000;
    if fraction != 0 {
        let digits = format!("{:06}", fraction);
        text.push('.');
        text.push_str(digits.trim_end_matches('0'));
    }
    text
}
