//! Wall-clock timestamps for the operation log.
//!
//! Every [`Operation`](crate::Operation) and every merge bookmark carries a
//! [`Timestamp`]: a UTC instant with microsecond precision. The persisted
//! form is a fixed-width ISO-8601 string (`2024-05-01T09:30:00.000125`), so
//! comparing two persisted strings lexically gives the same answer as
//! comparing the instants.
//!
//! # Example
//!
//! ```
//! use gradesync::clock::{Clock, WallClock};
//!
//! let clock = WallClock::new();
//! let t1 = clock.now();
//! let t2 = clock.now();
//! assert!(t2 > t1);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, NaiveDateTime, Utc};

const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// `0001-01-01T00:00:00.000000`
const MIN_MICROS: i64 = -62_135_596_800_000_000;
/// `9999-12-31T23:59:59.999999`
const MAX_MICROS: i64 = 253_402_300_799_999_999;

/// A point in time, ordered by its microsecond offset from the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// Build a timestamp from microseconds since the Unix epoch.
    ///
    /// Values outside years 1 to 9999 are clamped to that range, where
    /// the four-digit-year text form stays fixed-width.
    pub fn from_micros(micros: i64) -> Self {
        Self {
            micros: micros.clamp(MIN_MICROS, MAX_MICROS),
        }
    }

    /// Microseconds since the Unix epoch.
    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    /// The timestamp one microsecond later, saturating at year 9999.
    pub fn next(&self) -> Self {
        Self::from_micros(self.micros.saturating_add(1))
    }

    fn to_datetime(self) -> DateTime<Utc> {
        // In range by construction.
        DateTime::from_timestamp_micros(self.micros).unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format(FORMAT))
    }
}

/// Error returned when a string is not a recognised timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimestampError(String);

impl fmt::Display for ParseTimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid timestamp: {:?}", self.0)
    }
}

impl std::error::Error for ParseTimestampError {}

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    /// Accepts the canonical form, the same form without fractional
    /// seconds, and RFC 3339 with an explicit offset.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(Self::from_micros(naive.and_utc().timestamp_micros()));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self::from_micros(dt.timestamp_micros()));
        }
        Err(ParseTimestampError(s.to_string()))
    }
}

impl serde::Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Source of timestamps for log entries and merge bookmarks.
///
/// One clock is shared by every replica in a process so that "now" is
/// comparable across their logs.
pub trait Clock: Send + Sync {
    /// Return a timestamp strictly greater than any this clock returned before.
    fn now(&self) -> Timestamp;
}

fn system_time_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// System wall clock with a monotonic guard.
///
/// If the physical clock stalls or steps backward, the returned value is
/// bumped one microsecond past the previous one.
pub struct WallClock {
    last: AtomicI64,
    time_fn: fn() -> i64,
}

impl WallClock {
    /// Clock backed by `SystemTime`.
    pub fn new() -> Self {
        Self::with_time_source(system_time_micros)
    }

    /// Clock with a custom physical time source returning microseconds
    /// since the Unix epoch.
    pub fn with_time_source(time_fn: fn() -> i64) -> Self {
        Self {
            last: AtomicI64::new(i64::MIN),
            time_fn,
        }
    }

    /// The last timestamp handed out, if any.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        match self.last.load(Ordering::SeqCst) {
            i64::MIN => None,
            micros => Some(Timestamp::from_micros(micros)),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> Timestamp {
        let physical = (self.time_fn)();
        let mut next = physical;
        // fetch_update retries on contention; the closure never returns None.
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                next = if physical > last {
                    physical
                } else {
                    last.saturating_add(1)
                };
                Some(next)
            });
        Timestamp::from_micros(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static MOCK_TIME: AtomicI64 = AtomicI64::new(1_000_000);

    fn mock_time() -> i64 {
        MOCK_TIME.load(Ordering::SeqCst)
    }

    fn frozen_time() -> i64 {
        1_700_000_000_000_000
    }

    #[test]
    fn strictly_increasing_when_time_stalls() {
        let clock = WallClock::with_time_source(frozen_time);

        let t1 = clock.now();
        let t2 = clock.now();
        let t3 = clock.now();

        assert_eq!(t1.as_micros(), frozen_time());
        assert_eq!(t2, t1.next());
        assert_eq!(t3, t2.next());
    }

    #[test]
    fn survives_backward_step() {
        MOCK_TIME.store(5_000_000, Ordering::SeqCst);
        let clock = WallClock::with_time_source(mock_time);
        let t1 = clock.now();

        MOCK_TIME.store(1_000_000, Ordering::SeqCst);
        let t2 = clock.now();
        assert!(t2 > t1);
        assert_eq!(clock.last_timestamp(), Some(t2));
    }

    #[test]
    fn display_is_fixed_width_iso() {
        let ts = Timestamp::from_micros(1_714_555_800_000_125);
        assert_eq!(ts.to_string(), "2024-05-01T09:30:00.000125");

        let whole = Timestamp::from_micros(1_714_555_800_000_000);
        assert_eq!(whole.to_string(), "2024-05-01T09:30:00.000000");
    }

    #[test]
    fn lexical_order_matches_time_order() {
        let a = Timestamp::from_micros(1_714_555_800_000_999);
        let b = Timestamp::from_micros(1_714_555_800_001_000);
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn parses_all_accepted_forms() {
        let canonical: Timestamp = "2024-05-01T09:30:00.000125".parse().unwrap();
        assert_eq!(canonical.as_micros(), 1_714_555_800_000_125);

        let coarse: Timestamp = "2024-05-01T09:30:00".parse().unwrap();
        assert_eq!(coarse.as_micros(), 1_714_555_800_000_000);

        let offset: Timestamp = "2024-05-01T11:30:00.000125+02:00".parse().unwrap();
        assert_eq!(offset, canonical);

        assert!("yesterday".parse::<Timestamp>().is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let ts = Timestamp::from_micros(1_714_555_800_000_125);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2024-05-01T09:30:00.000125\"");

        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn out_of_range_micros_clamp_and_round_trip() {
        let far = Timestamp::from_micros(i64::MAX);
        assert_eq!(far.to_string(), "9999-12-31T23:59:59.999999");
        assert_eq!(far.to_string().parse::<Timestamp>().unwrap(), far);
        assert_eq!(far.next(), far);

        let early = Timestamp::from_micros(i64::MIN);
        assert_eq!(early.to_string(), "0001-01-01T00:00:00.000000");
        assert_eq!(early.to_string().parse::<Timestamp>().unwrap(), early);
    }
}
