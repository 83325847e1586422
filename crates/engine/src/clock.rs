//! Wall-clock source. Every algorithm takes `now` from a [`Clock`] so tests
//! can pin the local time of day.

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use std::fmt::Debug;

/// Persisted timestamp format (local wall time, no offset).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<FixedOffset>;

    /// The instant a local wall-clock time falls on, with that day's own
    /// offset. `None` when the time does not exist locally.
    fn resolve_local(&self, local: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
        self.now().offset().from_local_datetime(&local).single()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().into()
    }

    fn resolve_local(&self, local: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
        Local.from_local_datetime(&local).earliest().map(|t| t.fixed_offset())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use manual::ManualClock;

#[cfg(any(test, feature = "test-util"))]
mod manual {
    use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
    use std::sync::{Mutex, MutexGuard};

    use super::{Clock, TIMESTAMP_FORMAT};

    /// A clock that only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<DateTime<FixedOffset>>,
        offset_change: Mutex<Option<(NaiveDateTime, FixedOffset)>>,
    }

    impl ManualClock {
        pub fn new(now: DateTime<FixedOffset>) -> Self {
            Self {
                now: Mutex::new(now),
                offset_change: Mutex::new(None),
            }
        }

        /// Build a UTC clock from a `YYYY-MM-DD HH:MM:SS` string.
        pub fn at(local: &str) -> Self {
            let naive = NaiveDateTime::parse_from_str(local, TIMESTAMP_FORMAT)
                .unwrap_or_else(|e| panic!("bad clock literal '{local}': {e}"));
            Self::new(Utc.fix().from_utc_datetime(&naive))
        }

        pub fn set(&self, now: DateTime<FixedOffset>) {
            *self.lock() = now;
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.lock();
            *now += by;
        }

        /// Local times from `from` on resolve with `offset`, like a
        /// daylight saving change.
        pub fn change_offset_at(&self, from: NaiveDateTime, offset: FixedOffset) {
            *self.offset_change.lock().unwrap_or_else(|p| p.into_inner()) = Some((from, offset));
        }

        fn lock(&self) -> MutexGuard<'_, DateTime<FixedOffset>> {
            self.now.lock().unwrap_or_else(|p| p.into_inner())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<FixedOffset> {
            *self.lock()
        }

        fn resolve_local(&self, local: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
            let change = *self.offset_change.lock().unwrap_or_else(|p| p.into_inner());
            let offset = match change {
                Some((from, offset)) if local >= from => offset,
                _ => *self.now().offset(),
            };
            offset.from_local_datetime(&local).single()
        }
    }
}

/// Format a timestamp the way the snapshot stores it.
pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a persisted timestamp. Accepts the snapshot format (interpreted in
/// `offset`) and RFC 3339.
pub fn parse_timestamp(value: &str, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts);
    }
    let naive = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()?;
    offset.from_local_datetime(&naive).single()
}
