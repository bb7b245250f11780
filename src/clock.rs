//! Wall-clock access for overlays, file names and status timestamps.

use chrono::{DateTime, Local, NaiveDateTime};
use std::sync::Mutex;
use std::time::SystemTime;

/// Source of the current local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock pinned to a settable instant. Used by tests and demos.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `YYYY-MM-DDTHH:MM:SS.ffffff`, local time without offset.
pub fn iso_timestamp(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// ISO timestamp for a filesystem time, converted to local time.
pub fn iso_from_system(at: SystemTime) -> String {
    let local: DateTime<Local> = at.into();
    iso_timestamp(local.naive_local())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn fixed_clock_advances() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid date");
        let clock = FixedClock::new(start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(iso_timestamp(clock.now()), "2024-01-01T00:01:30.000000");
    }
}
