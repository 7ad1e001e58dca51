use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

const DAY_MS: i64 = 1000 * 60 * 60 * 24;

/// Developer clock override. Present fields substitute the wall-clock
/// date and time-of-day; absent fields fall back to the real value.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClockOverride {
    pub date: Option<String>,
    pub time: Option<String>,
}

/// Source of "now" as a wall-clock value in a fixed civil timezone.
/// All window arithmetic runs on these local-naive values, never on
/// UTC instants.
#[derive(Clone, Debug)]
pub struct Clock {
    tz: Tz,
    override_path: Option<PathBuf>,
}

impl Clock {
    pub fn new(tz: Tz) -> Clock {
        Clock {
            tz,
            override_path: None,
        }
    }

    /// Dev-only constructor: consults the override file on every call so
    /// a running service picks up edits without a restart.
    pub fn with_override_path(tz: Tz, path: impl AsRef<Path>) -> Clock {
        Clock {
            tz,
            override_path: Some(path.as_ref().to_path_buf()),
        }
    }

    pub fn now(&self) -> NaiveDateTime {
        let real = Utc::now().with_timezone(&self.tz).naive_local();
        match self.load_override() {
            Some(ov) if ov.date.is_some() || ov.time.is_some() => apply_override(&ov, real),
            _ => real,
        }
    }

    fn load_override(&self) -> Option<ClockOverride> {
        let path = self.override_path.as_ref()?;
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// Substitutes the override fields into the real wall-clock value.
/// Seconds are dropped whenever an override is active: the override
/// format carries minute precision only.
fn apply_override(ov: &ClockOverride, real: NaiveDateTime) -> NaiveDateTime {
    let date = ov
        .date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .unwrap_or_else(|| real.date());
    let time = ov
        .time
        .as_deref()
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok())
        .or_else(|| NaiveTime::from_hms_opt(real.hour(), real.minute(), 0))
        .unwrap_or_else(|| real.time());
    date.and_time(time)
}

/// Whole days elapsed since midnight (local) of the start date, by floor
/// division of the millisecond difference. This is a naive elapsed-time
/// calculation, not a calendar-day difference: a DST shift in the
/// configured zone can skew a boundary by an hour. Known approximation,
/// kept as the product defines it.
pub fn day_index(start_date: NaiveDate, now: NaiveDateTime) -> i64 {
    let start = start_date.and_time(NaiveTime::MIN);
    (now - start).num_milliseconds().div_euclid(DAY_MS)
}

/// True iff `open_hour <= hour < close_hour`.
pub fn in_window(hour: u32, open_hour: u32, close_hour: u32) -> bool {
    hour >= open_hour && hour < close_hour
}
