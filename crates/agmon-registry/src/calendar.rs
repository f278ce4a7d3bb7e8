//! Timezone-aware clock and report calendar helpers.
//!
//! Deterministic helpers are pure functions over `NaiveDate`/`NaiveTime`;
//! only [`Clock::now_local`] touches the wall clock.

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;

use crate::PollingWindow;

/// Wall-clock access pinned to the configured report timezone.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    tz: Tz,
}

impl Clock {
    pub fn new(tz: Tz) -> Self {
        Clock { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn now_local(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    /// Today's calendar date in the report timezone.
    pub fn today_local(&self) -> NaiveDate {
        self.now_local().date_naive()
    }
}

/// Weekend heuristic: reports do not publish on Saturday/Sunday.
pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// True when the local instant falls inside any of the report's windows.
pub fn within_any_window(windows: &[PollingWindow], local: DateTime<Tz>) -> bool {
    let t = local.time();
    windows.iter().any(|w| w.contains(t))
}

/// Upstream date token format (`MM/DD/YYYY`).
pub fn mmddyyyy(date: NaiveDate) -> String {
    date.format("%m/%d/%Y").to_string()
}

/// Parse an upstream date value, tolerating surrounding whitespace and
/// single-digit month/day.
pub fn parse_mmddyyyy(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%m/%d/%Y").ok()
}
