//! Focus session records
//!
//! A [`Session`] is one focus attempt. It is written once when opened and
//! once more when closed; after that it never changes.

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Note stored when the countdown ran out
pub const NOTE_COMPLETED: &str = "Completed in full";
/// Note stored when the user stopped the session early
pub const NOTE_STOPPED: &str = "Stopped early by user";
/// Note stored when a recovered session is interrupted instead of resumed
pub const NOTE_RESTART: &str = "Interrupted by application restart";
/// Note stored when the application quits mid-session
pub const NOTE_EXITED: &str = "Application exited";

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Completed,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Completed => "completed",
            SessionStatus::Interrupted => "interrupted",
        }
    }
}

/// One focus attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Store-assigned, monotonically increasing
    pub id: i64,
    pub start_time: DateTime<Utc>,
    /// Absent while the session is open
    pub end_time: Option<DateTime<Utc>>,
    /// Planned length in minutes
    pub planned_minutes: u32,
    /// Minutes actually spent, set at close
    pub actual_minutes: Option<u32>,
    pub completed: bool,
    pub interrupted: bool,
    /// Hostnames targeted for blocking when the session started
    pub websites: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn status(&self) -> SessionStatus {
        if self.is_open() {
            SessionStatus::Open
        } else if self.completed {
            SessionStatus::Completed
        } else {
            SessionStatus::Interrupted
        }
    }

    /// When the countdown for this session reaches zero
    pub fn deadline(&self) -> DateTime<Utc> {
        self.start_time + Duration::minutes(i64::from(self.planned_minutes))
    }

    /// Seconds left until the deadline, zero once it has passed
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        remaining_until(self.deadline(), now)
    }

    /// Whole minutes elapsed since the session started
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> u32 {
        let secs = now.signed_duration_since(self.start_time).num_seconds().max(0);
        u32::try_from(secs / 60).unwrap_or(u32::MAX)
    }

    /// Progress through the planned duration as 0-100
    pub fn progress_percent(&self, now: DateTime<Utc>) -> u32 {
        let total = i64::from(self.planned_minutes) * 60;
        if total == 0 {
            return 100;
        }
        let elapsed = now.signed_duration_since(self.start_time).num_seconds().clamp(0, total);
        ((elapsed * 100) / total) as u32
    }

    /// Calendar day the session is accounted under
    pub fn date(&self) -> NaiveDate {
        local_date(self.start_time)
    }
}

/// Per-day rollup of closed sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    /// Minutes from completed sessions only
    pub total_minutes: u32,
    pub completed: u32,
    pub interrupted: u32,
}

impl DailyAggregate {
    /// An all-zero entry for a day with no closed sessions
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_minutes: 0,
            completed: 0,
            interrupted: 0,
        }
    }

    pub fn sessions(&self) -> u32 {
        self.completed + self.interrupted
    }
}

/// The local calendar date of a timestamp
pub fn local_date(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

pub(crate) fn remaining_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let secs = deadline.signed_duration_since(now).num_seconds();
    u64::try_from(secs).unwrap_or(0)
}
