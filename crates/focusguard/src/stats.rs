//! Focus statistics
//!
//! Rolls daily aggregates up into the numbers shown to the user:
//! - Minutes of completed focus
//! - Completed and interrupted session counts
//! - Success rate

use crate::session::DailyAggregate;

/// Statistics over one or more days
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FocusStats {
    /// Minutes from completed sessions
    pub minutes: u32,
    pub completed: u32,
    pub interrupted: u32,
    /// completed / (completed + interrupted) as a percentage, 0 with no sessions
    pub success_rate: f64,
}

impl FocusStats {
    pub fn from_day(day: &DailyAggregate) -> Self {
        Self::from_days(std::slice::from_ref(day))
    }

    pub fn from_days(days: &[DailyAggregate]) -> Self {
        let minutes = days.iter().map(|d| d.total_minutes).sum();
        let completed = days.iter().map(|d| d.completed).sum();
        let interrupted = days.iter().map(|d| d.interrupted).sum();

        Self {
            minutes,
            completed,
            interrupted,
            success_rate: success_rate(completed, interrupted),
        }
    }

    pub fn sessions(&self) -> u32 {
        self.completed + self.interrupted
    }

    /// Total focus time as (hours, minutes)
    pub fn total_time(&self) -> (u32, u32) {
        (self.minutes / 60, self.minutes % 60)
    }
}

pub fn success_rate(completed: u32, interrupted: u32) -> f64 {
    let total = completed + interrupted;
    if total == 0 {
        0.0
    } else {
        f64::from(completed) * 100.0 / f64::from(total)
    }
}
