//! Scheduling jitter statistics
//!
//! Tracks how far periodic events land from their expected deadline.

use serde::Serialize;

/// Deviations beyond this multiple of the period are not accumulated
const OUTLIER_FACTOR: u64 = 10;

/// Deadline statistics for one periodic event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulingStats {
    pub total_updates: u64,
    pub last_update_us: u64,
    pub overdue_count: u64,
    pub total_overdue_us: u64,
    pub max_overdue_us: u64,
    pub premature_count: u64,
    pub total_premature_us: u64,
    pub max_premature_us: u64,
    pub exact_count: u64,
    /// Classified updates whose deviation was too large to accumulate
    pub outlier_count: u64,
    /// Sum of accepted inter-update intervals
    pub total_scheduling_time_us: u64,
}

/// How an update compares with its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// No previous update to compare against
    First,
    Overdue(u64),
    Premature(u64),
    Exact,
}

impl SchedulingStats {
    /// Records an event at `now_us` that was expected `expected_us` after the last
    pub fn update(&mut self, now_us: u64, expected_us: u64) -> Deadline {
        let last = self.last_update_us;
        self.total_updates += 1;
        self.last_update_us = now_us;

        if last == 0 {
            return Deadline::First;
        }

        let deadline = last + expected_us;
        let interval = now_us.saturating_sub(last);
        let limit = OUTLIER_FACTOR * expected_us;

        let (class, delta) = if deadline < now_us {
            self.overdue_count += 1;
            (Deadline::Overdue(now_us - deadline), now_us - deadline)
        } else if deadline > now_us {
            self.premature_count += 1;
            (Deadline::Premature(deadline - now_us), deadline - now_us)
        } else {
            self.exact_count += 1;
            (Deadline::Exact, 0)
        };

        if delta > limit {
            self.outlier_count += 1;
            return class;
        }
        match class {
            Deadline::Overdue(_) => {
                self.max_overdue_us = self.max_overdue_us.max(delta);
                self.total_overdue_us += delta;
            }
            Deadline::Premature(_) => {
                self.max_premature_us = self.max_premature_us.max(delta);
                self.total_premature_us += delta;
            }
            Deadline::Exact | Deadline::First => {}
        }
        self.total_scheduling_time_us += interval;
        class
    }

    /// Average accepted interval in milliseconds
    pub fn average_interval_ms(&self) -> f64 {
        let n = self.overdue_count + self.premature_count + self.exact_count
            - self.outlier_count;
        if n == 0 {
            return 0.0;
        }
        self.total_scheduling_time_us as f64 / n as f64 / 1000.0
    }

    pub fn average_overdue_ms(&self) -> f64 {
        if self.overdue_count == 0 {
            return 0.0;
        }
        self.total_overdue_us as f64 / self.overdue_count as f64 / 1000.0
    }

    pub fn average_premature_ms(&self) -> f64 {
        if self.premature_count == 0 {
            return 0.0;
        }
        self.total_premature_us as f64 / self.premature_count as f64 / 1000.0
    }
}
