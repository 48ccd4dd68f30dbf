//! Session statistics

pub mod media;
pub mod scheduling;

pub use media::{MediaStats, SessionMetrics, StatsSnapshot};
pub use scheduling::SchedulingStats;
