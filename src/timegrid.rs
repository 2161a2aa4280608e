//! Observation bucket selection.
//!
//! The upstream publishes readings on a fixed 10-minute grid, but the newest
//! bucket is routinely missing for several minutes after its nominal time.
//! `observation_bucket` maps "now" to the grid point one publication delay
//! behind the current bucket, which is the newest reading the upstream is
//! reliably expected to have.
//!
//! Only that single bucket is requested. When the collector runs on a coarser
//! cadence (e.g. hourly) the intermediate buckets are skipped, not backfilled.
//!
//! # Clock injection
//! Everything takes `now` explicitly; the collector passes the wall clock.

use chrono::{Duration, Timelike};

use crate::model::Timestamp;

pub const DEFAULT_GRID_MINUTES: u32 = 10;
pub const DEFAULT_PUBLICATION_DELAY_MINUTES: u32 = 10;

/// Format of the `obsdt` query parameter.
pub const OBSDT_FORMAT: &str = "%Y%m%d%H%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeGrid {
    grid_minutes: u32,
    delay_minutes: u32,
}

impl Default for TimeGrid {
    fn default() -> Self {
        Self {
            grid_minutes: DEFAULT_GRID_MINUTES,
            delay_minutes: DEFAULT_PUBLICATION_DELAY_MINUTES,
        }
    }
}

impl TimeGrid {
    /// Returns `None` unless `grid_minutes` evenly divides an hour.
    pub fn new(grid_minutes: u32, delay_minutes: u32) -> Option<Self> {
        if grid_minutes == 0 || 60 % grid_minutes != 0 {
            return None;
        }
        Some(Self { grid_minutes, delay_minutes })
    }

    pub fn grid_minutes(&self) -> u32 {
        self.grid_minutes
    }

    pub fn delay_minutes(&self) -> u32 {
        self.delay_minutes
    }

    /// Truncates `t` down to the nearest grid boundary of its local clock.
    pub fn truncate(&self, t: Timestamp) -> Timestamp {
        let excess_minutes = i64::from(t.minute() % self.grid_minutes);
        t - Duration::minutes(excess_minutes)
            - Duration::seconds(i64::from(t.second()))
            - Duration::nanoseconds(i64::from(t.nanosecond()))
    }

    /// The bucket to request from the upstream at `now`.
    pub fn observation_bucket(&self, now: Timestamp) -> Timestamp {
        self.truncate(now) - Duration::minutes(i64::from(self.delay_minutes))
    }

    pub fn is_aligned(&self, t: Timestamp) -> bool {
        t.minute() % self.grid_minutes == 0 && t.second() == 0 && t.nanosecond() == 0
    }
}

/// `observation_bucket` on the default 10-minute grid with a 10-minute delay.
pub fn observation_bucket(now: Timestamp) -> Timestamp {
    TimeGrid::default().observation_bucket(now)
}

/// Renders a bucket as the upstream's `obsdt` parameter, e.g. `202506230440`.
pub fn format_obsdt(bucket: Timestamp) -> String {
    bucket.format(OBSDT_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
