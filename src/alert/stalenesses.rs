/// Snapshot freshness grading.
///
/// The collector runs every 10 to 60 minutes and never alerts on its own
/// failures; a latest snapshot that keeps getting older is the signal that
/// collection is in trouble. This module turns that age into a grade the
/// dashboard and the `latest` command can show.
///
/// # Clock injection
/// All functions accept a `now` parameter rather than reading the clock
/// internally, so grading is deterministic in tests.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::model::Snapshot;

/// Younger than this is `Fresh`.
pub const FRESH_MINUTES: i64 = 60;
/// Younger than this (and not fresh) is `Aging`; anything older is `Stale`.
pub const AGING_MINUTES: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Freshness {
    Fresh,
    Aging,
    Stale,
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Freshness::Fresh => write!(f, "fresh"),
            Freshness::Aging => write!(f, "aging"),
            Freshness::Stale => write!(f, "stale"),
        }
    }
}

/// Whole minutes since the snapshot was collected. Negative if the snapshot
/// claims to come from the future (clock skew).
pub fn age_minutes_at<Tz: TimeZone>(snapshot: &Snapshot, now: DateTime<Tz>) -> i64 {
    now.with_timezone(&Utc)
        .signed_duration_since(snapshot.collection_time.with_timezone(&Utc))
        .num_minutes()
}

pub fn freshness_at<Tz: TimeZone>(snapshot: &Snapshot, now: DateTime<Tz>) -> Freshness {
    let age = age_minutes_at(snapshot, now);
    if age < FRESH_MINUTES {
        Freshness::Fresh
    } else if age < AGING_MINUTES {
        Freshness::Aging
    } else {
        Freshness::Stale
    }
}

/// Returns `true` if the snapshot was collected more than `max_age_minutes`
/// before `now`. Age equal to the threshold is not stale.
pub fn is_stale_at<Tz: TimeZone>(snapshot: &Snapshot, max_age_minutes: i64, now: DateTime<Tz>) -> bool {
    age_minutes_at(snapshot, now) > max_age_minutes
}

/// Convenience wrapper that uses the real current time.
/// Use `freshness_at` in tests to keep them deterministic.
pub fn freshness(snapshot: &Snapshot) -> Freshness {
    freshness_at(snapshot, Utc::now())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
