//! Warning level classification.
//!
//! Thresholds are inclusive lower bounds: a reading is assigned the highest
//! level whose bound it meets or exceeds, and `Normal` when it is below all
//! of them. Bounds always come from configuration; nothing here hardcodes a
//! station's values.

use serde::Serialize;

use crate::model::{AlertThresholds, Snapshot, StageLevel, StageThresholds, StorageLevel, StorageThresholds};

/// The quantity being classified, which selects the threshold set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    RiverLevel,
    HourlyRainfall,
    CumulativeRainfall,
    DamStorageRate,
}

/// Result of `classify`: river and rainfall use the four-step stage scale,
/// dam storage its own two-step scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Stage(StageLevel),
    Storage(StorageLevel),
}

impl Level {
    /// The level on the stage scale, dam storage ranked alongside.
    pub fn as_stage(self) -> StageLevel {
        match self {
            Level::Stage(stage) => stage,
            Level::Storage(storage) => storage_as_stage(storage),
        }
    }
}

/// Classifies `value` for `indicator` against the deployment's thresholds.
pub fn classify(indicator: Indicator, value: f64, thresholds: &AlertThresholds) -> Level {
    match indicator {
        Indicator::RiverLevel => Level::Stage(stage_level(value, &thresholds.river)),
        Indicator::HourlyRainfall => Level::Stage(stage_level(value, &thresholds.rainfall_hourly)),
        Indicator::CumulativeRainfall => {
            Level::Stage(stage_level(value, &thresholds.rainfall_cumulative))
        }
        Indicator::DamStorageRate => Level::Storage(storage_level(value, &thresholds.dam_storage)),
    }
}

pub fn stage_level(value: f64, thresholds: &StageThresholds) -> StageLevel {
    if value >= thresholds.danger {
        StageLevel::Danger
    } else if value >= thresholds.caution {
        StageLevel::Caution
    } else if value >= thresholds.standby {
        StageLevel::Standby
    } else {
        StageLevel::Normal
    }
}

pub fn storage_level(value: f64, thresholds: &StorageThresholds) -> StorageLevel {
    if value >= thresholds.danger {
        StorageLevel::Danger
    } else if value >= thresholds.warning {
        StorageLevel::Warning
    } else {
        StorageLevel::Normal
    }
}

/// Dam storage levels ranked on the stage scale for the overall level.
fn storage_as_stage(level: StorageLevel) -> StageLevel {
    match level {
        StorageLevel::Normal => StageLevel::Normal,
        StorageLevel::Warning => StageLevel::Caution,
        StorageLevel::Danger => StageLevel::Danger,
    }
}

// ---------------------------------------------------------------------------
// Snapshot assessment
// ---------------------------------------------------------------------------

/// Per-indicator levels of one snapshot plus the overall level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Assessment {
    pub river: StageLevel,
    pub dam: StorageLevel,
    /// The more severe of the hourly and cumulative rainfall levels.
    pub rainfall: StageLevel,
    pub overall: StageLevel,
}

impl Assessment {
    pub fn is_normal(&self) -> bool {
        self.overall == StageLevel::Normal
    }
}

pub fn assess(snapshot: &Snapshot, thresholds: &AlertThresholds) -> Assessment {
    let level = |indicator, value| classify(indicator, value, thresholds);

    let river = level(Indicator::RiverLevel, snapshot.river.water_level).as_stage();
    let dam = match level(Indicator::DamStorageRate, snapshot.dam.storage_rate) {
        Level::Storage(dam) => dam,
        Level::Stage(_) => StorageLevel::Normal,
    };
    let rainfall = level(Indicator::HourlyRainfall, snapshot.rainfall.hourly)
        .as_stage()
        .max(level(Indicator::CumulativeRainfall, snapshot.rainfall.cumulative).as_stage());
    let overall = river.max(rainfall).max(storage_as_stage(dam));

    Assessment { river, dam, rainfall, overall }
}
