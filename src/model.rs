/// Core data types for the Kotogawa dam and river monitoring service.
///
/// This module defines the shared domain model imported by all other modules:
/// the persisted `Snapshot`, the raw field set handed over by a fetcher,
/// alert levels and thresholds, and the error taxonomy of a collection cycle.
/// It contains no I/O.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every instant in this service carries the upstream's local UTC offset
/// (JST by default), so partition dates match the publisher's calendar.
pub type Timestamp = DateTime<FixedOffset>;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Dam readings for one cycle. `storage_change` is the water level delta
/// against the previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamReading {
    pub water_level: f64,  // m
    pub storage_rate: f64, // %
    pub inflow: f64,       // m3/s
    pub outflow: f64,      // m3/s
    pub storage_change: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiverReading {
    pub water_level: f64, // m
    pub level_change: Option<f64>,
    pub status: StageLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RainfallReading {
    pub hourly: f64,     // mm/h
    pub cumulative: f64, // mm
    pub change: Option<f64>,
}

/// One observation cycle's normalized result, immutable once appended.
///
/// Serialized key set is consumed by the dashboard:
/// `timestamp` (collection instant), `data_time` (observation instant),
/// `dam`, `river`, `rainfall`. Derived `_change` fields serialize as `null`
/// when unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "timestamp")]
    pub collection_time: Timestamp,
    pub data_time: Timestamp,
    pub dam: DamReading,
    pub river: RiverReading,
    pub rainfall: RainfallReading,
}

// ---------------------------------------------------------------------------
// Raw fields
// ---------------------------------------------------------------------------

/// Names of the raw fields a fetcher is expected to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawField {
    DamWaterLevel,
    DamStorageRate,
    DamInflow,
    DamOutflow,
    RiverWaterLevel,
    RainfallHourly,
    RainfallCumulative,
}

impl RawField {
    pub const ALL: [RawField; 7] = [
        RawField::DamWaterLevel,
        RawField::DamStorageRate,
        RawField::DamInflow,
        RawField::DamOutflow,
        RawField::RiverWaterLevel,
        RawField::RainfallHourly,
        RawField::RainfallCumulative,
    ];

    /// Dotted path of the field in the persisted snapshot.
    pub fn path(&self) -> &'static str {
        match self {
            RawField::DamWaterLevel => "dam.water_level",
            RawField::DamStorageRate => "dam.storage_rate",
            RawField::DamInflow => "dam.inflow",
            RawField::DamOutflow => "dam.outflow",
            RawField::RiverWaterLevel => "river.water_level",
            RawField::RainfallHourly => "rainfall.hourly",
            RawField::RainfallCumulative => "rainfall.cumulative",
        }
    }
}

impl fmt::Display for RawField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl Serialize for RawField {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.path())
    }
}

/// Field values exactly as scraped, before numeric parsing.
///
/// Every member is optional: a page that lacks a value leaves it `None`, and
/// the record builder turns that into a typed `IncompleteData` failure
/// instead of a silent key error.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFields {
    /// The `obsdt` bucket that was requested.
    pub requested_at: Timestamp,
    /// The observation instant the upstream page reports, if it shows one.
    /// May differ from `requested_at` when the upstream clamps the request.
    pub reported_at: Option<Timestamp>,
    pub dam_water_level: Option<String>,
    pub dam_storage_rate: Option<String>,
    pub dam_inflow: Option<String>,
    pub dam_outflow: Option<String>,
    pub river_water_level: Option<String>,
    pub rainfall_hourly: Option<String>,
    pub rainfall_cumulative: Option<String>,
}

impl RawFields {
    pub fn new(requested_at: Timestamp) -> Self {
        Self {
            requested_at,
            reported_at: None,
            dam_water_level: None,
            dam_storage_rate: None,
            dam_inflow: None,
            dam_outflow: None,
            river_water_level: None,
            rainfall_hourly: None,
            rainfall_cumulative: None,
        }
    }

    pub fn get(&self, field: RawField) -> Option<&str> {
        let value = match field {
            RawField::DamWaterLevel => &self.dam_water_level,
            RawField::DamStorageRate => &self.dam_storage_rate,
            RawField::DamInflow => &self.dam_inflow,
            RawField::DamOutflow => &self.dam_outflow,
            RawField::RiverWaterLevel => &self.river_water_level,
            RawField::RainfallHourly => &self.rainfall_hourly,
            RawField::RainfallCumulative => &self.rainfall_cumulative,
        };
        value.as_deref()
    }

    pub fn set(&mut self, field: RawField, value: impl Into<String>) {
        let slot = match field {
            RawField::DamWaterLevel => &mut self.dam_water_level,
            RawField::DamStorageRate => &mut self.dam_storage_rate,
            RawField::DamInflow => &mut self.dam_inflow,
            RawField::DamOutflow => &mut self.dam_outflow,
            RawField::RiverWaterLevel => &mut self.river_water_level,
            RawField::RainfallHourly => &mut self.rainfall_hourly,
            RawField::RainfallCumulative => &mut self.rainfall_cumulative,
        };
        *slot = Some(value.into());
    }

    /// Fields this set does not carry.
    pub fn missing(&self) -> Vec<RawField> {
        RawField::ALL
            .into_iter()
            .filter(|f| self.get(*f).is_none())
            .collect()
    }

    /// Combines the results of two station fetches for the same bucket.
    ///
    /// Values already present in `self` win. The merged `reported_at` is the
    /// earlier of the two, since a snapshot is only as recent as its oldest
    /// component.
    pub fn merge(mut self, other: RawFields) -> RawFields {
        for field in RawField::ALL {
            if self.get(field).is_none() {
                if let Some(value) = other.get(field) {
                    self.set(field, value);
                }
            }
        }
        self.reported_at = match (self.reported_at, other.reported_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self
    }
}

// ---------------------------------------------------------------------------
// Alert levels and thresholds
// ---------------------------------------------------------------------------

/// Four-step warning scale for river stage and rainfall, in ascending order
/// of severity. Serialized with the labels the prefecture publishes, which is
/// what the dashboard displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageLevel {
    #[serde(rename = "正常")]
    Normal,
    #[serde(rename = "水防団待機")]
    Standby,
    #[serde(rename = "氾濫注意")]
    Caution,
    #[serde(rename = "氾濫危険")]
    Danger,
}

impl fmt::Display for StageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageLevel::Normal => write!(f, "NORMAL"),
            StageLevel::Standby => write!(f, "STANDBY"),
            StageLevel::Caution => write!(f, "CAUTION"),
            StageLevel::Danger => write!(f, "DANGER"),
        }
    }
}

/// Parallel two-step scale for dam storage rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageLevel {
    #[serde(rename = "正常")]
    Normal,
    #[serde(rename = "警戒")]
    Warning,
    #[serde(rename = "危険")]
    Danger,
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLevel::Normal => write!(f, "NORMAL"),
            StorageLevel::Warning => write!(f, "WARNING"),
            StorageLevel::Danger => write!(f, "DANGER"),
        }
    }
}

/// Inclusive lower bounds of each stage level.
///
/// Levels in ascending order:
///   standby < caution < danger
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageThresholds {
    pub standby: f64,
    pub caution: f64,
    pub danger: f64,
}

impl StageThresholds {
    pub fn is_ascending(&self) -> bool {
        self.standby < self.caution && self.caution < self.danger
    }
}

/// Inclusive lower bounds for dam storage rate, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageThresholds {
    pub warning: f64,
    pub danger: f64,
}

impl StorageThresholds {
    pub fn is_ascending(&self) -> bool {
        self.warning < self.danger
    }
}

/// The full per-deployment threshold set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub river: StageThresholds,
    pub rainfall_hourly: StageThresholds,
    pub rainfall_cumulative: StageThresholds,
    pub dam_storage: StorageThresholds,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            river: crate::stations::default_river_thresholds(),
            rainfall_hourly: StageThresholds { standby: 10.0, caution: 30.0, danger: 50.0 },
            rainfall_cumulative: StageThresholds { standby: 50.0, caution: 100.0, danger: 200.0 },
            dam_storage: StorageThresholds { warning: 90.0, danger: 95.0 },
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures at the fetcher boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// The upstream has no page for the requested bucket (usually not yet
    /// published).
    #[error("No data published: {0}")]
    NotFound(String),
    /// Transport failure or non-2xx response.
    #[error("Network error: {0}")]
    Network(String),
    /// The page was retrieved but did not have the expected shape.
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Failures while turning raw fields into a `Snapshot`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    /// A required raw field was absent.
    #[error("Incomplete data: {0} is missing")]
    IncompleteData(RawField),
    /// A raw field was present but is not a finite number.
    #[error("Invalid value for {field}: {raw:?}")]
    InvalidValue { field: RawField, raw: String },
}

/// Failures of the on-disk history store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed snapshot file {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }
}

/// Why a collection cycle produced no snapshot.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Fetch failed for station {station}: {source}")]
    Fetch {
        station: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Collection cycle exceeded {0:?} and was abandoned")]
    TimedOut(Duration),
    #[error("Collection worker exited without reporting a result")]
    WorkerLost,
}
