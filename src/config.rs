//! Service configuration.
//!
//! Read from a TOML file whose path comes from `--config`, else the
//! `KOTOMON_CONFIG` environment variable (a `.env` file in the working
//! directory is honoured), else built-in defaults. Every key is optional.
//!
//! ```toml
//! data_dir = "/var/lib/kotomon"
//! utc_offset_hours = 9
//! retention_days = 7
//!
//! [source]
//! river_station = "05067"
//!
//! [thresholds.river]
//! standby = 3.80
//! caution = 5.00
//! danger = 5.50
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::history::DEFAULT_RETENTION_DAYS;
use crate::logging::LogLevel;
use crate::model::AlertThresholds;
use crate::stations::{self, Station, StationKind};
use crate::timegrid::{DEFAULT_GRID_MINUTES, DEFAULT_PUBLICATION_DELAY_MINUTES, TimeGrid};

pub const CONFIG_ENV_VAR: &str = "KOTOMON_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Where and how the telemetry pages are fetched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub dam_url: String,
    pub river_url: String,
    pub dam_station: String,
    pub river_station: String,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dam_url: "https://y-bousai.pref.yamaguchi.lg.jp/citizen/dam/kdm_table.aspx".to_string(),
            river_url: "https://y-bousai.pref.yamaguchi.lg.jp/citizen/water/kwl_table.aspx".to_string(),
            dam_station: stations::DAM_STATION_CODE.to_string(),
            river_station: stations::RIVER_STATION_CODE.to_string(),
            user_agent: concat!("kotomon_service/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Store root: `latest.json`, `history/`, and the default error log.
    pub data_dir: PathBuf,
    /// Offset of the upstream's local clock; partitions follow it.
    pub utc_offset_hours: i32,
    pub grid_minutes: u32,
    pub publication_delay_minutes: u32,
    pub retention_days: u32,
    /// Hard limit for one collection cycle.
    pub cycle_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// Defaults to `<data_dir>/error.log`.
    pub error_log: Option<PathBuf>,
    pub source: SourceConfig,
    pub thresholds: AlertThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            utc_offset_hours: 9,
            grid_minutes: DEFAULT_GRID_MINUTES,
            publication_delay_minutes: DEFAULT_PUBLICATION_DELAY_MINUTES,
            retention_days: DEFAULT_RETENTION_DAYS,
            cycle_timeout_secs: 300,
            request_timeout_secs: 30,
            log_level: "info".to_string(),
            log_file: None,
            error_log: None,
            source: SourceConfig::default(),
            thresholds: AlertThresholds::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Resolves the config file: `explicit`, else `$KOTOMON_CONFIG`, else
    /// defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Self::load(Path::new(&path)),
            _ => {
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if FixedOffset::east_opt(self.utc_offset_hours.saturating_mul(3600)).is_none()
            || self.utc_offset_hours.abs() > 23
        {
            return invalid(format!("utc_offset_hours {} is out of range", self.utc_offset_hours));
        }
        if TimeGrid::new(self.grid_minutes, self.publication_delay_minutes).is_none() {
            return invalid(format!("grid_minutes {} must evenly divide 60", self.grid_minutes));
        }
        if self.retention_days == 0 {
            return invalid("retention_days must be at least 1".to_string());
        }
        if self.cycle_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return invalid("timeouts must be positive".to_string());
        }
        if let Err(e) = self.log_level.parse::<LogLevel>() {
            return invalid(e);
        }
        let t = &self.thresholds;
        for (name, stage) in [
            ("river", &t.river),
            ("rainfall_hourly", &t.rainfall_hourly),
            ("rainfall_cumulative", &t.rainfall_cumulative),
        ] {
            if !stage.is_ascending() {
                return invalid(format!("thresholds.{} must satisfy standby < caution < danger", name));
            }
        }
        if !t.dam_storage.is_ascending() {
            return invalid("thresholds.dam_storage must satisfy warning < danger".to_string());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours.saturating_mul(3600)).unwrap_or_else(|| Utc.fix())
    }

    pub fn time_grid(&self) -> TimeGrid {
        TimeGrid::new(self.grid_minutes, self.publication_delay_minutes).unwrap_or_default()
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level.parse().unwrap_or(LogLevel::Info)
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.error_log.clone().unwrap_or_else(|| self.data_dir.join("error.log"))
    }

    pub fn dam_station(&self) -> Station {
        stations::station_for(&self.source.dam_station, StationKind::Dam)
    }

    pub fn river_station(&self) -> Station {
        stations::station_for(&self.source.river_station, StationKind::River)
    }

    /// Stations fetched each cycle, dam first.
    pub fn stations(&self) -> Vec<Station> {
        vec![self.dam_station(), self.river_station()]
    }
}
