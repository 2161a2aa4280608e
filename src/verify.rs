//! Station Verification Module
//!
//! Probes each configured station against the live upstream for the current
//! observation bucket and reports which of its expected fields the page
//! actually carried. Use it after changing station codes or when the
//! upstream page layout is suspected to have changed.

use std::io::{self, Write};

use chrono::Utc;
use serde::Serialize;

use crate::config::Config;
use crate::ingest::ObservationSource;
use crate::model::{RawField, Timestamp};
use crate::stations::Station;
use crate::timegrid::format_obsdt;

// ============================================================================
// Verification Results
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub obsdt: Timestamp,
    pub results: Vec<StationVerification>,
    pub working: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationVerification {
    pub station_code: String,
    pub name: String,
    pub status: VerificationStatus,
    pub fields_present: Vec<RawField>,
    pub fields_missing: Vec<RawField>,
    pub reported_at: Option<Timestamp>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum VerificationStatus {
    Success,
    PartialSuccess,
    Failed,
}

// ============================================================================
// Single station
// ============================================================================

pub fn verify_station<S: ObservationSource + ?Sized>(
    source: &S,
    station: &Station,
    obsdt: Timestamp,
) -> StationVerification {
    let mut result = StationVerification {
        station_code: station.code.clone(),
        name: station.name.clone(),
        status: VerificationStatus::Failed,
        fields_present: Vec::new(),
        fields_missing: station.expected_fields().to_vec(),
        reported_at: None,
        error_message: None,
    };

    match source.fetch(obsdt, station) {
        Ok(raw) => {
            let (present, missing): (Vec<RawField>, Vec<RawField>) = station
                .expected_fields()
                .iter()
                .copied()
                .partition(|f| raw.get(*f).is_some());
            result.fields_present = present;
            result.fields_missing = missing;
            result.reported_at = raw.reported_at;
            result.status = if result.fields_missing.is_empty() {
                VerificationStatus::Success
            } else if result.fields_present.is_empty() {
                VerificationStatus::Failed
            } else {
                VerificationStatus::PartialSuccess
            };
        }
        Err(e) => {
            result.error_message = Some(e.to_string());
        }
    }

    result
}

// ============================================================================
// Full Verification Runner
// ============================================================================

pub fn run_verification<S: ObservationSource + ?Sized>(source: &S, config: &Config) -> VerificationReport {
    let now = Utc::now().with_timezone(&config.offset());
    run_verification_at(source, config, now)
}

pub fn run_verification_at<S: ObservationSource + ?Sized>(
    source: &S,
    config: &Config,
    now: Timestamp,
) -> VerificationReport {
    let obsdt = config.time_grid().observation_bucket(now);
    let mut report = VerificationReport { obsdt, results: Vec::new(), working: 0, failed: 0 };

    println!("🔍 Verifying stations for bucket {}...", format_obsdt(obsdt));
    for station in config.stations() {
        print!("  {} {} ... ", station.code, station.name);
        // Show the station before the blocking fetch.
        let _ = io::stdout().flush();
        let result = verify_station(source, &station, obsdt);

        match result.status {
            VerificationStatus::Success => {
                println!("✓ OK ({} fields)", result.fields_present.len());
                report.working += 1;
            }
            VerificationStatus::PartialSuccess => {
                println!("⚠ Partial (missing: {})", join_fields(&result.fields_missing));
                report.working += 1;
            }
            VerificationStatus::Failed => {
                println!(
                    "✗ FAILED: {}",
                    result.error_message.as_deref().unwrap_or("no expected fields on page")
                );
                report.failed += 1;
            }
        }
        report.results.push(result);
    }

    report
}

fn join_fields(fields: &[RawField]) -> String {
    fields.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
}

pub fn print_summary(report: &VerificationReport) {
    println!("\n═══════════════════════════════════════════════════════════");
    println!("📊 VERIFICATION SUMMARY");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Bucket:   {}", report.obsdt.format("%Y-%m-%d %H:%M %:z"));
    println!(
        "Stations: {}/{} working  ({} failed)",
        report.working,
        report.results.len(),
        report.failed
    );
    for result in &report.results {
        if let Some(reported) = result.reported_at {
            println!("  {} reports {}", result.station_code, reported.format("%Y-%m-%d %H:%M"));
        }
    }
    println!("═══════════════════════════════════════════════════════════");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FetchError, RawFields};
    use crate::stations::StationKind;
    use chrono::{FixedOffset, TimeZone};

    struct RiverOnly;

    impl ObservationSource for RiverOnly {
        fn fetch(&self, obsdt: Timestamp, station: &Station) -> Result<RawFields, FetchError> {
            let mut raw = RawFields::new(obsdt);
            match station.kind {
                StationKind::River => raw.set(RawField::RiverWaterLevel, "2.91"),
                StationKind::Dam => {
                    raw.set(RawField::DamWaterLevel, "36.82");
                    raw.set(RawField::DamStorageRate, "97.9");
                }
            }
            Ok(raw)
        }
    }

    struct Down;

    impl ObservationSource for Down {
        fn fetch(&self, _obsdt: Timestamp, _station: &Station) -> Result<RawFields, FetchError> {
            Err(FetchError::Network("connection refused".to_string()))
        }
    }

    fn now() -> Timestamp {
        FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 6, 23, 5, 3, 0)
            .unwrap()
    }

    #[test]
    fn test_statuses_from_field_coverage() {
        let config = Config::default();
        let report = run_verification_at(&RiverOnly, &config, now());

        assert_eq!(report.results.len(), 2);
        let dam = &report.results[0];
        assert_eq!(dam.status, VerificationStatus::PartialSuccess);
        assert_eq!(dam.fields_present, vec![RawField::DamWaterLevel, RawField::DamStorageRate]);
        assert!(dam.fields_missing.contains(&RawField::DamInflow));

        let river = &report.results[1];
        assert_eq!(river.status, VerificationStatus::Success);
        assert!(river.fields_missing.is_empty());
        assert_eq!(report.working, 2);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_fetch_error_is_failed_with_message() {
        let station = Config::default().river_station();
        let result = verify_station(&Down, &station, now());
        assert_eq!(result.status, VerificationStatus::Failed);
        assert_eq!(result.fields_missing, vec![RawField::RiverWaterLevel]);
        assert!(result.error_message.unwrap().contains("connection refused"));
    }

    #[test]
    fn test_unreachable_upstream_fails_every_station() {
        let report = run_verification_at(&Down, &Config::default(), now());
        assert_eq!(report.working, 0);
        assert_eq!(report.failed, 2);
        assert!(report.results.iter().all(|r| r.status == VerificationStatus::Failed));
    }
}
