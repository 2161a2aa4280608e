//! Snapshot construction.
//!
//! Turns one cycle's `RawFields` into a `Snapshot`, computing the derived
//! deltas against the previous snapshot and the river status against the
//! configured stage thresholds. All-or-nothing: any absent or unparseable
//! field fails the whole build, so a partial snapshot can never reach the
//! store.

use chrono::SubsecRound;

use crate::alert::thresholds::stage_level;
use crate::model::{
    DamReading, RainfallReading, RawField, RawFields, RecordError, RiverReading, Snapshot,
    StageThresholds, Timestamp,
};

/// Placeholders the upstream prints in place of a value it did not receive.
const MISSING_MARKERS: &[&str] = &["-", "--", "---", "欠測", "未受信"];

/// Builds a snapshot collected now, on the clock of the requested bucket's
/// UTC offset.
pub fn build(
    raw: &RawFields,
    previous: Option<&Snapshot>,
    river_thresholds: &StageThresholds,
) -> Result<Snapshot, RecordError> {
    let now = chrono::Utc::now().with_timezone(raw.requested_at.offset());
    build_at(raw, previous, river_thresholds, now)
}

/// Builds a snapshot with an explicit collection instant.
///
/// `data_time` is the upstream-reported observation time when the page showed
/// one, else the requested bucket. Each `_change` field is current minus the
/// previous snapshot's value, rounded to centimetre / 0.01 unit precision,
/// or `None` without a previous snapshot.
pub fn build_at(
    raw: &RawFields,
    previous: Option<&Snapshot>,
    river_thresholds: &StageThresholds,
    collected_at: Timestamp,
) -> Result<Snapshot, RecordError> {
    if let Some(field) = RawField::ALL.into_iter().find(|f| is_missing(raw.get(*f))) {
        return Err(RecordError::IncompleteData(field));
    }

    let dam_level = parse_field(raw, RawField::DamWaterLevel)?;
    let storage_rate = parse_field(raw, RawField::DamStorageRate)?;
    let inflow = parse_field(raw, RawField::DamInflow)?;
    let outflow = parse_field(raw, RawField::DamOutflow)?;
    let river_level = parse_field(raw, RawField::RiverWaterLevel)?;
    let hourly = parse_field(raw, RawField::RainfallHourly)?;
    let cumulative = parse_field(raw, RawField::RainfallCumulative)?;

    Ok(Snapshot {
        collection_time: collected_at.trunc_subsecs(0),
        data_time: raw.reported_at.unwrap_or(raw.requested_at),
        dam: DamReading {
            water_level: dam_level,
            storage_rate,
            inflow,
            outflow,
            storage_change: delta(dam_level, previous.map(|p| p.dam.water_level)),
        },
        river: RiverReading {
            water_level: river_level,
            level_change: delta(river_level, previous.map(|p| p.river.water_level)),
            status: stage_level(river_level, river_thresholds),
        },
        rainfall: RainfallReading {
            hourly,
            cumulative,
            change: delta(hourly, previous.map(|p| p.rainfall.hourly)),
        },
    })
}

fn is_missing(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => {
            let v = v.trim();
            v.is_empty() || MISSING_MARKERS.contains(&v)
        }
    }
}

fn parse_field(raw: &RawFields, field: RawField) -> Result<f64, RecordError> {
    let text = raw.get(field).ok_or(RecordError::IncompleteData(field))?;
    parse_number(text).ok_or_else(|| RecordError::InvalidValue { field, raw: text.to_string() })
}

/// Parses a scraped numeric token, tolerating surrounding whitespace and
/// thousands separators. Non-finite results are rejected.
fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text.trim().chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Current minus previous, rounded to two decimals to drop float noise
/// (2.85 - 2.80 is 0.05, not 0.04999...). Never coerced to zero.
fn delta(current: f64, previous: Option<f64>) -> Option<f64> {
    previous.map(|p| ((current - p) * 100.0).round() / 100.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StageLevel;
    use chrono::{Duration, FixedOffset, TimeZone};

    fn bucket() -> Timestamp {
        FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 6, 23, 4, 50, 0)
            .unwrap()
    }

    fn collected() -> Timestamp {
        bucket() + Duration::minutes(12) + Duration::milliseconds(345)
    }

    fn thresholds() -> StageThresholds {
        StageThresholds { standby: 3.80, caution: 5.00, danger: 5.50 }
    }

    fn raw(river_level: &str) -> RawFields {
        let mut raw = RawFields::new(bucket());
        raw.set(RawField::DamWaterLevel, "36.82");
        raw.set(RawField::DamStorageRate, "97.9");
        raw.set(RawField::DamInflow, "17.22");
        raw.set(RawField::DamOutflow, "9.25");
        raw.set(RawField::RiverWaterLevel, river_level);
        raw.set(RawField::RainfallHourly, "4");
        raw.set(RawField::RainfallCumulative, "12");
        raw
    }

    #[test]
    fn test_first_run_has_no_deltas() {
        let s = build_at(&raw("2.85"), None, &thresholds(), collected()).unwrap();
        assert_eq!(s.river.water_level, 2.85);
        assert_eq!(s.river.level_change, None);
        assert_eq!(s.dam.storage_change, None);
        assert_eq!(s.rainfall.change, None);
    }

    #[test]
    fn test_level_change_against_previous_snapshot() {
        let previous = build_at(&raw("2.80"), None, &thresholds(), collected()).unwrap();
        let s = build_at(&raw("2.85"), Some(&previous), &thresholds(), collected()).unwrap();
        assert_eq!(s.river.level_change, Some(0.05));
        assert_eq!(s.dam.storage_change, Some(0.0));
        assert_eq!(s.rainfall.change, Some(0.0));
    }

    #[test]
    fn test_falling_level_gives_negative_change() {
        let previous = build_at(&raw("3.10"), None, &thresholds(), collected()).unwrap();
        let s = build_at(&raw("2.95"), Some(&previous), &thresholds(), collected()).unwrap();
        assert_eq!(s.river.level_change, Some(-0.15));
    }

    #[test]
    fn test_data_time_defaults_to_requested_bucket() {
        let s = build_at(&raw("2.85"), None, &thresholds(), collected()).unwrap();
        assert_eq!(s.data_time, bucket());
    }

    #[test]
    fn test_data_time_follows_upstream_reported_time() {
        let mut r = raw("2.85");
        r.reported_at = Some(bucket() - Duration::minutes(10));
        let s = build_at(&r, None, &thresholds(), collected()).unwrap();
        assert_eq!(s.data_time, bucket() - Duration::minutes(10));
    }

    #[test]
    fn test_collection_time_drops_subseconds() {
        let s = build_at(&raw("2.85"), None, &thresholds(), collected()).unwrap();
        assert_eq!(s.collection_time, bucket() + Duration::minutes(12));
    }

    #[test]
    fn test_status_is_classified_from_river_level() {
        let s = build_at(&raw("5.10"), None, &thresholds(), collected()).unwrap();
        assert_eq!(s.river.status, StageLevel::Caution);
    }

    #[test]
    fn test_missing_field_is_incomplete_data() {
        let mut r = raw("2.85");
        r.dam_outflow = None;
        let err = build_at(&r, None, &thresholds(), collected()).unwrap_err();
        assert_eq!(err, RecordError::IncompleteData(RawField::DamOutflow));
    }

    #[test]
    fn test_blank_and_marker_values_are_incomplete_data() {
        for marker in ["", "   ", "---", "欠測"] {
            let r = raw(marker);
            let err = build_at(&r, None, &thresholds(), collected()).unwrap_err();
            assert_eq!(err, RecordError::IncompleteData(RawField::RiverWaterLevel), "marker {:?}", marker);
        }
    }

    #[test]
    fn test_garbled_value_is_invalid_value() {
        let err = build_at(&raw("2.8x"), None, &thresholds(), collected()).unwrap_err();
        assert_eq!(
            err,
            RecordError::InvalidValue { field: RawField::RiverWaterLevel, raw: "2.8x".to_string() }
        );
    }

    #[test]
    fn test_non_finite_value_is_invalid_value() {
        let err = build_at(&raw("NaN"), None, &thresholds(), collected()).unwrap_err();
        assert!(matches!(err, RecordError::InvalidValue { field: RawField::RiverWaterLevel, .. }));
    }

    #[test]
    fn test_incomplete_reported_before_invalid() {
        let mut r = raw("garbage");
        r.rainfall_cumulative = None;
        let err = build_at(&r, None, &thresholds(), collected()).unwrap_err();
        assert_eq!(err, RecordError::IncompleteData(RawField::RainfallCumulative));
    }

    #[test]
    fn test_thousands_separator_and_whitespace_accepted() {
        let mut r = raw(" 2.85 ");
        r.set(RawField::RainfallCumulative, "1,024");
        let s = build_at(&r, None, &thresholds(), collected()).unwrap();
        assert_eq!(s.river.water_level, 2.85);
        assert_eq!(s.rainfall.cumulative, 1024.0);
    }
}
