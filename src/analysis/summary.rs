/// Statistics over a window of stored snapshots.
///
/// Used by the `summary` command to report how the river, the dam, and the
/// rain behaved over the last N hours, and to point out readings worth a
/// second look.

use serde::Serialize;

use crate::model::{Snapshot, Timestamp};

/// Relative difference between the recent mean and the window mean that
/// counts as a trend.
pub const TREND_THRESHOLD: f64 = 0.10;
/// Points averaged for the "recent" side of the trend comparison.
pub const TREND_RECENT_POINTS: usize = 3;
/// A river step must exceed both this many metres and two standard
/// deviations of the river level over the window to be flagged.
pub const RIVER_JUMP_MIN_M: f64 = 0.5;
pub const HEAVY_RAIN_MM: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trend {
    Rising,
    Falling,
    Steady,
    /// Fewer than two points.
    Unknown,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Trend::Rising => "rising",
            Trend::Falling => "falling",
            Trend::Steady => "steady",
            Trend::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesStats {
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    RiverJump { at: Timestamp, change: f64 },
    HeavyRain { at: Timestamp, hourly: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub from: Timestamp,
    pub to: Timestamp,
    pub river_level: SeriesStats,
    pub dam_level: SeriesStats,
    pub dam_storage_rate: SeriesStats,
    pub rainfall_hourly: SeriesStats,
    /// Sum of the hourly readings in the window.
    pub rainfall_total: f64,
    pub anomalies: Vec<Anomaly>,
}

/// Summarizes `snapshots`, which must be ordered by `data_time` (as
/// `HistoryStore::query` returns them). `None` for an empty window.
pub fn summarize(snapshots: &[Snapshot]) -> Option<Summary> {
    let first = snapshots.first()?;
    let last = snapshots.last()?;

    let river: Vec<f64> = snapshots.iter().map(|s| s.river.water_level).collect();
    let dam: Vec<f64> = snapshots.iter().map(|s| s.dam.water_level).collect();
    let storage: Vec<f64> = snapshots.iter().map(|s| s.dam.storage_rate).collect();
    let hourly: Vec<f64> = snapshots.iter().map(|s| s.rainfall.hourly).collect();

    Some(Summary {
        count: snapshots.len(),
        from: first.data_time,
        to: last.data_time,
        river_level: series_stats(&river)?,
        dam_level: series_stats(&dam)?,
        dam_storage_rate: series_stats(&storage)?,
        rainfall_hourly: series_stats(&hourly)?,
        rainfall_total: round2(hourly.iter().sum()),
        anomalies: find_anomalies(snapshots),
    })
}

pub fn series_stats(values: &[f64]) -> Option<SeriesStats> {
    let current = *values.last()?;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(SeriesStats {
        current,
        min,
        max,
        mean: round2(mean(values)),
        trend: trend(values),
    })
}

/// Mean of the last few points against the mean of the whole series.
pub fn trend(values: &[f64]) -> Trend {
    if values.len() < 2 {
        return Trend::Unknown;
    }
    let overall = mean(values);
    let recent = mean(&values[values.len().saturating_sub(TREND_RECENT_POINTS)..]);

    let diff = recent - overall;
    let scale = overall.abs();
    if scale < f64::EPSILON {
        // All-zero rain windows and the like; any positive recent value is a rise.
        return if diff > f64::EPSILON {
            Trend::Rising
        } else if diff < -f64::EPSILON {
            Trend::Falling
        } else {
            Trend::Steady
        };
    }
    if diff / scale > TREND_THRESHOLD {
        Trend::Rising
    } else if diff / scale < -TREND_THRESHOLD {
        Trend::Falling
    } else {
        Trend::Steady
    }
}

pub fn find_anomalies(snapshots: &[Snapshot]) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    let levels: Vec<f64> = snapshots.iter().map(|s| s.river.water_level).collect();
    if levels.len() >= 2 {
        let limit = (2.0 * sample_std_dev(&levels)).max(RIVER_JUMP_MIN_M);
        for (i, pair) in levels.windows(2).enumerate() {
            let step = pair[1] - pair[0];
            if step.abs() > limit {
                anomalies.push(Anomaly::RiverJump {
                    at: snapshots[i + 1].data_time,
                    change: round2(step),
                });
            }
        }
    }

    for s in snapshots {
        if s.rainfall.hourly >= HEAVY_RAIN_MM {
            anomalies.push(Anomaly::HeavyRain { at: s.data_time, hourly: s.rainfall.hourly });
        }
    }

    anomalies.sort_by_key(|a| match a {
        Anomaly::RiverJump { at, .. } | Anomaly::HeavyRain { at, .. } => *at,
    });
    anomalies
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with n - 1 in the denominator; 0 below two values.
fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DamReading, RainfallReading, RiverReading, StageLevel};
    use chrono::{Duration, FixedOffset, TimeZone};

    fn series(levels: &[f64], rain: &[f64]) -> Vec<Snapshot> {
        let start = FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 7, 1, 0, 0, 0)
            .unwrap();
        levels
            .iter()
            .zip(rain)
            .enumerate()
            .map(|(i, (&level, &hourly))| {
                let t = start + Duration::minutes(10 * i as i64);
                Snapshot {
                    collection_time: t + Duration::minutes(15),
                    data_time: t,
                    dam: DamReading {
                        water_level: 36.0,
                        storage_rate: 90.0,
                        inflow: 10.0,
                        outflow: 8.0,
                        storage_change: None,
                    },
                    river: RiverReading { water_level: level, level_change: None, status: StageLevel::Normal },
                    rainfall: RainfallReading { hourly, cumulative: 0.0, change: None },
                }
            })
            .collect()
    }

    #[test]
    fn test_empty_window() {
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn test_trend_directions() {
        assert_eq!(trend(&[1.0]), Trend::Unknown);
        assert_eq!(trend(&[2.0, 2.0, 2.0, 3.0, 3.5, 4.0]), Trend::Rising);
        assert_eq!(trend(&[4.0, 4.0, 4.0, 3.0, 2.5, 2.0]), Trend::Falling);
        assert_eq!(trend(&[2.0, 2.01, 1.99, 2.0]), Trend::Steady);
        assert_eq!(trend(&[0.0, 0.0, 0.0]), Trend::Steady);
        assert_eq!(trend(&[0.0, 0.0, 0.0, 0.0, 1.0]), Trend::Rising);
    }

    #[test]
    fn test_summary_stats() {
        let snaps = series(&[2.0, 2.2, 2.4, 2.6], &[0.0, 5.0, 10.0, 5.0]);
        let summary = summarize(&snaps).unwrap();

        assert_eq!(summary.count, 4);
        assert_eq!(summary.from, snaps[0].data_time);
        assert_eq!(summary.to, snaps[3].data_time);
        assert_eq!(summary.river_level.current, 2.6);
        assert_eq!(summary.river_level.min, 2.0);
        assert_eq!(summary.river_level.max, 2.6);
        assert_eq!(summary.river_level.mean, 2.3);
        assert_eq!(summary.rainfall_total, 20.0);
        assert_eq!(summary.dam_level.trend, Trend::Steady);
        assert!(summary.anomalies.is_empty());
    }

    #[test]
    fn test_river_jump_and_heavy_rain_are_flagged() {
        let snaps = series(
            &[2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 3.2, 3.2],
            &[0.0, 0.0, 12.0, 55.0, 20.0, 0.0, 0.0, 0.0],
        );
        let anomalies = find_anomalies(&snaps);

        assert_eq!(
            anomalies,
            vec![
                Anomaly::HeavyRain { at: snaps[3].data_time, hourly: 55.0 },
                Anomaly::RiverJump { at: snaps[6].data_time, change: 1.2 },
            ]
        );
    }

    #[test]
    fn test_small_steps_are_not_jumps() {
        // Large relative to the other steps but under half a metre.
        let snaps = series(&[2.0, 2.0, 2.0, 2.0, 2.4], &[0.0; 5]);
        assert!(find_anomalies(&snaps).is_empty());
    }
}
