//! Append-only, day-partitioned snapshot history.
//!
//! On-disk layout under the store root:
//!
//! ```text
//! latest.json                               most recent non-stale snapshot
//! history/YYYY/MM/DD/HHMM_<collected>.json  one file per collection cycle
//! ```
//!
//! The partition date and `HHMM` come from the snapshot's `data_time` on the
//! store's clock; `<collected>` is the collection instant as
//! `YYYYMMDDHHMMSS`, so repeated readings of the same bucket never collide.
//!
//! The collector is the only writer, but dashboards and the pruner read
//! concurrently from other processes. Every file is therefore published by
//! writing a temporary file in the destination directory and renaming it into
//! place, and partitions are pruned by renaming the whole day directory out of
//! the tree before deleting it. Readers see either the old or the new state,
//! never a torn file, and a reader that loses a race with the pruner sees an
//! empty partition rather than an error.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Days, Duration, FixedOffset, NaiveDate, Utc};
use tempfile::NamedTempFile;

use crate::model::{Snapshot, StoreError, Timestamp};

pub const LATEST_FILE: &str = "latest.json";
pub const HISTORY_DIR: &str = "history";
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Day directories are renamed to this prefix before deletion.
const PRUNING_PREFIX: &str = ".pruning-";

// ---------------------------------------------------------------------------
// Append results
// ---------------------------------------------------------------------------

/// A snapshot whose `data_time` is older than the current latest pointer,
/// typically a cached page served after a newer one was already recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleDataWarning {
    pub data_time: Timestamp,
    pub latest_data_time: Timestamp,
}

impl std::fmt::Display for StaleDataWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stale data: observation {} is older than latest {}; archived without updating latest",
            self.data_time.to_rfc3339(),
            self.latest_data_time.to_rfc3339()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// Archived and published as the new latest snapshot.
    Published { path: PathBuf },
    /// Archived only; the latest pointer still holds a newer observation.
    Archived { path: PathBuf, warning: StaleDataWarning },
}

impl AppendOutcome {
    /// Path of the history file that was written.
    pub fn path(&self) -> &Path {
        match self {
            AppendOutcome::Published { path } | AppendOutcome::Archived { path, .. } => path,
        }
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, AppendOutcome::Published { .. })
    }

    pub fn stale_warning(&self) -> Option<&StaleDataWarning> {
        match self {
            AppendOutcome::Archived { warning, .. } => Some(warning),
            AppendOutcome::Published { .. } => None,
        }
    }
}

/// What a prune pass removed.
#[derive(Debug, Clone, PartialEq)]
pub struct PruneReport {
    /// Partitions dated before this day were removed.
    pub cutoff: NaiveDate,
    pub partitions_removed: Vec<NaiveDate>,
    pub files_removed: usize,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HistoryStore {
    root: PathBuf,
    offset: FixedOffset,
}

impl HistoryStore {
    /// Opens (creating if needed) a store rooted at `root`. `offset` is the
    /// clock partition dates and the pruning "today" are computed on.
    pub fn open(root: impl Into<PathBuf>, offset: FixedOffset) -> Result<Self, StoreError> {
        let root = root.into();
        let history = root.join(HISTORY_DIR);
        fs::create_dir_all(&history).map_err(|e| StoreError::io(&history, e))?;
        Ok(Self { root, offset })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }

    fn history_dir(&self) -> PathBuf {
        self.root.join(HISTORY_DIR)
    }

    /// Local calendar date of an instant on the store's clock.
    pub fn partition_date(&self, t: Timestamp) -> NaiveDate {
        t.with_timezone(&self.offset).date_naive()
    }

    pub fn partition_dir(&self, date: NaiveDate) -> PathBuf {
        self.history_dir()
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    fn snapshot_file_name(&self, snapshot: &Snapshot) -> String {
        format!(
            "{}_{}.json",
            snapshot.data_time.with_timezone(&self.offset).format("%H%M"),
            snapshot.collection_time.with_timezone(&self.offset).format("%Y%m%d%H%M%S")
        )
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Archives `snapshot` in its `data_time` partition, then moves the latest
    /// pointer to it unless the current latest has a newer `data_time`.
    pub fn append(&self, snapshot: &Snapshot) -> Result<AppendOutcome, StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let dir = self.partition_dir(self.partition_date(snapshot.data_time));
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join(self.snapshot_file_name(snapshot));
        write_atomic(&path, &bytes)?;

        let current = match self.latest() {
            Ok(current) => current,
            Err(StoreError::Malformed { path, source }) => {
                log::warn!(
                    target: "store",
                    "replacing unreadable latest pointer {}: {}",
                    path.display(),
                    source
                );
                None
            }
            Err(e) => return Err(e),
        };

        match current {
            Some(latest) if snapshot.data_time < latest.data_time => Ok(AppendOutcome::Archived {
                path,
                warning: StaleDataWarning {
                    data_time: snapshot.data_time,
                    latest_data_time: latest.data_time,
                },
            }),
            _ => {
                write_atomic(&self.latest_path(), &bytes)?;
                Ok(AppendOutcome::Published { path })
            }
        }
    }

    /// Deletes every partition dated before `today - retention_days`, with
    /// today taken from the wall clock on the store's offset.
    pub fn prune(&self, retention_days: u32) -> Result<PruneReport, StoreError> {
        let today = Utc::now().with_timezone(&self.offset).date_naive();
        self.prune_at(retention_days, today)
    }

    pub fn prune_at(&self, retention_days: u32, today: NaiveDate) -> Result<PruneReport, StoreError> {
        let cutoff = today
            .checked_sub_days(Days::new(u64::from(retention_days)))
            .unwrap_or(NaiveDate::MIN);
        let mut report = PruneReport { cutoff, partitions_removed: Vec::new(), files_removed: 0 };

        self.sweep_pruning_leftovers()?;

        for date in self.partitions()? {
            if date >= cutoff {
                continue;
            }
            let dir = self.partition_dir(date);
            let files = count_snapshot_files(&dir);

            // Detach the whole day first so no reader can list a half-deleted
            // partition.
            let detached = self
                .history_dir()
                .join(format!("{}{}", PRUNING_PREFIX, date.format("%Y%m%d")));
            if detached.exists() {
                fs::remove_dir_all(&detached).map_err(|e| StoreError::io(&detached, e))?;
            }
            match fs::rename(&dir, &detached) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&dir, e)),
            }
            fs::remove_dir_all(&detached).map_err(|e| StoreError::io(&detached, e))?;

            // Month and year directories go once their last day is gone.
            if let Some(month_dir) = dir.parent() {
                if fs::remove_dir(month_dir).is_ok() {
                    if let Some(year_dir) = month_dir.parent() {
                        let _ = fs::remove_dir(year_dir);
                    }
                }
            }

            log::debug!(target: "prune", "removed partition {} ({} files)", date, files);
            report.partitions_removed.push(date);
            report.files_removed += files;
        }

        Ok(report)
    }

    /// Removes detached partitions left behind by an interrupted prune.
    fn sweep_pruning_leftovers(&self) -> Result<(), StoreError> {
        let history = self.history_dir();
        for entry in read_dir_or_empty(&history)? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(PRUNING_PREFIX) {
                let path = entry.path();
                fs::remove_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The latest pointer, or `None` if nothing has been published yet.
    pub fn latest(&self) -> Result<Option<Snapshot>, StoreError> {
        let path = self.latest_path();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Malformed { path, source }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// All snapshots with `data_time` in `[start, end]`, ascending by
    /// `data_time` (ties by collection time), across partitions.
    pub fn query(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Snapshot>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let first = self.partition_date(start);
        let last = self.partition_date(end);

        let mut snapshots = Vec::new();
        for date in self.partitions()? {
            if date < first || date > last {
                continue;
            }
            snapshots.extend(
                self.read_partition(date)?
                    .into_iter()
                    .filter(|s| s.data_time >= start && s.data_time <= end),
            );
        }
        snapshots.sort_by(|a, b| {
            a.data_time
                .cmp(&b.data_time)
                .then(a.collection_time.cmp(&b.collection_time))
        });
        Ok(snapshots)
    }

    /// Snapshots observed in the `hours` before `now`.
    pub fn recent(&self, hours: u32, now: Timestamp) -> Result<Vec<Snapshot>, StoreError> {
        self.query(now - Duration::hours(i64::from(hours)), now)
    }

    /// Dates of all existing day partitions, ascending.
    pub fn partitions(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let mut dates = Vec::new();
        for year in read_dir_or_empty(&self.history_dir())? {
            let Some(y) = numeric_dir_name::<i32>(&year) else { continue };
            for month in read_dir_or_empty(&year.path())? {
                let Some(m) = numeric_dir_name::<u32>(&month) else { continue };
                for day in read_dir_or_empty(&month.path())? {
                    let Some(d) = numeric_dir_name::<u32>(&day) else { continue };
                    if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                        dates.push(date);
                    }
                }
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// Every snapshot stored in one partition, in file name order. A partition
    /// that disappears mid-read (pruned) yields what was read so far.
    pub fn read_partition(&self, date: NaiveDate) -> Result<Vec<Snapshot>, StoreError> {
        let dir = self.partition_dir(date);
        let mut paths: Vec<PathBuf> = read_dir_or_empty(&dir)?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| is_snapshot_file(p))
            .collect();
        paths.sort();

        let mut snapshots = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&path, e)),
            };
            match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    log::warn!(target: "store", "skipping unreadable history file {}: {}", path.display(), e);
                }
            }
        }
        Ok(snapshots)
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Writes `bytes` to a temporary file beside `path`, syncs it, and renames it
/// over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    temp.write_all(bytes).map_err(|e| StoreError::io(temp.path(), e))?;
    temp.as_file().sync_all().map_err(|e| StoreError::io(temp.path(), e))?;
    temp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

fn read_dir_or_empty(dir: &Path) -> Result<Vec<fs::DirEntry>, StoreError> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut out = Vec::new();
            for entry in entries {
                match entry {
                    Ok(entry) => out.push(entry),
                    Err(e) if e.kind() == ErrorKind::NotFound => break,
                    Err(e) => return Err(StoreError::io(dir, e)),
                }
            }
            Ok(out)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

fn numeric_dir_name<T: std::str::FromStr>(entry: &fs::DirEntry) -> Option<T> {
    if !entry.file_type().ok()?.is_dir() {
        return None;
    }
    let name = entry.file_name();
    let name = name.to_str()?;
    if !name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Published snapshot files end in `.json`; in-flight temporaries do not.
fn is_snapshot_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

fn count_snapshot_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| is_snapshot_file(&e.path()))
                .count()
        })
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DamReading, RainfallReading, RiverReading, StageLevel};
    use chrono::TimeZone;

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn snapshot(data_time: Timestamp, river_level: f64) -> Snapshot {
        Snapshot {
            collection_time: data_time + Duration::minutes(12),
            data_time,
            dam: DamReading {
                water_level: 36.5,
                storage_rate: 95.0,
                inflow: 10.0,
                outflow: 8.0,
                storage_change: None,
            },
            river: RiverReading { water_level: river_level, level_change: None, status: StageLevel::Normal },
            rainfall: RainfallReading { hourly: 0.0, cumulative: 0.0, change: None },
        }
    }

    #[test]
    fn test_file_layout_follows_data_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), jst()).unwrap();
        let t = jst().with_ymd_and_hms(2025, 6, 23, 4, 50, 0).unwrap();

        let outcome = store.append(&snapshot(t, 2.9)).unwrap();
        assert_eq!(
            outcome.path(),
            dir.path().join("history/2025/06/23/0450_20250623050200.json")
        );
        assert!(store.latest_path().exists());
    }

    #[test]
    fn test_partition_date_uses_store_clock() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), jst()).unwrap();
        // 2025-06-22 20:00 UTC is already 2025-06-23 in JST.
        let t = Utc.with_ymd_and_hms(2025, 6, 22, 20, 0, 0).unwrap().fixed_offset();
        assert_eq!(store.partition_date(t), NaiveDate::from_ymd_opt(2025, 6, 23).unwrap());
    }

    #[test]
    fn test_no_temporaries_left_after_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), jst()).unwrap();
        let t = jst().with_ymd_and_hms(2025, 6, 23, 4, 50, 0).unwrap();
        let outcome = store.append(&snapshot(t, 2.9)).unwrap();

        let partition = outcome.path().parent().unwrap();
        let names: Vec<_> = fs::read_dir(partition)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["0450_20250623050200.json".to_string()]);
    }

    #[test]
    fn test_temporary_files_are_ignored_by_readers() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), jst()).unwrap();
        let t = jst().with_ymd_and_hms(2025, 6, 23, 4, 50, 0).unwrap();
        let outcome = store.append(&snapshot(t, 2.9)).unwrap();

        // Simulate a writer killed mid-write.
        let partition = outcome.path().parent().unwrap();
        fs::write(partition.join(".tmpAbC123"), b"{\"timestamp\": \"2025-").unwrap();

        let all = store.read_partition(store.partition_date(t)).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_non_numeric_directories_are_not_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), jst()).unwrap();
        fs::create_dir_all(dir.path().join("history/2025/06/23")).unwrap();
        fs::create_dir_all(dir.path().join("history/2025/06/notes")).unwrap();
        fs::create_dir_all(dir.path().join("history/.pruning-20250601")).unwrap();
        fs::create_dir_all(dir.path().join("history/2025/02/30")).unwrap();

        assert_eq!(store.partitions().unwrap(), vec![NaiveDate::from_ymd_opt(2025, 6, 23).unwrap()]);
    }

    #[test]
    fn test_prune_sweeps_interrupted_detach() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), jst()).unwrap();
        let leftover = dir.path().join("history/.pruning-20250601");
        fs::create_dir_all(&leftover).unwrap();
        fs::write(leftover.join("0000_20250601001200.json"), b"{}").unwrap();

        let today = NaiveDate::from_ymd_opt(2025, 6, 23).unwrap();
        store.prune_at(7, today).unwrap();
        assert!(!leftover.exists());
    }

    #[test]
    fn test_prune_removes_emptied_month_and_year_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), jst()).unwrap();
        let old = jst().with_ymd_and_hms(2024, 12, 30, 10, 0, 0).unwrap();
        let new = jst().with_ymd_and_hms(2025, 1, 10, 10, 0, 0).unwrap();
        store.append(&snapshot(old, 2.9)).unwrap();
        store.append(&snapshot(new, 2.9)).unwrap();

        let report = store.prune_at(7, NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()).unwrap();
        assert_eq!(report.partitions_removed, vec![NaiveDate::from_ymd_opt(2024, 12, 30).unwrap()]);
        assert_eq!(report.files_removed, 1);
        assert!(!dir.path().join("history/2024").exists());
        assert!(dir.path().join("history/2025/01/10").exists());
    }

    #[test]
    fn test_prune_never_touches_latest_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), jst()).unwrap();
        let old = jst().with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        store.append(&snapshot(old, 3.1)).unwrap();

        store.prune_at(7, NaiveDate::from_ymd_opt(2025, 6, 23).unwrap()).unwrap();
        assert!(store.partitions().unwrap().is_empty());
        assert_eq!(store.latest().unwrap().map(|s| s.data_time), Some(old));
    }

    #[test]
    fn test_malformed_latest_is_replaced_by_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path(), jst()).unwrap();
        fs::write(store.latest_path(), b"not json").unwrap();
        assert!(matches!(store.latest(), Err(StoreError::Malformed { .. })));

        let t = jst().with_ymd_and_hms(2025, 6, 23, 4, 50, 0).unwrap();
        let outcome = store.append(&snapshot(t, 2.9)).unwrap();
        assert!(outcome.is_latest());
        assert_eq!(store.latest().unwrap().map(|s| s.data_time), Some(t));
    }
}
