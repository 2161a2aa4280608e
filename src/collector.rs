//! One collection cycle: normalize → fetch → build → append → prune.
//!
//! A cycle is a stateless batch job. It never retries; a failed cycle is
//! logged to the error log and the next scheduled invocation is the retry.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use chrono::Utc;

use crate::config::Config;
use crate::history::{AppendOutcome, HistoryStore, PruneReport};
use crate::ingest::ObservationSource;
use crate::logging::{self, Component};
use crate::model::{CycleError, RawFields, Snapshot, StoreError, Timestamp};
use crate::record;
use crate::stations::Station;
use crate::timegrid::format_obsdt;

/// What a successful cycle did.
#[derive(Debug)]
pub struct CycleReport {
    /// Bucket requested from the upstream.
    pub obsdt: Timestamp,
    pub snapshot: Snapshot,
    pub outcome: AppendOutcome,
    /// `None` when pruning failed; the snapshot is stored regardless.
    pub prune: Option<PruneReport>,
}

/// Runs one cycle against the wall clock.
pub fn collect_once<S: ObservationSource + ?Sized>(
    source: &S,
    store: &HistoryStore,
    config: &Config,
) -> Result<CycleReport, CycleError> {
    let now = Utc::now().with_timezone(&config.offset());
    collect_once_at(source, store, config, now)
}

/// Runs one cycle as if the clock read `now`.
pub fn collect_once_at<S: ObservationSource + ?Sized>(
    source: &S,
    store: &HistoryStore,
    config: &Config,
    now: Timestamp,
) -> Result<CycleReport, CycleError> {
    let result = run_pipeline(source, store, config, now.with_timezone(&config.offset()), None);
    if let Err(e) = &result {
        logging::error(Component::Collector, None, &format!("Cycle failed: {}", e));
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    Committed,
    Abandoned,
}

/// Decides, between a cycle worker and its supervisor, whether the cycle
/// writes to the store or is abandoned. Whichever side gets there first wins;
/// after that the other side cannot change the outcome.
#[derive(Debug)]
struct CommitGate(Mutex<GateState>);

impl CommitGate {
    fn new() -> Self {
        CommitGate(Mutex::new(GateState::Open))
    }

    /// Runs `write` unless the cycle was abandoned. The lock is held for the
    /// whole write so the supervisor cannot abandon it halfway.
    fn commit<T>(&self, write: impl FnOnce() -> T) -> Option<T> {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == GateState::Abandoned {
            return None;
        }
        let out = write();
        *state = GateState::Committed;
        Some(out)
    }

    /// Marks the cycle abandoned. `false` when the worker already wrote.
    fn abandon(&self) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == GateState::Committed {
            return false;
        }
        *state = GateState::Abandoned;
        true
    }
}

fn run_pipeline<S: ObservationSource + ?Sized>(
    source: &S,
    store: &HistoryStore,
    config: &Config,
    now: Timestamp,
    gate: Option<&CommitGate>,
) -> Result<CycleReport, CycleError> {
    let obsdt = config.time_grid().observation_bucket(now);
    logging::info(
        Component::Collector,
        None,
        &format!("Cycle start: requesting bucket {}", format_obsdt(obsdt)),
    );

    let mut merged: Option<RawFields> = None;
    for station in config.stations() {
        let raw = source.fetch(obsdt, &station).map_err(|err| {
            logging::log_fetch_failure(&station.code, "fetch", &err);
            CycleError::Fetch { station: station.code.clone(), source: err }
        })?;
        let expected = station.expected_fields().len();
        logging::debug(
            Component::Fetch,
            Some(&station.code),
            &format!("{} of {} fields present", expected - count_missing(&raw, &station), expected),
        );
        merged = Some(match merged {
            Some(acc) => acc.merge(raw),
            None => raw,
        });
    }
    let raw = merged.unwrap_or_else(|| RawFields::new(obsdt));

    let previous = match store.latest() {
        Ok(previous) => previous,
        Err(StoreError::Malformed { path, source }) => {
            logging::warn(
                Component::Store,
                None,
                &format!("Ignoring unreadable {} for deltas: {}", path.display(), source),
            );
            None
        }
        Err(e) => return Err(e.into()),
    };

    let snapshot = record::build_at(&raw, previous.as_ref(), &config.thresholds.river, now)?;
    let outcome = match gate {
        Some(gate) => match gate.commit(|| store.append(&snapshot)) {
            Some(appended) => appended?,
            None => {
                logging::warn(
                    Component::Collector,
                    None,
                    &format!(
                        "Discarding snapshot for {}: cycle was abandoned",
                        snapshot.data_time.format("%Y-%m-%d %H:%M")
                    ),
                );
                return Err(CycleError::TimedOut(config.cycle_timeout()));
            }
        },
        None => store.append(&snapshot)?,
    };

    match outcome.stale_warning() {
        Some(warning) => logging::warn(Component::Store, None, &warning.to_string()),
        None => logging::info(
            Component::Store,
            None,
            &format!(
                "Stored snapshot for {} (river {:.2} m, {})",
                snapshot.data_time.format("%Y-%m-%d %H:%M"),
                snapshot.river.water_level,
                snapshot.river.status
            ),
        ),
    }

    let prune = match store.prune_at(config.retention_days, now.date_naive()) {
        Ok(report) => {
            logging::log_prune_summary(
                report.partitions_removed.len(),
                report.files_removed,
                &report.cutoff.to_string(),
            );
            Some(report)
        }
        Err(e) => {
            logging::error(Component::Prune, None, &format!("Prune failed after append: {}", e));
            None
        }
    };

    Ok(CycleReport { obsdt, snapshot, outcome, prune })
}

fn count_missing(raw: &RawFields, station: &Station) -> usize {
    station
        .expected_fields()
        .iter()
        .filter(|f| raw.get(**f).is_none())
        .count()
}

/// Runs one cycle on a worker thread and gives up after the configured
/// cycle timeout.
///
/// An abandoned worker is left to finish or be killed with the process, but it
/// can no longer append: a timed-out cycle never publishes a snapshot. If the
/// worker is already writing when the timeout fires, the write completes and
/// the cycle is reported with its real result.
pub fn run_cycle<S>(source: S, store: HistoryStore, config: Config) -> Result<CycleReport, CycleError>
where
    S: ObservationSource + Send + 'static,
{
    let timeout = config.cycle_timeout();
    let (tx, rx) = mpsc::channel();
    let gate = Arc::new(CommitGate::new());
    let worker_gate = Arc::clone(&gate);

    thread::Builder::new()
        .name("collector".to_string())
        .spawn(move || {
            let now = Utc::now().with_timezone(&config.offset());
            let result = run_pipeline(&source, &store, &config, now, Some(&worker_gate));
            // A timeout is reported by the supervisor.
            if let Err(e) = &result {
                if !matches!(e, CycleError::TimedOut(_)) {
                    logging::error(Component::Collector, None, &format!("Cycle failed: {}", e));
                }
            }
            // The receiver is gone when the cycle already timed out.
            let _ = tx.send(result);
        })
        .map_err(|e| {
            logging::error(Component::System, None, &format!("Cannot spawn collector thread: {}", e));
            CycleError::WorkerLost
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) if !gate.abandon() => {
            // The worker got its append in first; only pruning is left.
            rx.recv().unwrap_or_else(|_| {
                let err = CycleError::WorkerLost;
                logging::error(Component::Collector, None, &format!("Cycle failed: {}", err));
                Err(err)
            })
        }
        Err(RecvTimeoutError::Timeout) => {
            let err = CycleError::TimedOut(timeout);
            logging::error(Component::Collector, None, &format!("Cycle failed: {}", err));
            Err(err)
        }
        Err(RecvTimeoutError::Disconnected) => {
            let err = CycleError::WorkerLost;
            logging::error(Component::Collector, None, &format!("Cycle failed: {}", err));
            Err(err)
        }
    }
}
