/// Structured logging for the monitoring service
///
/// Provides context-rich log lines with component and station identifiers,
/// timestamps, and severity levels, installed behind the `log` facade so
/// every module logs with `log::info!(target: "store", ...)` and friends.
/// Supports console output plus two files: a run log, and the append-only
/// error log that records every failed or degraded collection cycle.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use log::{Level, LevelFilter, Metadata, Record};

use crate::model::FetchError;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => LogLevel::Error,
            Level::Warn => LogLevel::Warning,
            Level::Info => LogLevel::Info,
            Level::Debug | Level::Trace => LogLevel::Debug,
        }
    }
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Pipeline stage a log line comes from; used as the `log` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Collector,
    Fetch,
    Store,
    Prune,
    System,
}

impl Component {
    pub fn target(self) -> &'static str {
        match self {
            Component::Collector => "collector",
            Component::Fetch => "fetch",
            Component::Store => "store",
            Component::Prune => "prune",
            Component::System => "system",
        }
    }

    pub fn from_target(target: &str) -> Option<Self> {
        match target {
            "collector" => Some(Component::Collector),
            "fetch" => Some(Component::Fetch),
            "store" => Some(Component::Store),
            "prune" => Some(Component::Prune),
            "system" => Some(Component::System),
            _ => None,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Collector => write!(f, "COLLECT"),
            Component::Fetch => write!(f, "FETCH"),
            Component::Store => write!(f, "STORE"),
            Component::Prune => write!(f, "PRUNE"),
            Component::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - the upstream has not published the bucket yet
    Expected,
    /// Unexpected failure - indicates service degradation or a page layout change
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classify a fetch failure.
pub fn classify_fetch_failure(err: &FetchError) -> FailureType {
    match err {
        FetchError::NotFound(_) => FailureType::Expected,
        FetchError::Parse(_) => FailureType::Unexpected,
        // Timeouts are routine on the prefecture servers during storms;
        // refusals and HTTP errors are not.
        FetchError::Network(msg) if msg.contains("timed out") => FailureType::Unknown,
        FetchError::Network(_) => FailureType::Unexpected,
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Every line at or above `min_level`
    log_file: Option<PathBuf>,
    /// Append-only record of WARN and ERROR lines
    error_log: Option<PathBuf>,
    /// Whether to include timestamps in console output
    console_timestamps: bool,
}

impl Logger {
    pub fn new(
        min_level: LogLevel,
        log_file: Option<PathBuf>,
        error_log: Option<PathBuf>,
        console_timestamps: bool,
    ) -> Self {
        Self { min_level, log_file, error_log, console_timestamps }
    }

    /// Installs this logger as the global `log` backend.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        let filter = self.min_level.to_filter();
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(filter);
        Ok(())
    }

    fn format_line(level: LogLevel, component: Option<Component>, target: &str, message: &str) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        match component {
            Some(c) => format!("{} {} {}: {}", timestamp, level, c, message),
            None => format!("{} {} [{}]: {}", timestamp, level, target, message),
        }
    }

    fn append_to_file(path: &Path, entry: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let level = LogLevel::from(metadata.level());
        if Component::from_target(metadata.target()).is_none() {
            // Dependencies (reqwest, hyper) only get through with warnings.
            return level >= LogLevel::Warning.max(self.min_level);
        }
        level >= self.min_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = LogLevel::from(record.level());
        let component = Component::from_target(record.target());
        let message = record.args().to_string();
        let line = Self::format_line(level, component, record.target(), &message);

        // Console output
        if self.console_timestamps {
            match level {
                LogLevel::Error | LogLevel::Warning => eprintln!("{}", line),
                LogLevel::Info | LogLevel::Debug => println!("{}", line),
            }
        } else {
            let source = component.map(|c| c.to_string()).unwrap_or_else(|| record.target().to_string());
            match level {
                LogLevel::Error => eprintln!("   ✗ {}: {}", source, message),
                LogLevel::Warning => eprintln!("   ⚠ {}: {}", source, message),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => println!("   [DEBUG] {}", message),
            }
        }

        // File output
        if let Some(path) = &self.log_file {
            if let Err(e) = Self::append_to_file(path, &line) {
                eprintln!("Failed to write to log file {}: {}", path.display(), e);
            }
        }
        if level >= LogLevel::Warning {
            if let Some(path) = &self.error_log {
                if let Err(e) = Self::append_to_file(path, &line) {
                    eprintln!("Failed to write to error log {}: {}", path.display(), e);
                }
            }
        }
    }

    fn flush(&self) {}
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

fn with_station(station: Option<&str>, message: &str) -> String {
    match station {
        Some(code) => format!("[{}] {}", code, message),
        None => message.to_string(),
    }
}

/// Log a general informational message
pub fn info(component: Component, station: Option<&str>, message: &str) {
    log::info!(target: component.target(), "{}", with_station(station, message));
}

/// Log a warning message
pub fn warn(component: Component, station: Option<&str>, message: &str) {
    log::warn!(target: component.target(), "{}", with_station(station, message));
}

/// Log an error message
pub fn error(component: Component, station: Option<&str>, message: &str) {
    log::error!(target: component.target(), "{}", with_station(station, message));
}

/// Log a debug message
pub fn debug(component: Component, station: Option<&str>, message: &str) {
    log::debug!(target: component.target(), "{}", with_station(station, message));
}

/// Log a fetch failure at the level its classification calls for
pub fn log_fetch_failure(station: &str, operation: &str, err: &FetchError) {
    let failure_type = classify_fetch_failure(err);
    let message = format!("{} failed [{}]: {}", operation, failure_type, err);

    match failure_type {
        FailureType::Expected => debug(Component::Fetch, Some(station), &message),
        FailureType::Unexpected => error(Component::Fetch, Some(station), &message),
        FailureType::Unknown => warn(Component::Fetch, Some(station), &message),
    }
}

/// Log the outcome of a prune pass
pub fn log_prune_summary(partitions_removed: usize, files_removed: usize, cutoff: &str) {
    let message = format!(
        "Prune complete: {} partitions ({} files) older than {} removed",
        partitions_removed, files_removed, cutoff
    );
    if partitions_removed == 0 {
        debug(Component::Prune, None, &message);
    } else {
        info(Component::Prune, None, &message);
    }
}

// ---------------------------------------------------------------------------
// Log File Maintenance
// ---------------------------------------------------------------------------

/// Error logs larger than this are trimmed by `trim_log_file`.
pub const MAX_ERROR_LOG_BYTES: u64 = 1024 * 1024;
/// Lines kept when a log is trimmed.
pub const TRIMMED_LOG_LINES: usize = 100;

/// Cuts `path` down to its last `keep_lines` lines once it grows beyond
/// `max_bytes`. The replacement is written beside the log and renamed over
/// it. Returns whether the file was trimmed; a missing file is not an error.
pub fn trim_log_file(path: &Path, max_bytes: u64, keep_lines: usize) -> io::Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size <= max_bytes {
        return Ok(false);
    }

    let contents = fs::read_to_string(path)?;
    let lines: Vec<&str> = contents.lines().collect();
    let tail = &lines[lines.len().saturating_sub(keep_lines)..];

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    for line in tail {
        writeln!(temp, "{}", line)?;
    }
    temp.persist(path).map_err(|e| e.error)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!("info".parse::<LogLevel>(), Ok(LogLevel::Info));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_failure_classification() {
        let not_yet = FetchError::NotFound("HTTP 404".to_string());
        assert_eq!(classify_fetch_failure(&not_yet), FailureType::Expected);

        let refused = FetchError::Network("connection refused".to_string());
        assert_eq!(classify_fetch_failure(&refused), FailureType::Unexpected);

        let slow = FetchError::Network("operation timed out".to_string());
        assert_eq!(classify_fetch_failure(&slow), FailureType::Unknown);

        let layout = FetchError::Parse("no labelled values".to_string());
        assert_eq!(classify_fetch_failure(&layout), FailureType::Unexpected);
    }

    #[test]
    fn test_component_target_round_trip() {
        for c in [Component::Collector, Component::Fetch, Component::Store, Component::Prune, Component::System] {
            assert_eq!(Component::from_target(c.target()), Some(c));
        }
        assert_eq!(Component::from_target("reqwest::connect"), None);
    }

    #[test]
    fn test_error_log_receives_only_warnings_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let run_log = dir.path().join("run.log");
        let error_log = dir.path().join("error.log");
        let logger = Logger::new(LogLevel::Info, Some(run_log.clone()), Some(error_log.clone()), true);

        for (level, msg) in [(Level::Info, "cycle ok"), (Level::Error, "cycle failed"), (Level::Debug, "noise")] {
            logger.log(
                &Record::builder()
                    .level(level)
                    .target("collector")
                    .args(format_args!("{}", msg))
                    .build(),
            );
        }

        let run = fs::read_to_string(&run_log).unwrap();
        assert!(run.contains("INFO COLLECT: cycle ok"));
        assert!(run.contains("ERROR COLLECT: cycle failed"));
        assert!(!run.contains("noise"));

        let errors = fs::read_to_string(&error_log).unwrap();
        assert_eq!(errors.lines().count(), 1);
        assert!(errors.contains("cycle failed"));
    }

    #[test]
    fn test_dependency_chatter_is_filtered() {
        let logger = Logger::new(LogLevel::Debug, None, None, true);
        let info = Metadata::builder().level(Level::Info).target("hyper::client").build();
        let warn = Metadata::builder().level(Level::Warn).target("hyper::client").build();
        assert!(!logger.enabled(&info));
        assert!(logger.enabled(&warn));
    }

    #[test]
    fn test_trim_log_file_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error.log");
        let body: String = (0..500).map(|i| format!("line {}\n", i)).collect();
        fs::write(&path, body).unwrap();

        assert!(trim_log_file(&path, 100, 3).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "line 497\nline 498\nline 499\n");
    }

    #[test]
    fn test_trim_log_file_leaves_small_or_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error.log");
        assert!(!trim_log_file(&path, 100, 3).unwrap());

        fs::write(&path, "one\ntwo\n").unwrap();
        assert!(!trim_log_file(&path, 100, 3).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }
}
