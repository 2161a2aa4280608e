use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use kotomon_service::alert::stalenesses::{age_minutes_at, freshness_at};
use kotomon_service::alert::thresholds::assess;
use kotomon_service::analysis::summary::{Anomaly, SeriesStats, summarize};
use kotomon_service::collector;
use kotomon_service::config::Config;
use kotomon_service::history::HistoryStore;
use kotomon_service::ingest::bousai::BousaiClient;
use kotomon_service::logging::{self, Component, LogLevel, Logger};
use kotomon_service::model::Timestamp;
use kotomon_service::verify;

#[derive(Parser)]
#[command(name = "kotomon", version, about = "Kotogawa dam and river telemetry collector")]
struct Cli {
    /// TOML config file (default: $KOTOMON_CONFIG, else built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one collection cycle under the configured hard timeout
    Collect,
    /// Delete day partitions older than the retention window and trim the error log
    Prune {
        /// Retention in days (default: retention_days from config)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Print the latest snapshot as JSON
    Latest,
    /// Print stored snapshots whose data_time falls in a window, as JSON
    Query {
        /// Window start, RFC 3339 (e.g. 2025-06-23T00:00:00+09:00)
        #[arg(long, requires = "to", conflicts_with = "hours")]
        from: Option<Timestamp>,
        /// Window end, RFC 3339
        #[arg(long, requires = "from")]
        to: Option<Timestamp>,
        /// Window of the last N hours instead of --from/--to
        #[arg(long)]
        hours: Option<u32>,
    },
    /// Alert levels and freshness of the latest snapshot
    Status,
    /// Statistics over the last N hours
    Summary {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Probe each configured station for the current bucket
    Verify,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::discover(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config, cli.verbose, matches!(cli.command, Command::Collect))?;

    let store = HistoryStore::open(&config.data_dir, config.offset())
        .with_context(|| format!("opening store at {}", config.data_dir.display()))?;

    match cli.command {
        Command::Collect => collect(store, config),
        Command::Prune { days } => prune(&store, &config, days),
        Command::Latest => latest(&store),
        Command::Query { from, to, hours } => query(&store, &config, from, to, hours),
        Command::Status => status(&store, &config),
        Command::Summary { hours } => summary(&store, &config, hours),
        Command::Verify => {
            let client = BousaiClient::new(&config.source, config.request_timeout())?;
            let report = verify::run_verification(&client, &config);
            verify::print_summary(&report);
            Ok(if report.failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

fn init_logging(config: &Config, verbose: bool, console_timestamps: bool) -> Result<()> {
    let error_log = config.error_log_path();
    if let Some(parent) = error_log.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let level = if verbose { LogLevel::Debug } else { config.log_level() };
    Logger::new(level, config.log_file.clone(), Some(error_log), console_timestamps)
        .install()
        .context("installing logger")?;
    Ok(())
}

fn now(config: &Config) -> Timestamp {
    Utc::now().with_timezone(&config.offset())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn collect(store: HistoryStore, config: Config) -> Result<ExitCode> {
    let client = BousaiClient::new(&config.source, config.request_timeout())?;
    match collector::run_cycle(client, store, config) {
        Ok(report) => {
            let s = &report.snapshot;
            logging::info(
                Component::Collector,
                None,
                &format!(
                    "Cycle complete: data_time {} → {}",
                    s.data_time.format("%Y-%m-%d %H:%M"),
                    report.outcome.path().display()
                ),
            );
            Ok(ExitCode::SUCCESS)
        }
        // Already written to the error log by the collector.
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

fn prune(store: &HistoryStore, config: &Config, days: Option<u32>) -> Result<ExitCode> {
    let days = days.unwrap_or(config.retention_days);
    if days == 0 {
        bail!("--days must be at least 1");
    }
    let report = store.prune(days)?;
    logging::log_prune_summary(report.partitions_removed.len(), report.files_removed, &report.cutoff.to_string());
    for date in &report.partitions_removed {
        println!("removed {}", date);
    }
    println!(
        "{} partitions ({} files) older than {} removed",
        report.partitions_removed.len(),
        report.files_removed,
        report.cutoff
    );

    let error_log = config.error_log_path();
    if logging::trim_log_file(&error_log, logging::MAX_ERROR_LOG_BYTES, logging::TRIMMED_LOG_LINES)
        .with_context(|| format!("trimming {}", error_log.display()))?
    {
        println!("{} trimmed to its last {} lines", error_log.display(), logging::TRIMMED_LOG_LINES);
    }
    Ok(ExitCode::SUCCESS)
}

fn latest(store: &HistoryStore) -> Result<ExitCode> {
    match store.latest()? {
        Some(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            let now = Utc::now();
            eprintln!(
                "age {} min ({})",
                age_minutes_at(&snapshot, now),
                freshness_at(&snapshot, now)
            );
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("No snapshot stored yet");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn query(
    store: &HistoryStore,
    config: &Config,
    from: Option<Timestamp>,
    to: Option<Timestamp>,
    hours: Option<u32>,
) -> Result<ExitCode> {
    let snapshots = match (from, to, hours) {
        (Some(from), Some(to), None) => {
            if from > to {
                bail!("--from must not be after --to");
            }
            store.query(from, to)?
        }
        (None, None, Some(hours)) => store.recent(hours, now(config))?,
        _ => bail!("give either --from and --to, or --hours"),
    };
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(ExitCode::SUCCESS)
}

fn status(store: &HistoryStore, config: &Config) -> Result<ExitCode> {
    let Some(snapshot) = store.latest()? else {
        eprintln!("No snapshot stored yet");
        return Ok(ExitCode::FAILURE);
    };
    let assessment = assess(&snapshot, &config.thresholds);
    let now = now(config);

    println!("data_time   {}", snapshot.data_time.format("%Y-%m-%d %H:%M"));
    println!(
        "collected   {} ({} min ago, {})",
        snapshot.collection_time.format("%Y-%m-%d %H:%M"),
        age_minutes_at(&snapshot, now),
        freshness_at(&snapshot, now)
    );
    println!(
        "river       {:.2} m  {}  (change {})",
        snapshot.river.water_level,
        assessment.river,
        fmt_change(snapshot.river.level_change)
    );
    println!(
        "dam         {:.2} m  {:.1} %  {}  (in {:.2} / out {:.2} m3/s)",
        snapshot.dam.water_level,
        snapshot.dam.storage_rate,
        assessment.dam,
        snapshot.dam.inflow,
        snapshot.dam.outflow
    );
    println!(
        "rainfall    {} mm/h  {} mm total  {}",
        snapshot.rainfall.hourly, snapshot.rainfall.cumulative, assessment.rainfall
    );
    println!("overall     {}", assessment.overall);
    Ok(ExitCode::SUCCESS)
}

fn summary(store: &HistoryStore, config: &Config, hours: u32) -> Result<ExitCode> {
    let now = now(config);
    let snapshots = store.recent(hours, now)?;
    let Some(summary) = summarize(&snapshots) else {
        println!("No snapshots in the last {} hours", hours);
        return Ok(ExitCode::SUCCESS);
    };

    println!(
        "{} snapshots, {} → {}",
        summary.count,
        summary.from.format("%m-%d %H:%M"),
        summary.to.format("%m-%d %H:%M")
    );
    print_series("river level (m)", &summary.river_level);
    print_series("dam level (m)", &summary.dam_level);
    print_series("storage (%)", &summary.dam_storage_rate);
    print_series("rain (mm/h)", &summary.rainfall_hourly);
    println!("rain total over window: {} mm", summary.rainfall_total);

    if !summary.anomalies.is_empty() {
        println!("anomalies:");
        for anomaly in &summary.anomalies {
            match anomaly {
                Anomaly::RiverJump { at, change } => {
                    println!("  {}  river moved {:+.2} m in one step", at.format("%m-%d %H:%M"), change)
                }
                Anomaly::HeavyRain { at, hourly } => {
                    println!("  {}  heavy rain {} mm/h", at.format("%m-%d %H:%M"), hourly)
                }
            }
        }
    }
    let window_start = now - Duration::hours(i64::from(hours));
    if summary.from - window_start > Duration::hours(1) {
        println!("note: history starts {} after the window opens", fmt_gap(summary.from - window_start));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_series(label: &str, stats: &SeriesStats) {
    println!(
        "{:<16} now {:>7.2}  min {:>7.2}  max {:>7.2}  mean {:>7.2}  {}",
        label, stats.current, stats.min, stats.max, stats.mean, stats.trend
    );
}

fn fmt_change(change: Option<f64>) -> String {
    match change {
        Some(c) => format!("{:+.2}", c),
        None => "n/a".to_string(),
    }
}

fn fmt_gap(gap: Duration) -> String {
    format!("{}h{:02}m", gap.num_hours(), gap.num_minutes() % 60)
}
