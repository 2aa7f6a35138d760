use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::{SourceIdentity, TaskOptions, TaskParameters};
use crate::engine::persistence::{MemorySink, RecordSink};
use crate::engine::planner::{RangeSpec, TaskSpec};
use crate::engine::runner::{ExitStatus, RunReport, Runner};
use crate::engine::windows::{parse_date, SplitUnit};
use crate::engine::{worker, PacingConfig, Strategy};
use crate::infra::config::StrategyKind;
use crate::infra::lock::LockStatus;
use crate::infra::{logging, AccountList, ConfigManager, HarvesterConfig, RunLock, SqliteSink};
use crate::sources::builtin_registry;

#[derive(Parser)]
#[command(name = "harvester")]
#[command(about = "Paced, incremental collection of social platform accounts", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to ./harvester.yml)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a commented default config file
    Init,

    /// Collect specific accounts now
    Collect {
        /// Platform / source type
        #[arg(long, short)]
        source: String,

        /// Account handles
        #[arg(long = "handle", short = 'u', required = true)]
        handles: Vec<String>,

        /// Maximum regular items per account
        #[arg(long)]
        limit: Option<usize>,

        /// Skip stories and other ephemeral items
        #[arg(long)]
        no_ephemeral: bool,

        /// Fetch media for collected items
        #[arg(long)]
        media: bool,

        #[command(flatten)]
        run: RunOptions,
    },

    /// Collect every account in an accounts file
    Daily {
        #[arg(long, short)]
        accounts: PathBuf,

        /// Visit accounts in random order
        #[arg(long)]
        shuffle: bool,

        #[command(flatten)]
        run: RunOptions,
    },

    /// Collect a historical range, one task per window
    Backfill {
        #[arg(long, short)]
        source: String,

        #[arg(long = "handle", short = 'u', required = true)]
        handles: Vec<String>,

        /// Range start (YYYY-MM-DD, YYYY-MM, YYYY or RFC 3339)
        #[arg(long)]
        start: String,

        /// Range end, exclusive (defaults to now)
        #[arg(long)]
        end: Option<String>,

        #[arg(long, value_enum, default_value = "months")]
        unit: SplitUnit,

        #[arg(long, default_value = "1")]
        step: u32,

        #[arg(long)]
        limit: Option<usize>,

        #[command(flatten)]
        run: RunOptions,
    },

    /// Show lock state and recent collection history
    Status {
        /// History rows to show
        #[arg(short = 'n', default_value = "10")]
        count: usize,

        #[arg(long)]
        json: bool,
    },

    /// Run one task from stdin (used by the parallel strategy)
    #[command(hide = true)]
    Worker,
}

#[derive(Args, Clone, Default)]
pub struct RunOptions {
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyKind>,

    /// Worker processes for the parallel strategy
    #[arg(long)]
    pub workers: Option<usize>,

    /// Concurrent tasks for the cooperative strategy
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// Stop dispatching after this many seconds
    #[arg(long)]
    pub deadline: Option<u64>,

    /// Skip pacing delays
    #[arg(long)]
    pub no_pacing: bool,

    /// Seed for reproducible pacing
    #[arg(long)]
    pub seed: Option<u64>,

    /// Keep results in memory instead of writing the database
    #[arg(long)]
    pub dry_run: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunOptions {
    fn apply(&self, config: &mut HarvesterConfig) {
        let orchestrator = &mut config.orchestrator;
        if let Some(strategy) = self.strategy {
            orchestrator.strategy = strategy;
        }
        if let Some(workers) = self.workers {
            orchestrator.workers = Some(workers);
        }
        if let Some(max) = self.max_in_flight {
            orchestrator.max_in_flight = max;
        }
        if let Some(deadline) = self.deadline {
            orchestrator.deadline_secs = Some(deadline);
        }
        if self.no_pacing {
            config.pacing = PacingConfig::none();
        }
    }
}

/// Parse arguments, run the command, and return the process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match dispatch(cli).await {
        Ok(status) => status.code(),
        Err(e) => {
            eprintln!("{} {:#}", "✗".red(), e);
            ExitStatus::Fatal.code()
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitStatus> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(ConfigManager::CONFIG_FILE));

    match cli.command {
        Commands::Init => init_command(&config_path),
        Commands::Worker => {
            worker::serve().await?;
            Ok(ExitStatus::Success)
        }
        Commands::Status { count, json } => {
            let manager = ConfigManager::new(&config_path)?;
            status_command(manager.get(), count, json)
        }
        Commands::Collect {
            source,
            handles,
            limit,
            no_ephemeral,
            media,
            run,
        } => {
            let mut params = TaskParameters::new();
            if let Some(limit) = limit {
                params.insert(TaskOptions::LIMIT.into(), limit.into());
            }
            if no_ephemeral {
                params.insert(TaskOptions::INCLUDE_EPHEMERAL.into(), false.into());
            }
            if media {
                params.insert(TaskOptions::ATTACH_MEDIA.into(), true.into());
            }
            let specs = handles
                .iter()
                .map(|h| TaskSpec::new(SourceIdentity::new(&source, h)).with_parameters(params.clone()))
                .collect();

            let manager = ConfigManager::new(&config_path)?;
            execute(manager.into_config(), specs, &run, false).await
        }
        Commands::Daily {
            accounts,
            shuffle,
            run,
        } => {
            let manager = ConfigManager::new(&config_path)?;
            let specs = daily_specs(&manager, &accounts)?;
            execute(manager.into_config(), specs, &run, shuffle).await
        }
        Commands::Backfill {
            source,
            handles,
            start,
            end,
            unit,
            step,
            limit,
            run,
        } => {
            let start = parse_date(&start)?;
            let end = match end {
                Some(end) => parse_date(&end)?,
                None => Utc::now(),
            };
            let mut params = TaskParameters::new();
            if let Some(limit) = limit {
                params.insert(TaskOptions::LIMIT.into(), limit.into());
            }
            let range = RangeSpec {
                start,
                end,
                unit,
                step,
            };
            let specs = handles
                .iter()
                .map(|h| {
                    TaskSpec::new(SourceIdentity::new(&source, h))
                        .with_parameters(params.clone())
                        .with_range(range.clone())
                })
                .collect();

            let manager = ConfigManager::new(&config_path)?;
            execute(manager.into_config(), specs, &run, false).await
        }
    }
}

fn init_command(config_path: &Path) -> Result<ExitStatus> {
    println!("{}", "Initializing harvester...".bold());

    if ConfigManager::create_default(config_path)? {
        println!("✓ Configuration written to {}", config_path.display());
    } else {
        println!(
            "{} {} already exists, left untouched",
            "⚠️".yellow(),
            config_path.display()
        );
    }

    let manager = ConfigManager::new(config_path)?;
    let database = &manager.get().database;
    SqliteSink::open(database)
        .with_context(|| format!("failed to initialize {}", database.display()))?;
    println!("✓ Database ready at {}", database.display());

    println!("\n{}", "Ready to collect.".green().bold());
    Ok(ExitStatus::Success)
}

fn daily_specs(manager: &ConfigManager, accounts: &Path) -> Result<Vec<TaskSpec>> {
    let list = AccountList::load(accounts)?;
    let registry = builtin_registry(&manager.get().sources);

    for platform in list.platforms() {
        if !manager.platform(platform).enabled {
            tracing::info!(platform, "platform disabled, skipping its accounts");
        } else if !registry.contains(platform) {
            tracing::warn!(platform, "no source registered for platform");
        }
    }

    let identities = list.identities(|platform| manager.platform(platform).enabled);
    tracing::info!(
        accounts = identities.len(),
        file = %accounts.display(),
        "accounts loaded"
    );
    Ok(identities.into_iter().map(TaskSpec::new).collect())
}

async fn execute(
    mut config: HarvesterConfig,
    specs: Vec<TaskSpec>,
    options: &RunOptions,
    shuffle: bool,
) -> Result<ExitStatus> {
    options.apply(&mut config);
    ConfigManager::validate(&config)?;

    let registry = Arc::new(builtin_registry(&config.sources));
    let strategy = Strategy::from_config(&config.orchestrator);

    let runner = if options.dry_run {
        tracing::info!("dry run, nothing will be written");
        Runner::new(config, registry, Arc::new(MemorySink::new()))
    } else {
        let database = config.database.clone();
        Runner::opening(config, registry, move || {
            let sink: Arc<dyn RecordSink> = Arc::new(SqliteSink::open(&database)?);
            Ok(sink)
        })
    };
    let mut runner = runner.with_shuffle(shuffle);
    if let Some(seed) = options.seed {
        runner = runner.with_pacing_seed(seed);
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let listener = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after in-flight tasks");
            interrupt.cancel();
        }
    });

    let result = runner.run(specs, strategy, &cancel).await;
    listener.abort();

    match result {
        Ok(report) => {
            print_report(&report, options.json)?;
            Ok(report.exit_status())
        }
        Err(e) => {
            eprintln!("{} {}", "✗".red(), e);
            Ok(e.exit_status())
        }
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "\n{} {} ({}, {:.1}s)",
        "Run".bold(),
        report.run_id.to_string().dimmed(),
        report.strategy,
        report.duration().num_milliseconds() as f64 / 1000.0
    );

    for task in &report.tasks {
        let label = match task.time_window {
            Some(window) => format!("{} [{}]", task.identity, window),
            None => task.identity.to_string(),
        };
        if task.success {
            println!(
                "  {} {}  {} items, {} ephemeral",
                "✓".green(),
                label,
                task.items,
                task.ephemeral_items
            );
        } else {
            let kind = task
                .error_kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "error".to_string());
            println!(
                "  {} {}  {}: {}",
                "✗".red(),
                label,
                kind.yellow(),
                task.error_detail.as_deref().unwrap_or("")
            );
        }
    }

    for error in &report.persistence_errors {
        println!("  {} {}", "⚠️".yellow(), error);
    }

    println!("\nRecords: {}", report.diff);
    let totals = format!(
        "{} succeeded, {} failed, {} cancelled",
        report.succeeded, report.failed, report.cancelled
    );
    if report.exit_status() == ExitStatus::Success {
        println!("{}", totals.green().bold());
    } else {
        println!("{}", totals.yellow().bold());
    }
    Ok(())
}

fn status_command(config: &HarvesterConfig, count: usize, json: bool) -> Result<ExitStatus> {
    let lock = RunLock::inspect(&config.lock_path)?;
    let database_exists = config.database.exists();
    let (records, history) = if database_exists {
        let sink = SqliteSink::open(&config.database)
            .with_context(|| format!("failed to open {}", config.database.display()))?;
        (sink.count_records(None)?, sink.recent_history(count)?)
    } else {
        (0, Vec::new())
    };

    if json {
        let (state, holder) = match &lock {
            LockStatus::Free => ("free", None),
            LockStatus::Held(record) => ("held", Some(record)),
            LockStatus::Stale(record) => ("stale", record.as_ref()),
        };
        let value = serde_json::json!({
            "lock": { "path": config.lock_path, "state": state, "holder": holder },
            "database": config.database,
            "records": records,
            "history": history,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(ExitStatus::Success);
    }

    println!("{}", "Harvester status".bold());
    match &lock {
        LockStatus::Free => println!("✓ No run in progress"),
        LockStatus::Held(record) => println!(
            "{} Run in progress (pid {}, since {})",
            "●".cyan(),
            record.pid,
            record.acquired_at.format("%Y-%m-%d %H:%M:%S")
        ),
        LockStatus::Stale(_) => println!(
            "{} Stale lock at {} (will be reclaimed by the next run)",
            "⚠️".yellow(),
            config.lock_path.display()
        ),
    }

    if !database_exists {
        println!("{} No database yet at {}", "⚠️".yellow(), config.database.display());
        return Ok(ExitStatus::Success);
    }
    println!("✓ {} records in {}", records, config.database.display());

    if history.is_empty() {
        return Ok(ExitStatus::Success);
    }
    println!("\n{}", "Recent tasks".bold());
    for entry in &history {
        let mark = if entry.success {
            "✓".green()
        } else {
            "✗".red()
        };
        let detail = match (&entry.error_kind, &entry.error_detail) {
            (Some(kind), Some(detail)) => format!("{kind}: {detail}"),
            _ => format!("{} items", entry.item_count),
        };
        println!(
            "  {} {} {}  {}",
            mark,
            entry.finished_at.format("%Y-%m-%d %H:%M"),
            entry.identity,
            detail.dimmed()
        );
    }
    Ok(ExitStatus::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_options_override_config() {
        let mut config = HarvesterConfig::default();
        let options = RunOptions {
            strategy: Some(StrategyKind::Cooperative),
            max_in_flight: Some(9),
            deadline: Some(60),
            no_pacing: true,
            ..RunOptions::default()
        };
        options.apply(&mut config);

        assert_eq!(config.orchestrator.strategy, StrategyKind::Cooperative);
        assert_eq!(config.orchestrator.max_in_flight, 9);
        assert_eq!(config.orchestrator.deadline_secs, Some(60));
        assert_eq!(config.pacing, PacingConfig::none());
    }

    #[test]
    fn backfill_arguments_parse() {
        let cli = Cli::try_parse_from([
            "harvester", "backfill", "--source", "instagram", "-u", "nasa", "-u", "esa",
            "--start", "2024-01", "--unit", "days", "--step", "7",
        ])
        .unwrap();
        match cli.command {
            Commands::Backfill { handles, unit, step, end, .. } => {
                assert_eq!(handles, vec!["nasa", "esa"]);
                assert_eq!(unit, SplitUnit::Days);
                assert_eq!(step, 7);
                assert!(end.is_none());
            }
            _ => panic!("expected backfill"),
        }
    }
}
