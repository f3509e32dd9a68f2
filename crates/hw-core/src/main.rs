//! hostwatch - host telemetry daemon with durable local buffering.
//!
//! Commands:
//! - `run`: sample on an interval and persist through the resilient writer
//! - `status`: local queue statistics as JSON
//! - `replay`: drain the local queue once
//! - `config show|validate`: inspect the effective configuration

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use hw_common::error::{format_error_human, StructuredError};
use hw_common::{
    ConfigPaths, ConfigResolver, ConfigSource, HostwatchConfig, SnapshotSequence,
};
use hw_core::daemon::{install_shutdown_handler, Daemon, DaemonError, DaemonSettings};
use hw_core::exit_codes::ExitCode;
use hw_core::logging::{detect_host_id, init_logging, LogConfig, LogFormat, LogLevel};
use hw_core::ProcfsSampler;
use hw_telemetry::{
    DirectoryStore, DurableQueue, HealthMonitor, MemoryStore, PrimaryStore, ResilientWriter,
    RetryPolicy, SpoolLock, SpoolSettings, TimeoutStore,
};
use tracing::{error, info, warn};

/// hostwatch - host telemetry with a durable local queue
#[derive(Parser)]
#[command(name = "hostwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Path to hostwatch.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sampling and replay loops until interrupted
    Run(RunArgs),

    /// Print local queue statistics as JSON
    Status,

    /// Run one replay cycle now and print its report
    Replay,

    /// Configuration management
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Write to an in-memory primary store instead of `primary.dir`
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Load and validate the configuration
    Validate,
}

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => cli.global.log_level,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    init_logging(&LogConfig::from_env(cli_level, cli.global.log_format));

    let exit_code = match &cli.command {
        Commands::Run(args) => run_daemon(&cli.global, args),
        Commands::Status => run_status(&cli.global),
        Commands::Replay => run_replay(&cli.global),
        Commands::Config(args) => match args.command {
            ConfigCommands::Show => run_config_show(&cli.global),
            ConfigCommands::Validate => run_config_validate(&cli.global),
        },
    };

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Shared setup
// ============================================================================

fn load_config(global: &GlobalOpts) -> Result<(HostwatchConfig, ConfigSource), hw_common::Error> {
    let resolver = ConfigResolver::new(ConfigPaths {
        config_path: global.config.clone(),
        config_dir: None,
    });
    resolver.load()
}

fn report_error(err: &hw_common::Error) -> ExitCode {
    let stderr = std::io::stderr();
    if stderr.is_terminal() {
        eprintln!("{}", format_error_human(err, true));
    } else {
        eprintln!("{}", StructuredError::from(err).to_json());
    }
    ExitCode::for_error(err)
}

fn primary_store(config: &HostwatchConfig) -> Arc<dyn PrimaryStore> {
    let directory = Arc::new(DirectoryStore::new(config.primary.dir.clone()));
    Arc::new(TimeoutStore::new(
        directory,
        Duration::from_millis(config.replay.store_timeout_ms),
    ))
}

fn open_writer(
    config: &HostwatchConfig,
    store: Arc<dyn PrimaryStore>,
) -> Result<ResilientWriter, hw_common::Error> {
    let queue = DurableQueue::open(SpoolSettings::from_config(&config.spool))?;
    Ok(ResilientWriter::new(
        store,
        queue.into_shared(),
        RetryPolicy::from_config(&config.replay),
    )
    .with_health(HealthMonitor::new(
        config.health.storage_fault_escalation_cycles,
    )))
}

fn print_json(value: &serde_json::Value) -> Result<(), hw_common::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn run_daemon(global: &GlobalOpts, args: &RunArgs) -> ExitCode {
    let (config, source) = match load_config(global) {
        Ok(loaded) => loaded,
        Err(e) => return report_error(&e),
    };
    info!(
        config = source.path.as_deref().unwrap_or("<defaults>"),
        resolution = %source.resolution,
        "configuration loaded"
    );

    let store: Arc<dyn PrimaryStore> = if args.dry_run {
        warn!("dry run: telemetry goes to an in-memory store and is discarded on exit");
        Arc::new(MemoryStore::new())
    } else {
        primary_store(&config)
    };
    let writer = match open_writer(&config, store) {
        Ok(w) => w,
        Err(e) => return report_error(&e),
    };

    let sequence = {
        let queue = hw_telemetry::spool::lock(writer.spool());
        SnapshotSequence::resume_after(queue.max_local_snapshot_id())
    };
    let host_id = config
        .sampling
        .host_id
        .clone()
        .unwrap_or_else(detect_host_id);

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_shutdown_handler(shutdown.clone()) {
        error!(error = %e, "failed to install signal handler");
        return ExitCode::InternalError;
    }

    let writer = Arc::new(writer);
    let daemon = Daemon::new(
        writer.clone(),
        DaemonSettings::from_config(&config, host_id),
        shutdown,
    );

    #[cfg(feature = "metrics")]
    let (daemon, _metrics_server) = if config.metrics.enabled {
        match start_metrics(&config) {
            Ok((metrics, server)) => (daemon.with_metrics(metrics), Some(server)),
            Err(e) => {
                error!(error = %e, "metrics endpoint disabled");
                (daemon, None)
            }
        }
    } else {
        (daemon, None)
    };

    let sampler = ProcfsSampler::new(config.sampling.max_processes);
    match daemon.run(sampler, sequence) {
        Ok(_) => {
            let stats = writer.queue_stats(chrono::Utc::now());
            if stats.depth > 0 {
                info!(pending = stats.depth, "batches left queued for the next start");
                ExitCode::Degraded
            } else {
                ExitCode::Clean
            }
        }
        Err(e @ DaemonError::Spawn { .. }) => {
            error!(error = %e, "daemon failed to start");
            ExitCode::IoError
        }
        Err(e) => {
            error!(error = %e, "daemon failed");
            ExitCode::InternalError
        }
    }
}

#[cfg(feature = "metrics")]
fn start_metrics(
    config: &HostwatchConfig,
) -> Result<
    (
        hw_core::daemon::metrics::HostwatchMetrics,
        hw_core::daemon::metrics::MetricsServer,
    ),
    hw_core::daemon::metrics::MetricsError,
> {
    use hw_core::daemon::metrics::{HostwatchMetrics, MetricsServer};

    let metrics = HostwatchMetrics::new()?;
    let server = MetricsServer::start(&config.metrics, metrics.clone())?;
    Ok((metrics, server))
}

/// Inspects the spool without owning it, so it is safe next to `hostwatch run`.
fn run_status(global: &GlobalOpts) -> ExitCode {
    let (config, source) = match load_config(global) {
        Ok(loaded) => loaded,
        Err(e) => return report_error(&e),
    };
    let queue = match DurableQueue::open_read_only(SpoolSettings::from_config(&config.spool)) {
        Ok(q) => q,
        Err(e) => return report_error(&e.into()),
    };
    let policy = RetryPolicy::from_config(&config.replay);

    let stats = queue.stats(chrono::Utc::now(), &policy);
    let response = serde_json::json!({
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "config": source,
        "spool_dir": config.spool.dir.display().to_string(),
        "owner_pid": SpoolLock::holder(&config.spool.dir),
        "queue": stats,
        "recovery": queue.recovery(),
        "primary": {
            "dir": config.primary.dir.display().to_string(),
            "reachable": primary_store(&config).is_reachable(),
        },
    });
    if let Err(e) = print_json(&response) {
        return report_error(&e);
    }

    if stats.depth > 0 {
        ExitCode::Degraded
    } else {
        ExitCode::Clean
    }
}

fn run_replay(global: &GlobalOpts) -> ExitCode {
    let (config, _) = match load_config(global) {
        Ok(loaded) => loaded,
        Err(e) => return report_error(&e),
    };
    let store = primary_store(&config);
    let writer = match open_writer(&config, store) {
        Ok(w) => w,
        Err(e) => return report_error(&e),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_shutdown_handler(cancel.clone()) {
        warn!(error = %e, "replay is not interruptible");
    }

    let report = writer.replay_pending(&cancel);
    let value = match serde_json::to_value(&report) {
        Ok(v) => v,
        Err(e) => return report_error(&e.into()),
    };
    if let Err(e) = print_json(&value) {
        return report_error(&e);
    }

    if report.is_clean() {
        ExitCode::Clean
    } else {
        ExitCode::Degraded
    }
}

fn run_config_show(global: &GlobalOpts) -> ExitCode {
    match load_config(global) {
        Ok((config, source)) => {
            let response = serde_json::json!({
                "source": source,
                "config": config,
            });
            match print_json(&response) {
                Ok(()) => ExitCode::Clean,
                Err(e) => report_error(&e),
            }
        }
        Err(e) => report_error(&e),
    }
}

fn run_config_validate(global: &GlobalOpts) -> ExitCode {
    match load_config(global) {
        Ok((_, source)) => {
            let response = serde_json::json!({
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "status": "valid",
                "source": source,
            });
            match print_json(&response) {
                Ok(()) => ExitCode::Clean,
                Err(e) => report_error(&e),
            }
        }
        Err(e) => {
            let response = serde_json::json!({
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "status": "error",
                "error": StructuredError::from(&e),
            });
            if let Ok(body) = serde_json::to_string_pretty(&response) {
                println!("{}", body);
            }
            ExitCode::for_error(&e)
        }
    }
}
