//! exam-migrate CLI - staged exam-platform data migration.

use clap::{Parser, Subcommand};
use exam_migrate::error::EXIT_CANCELLED;
use exam_migrate::{CheckStatus, Config, MigrateError, MigrationResult, Pipeline};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "exam-migrate")]
#[command(about = "Staged migration of exam-platform data between PostgreSQL schemas")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for a graceful stop after a signal before exiting
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled stage: extract, transform, load, reconcile
    Run {
        /// Re-extract tables even when artifacts exist
        #[arg(long)]
        force_download: bool,

        /// Disable non-essential target triggers during the large loads
        #[arg(long)]
        suspend_triggers: bool,

        #[arg(long)]
        skip_extract: bool,

        #[arg(long)]
        skip_transform: bool,

        #[arg(long)]
        skip_load: bool,

        #[arg(long)]
        skip_reconcile: bool,

        /// Load into an in-memory copy of the target schema
        #[arg(long)]
        dry_run: bool,
    },

    /// Resume a previous run, skipping completed stages
    Resume,

    /// Extract source tables into raw artifacts
    Extract {
        /// Re-extract tables even when artifacts exist
        #[arg(long)]
        force_download: bool,
    },

    /// Transform raw artifacts into target-shaped artifacts
    Transform,

    /// Load transformed artifacts into the target
    Load {
        /// Disable non-essential target triggers during the large loads
        #[arg(long)]
        suspend_triggers: bool,

        /// Load into an in-memory copy of the target schema
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate row counts between source and target
    Validate,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Enable exactly the given stages.
fn only(config: &mut Config, extract: bool, transform: bool, load: bool, reconcile: bool) {
    let stages = &mut config.migration.stages;
    stages.extract = extract;
    stages.transform = transform;
    stages.load = load;
    stages.reconcile = reconcile;
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler(cli.shutdown_timeout)?;

    let mut dry = false;
    let mut resume = false;
    match cli.command {
        Commands::HealthCheck => return health_check(config, cli.output_json).await,
        Commands::Run {
            force_download,
            suspend_triggers,
            skip_extract,
            skip_transform,
            skip_load,
            skip_reconcile,
            dry_run,
        } => {
            let stages = &mut config.migration.stages;
            stages.extract &= !skip_extract;
            stages.transform &= !skip_transform;
            stages.load &= !skip_load;
            stages.reconcile &= !skip_reconcile;
            config.migration.force_download |= force_download;
            config.migration.suspend_triggers |= suspend_triggers;
            dry = dry_run;
        }
        Commands::Resume => {
            // State file is required for resume
            let state_file = cli.state_file.as_ref().ok_or_else(|| {
                MigrateError::Config("--state-file is required for resume".to_string())
            })?;
            if !state_file.exists() {
                return Err(MigrateError::Config(format!(
                    "State file not found: {:?}",
                    state_file
                )));
            }
            resume = true;
        }
        Commands::Extract { force_download } => {
            only(&mut config, true, false, false, false);
            config.migration.force_download |= force_download;
        }
        Commands::Transform => only(&mut config, false, true, false, false),
        Commands::Load {
            suspend_triggers,
            dry_run,
        } => {
            only(&mut config, false, false, true, false);
            config.migration.suspend_triggers |= suspend_triggers;
            dry = dry_run;
        }
        Commands::Validate => only(&mut config, false, false, false, true),
    }
    config.validate()?;

    let mut pipeline = if dry {
        Pipeline::connect_dry_run(config).await?
    } else {
        Pipeline::connect(config).await?
    }
    .with_cancel(cancel_token);

    if let Some(ref path) = cli.state_file {
        pipeline = pipeline.with_state_file(path.clone());
    }
    if resume {
        pipeline = pipeline.resume()?;
        info!("Resuming from previous state");
    }

    let result = pipeline.run().await?;
    if cli.output_json {
        println!("{}", result.to_json()?);
    } else {
        print_summary(&result);
    }

    match result.failure() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn print_summary(result: &MigrationResult) {
    println!("\nMigration {}!", result.status);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Stages: {}", result.stages_run.join(", "));
    if !result.extract.is_empty() {
        let rows: u64 = result.extract.iter().map(|s| s.rows).sum();
        println!("  Extracted: {} tables, {} rows", result.extract.len(), rows);
    }
    if let Some(ref transform) = result.transform {
        println!(
            "  Transformed: {} tables, {} skipped",
            transform.tables.len(),
            transform.total_skipped()
        );
    }
    if result.load.is_some() {
        println!(
            "  Loaded: {}/{} tables, {} rows, {} skipped",
            result.tables_success, result.tables_total, result.rows_loaded, result.rows_skipped
        );
    }
    if !result.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", result.failed_tables);
    }
    if let Some(ref report) = result.reconcile {
        println!("\nReconciliation:");
        for r in &report.results {
            let ratio = r.ratio.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".into());
            println!(
                "  {:<8} {:<28} ratio {:>6} expected {:.2}{}",
                r.status,
                r.target_table,
                ratio,
                r.expected,
                r.message
                    .as_deref()
                    .map(|m| format!("  {}", m))
                    .unwrap_or_default()
            );
        }
        println!(
            "  {} passed, {} failed, {} errors",
            report.count(CheckStatus::Pass),
            report.count(CheckStatus::Fail),
            report.count(CheckStatus::Error)
        );
    }
}

async fn health_check(config: Config, output_json: bool) -> Result<(), MigrateError> {
    let pipeline = Pipeline::connect(config).await?;
    let result = pipeline.health_check().await?;

    if output_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Health Check Results:");
        println!(
            "  Source: {} ({}ms)",
            if result.source_connected { "OK" } else { "FAILED" },
            result.source_latency_ms
        );
        if let Some(ref err) = result.source_error {
            println!("    Error: {}", err);
        }
        println!(
            "  Target: {} ({}ms)",
            if result.target_connected { "OK" } else { "FAILED" },
            result.target_latency_ms
        );
        if let Some(ref err) = result.target_error {
            println!("    Error: {}", err);
        }
        println!(
            "\n  Overall: {}",
            if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
        );
    }

    if !result.healthy {
        return Err(MigrateError::connection("health check failed", "health-check"));
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().try_init().map_err(|e| e.to_string())
    } else {
        subscriber.try_init().map_err(|e| e.to_string())
    }
}

/// Cancel the token on a signal, then give the pipeline `shutdown_timeout`
/// seconds to stop at its next batch boundary before exiting.
fn on_signal(token: CancellationToken, name: &'static str, shutdown_timeout: u64) {
    eprintln!(
        "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
        name, shutdown_timeout
    );
    token.cancel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
        eprintln!("Shutdown timeout elapsed, exiting");
        std::process::exit(i32::from(EXIT_CANCELLED));
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        on_signal(token, name, shutdown_timeout);
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal(token, "Ctrl-C", shutdown_timeout);
        }
    });

    Ok(cancel_token)
}
