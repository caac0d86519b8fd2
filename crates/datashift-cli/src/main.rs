//! datashift CLI - Parallel bulk record transfer between storage backends.

use clap::{Parser, Subcommand};
use datashift::{
    BackendCatalog, Config, Isolation, Orchestrator, RunStatus, RunSummary, TransferError,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "datashift")]
#[command(about = "Parallel bulk record transfer between storage backends")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer every record from the source to the target
    Run {
        /// Override number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override records per work unit
        #[arg(long)]
        page_size: Option<usize>,

        /// Override attempts per backend call
        #[arg(long)]
        max_retries: Option<u32>,

        /// Skip units that fail after retries instead of aborting
        #[arg(long)]
        ignore_errors: bool,

        /// Worker isolation: process or task
        #[arg(long, value_parser = ["process", "task"])]
        isolation: Option<String>,

        /// Dry run: check backends and copy metadata, leaving target records untouched
        #[arg(long)]
        dry_run: bool,
    },

    /// List the registered backend drivers
    Drivers,

    /// Serve the worker protocol on stdin/stdout
    #[command(hide = true)]
    Worker,
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

async fn run() -> Result<(), TransferError> {
    let cli = Cli::parse();

    // Workers log to stderr like everything else; stdout carries the protocol
    setup_logging(&cli.verbosity, &cli.log_format);

    let catalog = Arc::new(BackendCatalog::with_builtins());

    match cli.command {
        Commands::Worker => datashift::serve_stdio(catalog).await,

        Commands::Drivers => {
            let drivers = catalog.drivers();
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&drivers)?);
            } else {
                println!("Registered drivers:");
                for driver in drivers {
                    println!(
                        "  {:<10} {} v{} - {}",
                        driver.id, driver.name, driver.version, driver.description
                    );
                }
            }
            Ok(())
        }

        Commands::Run {
            workers,
            page_size,
            max_retries,
            ignore_errors,
            isolation,
            dry_run,
        } => {
            let mut config = Config::load(&cli.config)?.with_auto_tuning();
            info!("Loaded configuration from {:?}", cli.config);

            // Apply overrides
            if let Some(w) = workers {
                config.transfer.workers = Some(w);
            }
            if let Some(size) = page_size {
                config.transfer.page_size = Some(size);
            }
            if let Some(n) = max_retries {
                config.transfer.max_retries = Some(n);
            }
            if ignore_errors {
                config.transfer.ignore_errors = true;
            }
            if let Some(isolation) = isolation.as_deref() {
                config.transfer.isolation = match isolation {
                    "task" => Isolation::Task,
                    _ => Isolation::Process,
                };
            }
            config.validate()?;

            let cancel_token = setup_signal_handler();

            let program = std::env::current_exe()?;
            let worker_args = vec![
                "--log-format".to_string(),
                cli.log_format.clone(),
                "--verbosity".to_string(),
                cli.verbosity.clone(),
                "worker".to_string(),
            ];

            let result = Orchestrator::new(config, catalog)
                .with_worker_program(program, worker_args)
                .with_dry_run(dry_run)
                .with_progress_output(cli.progress)
                .run(cancel_token)
                .await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_summary(&result);
            }

            result.outcome()
        }
    }
}

fn print_summary(result: &RunSummary) {
    let status_msg = match result.status {
        RunStatus::DryRun => "Dry run completed!",
        RunStatus::Cancelled => "Transfer cancelled.",
        RunStatus::CompletedWithErrors => "Transfer completed with errors.",
        RunStatus::Completed => "Transfer completed!",
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Records: {}/{}",
        result.records_processed, result.records_expected
    );
    println!("  Workers: {}", result.workers);
    println!("  Throughput: {:.0} records/sec", result.records_per_second);
    if result.failed_units > 0 {
        println!("  Failed units: {}", result.failed_units);
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over --verbosity when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("Failed to setup {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Finishing in-flight units...", name);
            token.cancel();
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Failed to setup Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Finishing in-flight units...");
        token.cancel();
    });

    cancel_token
}
