//! Tandem CLI - local two-tier service orchestrator.
//!
//! Single binary that provides:
//! - `tandem start` - bring up backend then frontend, idle until interrupted
//! - `tandem stop` - terminate whatever an earlier `start` launched
//! - `tandem restart` - stop, settle, start
//! - `tandem status` - per-tier liveness and reachability
//! - `tandem logs` - stream the backend log
//! - `tandem` (no args) - same as `start`

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use tandem_core::supervisor::{listen_for_signals, LogOptions, LogOutcome, LogReporter, StatusReport};
use tandem_core::{
    Collaborators, OrchestratorConfig, OrchestratorError, ProcessHandle, StartReport, Supervisor,
};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Run a backend API and its web frontend as one unit", version)]
struct Cli {
    /// Project root directory
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the backend port
    #[arg(long, global = true)]
    backend_port: Option<u16>,

    /// Override the frontend port
    #[arg(long, global = true)]
    frontend_port: Option<u16>,

    /// Never pause for settings-file edits
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start both tiers and wait for Ctrl-C
    Start,

    /// Stop both tiers
    Stop,

    /// Stop, then start again
    Restart,

    /// Show tier status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream the backend log
    Logs {
        /// Print what is there and exit
        #[arg(long)]
        no_follow: bool,

        /// Start from the last N lines
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_failure(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // Find project root
    let project_root = match cli.project {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut config = OrchestratorConfig::load_from_project(&project_root)?;
    config.resolve_paths(&project_root);
    if let Some(port) = cli.backend_port {
        config.backend.port = port;
    }
    if let Some(port) = cli.frontend_port {
        config.frontend.port = port;
    }

    let interactive = !cli.yes && std::io::stdin().is_terminal();
    let parts = Collaborators::system(&config, interactive);
    let supervisor = Supervisor::new(config, parts);

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            tracing::info!(project = %project_root.display(), "Starting");
            run_supervised(&supervisor, false).await
        }
        Commands::Restart => {
            tracing::info!(project = %project_root.display(), "Restarting");
            run_supervised(&supervisor, true).await
        }
        Commands::Stop => stop(&supervisor).await,
        Commands::Status { json } => show_status(&supervisor, &project_root, json).await,
        Commands::Logs { no_follow, lines } => {
            let options = LogOptions {
                lines,
                follow: !no_follow,
            };
            show_logs(&supervisor, options).await
        }
    }
}

fn report_failure(err: &anyhow::Error) {
    match err.downcast_ref::<OrchestratorError>() {
        Some(failure) => {
            eprintln!("error: {} failed: {}", failure.step(), failure);
            if let Some(log) = failure.log_path() {
                eprintln!("       see {} for the tier's output", log.display());
            }
        }
        None => eprintln!("error: {err:#}"),
    }
}

/// Start (or restart), then idle until interrupted.
///
/// Signals are captured before startup begins: an interrupt that lands
/// mid-startup is held until both tiers are up and recorded, then tears
/// them down instead of leaving a detached tier behind.
async fn run_supervised(supervisor: &Supervisor, restart: bool) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let signals = listen_for_signals(cancel.clone());

    let started = if restart {
        supervisor.restart().await
    } else {
        supervisor.start().await
    };
    let result = match started {
        Ok(report) => supervise(supervisor, report, cancel).await,
        Err(e) => Err(e.into()),
    };

    signals.abort();
    result
}

async fn supervise(
    supervisor: &Supervisor,
    report: StartReport,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let config = supervisor.config();

    let (backend, frontend) = match report {
        StartReport::AlreadyRunning { backend, frontend } => {
            println!(
                "Already running (backend pid {}, frontend pid {}).",
                backend.pid, frontend.pid
            );
            println!("Use 'tandem stop' or 'tandem restart' to control them.");
            return Ok(ExitCode::SUCCESS);
        }
        StartReport::Started { backend, frontend } => (backend, frontend),
    };

    println!();
    print_tier("Backend", &backend, config.backend.port);
    print_tier("Frontend", &frontend, config.frontend.port);
    if let Some(log) = &config.backend.log_file {
        println!("  Backend log: {}", log.display());
    }
    println!();
    println!("Press Ctrl-C to stop both tiers.");

    let stopped = supervisor.supervise(cancel).await?;

    if let Some(report) = stopped {
        for tier in &report.tiers {
            println!("Stopped {} (pid {}, {:?})", tier.tier, tier.pid, tier.outcome);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_tier(label: &str, handle: &ProcessHandle, port: u16) {
    println!("  {label:<9} http://localhost:{port}  (pid {})", handle.pid);
}

async fn stop(supervisor: &Supervisor) -> Result<ExitCode> {
    let report = supervisor.stop().await?;

    if !report.was_running() {
        println!("Not running.");
    }
    for tier in report.tiers.iter().filter(|t| t.outcome.is_gone()) {
        println!("Stopped {} (pid {})", tier.tier, tier.pid);
    }
    for tier in report.tiers.iter().filter(|t| !t.outcome.is_gone()) {
        println!("Could not stop {} (pid {})", tier.tier, tier.pid);
    }
    Ok(ExitCode::SUCCESS)
}

async fn show_status(supervisor: &Supervisor, project_root: &Path, json: bool) -> Result<ExitCode> {
    let report = supervisor.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    print_status(&report, project_root);
    Ok(ExitCode::SUCCESS)
}

fn print_status(report: &StatusReport, project_root: &Path) {
    println!("Tandem Status");
    println!("=============");
    println!();
    println!("Project: {}", project_root.display());
    println!("State:   {:?}", report.state);
    println!();
    for tier in &report.tiers {
        let pid = tier
            .handle
            .as_ref()
            .map(|h| h.pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let liveness = match (&tier.handle, tier.alive) {
            (None, _) => "no handle",
            (Some(_), true) => "alive",
            (Some(_), false) => "stale handle",
        };
        let reachability = if tier.reachable { "reachable" } else { "not reachable" };
        println!(
            "  {:<9} port {:<5} pid {:<8} {:<12} {}",
            tier.name, tier.port, pid, liveness, reachability
        );
    }
    println!();
    println!("Recent events:");
    for event in &report.recent_events {
        match &event.tier {
            Some(tier) => println!("  [{}] {}: {}", event.event_type, tier, event.message),
            None => println!("  [{}] {}", event.event_type, event.message),
        }
    }
}

async fn show_logs(supervisor: &Supervisor, options: LogOptions) -> Result<ExitCode> {
    let reporter = LogReporter::new(supervisor.config().backend.log_file.clone());

    let cancel = CancellationToken::new();
    let signals = listen_for_signals(cancel.clone());
    let mut stdout = std::io::stdout();
    let outcome = reporter.stream(&mut stdout, options, cancel).await?;
    signals.abort();

    match outcome {
        LogOutcome::NoSink => println!("The backend's output is not captured (no log_file configured)."),
        LogOutcome::Missing(path) => println!("No log file at {} yet.", path.display()),
        LogOutcome::Streamed { .. } => {}
    }
    Ok(ExitCode::SUCCESS)
}
