//! # chainback CLI
//!
//! Command-line front end for the chainback engine.
//!
//! ## Usage
//! ```bash
//! # Sync one target, or every configured target on four threads
//! chainback sync dotfiles
//! chainback sync --all --jobs 4
//!
//! # Collapse a chain now, or every chain whose thresholds are met
//! chainback consolidate dotfiles
//! chainback consolidate --all --due
//!
//! # Restore from the committed remote manifest and check the result
//! chainback restore dotfiles /tmp/dotfiles
//! chainback verify dotfiles
//!
//! # Show configured targets and their chains
//! chainback list
//! ```
//!
//! The configuration file is taken from `--config`, then `$CHAINBACK_CONFIG`,
//! then `./chainback.toml`.

use chainback::utils::format_bytes;
use chainback::{
    BatchReport, ChainEngine, ChainError, EngineConfig, ManifestSource, RestoreReport, Result, SyncAction,
    SyncOutcome,
};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "CHAINBACK_CONFIG";
const DEFAULT_CONFIG: &str = "chainback.toml";

/// chainback - chain-of-snapshots backups for directories and git repositories
#[derive(Parser)]
#[command(name = "chainback")]
#[command(version)]
#[command(about = "Keep off-host backups of local directories and repositories as snapshot chains")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (defaults to $CHAINBACK_CONFIG, then ./chainback.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a target, or every configured target
    Sync {
        /// Target name
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        target: Option<String>,

        /// Sync every configured target
        #[arg(long)]
        all: bool,

        /// Targets synced in parallel (defaults to the number of CPUs)
        #[arg(short, long, requires = "all")]
        jobs: Option<usize>,
    },

    /// Collapse a target's chain into a single full artifact
    Consolidate {
        /// Target name
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        target: Option<String>,

        /// Consider every configured target
        #[arg(long, requires = "due")]
        all: bool,

        /// Only consolidate chains whose count or age threshold is met
        #[arg(long, requires = "all")]
        due: bool,
    },

    /// Rebuild a target from its chain
    #[command(alias = "rs")]
    Restore {
        /// Target name
        target: String,

        /// Empty or missing destination (defaults to ./<target>-restore)
        destination: Option<PathBuf>,

        /// Read the manifest from local state instead of the remote
        #[arg(long)]
        local_manifest: bool,
    },

    /// Restore a target into a scratch directory and check the result
    Verify {
        /// Target name
        target: String,

        /// Read the manifest from local state instead of the remote
        #[arg(long)]
        local_manifest: bool,
    },

    /// List targets and their chains
    #[command(alias = "ls")]
    List,
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; summaries go to stdout
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e.user_message());
            std::process::exit(e.exit_code());
        }
    }
}

/// Main command runner, returning the process exit code
fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = EngineConfig::load(&config_path)?;
    let engine = ChainEngine::new(config)?;

    match cli.command {
        Commands::Sync { target: Some(target), .. } => cmd_sync(&engine, &target),
        Commands::Sync { jobs, .. } => cmd_sync_all(&engine, jobs),
        Commands::Consolidate { target: Some(target), .. } => cmd_consolidate(&engine, &target),
        Commands::Consolidate { .. } => cmd_consolidate_due(&engine),
        Commands::Restore {
            target,
            destination,
            local_manifest,
        } => {
            let destination = destination.unwrap_or_else(|| PathBuf::from(format!("{target}-restore")));
            cmd_restore(&engine, &target, destination, manifest_source(local_manifest))
        }
        Commands::Verify { target, local_manifest } => cmd_verify(&engine, &target, manifest_source(local_manifest)),
        Commands::List => cmd_list(&engine),
    }
}

fn manifest_source(local: bool) -> ManifestSource {
    if local {
        ManifestSource::Local
    } else {
        ManifestSource::Remote
    }
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn sync_line(outcome: &SyncOutcome) -> String {
    let action = match outcome.action {
        SyncAction::NoOp => "unchanged".dimmed(),
        SyncAction::Full => "full".cyan(),
        SyncAction::Incremental => "incremental".cyan(),
    };
    let mut line = format!(
        "{} {} {} (chain {})",
        "✓".green().bold(),
        outcome.target.bold(),
        action,
        outcome.chain_length
    );
    if let Some(artifact) = &outcome.artifact {
        line.push_str(&format!(" {}", format_bytes(artifact.size_bytes)));
    }
    if outcome.consolidated {
        line.push_str(&format!(" {}", "consolidated".yellow()));
    }
    line.push_str(&format!(
        " {}",
        format_duration(Duration::from_millis(outcome.duration_ms)).to_string().dimmed()
    ));
    line
}

fn failure_line(target: &str, error: &ChainError) -> String {
    format!("{} {} {}", "✗".red().bold(), target.bold(), error.user_message().red())
}

/// Sync a single target
fn cmd_sync(engine: &ChainEngine, target: &str) -> Result<i32> {
    let pb = spinner(format!("Syncing {target}..."));
    let outcome = engine.sync(target);
    pb.finish_and_clear();
    println!("{}", sync_line(&outcome?));
    Ok(0)
}

/// Sync every target and print one line per target
fn cmd_sync_all(engine: &ChainEngine, jobs: Option<usize>) -> Result<i32> {
    let pb = spinner(format!("Syncing {} targets...", engine.config().targets.len()));
    let report = engine.sync_all(jobs);
    pb.finish_and_clear();
    let report = report?;

    for result in &report.results {
        match &result.result {
            Ok(outcome) => println!("{}", sync_line(outcome)),
            Err(e) => println!("{}", failure_line(&result.target, e)),
        }
    }
    print_batch_summary(&report);
    Ok(report.exit_code())
}

/// Consolidate one target regardless of its thresholds
fn cmd_consolidate(engine: &ChainEngine, target: &str) -> Result<i32> {
    let pb = spinner(format!("Consolidating {target}..."));
    let manifest = engine.consolidate(target);
    pb.finish_and_clear();
    let manifest = manifest?;
    println!(
        "{} {} consolidated into {}",
        "✓".green().bold(),
        target.bold(),
        manifest
            .head()
            .map(|a| a.filename.as_str())
            .unwrap_or_default()
            .cyan()
    );
    Ok(0)
}

/// Consolidate every target whose thresholds are met
fn cmd_consolidate_due(engine: &ChainEngine) -> Result<i32> {
    let pb = spinner("Checking chains...".to_string());
    let report = engine.consolidate_due();
    pb.finish_and_clear();

    for result in &report.results {
        match &result.result {
            Ok(Some(manifest)) => println!(
                "{} {} consolidated ({} consolidations so far)",
                "✓".green().bold(),
                result.target.bold(),
                manifest.consolidation_history.len()
            ),
            Ok(None) => println!("{} {} {}", "·".dimmed(), result.target.bold(), "not due".dimmed()),
            Err(e) => println!("{}", failure_line(&result.target, e)),
        }
    }
    print_batch_summary(&report);
    Ok(report.exit_code())
}

fn print_batch_summary<T>(report: &BatchReport<T>) {
    if report.failed() > 0 {
        println!(
            "\n{} of {} targets failed",
            report.failed().to_string().red().bold(),
            report.results.len()
        );
    }
}

fn print_restore(report: &RestoreReport) {
    let verdict = if report.status.is_verified() {
        format!("{} {}", "✓".green().bold(), report.status.to_string().green())
    } else {
        format!("{} {}", "✗".red().bold(), report.status.to_string().red())
    };
    println!("{} {}", verdict, report.target.bold());
    println!("  Destination: {}", report.destination.display().to_string().cyan());
    println!("  Artifacts applied: {}", report.artifacts_applied.to_string().cyan());
    println!("  Fetched: {}", format_bytes(report.bytes_fetched).cyan());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
    );
}

/// Restore a target into an empty destination
fn cmd_restore(engine: &ChainEngine, target: &str, destination: PathBuf, source: ManifestSource) -> Result<i32> {
    let pb = spinner(format!("Restoring {target}..."));
    let report = engine.restore(target, &destination, source);
    pb.finish_and_clear();
    let report = report?;
    print_restore(&report);
    Ok(report.status.exit_code())
}

/// Restore a target into scratch space and discard it
fn cmd_verify(engine: &ChainEngine, target: &str, source: ManifestSource) -> Result<i32> {
    let pb = spinner(format!("Verifying {target}..."));
    let report = engine.verify(target, source);
    pb.finish_and_clear();
    let report = report?;
    print_restore(&report);
    Ok(report.status.exit_code())
}

/// List targets
fn cmd_list(engine: &ChainEngine) -> Result<i32> {
    let summaries = engine.list()?;
    if summaries.is_empty() {
        println!("{}", "No targets configured".yellow());
        return Ok(0);
    }

    let configured: Vec<&str> = engine.config().targets.iter().map(|t| t.name.as_str()).collect();
    for summary in &summaries {
        let mut line = format!("{} {}", summary.name.bold(), format!("[{}]", summary.kind).dimmed());
        match summary.chain_length {
            Some(length) => {
                line.push_str(&format!(
                    " chain {} ({} incrementals)",
                    length.to_string().cyan(),
                    summary.incremental_count.unwrap_or(0)
                ));
                if let Some(last) = summary.last_sync {
                    line.push_str(&format!(" last sync {}", last.format("%Y-%m-%d %H:%M:%S UTC")));
                }
                if summary.consolidations > 0 {
                    line.push_str(&format!(", {} consolidations", summary.consolidations));
                }
            }
            None => line.push_str(&format!(" {}", "never synced".yellow())),
        }
        if !configured.contains(&summary.name.as_str()) {
            line.push_str(&format!(" {}", "(not configured)".dimmed()));
        }
        println!("{}", line);
    }
    Ok(0)
}
