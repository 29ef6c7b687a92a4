// Photo Migrator CLI binary

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

use photo_migrator_lib::config::{load_config, validate, DestinationKind, MigrateConfig, VerificationPolicy};
use photo_migrator_lib::constants::PROMPT_TIMEOUT_SECS;
use photo_migrator_lib::ledger::{SideRecords, StateLedger};
use photo_migrator_lib::logging;
use photo_migrator_lib::orchestrator::{
    reset_working_directory, write_restart_marker, write_stop_marker, DecisionHandler, PolicyHandler,
    PromptHandler,
};
use photo_migrator_lib::workdir::WorkPaths;
use photo_migrator_lib::{Orchestrator, RunContext, RunMode, RunSummary};

#[derive(Parser)]
#[command(name = "photo-migrator")]
#[command(about = "Migrate exported photo archives into a photo library, resumably", long_about = None)]
#[command(version, args_conflicts_with_subcommands = true)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct RunArgs {
    /// Import by copying into the configured sync folder instead of the Photos app
    #[arg(long)]
    use_sync: bool,

    /// Retry files whose import or verification failed
    #[arg(long, conflicts_with_all = ["retry_failed_extractions", "retry_failed_conversions"])]
    retry_failed: bool,

    /// Re-download and re-extract archives that failed extraction
    #[arg(long, conflicts_with = "retry_failed_conversions")]
    retry_failed_extractions: bool,

    /// Retry files whose metadata merge failed
    #[arg(long)]
    retry_failed_conversions: bool,

    /// Ceiling for the working directory, in GB
    #[arg(long, value_name = "GB")]
    max_disk_space: Option<f64>,

    /// Never prompt; decisions come from the config
    #[arg(long)]
    non_interactive: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show ledger counts, the last checkpoint and corrupted archives
    Status,

    /// Ask a running migration to stop after its current archive
    Stop,

    /// Ask a running migration to wipe its state and start over
    Restart,

    /// Wipe all migration state (the duplicate-import record is kept)
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    match cli.command {
        None => cmd_run(cli.config, cli.run),
        Some(Commands::Status) => cmd_status(cli.config),
        Some(Commands::Stop) => cmd_stop(cli.config),
        Some(Commands::Restart) => cmd_restart(cli.config),
        Some(Commands::Reset { yes }) => cmd_reset(cli.config, yes),
    }
}

fn load(config: Option<PathBuf>) -> Result<MigrateConfig> {
    load_config(config.as_deref()).context("Failed to load configuration")
}

fn run_mode(args: &RunArgs) -> RunMode {
    if args.retry_failed {
        RunMode::RetryFailedUploads
    } else if args.retry_failed_extractions {
        RunMode::RetryFailedExtractions
    } else if args.retry_failed_conversions {
        RunMode::RetryFailedConversions
    } else {
        RunMode::Full
    }
}

fn decision_handler(policy: VerificationPolicy, non_interactive: bool) -> Box<dyn DecisionHandler> {
    let interactive = !non_interactive && io::stdin().is_terminal();
    if interactive && policy == VerificationPolicy::Prompt {
        Box::new(PromptHandler::stdin(Duration::from_secs(PROMPT_TIMEOUT_SECS)))
    } else {
        Box::new(PolicyHandler::new(policy, true))
    }
}

fn cmd_run(config: Option<PathBuf>, args: RunArgs) -> Result<()> {
    let mut cfg = load(config)?;
    if args.use_sync {
        cfg.destination.kind = DestinationKind::SyncFolder;
    }
    if let Some(gb) = args.max_disk_space {
        cfg.disk.max_disk_space_gb = Some(gb);
    }
    validate(&cfg).context("Invalid configuration")?;

    let mode = run_mode(&args);
    let handler = decision_handler(cfg.destination.on_verification_failure, args.non_interactive);
    let work_dir = cfg.work_dir.clone();

    let ctx = RunContext::new(cfg, mode);
    let mut orchestrator = Orchestrator::from_config(ctx, handler)?;

    println!("Migrating ({}) with working directory {}", mode.label(), work_dir.display());
    let summary = orchestrator.run()?;
    print_summary(&summary);

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Migration {}:", if summary.stopped { "stopped" } else { "finished" });
    println!("  Completed:  {}", summary.completed);
    println!("  Partial:    {}", summary.partial);
    println!("  Failed:     {}", summary.failed);
    println!("  Deferred:   {}", summary.deferred);
    println!("  Skipped:    {}", summary.skipped);
    println!("  Imports:    {}", summary.imports);
    if summary.restarts > 0 {
        println!("  Restarts:   {}", summary.restarts);
    }

    let problems: Vec<_> = summary
        .outcomes
        .iter()
        .filter(|(_, o)| o.is_failure() || matches!(o, photo_migrator_lib::UnitOutcome::Partial { .. }))
        .collect();
    if !problems.is_empty() {
        println!();
        for (unit, outcome) in problems {
            let detail = serde_json::to_string(outcome).unwrap_or_else(|_| outcome.label().to_string());
            println!("  {}  {}", unit, detail);
        }
    }

    if summary.stopped {
        println!();
        println!("Run photo-migrator again to resume.");
    } else if summary.partial > 0 || summary.failed > 0 {
        println!();
        println!("Use --retry-failed, --retry-failed-conversions or --retry-failed-extractions to retry.");
    }
}

fn cmd_status(config: Option<PathBuf>) -> Result<()> {
    let cfg = load(config)?;
    let paths = WorkPaths::new(&cfg.work_dir);
    if !paths.zip_state_file().exists() {
        println!("No migration state in {}", paths.root.display());
        return Ok(());
    }

    let ledger = StateLedger::open(&paths)?;
    let side = SideRecords::open(&paths);

    println!("Working directory: {}", paths.root.display());
    println!();
    println!("Archives:");
    for (state, count) in ledger.archive_counts() {
        println!("  {:<22} {}", state.as_str(), count);
    }
    println!("Files:");
    for (state, count) in ledger.file_counts() {
        println!("  {:<22} {}", state.as_str(), count);
    }
    println!();
    println!("Failed uploads recorded:  {}", side.failed_upload_count());
    println!("Imported fingerprints:    {}", side.uploaded_count());

    if let Some(cp) = ledger.checkpoint() {
        println!();
        println!(
            "Last checkpoint: {} {} {} at {}",
            cp.step,
            cp.zip_name.as_deref().unwrap_or("-"),
            cp.file_path.as_deref().unwrap_or("-"),
            cp.timestamp.to_rfc3339()
        );
        if let Some(host) = cp.host {
            println!("  on host {}", host);
        }
    }

    let corrupted: Vec<_> = side.corrupted().collect();
    if !corrupted.is_empty() {
        println!();
        println!("Corrupted archives (re-export, then run with --retry-failed-extractions):");
        for (id, entry) in corrupted {
            println!(
                "  {} ({} bytes, id {}, failed {}x): {}",
                entry.file_name, entry.file_size, id, entry.failures, entry.error
            );
        }
    }

    Ok(())
}

fn cmd_stop(config: Option<PathBuf>) -> Result<()> {
    let cfg = load(config)?;
    let marker = write_stop_marker(&WorkPaths::new(&cfg.work_dir))?;
    println!("Stop requested ({}); the run stops after its current archive.", marker.display());
    Ok(())
}

fn cmd_restart(config: Option<PathBuf>) -> Result<()> {
    let cfg = load(config)?;
    let marker = write_restart_marker(&WorkPaths::new(&cfg.work_dir))?;
    println!("Restart requested ({}); the run starts over after its current archive.", marker.display());
    Ok(())
}

fn cmd_reset(config: Option<PathBuf>, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Reset erases all migration progress; pass --yes to confirm");
    }
    let cfg = load(config)?;
    let paths = WorkPaths::new(&cfg.work_dir);
    reset_working_directory(&paths).context("Reset failed")?;
    println!("Reset {}", paths.root.display());
    Ok(())
}
