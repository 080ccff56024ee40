use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use bids2datalad::adapters;
use bids2datalad::config::AppConfig;
use bids2datalad::context::RunContext;
use bids2datalad::core::archive::{ArchiveOptions, archive_directory};
use bids2datalad::core::cleanup::{check_removable, remove_dataset, removal_gateway};
use bids2datalad::core::controller::{ConversionRequest, PipelineController};
use bids2datalad::core::decide::{Decider, FixedDecider, TerminalDecider};
use bids2datalad::core::gzheader;
use bids2datalad::core::transfer_engine::TransferEngineType;
use bids2datalad::logging::{self, LogConfig, LogSink, Status, print_status};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::signal;

/// Exit status after SIGINT or SIGTERM.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "bids2datalad")]
#[command(about = "Integrity-verified conversion of BIDS datasets into DataLad datasets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Config file (default: ./bids2datalad.toml)
    #[serde(skip)]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emulate datalad, git and the validator
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    simulation: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short, global = true)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a BIDS directory into a DataLad dataset
    Convert(ConvertArgs),
    /// Remove a dataset, escalating until it is gone
    Cleanup(CleanupArgs),
    /// Zero gzip header timestamps and drop embedded file names
    CleanGzHeaders(CleanGzArgs),
    /// Tar+gzip a directory next to itself and verify the archive
    Archive(ArchiveArgs),
}

#[derive(Args, Serialize)]
struct ConvertArgs {
    #[serde(skip)]
    source: PathBuf,

    /// Parent directory of the dataset; it is created as <DESTINATION>/<study name>
    #[serde(skip)]
    destination: PathBuf,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    skip_validation: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    dry_run: bool,

    /// Back up a non-empty destination before converting into it
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    backup: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    parallel_hash: bool,

    /// Abort unless the destination is empty
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    force_empty: bool,

    /// Size and mtime change detection instead of checksums during copy
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    fast_track: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    non_interactive: bool,

    /// Reuse an existing dataset at the destination
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    update: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    no_gzheader_check: bool,

    /// Write a JSON integrity report
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    report: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    transfer_engine: Option<TransferEngineType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    retry_attempts: Option<u32>,
}

#[derive(Args)]
struct CleanupArgs {
    path: PathBuf,

    /// Remove even if the path is not a DataLad dataset
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct CleanGzArgs {
    dir: PathBuf,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ArchiveArgs {
    dir: PathBuf,

    /// Delete the directory once the archive is verified
    #[arg(long)]
    delete_source: bool,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(flatten)]
    global: &'a GlobalArgs,
    #[serde(flatten)]
    convert: Option<&'a ConvertArgs>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            print_status(Status::Fail, &format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let overrides = Overrides {
        global: &cli.global,
        convert: match &cli.command {
            Commands::Convert(args) => Some(args),
            _ => None,
        },
    };
    let config = AppConfig::new(cli.global.config.as_deref(), Some(&overrides))
        .context("Failed to load configuration")?;

    let sink = LogSink::buffered();
    logging::init(
        LogConfig {
            json: config.json_logs,
            verbose: config.verbose,
        },
        Some(sink.clone()),
    )
    .context("Failed to initialise logging")?;

    match cli.command {
        Commands::Convert(args) => run_convert(config, sink, args).await,
        Commands::Cleanup(args) => run_cleanup(config, args).await,
        Commands::CleanGzHeaders(args) => run_clean_gz(args).await,
        Commands::Archive(args) => run_archive(config, args).await,
    }
}

async fn run_convert(config: AppConfig, sink: LogSink, args: ConvertArgs) -> Result<ExitCode> {
    let runner = adapters::get_runner(config.simulation);
    let decider: Arc<dyn Decider> = if config.non_interactive || !std::io::stdin().is_terminal() {
        Arc::new(FixedDecider::fail_closed())
    } else {
        Arc::new(TerminalDecider)
    };

    let ctx = RunContext::new(config, runner, decider, sink);
    let controller = PipelineController::new(
        ctx.clone(),
        ConversionRequest {
            source: args.source,
            destination_root: args.destination,
        },
    );

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = controller.run() => match result {
            Ok(summary) => {
                let verdict = if summary.dry_run { "Dry run complete" } else { "Conversion complete" };
                print_status(Status::Ok, &format!("{verdict}: {}", summary.dataset.display()));
                Ok(ExitCode::SUCCESS)
            }
            // Already reported, with the log location, by the controller.
            Err(_) => Ok(ExitCode::FAILURE),
        },
        () = ctrl_c => Ok(interrupted(&ctx, "SIGINT")),
        () = terminate => Ok(interrupted(&ctx, "SIGTERM")),
    }
}

/// The controller future has been dropped: lock and temp dir are gone.
fn interrupted(ctx: &RunContext, signal_name: &str) -> ExitCode {
    tracing::warn!(signal = signal_name, "Run interrupted");
    print_status(Status::Fail, &format!("Received {signal_name}"));
    for line in ctx.breadcrumbs() {
        print_status(Status::Warn, &line);
    }

    if ctx.log.location().is_none() {
        let fallback = ctx.fallback_log_path();
        if let Err(e) = ctx.log.persist_to(&fallback) {
            tracing::warn!(log = %fallback.display(), error = %e, "Could not persist run log");
        }
    }
    if let Some(path) = ctx.log.location() {
        print_status(Status::Info, &format!("Log: {}", path.display()));
    }
    ExitCode::from(EXIT_INTERRUPTED)
}

async fn run_cleanup(config: AppConfig, args: CleanupArgs) -> Result<ExitCode> {
    let path = check_removable(&args.path, args.force)?;
    let gateway = removal_gateway(adapters::get_runner(config.simulation), &config);

    let strategy = remove_dataset(&gateway, &path)
        .await
        .with_context(|| format!("Failed to remove {}", path.display()))?;
    print_status(
        Status::Ok,
        &format!("Removed {} ({strategy:?})", path.display()),
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_clean_gz(args: CleanGzArgs) -> Result<ExitCode> {
    let dir = args.dir.clone();
    let summary = tokio::task::spawn_blocking(move || gzheader::clean_tree(&dir, args.dry_run))
        .await
        .context("Gzip header task panicked")?
        .with_context(|| format!("Failed to scan {}", args.dir.display()))?;

    let verb = if args.dry_run { "would clean" } else { "cleaned" };
    print_status(
        if summary.errors == 0 { Status::Ok } else { Status::Warn },
        &format!(
            "{} checked, {} {verb}, {} error(s)",
            summary.checked, summary.cleaned, summary.errors
        ),
    );
    Ok(if summary.errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_archive(config: AppConfig, args: ArchiveArgs) -> Result<ExitCode> {
    let runner = adapters::get_runner(config.simulation);
    let outcome = archive_directory(
        runner.as_ref(),
        &args.dir,
        ArchiveOptions {
            delete_source: args.delete_source,
            dry_run: args.dry_run,
        },
    )
    .await
    .with_context(|| format!("Failed to archive {}", args.dir.display()))?;

    if args.dry_run {
        print_status(
            Status::Info,
            &format!("Would archive {} files to {}", outcome.files, outcome.archive.display()),
        );
    } else {
        print_status(
            Status::Ok,
            &format!(
                "Archived {} files to {} (digest in {})",
                outcome.files,
                outcome.archive.display(),
                outcome.digest_file.display()
            ),
        );
        if outcome.source_deleted {
            print_status(Status::Info, &format!("Deleted {}", args.dir.display()));
        }
    }
    Ok(ExitCode::SUCCESS)
}
