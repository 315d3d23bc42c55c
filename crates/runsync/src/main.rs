//! runsync CLI: replay, inspect and maintain local run logs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use runsync_core::artifact_cache::ArtifactCache;
use runsync_core::config::{LogFormat, Settings};
use runsync_core::error::format_error_with_remediation;
use runsync_core::logging::init_logging;
use runsync_core::replay::{self, LogInspection, SyncMode, SyncOptions, SyncSummary};
use runsync_core::run::RunTarget;
use runsync_core::transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "runsync", version, about = "Durable run logs and file-stream sync")]
struct Cli {
    /// Settings file (TOML). RUNSYNC_* variables override it.
    #[arg(long, global = true, env = "RUNSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Diagnostic log format
    #[arg(long, global = true, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a local run log that has not been (fully) uploaded
    Sync(SyncArgs),

    /// Report entries, corruption and upload progress of a run log
    Inspect {
        log_dir: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Evict least-recently-used artifact cache entries
    CacheCleanup {
        /// Keep at most this many bytes (defaults to cache.budget_bytes)
        #[arg(long)]
        target_bytes: Option<u64>,

        /// Cache root (defaults to the configured cache dir)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct SyncArgs {
    log_dir: PathBuf,

    /// Continue line numbering after what the backend already has
    #[arg(long)]
    append: bool,

    #[arg(long)]
    entity: Option<String>,

    #[arg(long)]
    project: Option<String>,

    /// Upload into this run instead of the one recorded in the log
    #[arg(long)]
    run_id: Option<String>,

    /// Backend URL (overrides backend.base_url)
    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    json: bool,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<runsync_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        settings.log.level = level;
    }
    if let Some(format) = cli.log_format {
        settings.log.format = format;
    }
    init_logging(&settings.log).map_err(runsync_core::Error::from)?;
    tracing::debug!(
        version = runsync_core::VERSION,
        config = ?cli.config,
        offline = settings.backend.is_offline(),
        "runsync starting"
    );

    match cli.command {
        Commands::Sync(args) => run_sync(&mut settings, args),
        Commands::Inspect { log_dir, json } => run_inspect(&log_dir, json),
        Commands::CacheCleanup {
            target_bytes,
            cache_dir,
            json,
        } => run_cache_cleanup(&settings, target_bytes, cache_dir, json),
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load(path),
        None => Settings::from_env(),
    };
    Ok(settings.map_err(runsync_core::Error::from)?)
}

fn run_sync(settings: &mut Settings, args: SyncArgs) -> anyhow::Result<ExitCode> {
    if let Some(url) = args.base_url {
        settings.backend.base_url = Some(url);
    }
    let target = resolve_target(settings, &args.log_dir, args.entity, args.project, args.run_id)?;
    let transport = HttpTransport::new(&settings.backend).map_err(runsync_core::Error::from)?;
    let options = SyncOptions {
        mode: if args.append {
            SyncMode::Append
        } else {
            SyncMode::Overwrite
        },
        target,
        upload: settings.upload_config(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let summary = runtime
        .block_on(replay::sync(&args.log_dir, transport, options))
        .map_err(runsync_core::Error::from)?;

    if args.json {
        print_json(&summary)?;
    } else {
        print_sync_summary(&summary, &args.log_dir);
    }
    Ok(if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// A target given on the command line, completed from settings and the log.
fn resolve_target(
    settings: &Settings,
    log_dir: &Path,
    entity: Option<String>,
    project: Option<String>,
    run_id: Option<String>,
) -> anyhow::Result<Option<RunTarget>> {
    if entity.is_none() && project.is_none() && run_id.is_none() {
        return Ok(None);
    }
    let recorded = replay::inspect(log_dir)
        .map_err(runsync_core::Error::from)?
        .target;
    let pick = |flag: Option<String>, configured: Option<&String>, stored: Option<&String>| {
        flag.or_else(|| configured.cloned()).or_else(|| stored.cloned())
    };
    let entity = pick(
        entity,
        settings.backend.entity.as_ref(),
        recorded.as_ref().map(|t| &t.entity),
    )
    .context("--entity is required: the log records no entity")?;
    let project = pick(
        project,
        settings.backend.project.as_ref(),
        recorded.as_ref().map(|t| &t.project),
    )
    .context("--project is required: the log records no project")?;
    let run_id = pick(run_id, None, recorded.as_ref().map(|t| &t.run_id))
        .context("--run-id is required: the log records no run id")?;
    Ok(Some(RunTarget::new(entity, project, run_id)))
}

fn print_sync_summary(summary: &SyncSummary, log_dir: &Path) {
    if summary.already_synced {
        println!("{}: already synced to {}", log_dir.display(), summary.target);
        return;
    }
    println!("synced {} to {}", log_dir.display(), summary.target);
    println!(
        "  entries: {}  bytes: {}  requests: {}  retries: {}",
        summary.entries_replayed,
        summary.new_bytes,
        summary.upload.requests,
        summary.upload.retries
    );
    if summary.chunks_dropped > 0 {
        println!("  dropped chunks: {}", summary.chunks_dropped);
    }
    if !summary.log_complete {
        println!("  run still in progress; sync again once it finishes");
    }
}

fn run_inspect(log_dir: &Path, json: bool) -> anyhow::Result<ExitCode> {
    let report = replay::inspect(log_dir).map_err(runsync_core::Error::from)?;
    if json {
        print_json(&report)?;
    } else {
        print_inspection(&report);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_inspection(report: &LogInspection) {
    println!("log: {}", report.path.display());
    if let Some(target) = &report.target {
        println!("run: {target}");
    }
    println!(
        "size: {} bytes ({} trailing)",
        report.size_bytes,
        report.trailing_bytes()
    );
    println!("entries: {}", report.entries);
    for (kind, count) in &report.kinds {
        println!("  {kind}: {count}");
    }
    if report.corrupt_entries > 0 || report.undecodable_entries > 0 {
        println!(
            "corrupt: {} spans ({} bytes), undecodable: {}",
            report.corrupt_entries, report.corrupt_bytes, report.undecodable_entries
        );
    }
    match report.exit_code {
        Some(code) => println!("complete: yes (exit code {code})"),
        None => println!("complete: no"),
    }
    for (consumer, checkpoint) in &report.checkpoints {
        println!(
            "checkpoint {consumer}: offset {} dropped {}{}",
            checkpoint.log_offset,
            checkpoint.dropped_chunks,
            if checkpoint.complete { " complete" } else { "" }
        );
    }
}

fn run_cache_cleanup(
    settings: &Settings,
    target_bytes: Option<u64>,
    cache_dir: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let target_bytes = target_bytes.or(settings.cache.budget_bytes).context(
        "no cleanup target: pass --target-bytes or set cache.budget_bytes (RUNSYNC_CACHE_BUDGET_BYTES)",
    )?;
    let mut config = settings.cache_config();
    if let Some(dir) = cache_dir {
        config.root = dir;
    }
    let root = config.root.clone();
    let report = ArtifactCache::new(config)
        .cleanup(target_bytes)
        .map_err(runsync_core::Error::from)?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "{}: reclaimed {} bytes from {} entries, {} bytes remain",
            root.display(),
            report.bytes_reclaimed,
            report.entries_removed,
            report.remaining_bytes
        );
        if report.errors > 0 {
            println!("  {} entries could not be removed", report.errors);
        }
    }
    Ok(if report.errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
