use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use digest_pipeline::{
    CompileOutcome, JsonFileScanner, OutputFormat, PeriodId, PipelineStore, Scheduler,
    SchedulerConfig, SourceType,
};

#[derive(Parser)]
#[command(
    name = "digest-pipeline",
    about = "Compiles periodically-scanned content into per-period digests"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scan cycle, reading a scanner payload from a JSON file.
    Scan {
        /// Source type: paper, blog_post or project.
        #[arg(long)]
        source: String,
        /// Path to the JSON scan payload.
        #[arg(long)]
        input: PathBuf,
    },
    /// Compile the digest for one period from accumulated scan batches.
    Compile {
        /// Period to compile, as YYYY-MM.
        period: String,
        /// Recompile even if the period already succeeded.
        #[arg(long)]
        force: bool,
        /// Where rendered artifacts are written.
        #[arg(long, default_value = "data/generated")]
        output_dir: PathBuf,
    },
    /// Drive recurring scan and compile cycles until interrupted.
    Run,
    /// Show compile-run records and scan-store statistics.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let database_url = env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://data/digest-pipeline.db".to_string());
    if let Some(parent) = database_url
        .strip_prefix("sqlite://")
        .map(PathBuf::from)
        .and_then(|p| p.parent().map(PathBuf::from))
    {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(&parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let store = Arc::new(PipelineStore::connect(&database_url).await?);
    let mut scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());

    match cli.command {
        Command::Scan { source, input } => {
            let source_type: SourceType = source.parse()?;
            scheduler.register_scanner(Box::new(JsonFileScanner::new(source_type, input)));

            let report = scheduler.trigger_scan(source_type).await?;
            info!(
                source_type = %report.source_type,
                records = report.records,
                record_errors = report.record_errors.len(),
                "scan cycle finished"
            );
            for record_error in &report.record_errors {
                error!("record error: {record_error}");
            }
        }

        Command::Compile {
            period,
            force,
            output_dir,
        } => {
            let period_id: PeriodId = period.parse()?;
            match scheduler.trigger_compile(&period_id, force).await? {
                CompileOutcome::Compiled(success) => {
                    info!(
                        period_id = %period_id,
                        items = success.digest.item_count(),
                        dropped = success.dropped_records,
                        merged = success.duplicates_merged,
                        "compiled digest"
                    );
                    std::fs::create_dir_all(&output_dir)
                        .with_context(|| format!("creating {}", output_dir.display()))?;
                    for (format, artifact) in &success.artifacts {
                        let path = output_dir
                            .join(format!("{period_id}.{}", extension(*format)));
                        std::fs::write(&path, artifact)
                            .with_context(|| format!("writing {}", path.display()))?;
                        info!(%format, path = %path.display(), "wrote artifact");
                    }
                    for failure in &success.render_failures {
                        error!(format = %failure.format, "render failed: {}", failure.message);
                    }
                }
                CompileOutcome::AlreadySucceeded { digest, .. } => {
                    info!(
                        period_id = %period_id,
                        generated_at = %digest.generated_at,
                        "period already compiled; pass --force to recompile"
                    );
                }
                CompileOutcome::AlreadyRunning(record) => {
                    info!(period_id = %record.period_id, "a compile for this period is already running");
                }
                CompileOutcome::Failed(record) => {
                    error!(
                        period_id = %record.period_id,
                        attempts = record.attempt_count,
                        next_retry_at = ?record.next_retry_at,
                        "compile failed: {}",
                        record.last_error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }

        Command::Run => {
            info!("starting scheduler; press Ctrl-C to stop");
            tokio::select! {
                result = scheduler.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    scheduler.stop().await;
                    info!("shutting down");
                }
            }
        }

        Command::Status => {
            let runs = store.list_runs().await?;
            if runs.is_empty() {
                println!("no compile runs recorded");
            }
            for run in runs {
                println!(
                    "{}  {:<9}  attempts={}  next_retry={}  error={}",
                    run.period_id,
                    run.status.to_string(),
                    run.attempt_count,
                    run.next_retry_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    run.last_error.as_deref().unwrap_or("-"),
                );
            }

            let stats = store.batch_stats().await?;
            for (source_type, batches) in stats {
                println!("{source_type}: {batches} batch(es) in scan store");
            }
        }
    }

    Ok(())
}

fn extension(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Html => "html",
        OutputFormat::Text => "txt",
        OutputFormat::Markdown => "md",
    }
}
