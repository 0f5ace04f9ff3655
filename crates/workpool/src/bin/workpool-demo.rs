// Workpool demo
//
// Design Decision: Simulated file-processing jobs, so the demo runs anywhere.
// Design Decision: Flags fall back to the same WORKPOOL_* variables as PoolConfig::from_env.
// Design Decision: Ctrl-C while producing forces shutdown; Ctrl-C while draining escalates.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workpool::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "workpool-demo")]
#[command(about = "Process simulated files on a bounded worker pool")]
#[command(version)]
struct Args {
    /// Number of workers
    #[arg(long, short, env = "WORKPOOL_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Jobs that may wait before submit blocks
    #[arg(long, env = "WORKPOOL_QUEUE_CAPACITY", default_value_t = 8)]
    queue_capacity: usize,

    /// Number of files to process
    #[arg(long, short, default_value_t = 20)]
    jobs: u64,

    /// Base processing time per file in milliseconds
    #[arg(long, default_value_t = 100)]
    job_millis: u64,

    /// Per-file timeout in milliseconds
    #[arg(long, default_value_t = 1_000)]
    timeout_ms: u64,

    /// Every Nth file is malformed and fails (0 disables)
    #[arg(long, default_value_t = 7)]
    fail_every: u64,

    /// Forced-shutdown grace period in milliseconds
    #[arg(long, env = "WORKPOOL_SHUTDOWN_GRACE_MS", default_value_t = 2_000)]
    grace_ms: u64,
}

/// What processing one file produced
#[derive(Debug)]
struct FileReport {
    file: String,
    rows: u64,
}

fn file_job(index: u64, args: &Args) -> Job<FileReport> {
    let file = format!("data_{index}.csv");
    let work = Duration::from_millis(args.job_millis * (1 + index % 3));
    let malformed = args.fail_every > 0 && (index + 1) % args.fail_every == 0;

    Job::new(file.clone(), move |scope| async move {
        scope.run(tokio::time::sleep(work)).await?;
        if malformed {
            return Err(JobError::permanent(anyhow::anyhow!(
                "malformed header in {file}"
            )));
        }
        Ok(FileReport {
            rows: 100 * (index + 1),
            file,
        })
    })
    .with_timeout(Duration::from_millis(args.timeout_ms))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workpool=debug,workpool_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let metrics = Arc::new(PoolMetrics::new());
    let config = PoolConfig::new(args.workers, args.queue_capacity)
        .with_name("workpool-demo")
        .with_shutdown_grace(Duration::from_millis(args.grace_ms))
        .with_observer(metrics.clone());

    let pool: Pool<FileReport> = Pool::with_config(config).context("Invalid pool configuration")?;
    let mut results = pool.results().context("Result stream already taken")?;
    pool.start().context("Failed to start worker pool")?;

    let collector = tokio::spawn(async move {
        let mut summary = ResultSummary::default();
        while let Some(result) = results.recv().await {
            match result.outcome() {
                Ok(report) => tracing::info!(
                    file = %report.file,
                    rows = report.rows,
                    worker = ?result.worker(),
                    duration_ms = result.duration().as_millis() as u64,
                    "File processed"
                ),
                Err(error) => tracing::warn!(
                    job_id = %result.job_id(),
                    retryable = error.is_retryable(),
                    error = %error,
                    "File not processed"
                ),
            }
            summary.record(&result);
        }
        summary
    });

    tracing::info!(jobs = args.jobs, workers = args.workers, "Submitting files");
    let produce = async {
        for index in 0..args.jobs {
            pool.submit(file_job(index, &args)).await?;
        }
        Ok::<_, PoolError>(())
    };

    let interrupted = tokio::select! {
        produced = produce => {
            produced.context("Submitting files failed")?;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal while submitting");
            true
        }
    };

    let shutdown_scope = CancellationScope::new();
    let report = if interrupted {
        pool.shutdown(&shutdown_scope, false).await?
    } else {
        let escalate = shutdown_scope.clone();
        let signal = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal while draining");
                escalate.cancel();
            }
        });
        let report = pool.shutdown(&shutdown_scope, true).await?;
        signal.abort();
        report
    };

    let summary = collector.await.context("Result collector failed")?;
    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled + summary.deadline_exceeded,
        panicked = summary.panicked,
        mean_ms = summary.mean_duration().as_millis() as u64,
        max_ms = summary.max_duration.as_millis() as u64,
        "Summary"
    );
    tracing::info!(
        escalated = report.escalated,
        cancelled_queued = report.cancelled_queued,
        abandoned = ?report.abandoned,
        dropped_results = report.dropped_results,
        metrics = ?metrics.snapshot(),
        "Worker pool shutdown complete"
    );
    Ok(())
}
