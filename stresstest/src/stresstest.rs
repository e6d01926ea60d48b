//! Run workloads against a backend for a range of batch sizes and print metrics.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bulkwriter_service::{
    Backend, BulkWriter, CommitError, CommitResult, RunReport, ThroughputReporter, WriteIntent,
    WriterConfig,
};
use futures::StreamExt;
use sketches_ddsketch::DDSketch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use yansi::Paint;

use crate::workload::{Strategy, Workload};

/// Settings shared by all workloads of a run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Loops per workload and batch size, unless the workload is timed.
    pub loops: usize,
    /// The batch sizes to compare.
    pub batch_sizes: Vec<usize>,
    /// Settings of the bulk writer. The batch size is overridden per run.
    pub writer: WriterConfig,
}

/// The outcome of running one workload with one batch size.
pub struct BatchReport {
    /// Name of the workload.
    pub workload: String,
    /// How the writes were submitted.
    pub strategy: Strategy,
    /// Throughput and errors of the run.
    pub report: RunReport,
    /// Latency of every commit call, in seconds.
    pub commit_latency: DDSketch,
}

impl fmt::Debug for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchReport")
            .field("workload", &self.workload)
            .field("strategy", &self.strategy)
            .field("report", &self.report)
            .field("commits", &self.commit_latency.count())
            .finish()
    }
}

/// Runs every workload once per configured batch size and prints a report for each run.
///
/// Workloads run one after another so their numbers do not influence each other. When `shutdown`
/// is cancelled, the active bulk writer is shut down and no further runs are started. The reports
/// of all completed runs are returned.
pub async fn run(
    backend: Arc<dyn Backend>,
    workloads: Vec<Workload>,
    options: RunOptions,
    shutdown: CancellationToken,
) -> Result<Vec<BatchReport>> {
    let mut reports = Vec::new();

    for mut workload in workloads {
        if shutdown.is_cancelled() {
            break;
        }

        println!();
        println!(
            "{} {} (strategy: {}, shape: {}, concurrency: {})",
            "## Workload".bold(),
            workload.name.bold().blue(),
            workload.strategy,
            workload.shape,
            workload.concurrency.bold()
        );

        for &batch_size in &options.batch_sizes {
            if shutdown.is_cancelled() {
                break;
            }

            tracing::info!(
                workload = workload.name(),
                batch_size,
                backend = backend.name(),
                "starting run"
            );

            let timed = Timed::new(backend.clone());
            let latency = timed.latency.clone();
            let report = match workload.strategy {
                Strategy::BulkWriter => {
                    run_bulk_writer(timed, &mut workload, batch_size, &options, &shutdown).await?
                }
                Strategy::BatchedCommits => {
                    run_batched_commits(timed, &mut workload, batch_size, &options, &shutdown)
                        .await?
                }
            };

            let commit_latency = latency.lock().unwrap().clone();
            let report = BatchReport {
                workload: workload.name.clone(),
                strategy: workload.strategy,
                report,
                commit_latency,
            };
            print_report(&report);
            reports.push(report);
        }
    }

    print_summary(&reports);
    Ok(reports)
}

/// Returns `true` if another round should run.
fn keep_going(round: usize, loops: usize, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => Instant::now() < deadline,
        None => round < loops,
    }
}

async fn run_bulk_writer(
    backend: Timed,
    workload: &mut Workload,
    batch_size: usize,
    options: &RunOptions,
    shutdown: &CancellationToken,
) -> Result<RunReport> {
    let config = WriterConfig {
        max_batch_size: batch_size,
        ..options.writer.clone()
    };
    let writer = BulkWriter::new(backend, config).context("failed to create bulk writer")?;

    if let Some(mut failures) = writer.failures() {
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                tracing::debug!(
                    key = %failure.intent.write().key,
                    reason = ?failure.reason,
                    attempts = failure.attempts,
                    error = &failure.error as &dyn std::error::Error,
                    "write failed"
                );
            }
        });
    }

    let deadline = workload.duration.map(|duration| Instant::now() + duration);
    let mut round = 0;
    while keep_going(round, options.loops, deadline) {
        for write in workload.next_round() {
            writer.enqueue(write)?;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(workload = workload.name(), "interrupted, shutting down");
                break;
            }
            result = writer.flush() => {
                result.context("bulk writer aborted")?;
            }
        }
        round += 1;
    }

    let summary = writer.shutdown().await;
    tracing::debug!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        "bulk writer finished"
    );
    Ok(writer.report())
}

async fn run_batched_commits(
    backend: Timed,
    workload: &mut Workload,
    batch_size: usize,
    options: &RunOptions,
    shutdown: &CancellationToken,
) -> Result<RunReport> {
    let reporter = ThroughputReporter::new(options.writer.report_window);
    let mut errors = 0;
    let mut next_id = 0;

    let deadline = workload.duration.map(|duration| Instant::now() + duration);
    let mut round = 0;
    while keep_going(round, options.loops, deadline) {
        let intents: Vec<_> = workload
            .next_round()
            .into_iter()
            .map(|write| {
                next_id += 1;
                WriteIntent::new(next_id, write)
            })
            .collect();

        let backend = &backend;
        let commits = futures::stream::iter(intents.chunks(batch_size))
            .map(|chunk| async move { (chunk.len(), backend.commit(chunk).await) })
            .buffer_unordered(workload.concurrency)
            .collect::<Vec<_>>();

        let outcomes = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            outcomes = commits => outcomes,
        };

        for (len, outcome) in outcomes {
            let succeeded = tally(len, outcome)?;
            reporter.record(succeeded);
            errors += len as u64 - succeeded;
        }
        round += 1;
    }

    Ok(RunReport {
        batch_size,
        total_operations: reporter.total(),
        elapsed: reporter.elapsed(),
        average_qps: reporter.average_qps(),
        error_count: errors,
        failed: errors,
    })
}

/// Counts the successful operations of a commit of `len` writes.
fn tally(len: usize, outcome: CommitResult) -> Result<u64> {
    match outcome {
        Ok(results) if results.len() == len => {
            Ok(results.iter().filter(|result| result.is_ok()).count() as u64)
        }
        Ok(results) => {
            tracing::warn!(
                expected = len,
                received = results.len(),
                "backend returned the wrong number of results"
            );
            Ok(0)
        }
        Err(CommitError::Rejected(error)) => {
            tracing::debug!(error = &error as &dyn std::error::Error, "batch rejected");
            Ok(0)
        }
        Err(error) => Err(error).context("backend unreachable"),
    }
}

/// A backend wrapper that records the latency of every commit.
struct Timed {
    inner: Arc<dyn Backend>,
    latency: Arc<Mutex<DDSketch>>,
}

impl Timed {
    fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            latency: Arc::new(Mutex::new(DDSketch::default())),
        }
    }
}

impl fmt::Debug for Timed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timed")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Backend for Timed {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn commit(&self, intents: &[WriteIntent]) -> CommitResult {
        let start = Instant::now();
        let result = self.inner.commit(intents).await;
        self.latency
            .lock()
            .unwrap()
            .add(start.elapsed().as_secs_f64());
        result
    }
}

fn print_report(report: &BatchReport) {
    let run = &report.report;

    print!(
        "{} ({} ops",
        format!("BATCH SIZE {}:", run.batch_size).bold().green(),
        run.total_operations.bold()
    );
    if run.error_count > 0 {
        print!(", {}", format!("{} ERRORS", run.error_count).bold().red());
    }
    if run.failed > 0 {
        print!(", {}", format!("{} FAILED", run.failed).bold().red());
    }
    println!(")");

    println!(
        "  {:.2} operations/s; elapsed: {:.2?}",
        run.average_qps.bold(),
        run.elapsed
    );
    if report.commit_latency.count() > 0 {
        print!("  {} commits;", report.commit_latency.count());
        print_percentiles(&report.commit_latency, Duration::from_secs_f64);
    }
}

fn print_percentiles<T: fmt::Debug>(sketch: &DDSketch, map: impl Fn(f64) -> T) {
    let quantile = |q| sketch.quantile(q).ok().flatten().unwrap_or_default();
    let avg = map(sketch.sum().unwrap_or_default() / sketch.count() as f64);
    let p50 = map(quantile(0.5));
    let p90 = map(quantile(0.9));
    let p99 = map(quantile(0.99));
    println!(
        " avg: {:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}",
        avg.bold()
    );
}

fn print_summary(reports: &[BatchReport]) {
    if reports.is_empty() {
        return;
    }

    println!();
    println!("{}", "## SUMMARY".bold());

    let mut workloads: Vec<&str> = reports.iter().map(|r| r.workload.as_str()).collect();
    workloads.dedup();
    for name in workloads {
        let best = reports
            .iter()
            .filter(|r| r.workload == name)
            .max_by(|a, b| a.report.average_qps.total_cmp(&b.report.average_qps));
        if let Some(best) = best {
            println!(
                "{}: best batch size {} ({:.2} operations/s)",
                name.bold().blue(),
                best.report.batch_size.bold(),
                best.report.average_qps
            );
        }
    }
}
