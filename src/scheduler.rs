use crate::models::BatchFile;
use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{error, info};

/// A batch whose worker returned an error.
#[derive(Debug)]
pub struct BatchFailure {
    pub batch: u32,
    pub error: anyhow::Error,
}

#[derive(Debug, Default)]
pub struct ScheduleReport {
    /// Batch indices in dispatch order
    pub completed: Vec<u32>,
    /// Batches not dispatched because they were already done
    pub skipped: Vec<u32>,
    pub failures: Vec<BatchFailure>,
}

impl ScheduleReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_batches(&self) -> Vec<u32> {
        let mut batches: Vec<u32> = self.failures.iter().map(|f| f.batch).collect();
        batches.sort_unstable();
        batches
    }
}

/// `max(1, cpus - 1)`, leaving one core for the coordinating thread.
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Runs `job` once per batch on a pool of `workers` threads.
///
/// Each dispatch is independent: a failing or panicking batch is recorded
/// with its index and never cancels its siblings. Returns once every batch
/// has finished.
pub fn run_batches<F>(batches: &[BatchFile], workers: usize, job: F) -> Result<ScheduleReport>
where
    F: Fn(&BatchFile) -> Result<()> + Sync,
{
    let mut report = ScheduleReport::default();
    if batches.is_empty() {
        return Ok(report);
    }

    let workers = workers.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("copurchase-parse-{i}"))
        .build()
        .context("Failed to build worker pool")?;

    info!(batches = batches.len(), workers, "Dispatching batches");
    let pb = make_progress_bar(batches.len() as u64);
    let results: Vec<(u32, Result<()>)> = pool.install(|| {
        batches
            .par_iter()
            .with_max_len(1)
            .map(|batch| {
                let result = run_isolated(&job, batch);
                pb.inc(1);
                (batch.index, result)
            })
            .collect()
    });

    for (index, result) in results {
        match result {
            Ok(()) => report.completed.push(index),
            Err(e) => {
                error!(batch = index, error = %format!("{:#}", e), "Batch failed");
                report.failures.push(BatchFailure {
                    batch: index,
                    error: e,
                });
            }
        }
    }

    pb.finish_with_message(format!(
        "{} parsed, {} failed",
        report.completed.len(),
        report.failures.len()
    ));
    Ok(report)
}

/// Turns a panic inside `job` into an error for that batch alone.
fn run_isolated<F>(job: &F, batch: &BatchFile) -> Result<()>
where
    F: Fn(&BatchFile) -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| job(batch))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow!("Batch {} worker panicked: {}", batch.index, message))
        }
    }
}

fn make_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("    {spinner:.cyan} Batches        [{bar:30.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}
