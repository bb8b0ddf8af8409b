use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_THRESHOLD, LEDGER_FILE};
use crate::export::ExportDir;
use crate::ledger::Ledger;
use crate::merge::{collate_run, CollateReport};
use crate::models::BatchFile;
use crate::parser::load_split;
use crate::perf::PerfMon;
use crate::scheduler::{default_workers, run_batches, ScheduleReport};
use crate::split::{list_batches, split_file};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::store::RunStore;
use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDateTime};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Directory layout under the work directory.
#[derive(Debug, Clone)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn splits_dir(&self) -> PathBuf {
        self.root.join("splits")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id).join("artifacts")
    }

    pub fn export_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("exports").join(run_id)
    }

    pub fn perf_dir(&self) -> PathBuf {
        self.root.join("perf")
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.root.join(LEDGER_FILE))
    }

    pub fn store(&self, run_id: &str) -> RunStore {
        RunStore::new(self.artifacts_dir(run_id), run_id)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub batch_size: usize,
    pub flush_threshold: usize,
    pub workers: usize,
    /// Explicit run id; otherwise a new one, or the pending run when resuming
    pub run_id: Option<String>,
    pub resume: bool,
    pub write_summary: bool,
}

impl PipelineConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            input: None,
            work_dir: work_dir.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            workers: default_workers(),
            run_id: None,
            resume: false,
            write_summary: true,
        }
    }

    pub fn layout(&self) -> WorkLayout {
        WorkLayout::new(&self.work_dir)
    }
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub batches: usize,
    pub schedule: ScheduleReport,
    pub collate: CollateReport,
    pub stats: StatsSnapshot,
}

/// Local timestamp, sortable as text.
pub fn new_run_id() -> String {
    Local::now().format(RUN_ID_FORMAT).to_string()
}

pub fn is_run_id(s: &str) -> bool {
    NaiveDateTime::parse_from_str(s, RUN_ID_FORMAT).is_ok()
}

/// Newest run directory that the ledger has not recorded as complete.
pub fn pending_run(layout: &WorkLayout) -> Result<Option<String>> {
    let runs_dir = layout.runs_dir();
    if !runs_dir.exists() {
        return Ok(None);
    }

    let mut runs = Vec::new();
    for entry in
        fs::read_dir(&runs_dir).with_context(|| format!("Failed to read directory: {:?}", runs_dir))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_run_id(name) {
                runs.push(name.to_string());
            }
        }
    }

    let Some(newest) = runs.into_iter().max() else {
        return Ok(None);
    };
    match layout.ledger().latest()? {
        Some(latest) if latest >= newest => Ok(None),
        _ => Ok(Some(newest)),
    }
}

/// Picks the run id for a parse or full run.
pub fn resolve_run_id(config: &PipelineConfig) -> Result<String> {
    if let Some(run_id) = &config.run_id {
        if !is_run_id(run_id) {
            bail!("Invalid run id {:?}, expected YYYYMMDD_HHMMSS", run_id);
        }
        return Ok(run_id.clone());
    }
    if config.resume {
        if let Some(run_id) = pending_run(&config.layout())? {
            info!(run = %run_id, "Resuming pending run");
            return Ok(run_id);
        }
        info!("No pending run to resume, starting a new one");
    }
    Ok(new_run_id())
}

fn write_perf(perf: &PerfMon, layout: &WorkLayout) {
    if let Err(e) = perf.write_logs(&layout.perf_dir()) {
        warn!(error = %e, "Failed to write perf logs");
    }
}

/// Splits the input into batch files, or reuses existing ones when resuming.
pub fn split_stage(config: &PipelineConfig, stats: &PipelineStats) -> Result<Vec<BatchFile>> {
    let layout = config.layout();
    let splits_dir = layout.splits_dir();

    if config.resume {
        let existing = list_batches(&splits_dir)?;
        if !existing.is_empty() {
            info!(batches = existing.len(), "Reusing existing batch files");
            return Ok(existing);
        }
    }

    let Some(input) = &config.input else {
        bail!("No input file given and no batch files in {:?}", splits_dir);
    };

    let mut perf = PerfMon::new("split");
    perf.event("start");
    let summary = split_file(input, &splits_dir, config.batch_size, stats)?;
    perf.add("records", summary.records);
    perf.add("dropped", summary.dropped);
    perf.add("batches", summary.batches.len() as u64);
    perf.event("end");
    write_perf(&perf, &layout);

    Ok(summary.batches)
}

/// Parses every batch into the run's intermediate store.
///
/// When resuming, batches that already have a manifest for the run are
/// skipped. Otherwise any artifacts left under the run are discarded first.
pub fn parse_stage(
    config: &PipelineConfig,
    run_id: &str,
    batches: &[BatchFile],
    stats: &PipelineStats,
) -> Result<ScheduleReport> {
    let layout = config.layout();
    let store = layout.store(run_id);

    if !config.resume && store.dir().exists() {
        info!(run = run_id, "Discarding artifacts of earlier attempt");
        fs::remove_dir_all(store.dir())
            .with_context(|| format!("Failed to clear directory: {:?}", store.dir()))?;
    }
    store.ensure_dir()?;

    let mut skipped = Vec::new();
    let mut pending = Vec::with_capacity(batches.len());
    for batch in batches {
        if config.resume && store.load_manifest(batch.index)?.is_some() {
            skipped.push(batch.index);
        } else {
            pending.push(batch.clone());
        }
    }
    if !skipped.is_empty() {
        info!(skipped = skipped.len(), "Skipping batches already parsed");
    }

    let mut perf = PerfMon::new("parse");
    perf.event("start");
    let mut report = run_batches(&pending, config.workers, |batch| {
        load_split(batch, &store, config.flush_threshold, stats)
            .map(|_| ())
            .with_context(|| format!("Batch {} failed", batch.index))
    })?;
    report.skipped = skipped;

    perf.add("batches", report.completed.len() as u64);
    perf.add("skipped", report.skipped.len() as u64);
    for _ in &report.failures {
        stats.inc_batches_failed();
        perf.count("failed");
    }
    perf.event("end");
    if perf.counter("failed") > 0 {
        warn!(
            run = run_id,
            failed = perf.counter("failed"),
            "Parse stage finished with failed batches"
        );
    }
    write_perf(&perf, &layout);

    Ok(report)
}

/// Collates a parsed run into `exports/<run>`. Without `resume` any earlier
/// export of the run is discarded first.
pub fn collate_stage(
    config: &PipelineConfig,
    run_id: &str,
    stats: &PipelineStats,
) -> Result<CollateReport> {
    let layout = config.layout();
    let export_path = layout.export_dir(run_id);

    if !config.resume && export_path.exists() {
        info!(run = run_id, "Discarding earlier export");
        fs::remove_dir_all(&export_path)
            .with_context(|| format!("Failed to clear directory: {:?}", export_path))?;
    }
    let export = ExportDir::create(&export_path)?;

    let mut perf = PerfMon::new("collate");
    perf.event("start");
    let report = collate_run(
        &layout.store(run_id),
        &export,
        &layout.ledger(),
        config.write_summary,
        stats,
    )?;
    for dataset in &report.datasets {
        if dataset.skipped {
            perf.count("datasets_skipped");
        } else {
            perf.add(dataset.dataset.name(), dataset.nodes + dataset.edges);
        }
    }
    perf.event("end");
    if perf.counter("datasets_skipped") > 0 {
        info!(
            run = run_id,
            skipped = perf.counter("datasets_skipped"),
            "Kept datasets exported by an earlier attempt"
        );
    }
    write_perf(&perf, &layout);

    Ok(report)
}

/// Split, parse and collate one run end to end.
///
/// Collation only starts once every batch has parsed; a failed batch stops the
/// run with the failing indices so it can be resumed.
pub fn run_pipeline(config: &PipelineConfig) -> Result<PipelineOutcome> {
    let stats = PipelineStats::new();
    let run_id = resolve_run_id(config)?;
    info!(run = %run_id, work_dir = ?config.work_dir, "Starting run");

    let start = Instant::now();
    let batches = split_stage(config, &stats)?;
    info!(
        batches = batches.len(),
        duration_secs = start.elapsed().as_secs_f64(),
        "Split stage complete"
    );

    let start = Instant::now();
    let schedule = parse_stage(config, &run_id, &batches, &stats)?;
    if !schedule.is_complete() {
        bail!(
            "{} of {} batches failed: {:?}; rerun with --resume --run {}",
            schedule.failures.len(),
            batches.len(),
            schedule.failed_batches(),
            run_id
        );
    }
    info!(
        duration_secs = start.elapsed().as_secs_f64(),
        "Parse stage complete"
    );

    let start = Instant::now();
    let collate = collate_stage(config, &run_id, &stats)?;
    info!(
        duration_secs = start.elapsed().as_secs_f64(),
        "Collate stage complete"
    );

    Ok(PipelineOutcome {
        run_id,
        batches: batches.len(),
        schedule,
        collate,
        stats: stats.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ARTIFACT_VERSION;
    use crate::models::{Dataset, Product};
    use crate::store::BatchManifest;
    use tempfile::TempDir;

    #[test]
    fn layout_paths() {
        let layout = WorkLayout::new("/work");
        assert_eq!(layout.splits_dir(), PathBuf::from("/work/splits"));
        assert_eq!(
            layout.artifacts_dir("20240101_000000"),
            PathBuf::from("/work/runs/20240101_000000/artifacts")
        );
        assert_eq!(
            layout.export_dir("20240101_000000"),
            PathBuf::from("/work/exports/20240101_000000")
        );
        assert_eq!(layout.ledger().path(), Path::new("/work/ledger.log"));
    }

    #[test]
    fn run_ids_are_timestamps() {
        let id = new_run_id();
        assert_eq!(id.len(), 15);
        assert!(is_run_id(&id));
        assert!(!is_run_id("latest"));
        assert!(!is_run_id("20241301_000000"));
    }

    #[test]
    fn pending_run_ignores_recorded_runs() {
        let dir = TempDir::new().unwrap();
        let layout = WorkLayout::new(dir.path());
        assert_eq!(pending_run(&layout).unwrap(), None);

        fs::create_dir_all(layout.artifacts_dir("20240101_000000")).unwrap();
        fs::create_dir_all(layout.artifacts_dir("20240102_000000")).unwrap();
        fs::create_dir_all(layout.runs_dir().join("scratch")).unwrap();
        assert_eq!(
            pending_run(&layout).unwrap().as_deref(),
            Some("20240102_000000")
        );

        layout.ledger().record("20240102_000000").unwrap();
        assert_eq!(pending_run(&layout).unwrap(), None);
    }

    #[test]
    fn explicit_run_id_is_validated() {
        let mut config = PipelineConfig::new("/work");
        config.run_id = Some("not-a-run".to_string());
        assert!(resolve_run_id(&config).is_err());

        config.run_id = Some("20240101_000000".to_string());
        assert_eq!(resolve_run_id(&config).unwrap(), "20240101_000000");
    }

    #[test]
    fn resumed_collation_logs_skipped_datasets() {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::new(dir.path());
        config.resume = true;
        let run_id = "20240101_000000";

        let store = config.layout().store(run_id);
        let mut product = Product::new(1);
        product.asin = "0827229534".to_string();
        store.write_chunk(Dataset::Product, 0, 0, &[product]).unwrap();
        store
            .write_manifest(&BatchManifest {
                version: ARTIFACT_VERSION,
                run_id: run_id.to_string(),
                batch: 0,
                chunks: 1,
                ..Default::default()
            })
            .unwrap();

        collate_stage(&config, run_id, &PipelineStats::new()).unwrap();
        let report = collate_stage(&config, run_id, &PipelineStats::new()).unwrap();
        assert!(report.datasets.iter().all(|d| d.skipped));

        let counts: Vec<String> = fs::read_dir(config.layout().perf_dir())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.to_string_lossy().ends_with("_counts_collate.csv"))
            .map(|path| fs::read_to_string(path).unwrap())
            .collect();
        assert!(counts.iter().any(|c| c.contains("datasets_skipped,4")));
    }

    #[test]
    fn split_stage_requires_input() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path());
        assert!(split_stage(&config, &PipelineStats::new()).is_err());
    }
}
