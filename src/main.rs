use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use copurchase::config::{DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_THRESHOLD};
use copurchase::merge::CollateReport;
use copurchase::pipeline::{
    collate_stage, parse_stage, pending_run, resolve_run_id, run_pipeline,
    split_stage, PipelineConfig,
};
use copurchase::scheduler::default_workers;
use copurchase::split::list_batches;
use copurchase::stats::{PipelineStats, StatsSnapshot};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "copurchase")]
#[command(about = "Convert product co-purchasing metadata into graph bulk-import files")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split the metadata dump into record-aligned batch files
    Split(SplitArgs),
    /// Parse batch files into a run's intermediate artifacts
    Parse(ParseArgs),
    /// Merge a parsed run into the final export files
    Collate(CollateArgs),
    /// Split, parse and collate in one go
    Run(RunArgs),
    /// Show completed runs
    Ledger(LedgerArgs),
}

#[derive(Args)]
struct WorkArgs {
    /// Work directory holding batches, artifacts, exports and the ledger
    #[arg(short, long, default_value = "work")]
    work_dir: PathBuf,
}

#[derive(Args)]
struct SplitArgs {
    /// Path to the metadata dump
    #[arg(short, long)]
    input: PathBuf,

    #[command(flatten)]
    work: WorkArgs,

    /// Records per batch file
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[derive(Args)]
struct ParseArgs {
    #[command(flatten)]
    work: WorkArgs,

    /// Run id (YYYYMMDD_HHMMSS); defaults to a new run, or the pending one with --resume
    #[arg(long)]
    run: Option<String>,

    /// Skip batches already parsed for the run
    #[arg(long)]
    resume: bool,

    /// Parallel workers (default: CPUs - 1)
    #[arg(long)]
    workers: Option<usize>,

    /// Entities held in memory before a chunk is flushed
    #[arg(long, default_value_t = DEFAULT_FLUSH_THRESHOLD)]
    flush_threshold: usize,
}

#[derive(Args)]
struct CollateArgs {
    #[command(flatten)]
    work: WorkArgs,

    /// Run id to collate; defaults to the newest run not yet in the ledger
    #[arg(long)]
    run: Option<String>,

    /// Keep datasets already exported for the run
    #[arg(long)]
    resume: bool,

    /// Skip summary files
    #[arg(long)]
    no_summary: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Path to the metadata dump (optional with --resume when batches exist)
    #[arg(short, long)]
    input: Option<PathBuf>,

    #[command(flatten)]
    work: WorkArgs,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    #[arg(long, default_value_t = DEFAULT_FLUSH_THRESHOLD)]
    flush_threshold: usize,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    run: Option<String>,

    /// Continue the pending run: reuse batches, parsed batches and exported datasets
    #[arg(long)]
    resume: bool,

    #[arg(long)]
    no_summary: bool,
}

#[derive(Args)]
struct LedgerArgs {
    #[command(flatten)]
    work: WorkArgs,

    /// List every recorded run, not just the latest
    #[arg(long)]
    all: bool,
}

fn print_stats(stats: &StatsSnapshot) {
    println!("Records split:      {}", stats.records_split);
    println!("Records dropped:    {}", stats.records_dropped);
    println!("Batches parsed:     {}", stats.batches_parsed);
    println!("Batches failed:     {}", stats.batches_failed);
    println!("Products parsed:    {}", stats.products_parsed);
    println!("Reviews parsed:     {}", stats.reviews_parsed);
    println!("Category paths:     {}", stats.category_paths);
    println!("Chunks flushed:     {}", stats.chunks_flushed);
    println!("Rows exported:      {}", stats.rows_exported);
    println!("Edges exported:     {}", stats.edges_exported);
}

fn print_collation(report: &CollateReport) {
    for dataset in &report.datasets {
        if dataset.skipped {
            println!("{:<10} already exported", dataset.dataset.name());
        } else {
            println!(
                "{:<10} {} nodes, {} edges",
                dataset.dataset.name(),
                dataset.nodes,
                dataset.edges
            );
        }
    }
}

fn run_split(args: SplitArgs) -> Result<()> {
    let mut config = PipelineConfig::new(args.work.work_dir);
    config.input = Some(args.input);
    config.batch_size = args.batch_size;

    let stats = PipelineStats::new();
    let start = Instant::now();
    let batches = split_stage(&config, &stats)?;

    println!();
    println!("=== Split ===");
    println!("Batch files:        {}", batches.len());
    println!("Records kept:       {}", stats.records_split());
    println!("Records dropped:    {}", stats.records_dropped());
    println!("Time:               {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn run_parse(args: ParseArgs) -> Result<()> {
    let mut config = PipelineConfig::new(args.work.work_dir);
    config.run_id = args.run;
    config.resume = args.resume;
    config.flush_threshold = args.flush_threshold;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let batches = list_batches(&config.layout().splits_dir())?;
    if batches.is_empty() {
        bail!("No batch files in {:?}; run the split stage first", config.layout().splits_dir());
    }

    let run_id = resolve_run_id(&config)?;
    let stats = PipelineStats::new();
    let start = Instant::now();
    let report = parse_stage(&config, &run_id, &batches, &stats)?;

    println!();
    println!("=== Parse ({}) ===", run_id);
    println!("Batches parsed:     {}", report.completed.len());
    println!("Batches skipped:    {}", report.skipped.len());
    println!("Products parsed:    {}", stats.products());
    println!("Reviews parsed:     {}", stats.reviews());
    println!("Time:               {:.2}s", start.elapsed().as_secs_f64());

    if !report.is_complete() {
        bail!(
            "{} batches failed: {:?}; rerun with --resume --run {}",
            report.failures.len(),
            report.failed_batches(),
            run_id
        );
    }
    Ok(())
}

fn run_collate(args: CollateArgs) -> Result<()> {
    let mut config = PipelineConfig::new(args.work.work_dir);
    config.resume = args.resume;
    config.write_summary = !args.no_summary;

    let run_id = match args.run {
        Some(run_id) => run_id,
        None => match pending_run(&config.layout())? {
            Some(run_id) => run_id,
            None => bail!("No pending run to collate; pass --run"),
        },
    };

    let stats = PipelineStats::new();
    let start = Instant::now();
    let report = collate_stage(&config, &run_id, &stats)?;

    println!();
    println!("=== Collate ({}) ===", run_id);
    print_collation(&report);
    println!("Export directory:   {:?}", config.layout().export_dir(&run_id));
    println!("Time:               {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn run_all(args: RunArgs) -> Result<()> {
    let mut config = PipelineConfig::new(args.work.work_dir);
    config.input = args.input;
    config.batch_size = args.batch_size;
    config.flush_threshold = args.flush_threshold;
    config.run_id = args.run;
    config.resume = args.resume;
    config.write_summary = !args.no_summary;
    config.workers = args.workers.unwrap_or_else(default_workers);

    let start = Instant::now();
    let outcome = run_pipeline(&config)?;

    println!();
    println!("=== Summary ({}) ===", outcome.run_id);
    println!("Batch files:        {}", outcome.batches);
    println!("Batches skipped:    {}", outcome.schedule.skipped.len());
    print_stats(&outcome.stats);
    println!();
    print_collation(&outcome.collate);
    println!();
    println!("Total time:         {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn run_ledger(args: LedgerArgs) -> Result<()> {
    let config = PipelineConfig::new(args.work.work_dir);
    let layout = config.layout();
    let ledger = layout.ledger();

    if args.all {
        for run_id in ledger.entries()? {
            println!("{}", run_id);
        }
        return Ok(());
    }

    match ledger.latest()? {
        Some(run_id) => println!("Latest run:         {}", run_id),
        None => println!("No completed runs"),
    }
    if let Some(run_id) = pending_run(&layout)? {
        println!("Pending run:        {}", run_id);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::Split(args) => run_split(args),
        Commands::Parse(args) => run_parse(args),
        Commands::Collate(args) => run_collate(args),
        Commands::Run(args) => run_all(args),
        Commands::Ledger(args) => run_ledger(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
