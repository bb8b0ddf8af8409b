//! End-to-end tests for the split -> parse -> collate -> ledger pipeline.
//!
//! Every test writes the shared `SAMPLE` dump into its own `TempDir` work
//! directory and drives the public pipeline API, then inspects the export
//! files the way a bulk importer would read them.
//!
//! # Sample Data
//!
//! - 1 discontinued record (dropped by the splitter)
//! - 4 products linked by `similar` lists, two of them pointing back at the first
//! - 3 distinct category paths, two shared between products
//! - 4 reviews by 2 customers; one customer reviews products in different batches

use copurchase::content::category_id;
use copurchase::export::{ExportDir, FileKind};
use copurchase::models::{Dataset, Product};
use copurchase::parser::{load_split, BatchParser};
use copurchase::pipeline::{collate_stage, run_pipeline, PipelineConfig, WorkLayout};
use copurchase::split::split_file;
use copurchase::stats::PipelineStats;
use copurchase::store::RunStore;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SAMPLE: &str = "# Full information about Amazon Share the Love products
Total items: 5

Id:   0
ASIN: 0771044445
  discontinued product

Id:   1
ASIN: 0827229534
  title: Patterns of Preaching: A Sermon Sampler
  group: Book
  salesrank: 396585
  similar: 2  0738700797  0486287785
  categories: 2
   |Books[283155]|Subjects[1000]|Religion & Spirituality[22]
   |Books[283155]|Subjects[1000]|Religion & Spirituality[22]|Christianity[12290]
  reviews: total: 2  downloaded: 2  avg rating: 4.5
    2000-7-28  cutomer: A2JW67OY8U6HHK  rating: 5  votes:  10  helpful:   9
    2003-12-14  cutomer: A2VE83MZF98ITY  rating: 4  votes:   6  helpful:   5

Id:   2
ASIN: 0738700797
  title: Candlemas: Feast of Flames
  group: Book
  salesrank: 168596
  similar: 1  0827229534
  categories: 1
   |Books[283155]|Subjects[1000]|Religion & Spirituality[22]
  reviews: total: 1  downloaded: 1  avg rating: 5
    2001-1-1  cutomer: A2JW67OY8U6HHK  rating: 5  votes:   2  helpful:   2

Id:   3
ASIN: 0486287785
  title: World War II Allied Fighter Planes Trading Cards
  group: Book
  salesrank: 1270652
  similar: 0
  categories: 1
   |Books[283155]|Subjects[1000]|Home & Garden[48]|Crafts & Hobbies[5126]
  reviews: total: 0  downloaded: 0  avg rating: 0

Id:   4
ASIN: 0842328327
  title: Life Application Bible Commentary: 1 and 2 Timothy and Titus
  group: Book
  salesrank: 631289
  similar: 1  0827229534
  categories: 1
   |Books[283155]|Subjects[1000]|Religion & Spirituality[22]|Christianity[12290]
  reviews: total: 1  downloaded: 1  avg rating: 4
    2001-1-11  cutomer: A2JW67OY8U6HHK  rating: 4  votes:   0  helpful:   0
";

const ASIN_1: &str = "0827229534";
const ASIN_2: &str = "0738700797";
const ASIN_3: &str = "0486287785";
const ASIN_4: &str = "0842328327";

const BAD_REVIEW: &str = "    2002-13-40  cutomer: A3UN6WX5RRO2AG  rating: 5  votes:   1  helpful:   1\n";

fn write_input(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("amazon-meta.txt");
    fs::write(&path, text).unwrap();
    path
}

fn config(dir: &TempDir, batch_size: usize) -> PipelineConfig {
    let mut config = PipelineConfig::new(dir.path().join("work"));
    config.input = Some(write_input(dir.path(), SAMPLE));
    config.batch_size = batch_size;
    config.flush_threshold = 3;
    config.workers = 2;
    config
}

fn data_lines(export: &ExportDir, dataset: Dataset, kind: FileKind) -> Vec<String> {
    fs::read_to_string(export.data_path(dataset, kind))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn export_for(config: &PipelineConfig, run_id: &str) -> ExportDir {
    ExportDir::create(config.layout().export_dir(run_id)).unwrap()
}

#[test]
fn full_run_exports_every_dataset() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);

    let outcome = run_pipeline(&config).unwrap();

    assert_eq!(outcome.batches, 2);
    assert!(outcome.schedule.is_complete());
    assert_eq!(outcome.stats.records_split, 4);
    assert_eq!(outcome.stats.records_dropped, 1);
    assert_eq!(outcome.stats.batches_parsed, 2);

    let export = export_for(&config, &outcome.run_id);
    assert!(export.is_complete());
    assert!(export.root().join("run_report.json").exists());

    let products = data_lines(&export, Dataset::Product, FileKind::Node);
    assert_eq!(products.len(), 4);
    assert!(products.iter().all(|row| !row.starts_with("0771044445")));

    assert_eq!(data_lines(&export, Dataset::Category, FileKind::Node).len(), 3);
    assert_eq!(data_lines(&export, Dataset::Category, FileKind::Edge).len(), 5);
    assert_eq!(data_lines(&export, Dataset::Review, FileKind::Node).len(), 4);
    assert_eq!(data_lines(&export, Dataset::Review, FileKind::Edge).len(), 4);
    assert_eq!(data_lines(&export, Dataset::Customer, FileKind::Node).len(), 2);
    assert_eq!(data_lines(&export, Dataset::Customer, FileKind::Edge).len(), 4);

    for dataset in Dataset::ALL {
        let header = fs::read_to_string(export.header_path(dataset, FileKind::Node)).unwrap();
        assert_eq!(header.lines().count(), 1);
        assert!(export.header_path(dataset, FileKind::Summary).exists());
    }

    let ledger = WorkLayout::new(&config.work_dir).ledger();
    assert_eq!(ledger.latest().unwrap(), Some(outcome.run_id.clone()));
}

#[test]
fn similar_edges_are_directed_and_unique() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);

    let outcome = run_pipeline(&config).unwrap();
    let export = export_for(&config, &outcome.run_id);

    let edges: Vec<String> = data_lines(&export, Dataset::Product, FileKind::Edge);
    let expected: BTreeSet<String> = [
        (ASIN_1, ASIN_2),
        (ASIN_1, ASIN_3),
        (ASIN_2, ASIN_1),
        (ASIN_4, ASIN_1),
    ]
    .iter()
    .map(|(from, to)| format!("{from}\t{to}\tSIMILAR"))
    .collect();

    assert_eq!(edges.len(), expected.len());
    assert_eq!(edges.into_iter().collect::<BTreeSet<_>>(), expected);
}

#[test]
fn shared_category_path_gets_one_id_across_batches() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);

    let outcome = run_pipeline(&config).unwrap();
    let export = export_for(&config, &outcome.run_id);

    let shared = category_id("|Books[283155]|Subjects[1000]|Religion & Spirituality[22]");
    let nodes = data_lines(&export, Dataset::Category, FileKind::Node);
    assert_eq!(nodes.iter().filter(|row| row.starts_with(&shared)).count(), 1);

    let edges = data_lines(&export, Dataset::Category, FileKind::Edge);
    assert!(edges.contains(&format!("{ASIN_1}\t{shared}\tIN_CATEGORY")));
    assert!(edges.contains(&format!("{ASIN_2}\t{shared}\tIN_CATEGORY")));
}

#[test]
fn customer_statistics_span_batches() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);

    let outcome = run_pipeline(&config).unwrap();
    let export = export_for(&config, &outcome.run_id);

    let customers = data_lines(&export, Dataset::Customer, FileKind::Node);
    let row = customers
        .iter()
        .find(|row| row.starts_with("A2JW67OY8U6HHK\t"))
        .unwrap();
    let cells: Vec<&str> = row.split('\t').collect();
    assert_eq!(cells[1], "3");
    // 2000-07-28 -> 2001-01-01 -> 2001-01-11
    assert_eq!(cells[2], "83.5");
}

#[test]
fn split_then_parse_matches_single_pass() {
    let dir = TempDir::new().unwrap();
    let input = write_input(dir.path(), SAMPLE);

    let mut parser = BatchParser::new(0, usize::MAX);
    for (i, line) in SAMPLE.lines().enumerate() {
        assert!(parser.feed(i + 1, line).unwrap().is_none());
    }
    let whole = parser.finish();
    let expected_products: BTreeSet<u64> = whole
        .products
        .iter()
        .filter(|p| !p.discontinued)
        .map(|p| p.id)
        .collect();
    let expected_reviews: BTreeSet<String> = whole.reviews.keys().cloned().collect();

    let stats = PipelineStats::new();
    let summary = split_file(&input, &dir.path().join("splits"), 1, &stats).unwrap();
    let store = RunStore::new(dir.path().join("artifacts"), "20240101_000000");
    for batch in &summary.batches {
        load_split(batch, &store, 2, &stats).unwrap();
    }

    let mut products = BTreeSet::new();
    for artifact in store.list(Dataset::Product).unwrap() {
        let chunk: Vec<Product> = store.read_chunk(&artifact).unwrap();
        products.extend(chunk.iter().map(|p| p.id));
    }
    let mut reviews = BTreeSet::new();
    for artifact in store.list(Dataset::Review).unwrap() {
        let chunk: Vec<copurchase::models::Review> = store.read_chunk(&artifact).unwrap();
        reviews.extend(chunk.into_iter().map(|r| r.id));
    }

    assert_eq!(products, expected_products);
    assert_eq!(reviews, expected_reviews);
}

#[test]
fn failed_batch_blocks_collation_and_resume_finishes_run() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 1);
    let broken = SAMPLE.replace(
        "  reviews: total: 0  downloaded: 0  avg rating: 0\n",
        &format!("  reviews: total: 1  downloaded: 1  avg rating: 5\n{BAD_REVIEW}"),
    );
    config.input = Some(write_input(dir.path(), &broken));
    config.run_id = Some("20240101_000000".to_string());

    let err = run_pipeline(&config).unwrap_err();
    assert!(err.to_string().contains("[2]"), "{err:#}");

    let layout = config.layout();
    assert_eq!(layout.ledger().latest().unwrap(), None);
    assert!(!layout.export_dir("20240101_000000").exists());

    // Repair the batch file in place and resume the same run.
    let batch = layout.splits_dir().join("00002.txt");
    let text = fs::read_to_string(&batch).unwrap();
    fs::write(&batch, text.replace(BAD_REVIEW, "")).unwrap();
    config.resume = true;

    let outcome = run_pipeline(&config).unwrap();
    assert_eq!(outcome.run_id, "20240101_000000");
    assert_eq!(outcome.schedule.completed, vec![2]);
    assert_eq!(outcome.schedule.skipped, vec![0, 1, 3]);
    assert_eq!(
        layout.ledger().latest().unwrap().as_deref(),
        Some("20240101_000000")
    );

    let export = export_for(&config, "20240101_000000");
    assert_eq!(data_lines(&export, Dataset::Product, FileKind::Node).len(), 4);
}

#[test]
fn repeated_collation_does_not_duplicate_rows() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 2);

    let outcome = run_pipeline(&config).unwrap();
    let export = export_for(&config, &outcome.run_id);
    let before: Vec<Vec<String>> = Dataset::ALL
        .iter()
        .map(|&d| data_lines(&export, d, FileKind::Node))
        .collect();

    config.resume = true;
    let report = collate_stage(&config, &outcome.run_id, &PipelineStats::new()).unwrap();
    assert!(report.datasets.iter().all(|d| d.skipped));

    config.resume = false;
    let report = collate_stage(&config, &outcome.run_id, &PipelineStats::new()).unwrap();
    assert!(report.datasets.iter().all(|d| !d.skipped));

    let after: Vec<Vec<String>> = Dataset::ALL
        .iter()
        .map(|&d| data_lines(&export, d, FileKind::Node))
        .collect();
    assert_eq!(before, after);
    assert_eq!(config.layout().ledger().entries().unwrap().len(), 1);
}

#[test]
fn ledger_tracks_latest_of_several_runs() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 2);

    config.run_id = Some("20240101_000000".to_string());
    run_pipeline(&config).unwrap();
    config.run_id = Some("20240102_000000".to_string());
    run_pipeline(&config).unwrap();

    let ledger = config.layout().ledger();
    assert_eq!(ledger.latest().unwrap().as_deref(), Some("20240102_000000"));
    assert_eq!(
        ledger.entries().unwrap(),
        vec!["20240101_000000", "20240102_000000"]
    );
}
