//! Collation of a run's intermediate artifacts into the final export.
//!
//! Every dataset is merged on its own: artifacts are read in (batch, chunk)
//! order, nodes are deduplicated by id with the first occurrence winning, and
//! edges from every artifact are folded into one ordered set. The merged
//! collection is released before the next dataset is loaded.

use crate::aggregate::{ReviewAggregate, ReviewSample, RunningStats};
use crate::config::RUN_REPORT_FILE;
use crate::export::{
    category_row, customer_row, edge_header, edge_row, node_header, product_row, review_row,
    summary_row, ExportDir, FileKind, SUMMARY_HEADER,
};
use crate::ledger::Ledger;
use crate::models::{
    CategoryPath, CustomerHistory, CustomerReview, CustomerStats, Dataset, Edge, Product, Review,
    EDGE_IN_CATEGORY, EDGE_REVIEW_OF, EDGE_SIMILAR, EDGE_WROTE,
};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::store::RunStore;
use anyhow::{bail, Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatasetReport {
    pub dataset: Dataset,
    pub nodes: u64,
    pub edges: u64,
    /// Already exported by an earlier attempt at this run
    pub skipped: bool,
}

/// Written to `run_report.json` next to the export files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CollateReport {
    pub run_id: String,
    pub batches: u32,
    pub datasets: Vec<DatasetReport>,
    pub stats: StatsSnapshot,
}

struct Measure {
    name: &'static str,
    values: RunningStats,
}

impl Measure {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            values: RunningStats::new(),
        }
    }
}

/// One dataset merged across all batches, keyed by `K`.
struct Collated<T, K = String> {
    records: BTreeMap<K, T>,
    edges: BTreeSet<Edge>,
    measures: Vec<Measure>,
}

impl<T, K: Ord> Collated<T, K> {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            edges: BTreeSet::new(),
            measures: Vec::new(),
        }
    }

    /// First occurrence wins.
    fn insert(&mut self, id: K, record: T) -> bool {
        match self.records.entry(id) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    fn measure(&mut self, name: &'static str, values: impl IntoIterator<Item = f64>) {
        let mut measure = Measure::new(name);
        measure.values.extend(values);
        self.measures.push(measure);
    }
}

/// Products are keyed by their record `Id`; the ASIN is the exported node id.
fn collate_products(store: &RunStore) -> Result<Collated<Product, u64>> {
    let mut collated = Collated::new();
    for artifact in store.list(Dataset::Product)? {
        let products: Vec<Product> = store.read_chunk(&artifact)?;
        for product in products {
            if product.asin.is_empty() {
                warn!(
                    product = product.id,
                    batch = artifact.batch,
                    "Skipping product without ASIN"
                );
                continue;
            }
            for similar in &product.similar {
                collated
                    .edges
                    .insert(Edge::new(&product.asin, similar, EDGE_SIMILAR));
            }
            collated.insert(product.id, product);
        }
    }

    let products: Vec<&Product> = collated.records.values().collect();
    let salesrank: Vec<f64> = products
        .iter()
        .filter_map(|p| p.salesrank)
        .map(|r| r as f64)
        .collect();
    let similar: Vec<f64> = products.iter().map(|p| p.similar.len() as f64).collect();
    let review_count: Vec<f64> = products
        .iter()
        .map(|p| p.reviews.as_ref().map_or(0, |r| r.count) as f64)
        .collect();
    let rating: Vec<f64> = products
        .iter()
        .filter_map(|p| p.reviews.as_ref())
        .map(|r| r.rating_avg)
        .collect();
    let category_count: Vec<f64> = products
        .iter()
        .filter_map(|p| p.categories.as_ref())
        .map(|c| c.count as f64)
        .collect();

    collated.measure("salesrank", salesrank);
    collated.measure("similar_count", similar);
    collated.measure("review_count", review_count);
    collated.measure("review_rating_avg", rating);
    collated.measure("category_count", category_count);
    Ok(collated)
}

fn collate_categories(store: &RunStore) -> Result<Collated<CategoryPath>> {
    let mut collated = Collated::new();
    for artifact in store.list(Dataset::Category)? {
        let categories: Vec<CategoryPath> = store.read_chunk(&artifact)?;
        for category in categories {
            for asin in category.products.iter().filter(|a| !a.is_empty()) {
                collated
                    .edges
                    .insert(Edge::new(asin, &category.id, EDGE_IN_CATEGORY));
            }
            collated.insert(category.id.clone(), category);
        }
    }

    let mut members: FxHashMap<&str, u64> = FxHashMap::default();
    for edge in &collated.edges {
        *members.entry(edge.to.as_str()).or_insert(0) += 1;
    }
    let depth: Vec<f64> = collated.records.values().map(|c| c.depth as f64).collect();
    let products: Vec<f64> = members.values().map(|&n| n as f64).collect();

    collated.measure("depth", depth);
    collated.measure("products_per_category", products);
    Ok(collated)
}

fn collate_reviews(store: &RunStore) -> Result<Collated<Review>> {
    let mut collated = Collated::new();
    for artifact in store.list(Dataset::Review)? {
        let reviews: Vec<Review> = store.read_chunk(&artifact)?;
        for review in reviews {
            collated
                .edges
                .insert(Edge::new(&review.id, &review.asin, EDGE_REVIEW_OF));
            collated.insert(review.id.clone(), review);
        }
    }

    let reviews: Vec<&Review> = collated.records.values().collect();
    let rating: Vec<f64> = reviews.iter().map(|r| r.rating as f64).collect();
    let votes: Vec<f64> = reviews.iter().map(|r| r.votes as f64).collect();
    let ratio: Vec<f64> = reviews.iter().map(|r| r.helpful_ratio).collect();
    let weighted: Vec<f64> = reviews.iter().map(|r| r.weighted_rating).collect();

    collated.measure("rating", rating);
    collated.measure("votes", votes);
    collated.measure("helpful_ratio", ratio);
    collated.measure("weighted_rating", weighted);
    Ok(collated)
}

/// Customer histories are split across every batch the customer reviewed in,
/// so their statistics are only computed once all histories are merged.
fn collate_customers(store: &RunStore) -> Result<Collated<CustomerStats>> {
    let mut histories: BTreeMap<String, (FxHashSet<String>, Vec<CustomerReview>)> =
        BTreeMap::new();
    let mut collated = Collated::new();

    for artifact in store.list(Dataset::Customer)? {
        let chunk: Vec<CustomerHistory> = store.read_chunk(&artifact)?;
        for history in chunk {
            let (seen, entries) = histories.entry(history.customer.clone()).or_default();
            for entry in history.entries {
                if seen.insert(entry.review_id.clone()) {
                    collated.edges.insert(Edge::new(
                        &history.customer,
                        &entry.review_id,
                        EDGE_WROTE,
                    ));
                    entries.push(entry);
                }
            }
        }
    }

    for (customer, (_, entries)) in histories {
        let mut aggregate = ReviewAggregate::new();
        for entry in &entries {
            aggregate.push(ReviewSample {
                date: entry.date,
                reviewer: &entry.asin,
                rating: entry.rating,
                votes: entry.votes,
                helpful_ratio: entry.helpful_ratio,
                weighted_rating: entry.weighted_rating,
            });
        }
        collated.insert(customer, aggregate.finish().unwrap_or_default());
    }

    let stats: Vec<&CustomerStats> = collated.records.values().collect();
    let count: Vec<f64> = stats.iter().map(|s| s.count as f64).collect();
    let rating: Vec<f64> = stats.iter().map(|s| s.rating_avg).collect();
    let mttr: Vec<f64> = stats
        .iter()
        .filter(|s| s.count > 1)
        .map(|s| s.mttr)
        .collect();

    collated.measure("review_count", count);
    collated.measure("rating_avg", rating);
    collated.measure("mttr", mttr);
    Ok(collated)
}

fn write_collated<T, K: Ord>(
    export: &ExportDir,
    dataset: Dataset,
    collated: Collated<T, K>,
    row: impl Fn(&K, &T) -> Vec<String>,
    write_summary: bool,
    stats: &PipelineStats,
) -> Result<DatasetReport> {
    export.write_header(dataset, FileKind::Node, node_header(dataset))?;
    export.write_header(dataset, FileKind::Edge, &edge_header(dataset))?;

    let mut nodes = export.data_writer(dataset, FileKind::Node)?;
    for (id, record) in &collated.records {
        nodes.write_record(row(id, record))?;
    }
    nodes
        .flush()
        .with_context(|| format!("Failed to write {} nodes", dataset))?;

    let mut edges = export.data_writer(dataset, FileKind::Edge)?;
    for edge in &collated.edges {
        edges.write_record(edge_row(edge))?;
    }
    edges
        .flush()
        .with_context(|| format!("Failed to write {} edges", dataset))?;

    if write_summary {
        export.write_header(dataset, FileKind::Summary, SUMMARY_HEADER)?;
        let mut summary = export.data_writer(dataset, FileKind::Summary)?;
        for measure in &collated.measures {
            summary.write_record(summary_row(measure.name, &measure.values))?;
        }
        summary
            .flush()
            .with_context(|| format!("Failed to write {} summary", dataset))?;
    }

    let report = DatasetReport {
        dataset,
        nodes: collated.records.len() as u64,
        edges: collated.edges.len() as u64,
        skipped: false,
    };
    stats.add_rows_exported(report.nodes);
    stats.add_edges_exported(report.edges);
    info!(
        dataset = %dataset,
        nodes = report.nodes,
        edges = report.edges,
        "Dataset exported"
    );
    Ok(report)
}

fn collate_dataset(
    store: &RunStore,
    export: &ExportDir,
    dataset: Dataset,
    write_summary: bool,
    stats: &PipelineStats,
) -> Result<DatasetReport> {
    match dataset {
        Dataset::Product => write_collated(
            export,
            dataset,
            collate_products(store)?,
            |_, p| product_row(p),
            write_summary,
            stats,
        ),
        Dataset::Category => write_collated(
            export,
            dataset,
            collate_categories(store)?,
            |_, c| category_row(c),
            write_summary,
            stats,
        ),
        Dataset::Review => write_collated(
            export,
            dataset,
            collate_reviews(store)?,
            |_, r| review_row(r),
            write_summary,
            stats,
        ),
        Dataset::Customer => write_collated(
            export,
            dataset,
            collate_customers(store)?,
            |id, s| customer_row(id, s),
            write_summary,
            stats,
        ),
    }
}

/// Batches that have a manifest; fails if any artifact belongs to a batch
/// without one.
fn completed_batches(store: &RunStore) -> Result<Vec<u32>> {
    let batches: Vec<u32> = store.manifests()?.iter().map(|m| m.batch).collect();
    if batches.is_empty() {
        bail!(
            "Run {} has no parsed batches in {:?}",
            store.run_id(),
            store.dir()
        );
    }

    for dataset in Dataset::ALL {
        if let Some(orphan) = store
            .list(dataset)?
            .into_iter()
            .find(|a| batches.binary_search(&a.batch).is_err())
        {
            bail!(
                "Batch {} of run {} is incomplete (no manifest); re-run the parse stage",
                orphan.batch,
                store.run_id()
            );
        }
    }
    Ok(batches)
}

fn write_report(export: &ExportDir, report: &CollateReport) -> Result<()> {
    let path = export.root().join(RUN_REPORT_FILE);
    let file =
        File::create(&path).with_context(|| format!("Failed to create report: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)
        .with_context(|| format!("Failed to write report: {:?}", path))?;
    writer
        .flush()
        .with_context(|| format!("Failed to write report: {:?}", path))?;
    Ok(())
}

/// Merges every dataset of the run into `export`, then writes the run report,
/// the completion marker and finally the ledger entry.
///
/// Datasets already marked done are skipped; the data files of any other
/// dataset are discarded before it is rewritten, so repeating a collation
/// never duplicates rows.
pub fn collate_run(
    store: &RunStore,
    export: &ExportDir,
    ledger: &Ledger,
    write_summary: bool,
    stats: &PipelineStats,
) -> Result<CollateReport> {
    let batches = completed_batches(store)?;
    info!(
        run = store.run_id(),
        batches = batches.len(),
        "Collating run into {:?}",
        export.root()
    );

    let mut datasets = Vec::with_capacity(Dataset::ALL.len());
    for dataset in Dataset::ALL {
        if export.is_done(dataset) {
            info!(dataset = %dataset, "Dataset already exported, skipping");
            datasets.push(DatasetReport {
                dataset,
                nodes: 0,
                edges: 0,
                skipped: true,
            });
            continue;
        }

        export.reset_data(dataset)?;
        let report = collate_dataset(store, export, dataset, write_summary, stats)
            .with_context(|| format!("Failed to collate dataset {}", dataset))?;
        export.mark_done(dataset)?;
        datasets.push(report);
    }

    let report = CollateReport {
        run_id: store.run_id().to_string(),
        batches: batches.len() as u32,
        datasets,
        stats: stats.snapshot(),
    };
    write_report(export, &report)?;
    export.mark_complete()?;

    if ledger.latest()?.as_deref() != Some(store.run_id()) {
        ledger.record(store.run_id())?;
    }
    Ok(report)
}
