use crate::aggregate::{round, RunningStats};
use crate::config::{ARRAY_DELIMITER, COMPLETION_MARKER, EXPORT_DELIMITER};
use crate::models::{CategoryPath, Dataset, Edge, Product, Review, ReviewStats};
use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};
use std::fs::{self, File, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const PRODUCT_NODE_HEADER: &[&str] = &[
    "ASIN:ID(asin_id)",
    "product_id:long",
    "title",
    "group",
    "salesrank:long",
    "similar:string[]",
    "discontinued:boolean",
    "reviews_total:int",
    "reviews_downloaded:int",
    "reviews_avg_rating:double",
    "review_count:int",
    "review_rating_avg:double",
    "review_rating_std:double",
    "review_votes_total:long",
    "review_votes_avg:double",
    "review_votes_std:double",
    "review_helpful_ratio_avg:double",
    "review_helpful_ratio_std:double",
    "review_weighted_rating_avg:double",
    "review_weighted_rating_std:double",
    "review_mttr:double",
    "unique_reviewers:int",
    "category_count:int",
    "category_depth_avg:double",
    "category_depth_std:double",
    ":LABEL",
];

pub const CATEGORY_NODE_HEADER: &[&str] = &[
    "category_id:ID(category_id)",
    "path",
    "name",
    "depth:int",
    ":LABEL",
];

pub const REVIEW_NODE_HEADER: &[&str] = &[
    "review_id:ID(review_id)",
    "product_id:long",
    "ASIN",
    "customer_id",
    "date:date",
    "rating:int",
    "votes:int",
    "helpful:int",
    "helpful_ratio:double",
    "weighted_rating:double",
    ":LABEL",
];

pub const CUSTOMER_NODE_HEADER: &[&str] = &[
    "customer_id:ID(customer_id)",
    "review_count:int",
    "mttr:double",
    "rating_avg:double",
    "rating_std:double",
    "votes_avg:double",
    "votes_std:double",
    "helpful_ratio_avg:double",
    "helpful_ratio_std:double",
    "weighted_rating_avg:double",
    "weighted_rating_std:double",
    ":LABEL",
];

pub const SUMMARY_HEADER: &[&str] = &[
    "measure",
    "count:long",
    "total:double",
    "mean:double",
    "std:double",
];

/// Edge header for each dataset: start id space, end id space.
pub fn edge_header(dataset: Dataset) -> [&'static str; 3] {
    match dataset {
        Dataset::Product => [":START_ID(asin_id)", ":END_ID(asin_id)", ":TYPE"],
        Dataset::Category => [":START_ID(asin_id)", ":END_ID(category_id)", ":TYPE"],
        Dataset::Review => [":START_ID(review_id)", ":END_ID(asin_id)", ":TYPE"],
        Dataset::Customer => [":START_ID(customer_id)", ":END_ID(review_id)", ":TYPE"],
    }
}

pub fn node_header(dataset: Dataset) -> &'static [&'static str] {
    match dataset {
        Dataset::Product => PRODUCT_NODE_HEADER,
        Dataset::Category => CATEGORY_NODE_HEADER,
        Dataset::Review => REVIEW_NODE_HEADER,
        Dataset::Customer => CUSTOMER_NODE_HEADER,
    }
}

pub fn node_label(dataset: Dataset) -> &'static str {
    match dataset {
        Dataset::Product => "Product",
        Dataset::Category => "Category",
        Dataset::Review => "Review",
        Dataset::Customer => "Customer",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Node,
    Edge,
    Summary,
}

impl FileKind {
    fn name(&self) -> &'static str {
        match self {
            FileKind::Node => "node",
            FileKind::Edge => "edge",
            FileKind::Summary => "summary",
        }
    }
}

/// Final export directory of one run.
#[derive(Debug, Clone)]
pub struct ExportDir {
    root: PathBuf,
}

impl ExportDir {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create export directory: {:?}", root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn header_path(&self, dataset: Dataset, kind: FileKind) -> PathBuf {
        self.root
            .join(format!("{}_{}_header.csv", dataset.name(), kind.name()))
    }

    pub fn data_path(&self, dataset: Dataset, kind: FileKind) -> PathBuf {
        self.root
            .join(format!("{}_{}_data.csv", dataset.name(), kind.name()))
    }

    fn done_path(&self, dataset: Dataset) -> PathBuf {
        self.root.join(format!(".{}.done", dataset.name()))
    }

    /// Writes the header once; returns `false` if it already existed.
    pub fn write_header(&self, dataset: Dataset, kind: FileKind, columns: &[&str]) -> Result<bool> {
        let path = self.header_path(dataset, kind);
        if path.exists() {
            debug!(path = ?path, "Header already present");
            return Ok(false);
        }
        let mut writer = tsv_writer(
            File::create(&path)
                .with_context(|| format!("Failed to create header file: {:?}", path))?,
        );
        writer.write_record(columns)?;
        writer
            .flush()
            .with_context(|| format!("Failed to write header file: {:?}", path))?;
        Ok(true)
    }

    /// Opens the data file for appending.
    pub fn data_writer(&self, dataset: Dataset, kind: FileKind) -> Result<Writer<BufWriter<File>>> {
        let path = self.data_path(dataset, kind);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open data file: {:?}", path))?;
        Ok(tsv_writer(file))
    }

    pub fn is_done(&self, dataset: Dataset) -> bool {
        self.done_path(dataset).exists()
    }

    pub fn mark_done(&self, dataset: Dataset) -> Result<()> {
        let path = self.done_path(dataset);
        fs::write(&path, b"").with_context(|| format!("Failed to write marker: {:?}", path))
    }

    /// Drops data files of a dataset whose export never finished, so the next
    /// append starts clean.
    pub fn reset_data(&self, dataset: Dataset) -> Result<()> {
        for kind in [FileKind::Node, FileKind::Edge, FileKind::Summary] {
            let path = self.data_path(dataset, kind);
            if path.exists() {
                info!(path = ?path, "Discarding partial data file");
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove data file: {:?}", path))?;
            }
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.root.join(COMPLETION_MARKER).exists()
    }

    pub fn mark_complete(&self) -> Result<()> {
        let path = self.root.join(COMPLETION_MARKER);
        fs::write(&path, b"").with_context(|| format!("Failed to write marker: {:?}", path))
    }
}

fn tsv_writer(file: File) -> Writer<BufWriter<File>> {
    WriterBuilder::new()
        .delimiter(EXPORT_DELIMITER)
        .has_headers(false)
        .from_writer(BufWriter::with_capacity(256 * 1024, file))
}

fn int<I: itoa::Integer>(value: I) -> String {
    itoa::Buffer::new().format(value).to_string()
}

fn opt_int<I: itoa::Integer>(value: Option<I>) -> String {
    value.map(int).unwrap_or_default()
}

fn float(value: f64) -> String {
    value.to_string()
}

fn opt_float(value: Option<f64>) -> String {
    value.map(float).unwrap_or_default()
}

fn opt_text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Collapses tabs and newlines so a free-text cell stays on one row.
fn sanitize_field(s: &str) -> String {
    if s.contains(['\t', '\n', '\r']) {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        s.to_string()
    }
}

pub fn product_row(p: &Product) -> Vec<String> {
    let r = p.reviews.as_ref();
    let c = p.categories.as_ref();
    vec![
        p.asin.clone(),
        int(p.id),
        sanitize_field(&opt_text(&p.title)),
        opt_text(&p.group),
        opt_int(p.salesrank),
        p.similar.join(ARRAY_DELIMITER),
        p.discontinued.to_string(),
        opt_int(p.reviews_total),
        opt_int(p.reviews_downloaded),
        opt_float(p.reviews_avg_rating),
        opt_int(r.map(|s| s.count)),
        opt_float(r.map(|s| s.rating_avg)),
        opt_float(r.map(|s| s.rating_std)),
        opt_int(r.map(|s| s.votes_total)),
        opt_float(r.map(|s| s.votes_avg)),
        opt_float(r.map(|s| s.votes_std)),
        opt_float(r.map(|s| s.helpful_ratio_avg)),
        opt_float(r.map(|s| s.helpful_ratio_std)),
        opt_float(r.map(|s| s.weighted_rating_avg)),
        opt_float(r.map(|s| s.weighted_rating_std)),
        opt_float(r.map(|s| s.mttr)),
        opt_int(r.map(|s| s.unique_reviewers)),
        opt_int(c.map(|s| s.count)),
        opt_float(c.map(|s| s.depth_avg)),
        opt_float(c.map(|s| s.depth_std)),
        node_label(Dataset::Product).to_string(),
    ]
}

pub fn category_row(c: &CategoryPath) -> Vec<String> {
    vec![
        c.id.clone(),
        sanitize_field(&c.path),
        sanitize_field(c.leaf()),
        int(c.depth),
        node_label(Dataset::Category).to_string(),
    ]
}

pub fn review_row(r: &Review) -> Vec<String> {
    vec![
        r.id.clone(),
        int(r.product_id),
        r.asin.clone(),
        r.customer.clone(),
        r.date.format("%Y-%m-%d").to_string(),
        int(r.rating),
        int(r.votes),
        int(r.helpful),
        float(r.helpful_ratio),
        float(r.weighted_rating),
        node_label(Dataset::Review).to_string(),
    ]
}

pub fn customer_row(customer: &str, stats: &ReviewStats) -> Vec<String> {
    vec![
        customer.to_string(),
        int(stats.count),
        float(stats.mttr),
        float(stats.rating_avg),
        float(stats.rating_std),
        float(stats.votes_avg),
        float(stats.votes_std),
        float(stats.helpful_ratio_avg),
        float(stats.helpful_ratio_std),
        float(stats.weighted_rating_avg),
        float(stats.weighted_rating_std),
        node_label(Dataset::Customer).to_string(),
    ]
}

pub fn summary_row(measure: &str, stats: &RunningStats) -> Vec<String> {
    vec![
        measure.to_string(),
        int(stats.count()),
        float(round(stats.sum())),
        float(round(stats.mean())),
        float(round(stats.std_dev())),
    ]
}

pub fn edge_row(edge: &Edge) -> [&str; 3] {
    [&edge.from, &edge.to, edge.kind]
}
