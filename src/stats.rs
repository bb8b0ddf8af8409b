use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every stage of a run. Workers only ever add to them.
#[derive(Default)]
pub struct PipelineStats {
    pub records_split: AtomicU64,
    pub records_dropped: AtomicU64,
    pub batches_written: AtomicU64,
    pub batches_parsed: AtomicU64,
    pub batches_failed: AtomicU64,
    pub products_parsed: AtomicU64,
    pub reviews_parsed: AtomicU64,
    pub category_paths: AtomicU64,
    pub chunks_flushed: AtomicU64,
    pub rows_exported: AtomicU64,
    pub edges_exported: AtomicU64,
}

/// Plain snapshot of [`PipelineStats`], written to the run report.
#[derive(Serialize, Deserialize, Clone, Default, Debug, PartialEq)]
pub struct StatsSnapshot {
    pub records_split: u64,
    pub records_dropped: u64,
    pub batches_written: u64,
    pub batches_parsed: u64,
    pub batches_failed: u64,
    pub products_parsed: u64,
    pub reviews_parsed: u64,
    pub category_paths: u64,
    pub chunks_flushed: u64,
    pub rows_exported: u64,
    pub edges_exported: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_records_split(&self) {
        self.records_split.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_records_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches_written(&self) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches_parsed(&self) {
        self.batches_parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_products(&self, count: u64) {
        self.products_parsed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_reviews(&self, count: u64) {
        self.reviews_parsed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_category_paths(&self, count: u64) {
        self.category_paths.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_chunks_flushed(&self) {
        self.chunks_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rows_exported(&self, count: u64) {
        self.rows_exported.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_edges_exported(&self, count: u64) {
        self.edges_exported.fetch_add(count, Ordering::Relaxed);
    }

    pub fn records_split(&self) -> u64 {
        self.records_split.load(Ordering::Relaxed)
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }

    pub fn batches_parsed(&self) -> u64 {
        self.batches_parsed.load(Ordering::Relaxed)
    }

    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    pub fn products(&self) -> u64 {
        self.products_parsed.load(Ordering::Relaxed)
    }

    pub fn reviews(&self) -> u64 {
        self.reviews_parsed.load(Ordering::Relaxed)
    }

    pub fn category_paths(&self) -> u64 {
        self.category_paths.load(Ordering::Relaxed)
    }

    pub fn chunks_flushed(&self) -> u64 {
        self.chunks_flushed.load(Ordering::Relaxed)
    }

    pub fn rows_exported(&self) -> u64 {
        self.rows_exported.load(Ordering::Relaxed)
    }

    pub fn edges_exported(&self) -> u64 {
        self.edges_exported.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_split: self.records_split(),
            records_dropped: self.records_dropped(),
            batches_written: self.batches_written(),
            batches_parsed: self.batches_parsed(),
            batches_failed: self.batches_failed(),
            products_parsed: self.products(),
            reviews_parsed: self.reviews(),
            category_paths: self.category_paths(),
            chunks_flushed: self.chunks_flushed(),
            rows_exported: self.rows_exported(),
            edges_exported: self.edges_exported(),
        }
    }
}
