//! Copurchase: product co-purchasing metadata to graph bulk-import files
//!
//! Converts a large flat-text product metadata dump (one multi-line record per
//! product, with nested category paths and reviews) into deduplicated node and
//! edge tables ready for neo4j-admin style bulk import.
//!
//! 1. **Split** -- Stream the dump once and re-partition it into batch files of
//!    N whole records
//! 2. **Parse** -- Parse batches in parallel; each worker writes typed, per-batch
//!    intermediate artifacts and a completion manifest
//! 3. **Collate** -- Merge every batch per dataset, deduplicate by id, recompute
//!    cross-batch customer statistics, and write header/data file pairs
//! 4. **Ledger** -- Record the completed run id in an append-only ledger
//!
//! # Architecture
//!
//! - **Content-addressed ids** -- Category paths and reviews are identified by a
//!   hash of their content, so independent workers agree without sharing state
//! - **No shared maps** -- Workers only share lock-free counters and a progress bar
//! - **Bounded memory** -- Parsers flush chunks once a threshold of entities is held
//! - **Resumable runs** -- Per-batch manifests, per-dataset done markers and the
//!   run ledger let an interrupted run pick up where it stopped
//!
//! # Key Modules
//!
//! - [`split`] -- Record-aligned splitting of the source dump
//! - [`content`] -- Line grammar and content-addressed ids
//! - [`parser`] -- Per-batch parsing (`load_split`)
//! - [`aggregate`] -- Streaming statistics for reviews and category paths
//! - [`store`] -- Intermediate per-batch artifacts
//! - [`scheduler`] -- Worker pool with per-batch failure isolation
//! - [`merge`] -- Cross-batch collation
//! - [`export`] -- Header/data file layout and row encoding
//! - [`ledger`] -- Completed-run ledger
//! - [`pipeline`] -- Work directory layout, stages and resume
//! - [`stats`] -- Atomic counters for stage metrics
//! - [`perf`] -- Stage timing logs
//!
//! # Example Usage
//!
//! ```bash
//! # Everything in one go
//! copurchase -v run -i amazon-meta.txt -w work/
//!
//! # Stage by stage
//! copurchase split -i amazon-meta.txt -w work/ --batch-size 10000
//! copurchase parse -w work/ --workers 7
//! copurchase collate -w work/ --resume
//! copurchase ledger -w work/
//! ```

pub mod aggregate;
pub mod config;
pub mod content;
pub mod export;
pub mod ledger;
pub mod merge;
pub mod models;
pub mod parser;
pub mod perf;
pub mod pipeline;
pub mod scheduler;
pub mod split;
pub mod stats;
pub mod store;
