use crate::aggregate::{category_stats, helpful_ratio, weighted_rating, ReviewAggregate, ReviewSample};
use crate::config::ARTIFACT_VERSION;
use crate::content::{
    category_depth, category_id, classify, parse_review_line, parse_review_summary, parse_similar,
    review_id, Keyword, LineKind,
};
use crate::models::{
    BatchFile, CategoryPath, CustomerHistory, CustomerReview, Dataset, Product, Review,
};
use crate::stats::PipelineStats;
use crate::store::{BatchManifest, RunStore};
use anyhow::{bail, Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use tracing::{debug, info};

/// Entities parsed from one batch since the last flush.
#[derive(Debug, Default)]
pub struct BatchData {
    pub products: Vec<Product>,
    pub categories: FxHashMap<String, CategoryPath>,
    pub reviews: FxHashMap<String, Review>,
    pub customers: FxHashMap<String, CustomerHistory>,
}

impl BatchData {
    /// Entities held in memory; drives the flush cadence.
    pub fn entity_count(&self) -> usize {
        self.products.len() + self.reviews.len() + self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0 && self.customers.is_empty()
    }

    /// Splits into per-dataset vectors, each sorted by id.
    pub fn into_sorted_parts(
        self,
    ) -> (
        Vec<Product>,
        Vec<CategoryPath>,
        Vec<Review>,
        Vec<CustomerHistory>,
    ) {
        let mut products = self.products;
        products.sort_by_key(|p| p.id);

        let mut categories: Vec<CategoryPath> = self.categories.into_values().collect();
        categories.sort_by(|a, b| a.id.cmp(&b.id));

        let mut reviews: Vec<Review> = self.reviews.into_values().collect();
        reviews.sort_by(|a, b| a.id.cmp(&b.id));

        let mut customers: Vec<CustomerHistory> = self.customers.into_values().collect();
        customers.sort_by(|a, b| a.customer.cmp(&b.customer));

        (products, categories, reviews, customers)
    }
}

/// The record currently being scanned.
struct OpenRecord {
    product: Product,
    reviews: ReviewAggregate,
    review_ids: FxHashSet<String>,
    depths: Vec<u32>,
}

impl OpenRecord {
    fn new(id: u64) -> Self {
        Self {
            product: Product::new(id),
            reviews: ReviewAggregate::new(),
            review_ids: FxHashSet::default(),
            depths: Vec::new(),
        }
    }
}

/// Single-pass line state machine for one batch file.
///
/// Feed lines in order; whenever a finalized record pushes the in-memory
/// entity count to the flush threshold, `feed` hands back the accumulated
/// [`BatchData`]. Records are only ever finalized whole, so a flush never
/// splits a product's fields.
pub struct BatchParser {
    batch: u32,
    flush_threshold: usize,
    data: BatchData,
    current: Option<OpenRecord>,
    path_ids: FxHashMap<String, String>,
}

impl BatchParser {
    pub fn new(batch: u32, flush_threshold: usize) -> Self {
        Self {
            batch,
            flush_threshold: flush_threshold.max(1),
            data: BatchData::default(),
            current: None,
            path_ids: FxHashMap::default(),
        }
    }

    pub fn feed(&mut self, line_no: usize, line: &str) -> Result<Option<BatchData>> {
        match classify(line) {
            LineKind::Comment => Ok(None),
            LineKind::Blank => {
                if self.current.is_some() {
                    self.finalize();
                    Ok(self.take_if_full())
                } else {
                    Ok(None)
                }
            }
            LineKind::Header(raw) => {
                let flushed = if self.current.is_some() {
                    self.finalize();
                    self.take_if_full()
                } else {
                    None
                };
                let id = raw.parse::<u64>().with_context(|| {
                    format!(
                        "Batch {}: invalid product Id {:?} at line {}",
                        self.batch, raw, line_no
                    )
                })?;
                self.current = Some(OpenRecord::new(id));
                Ok(flushed)
            }
            // Forward compatibility: attribute lines we do not know are skipped
            LineKind::Scalar(Keyword::Unknown, _) => Ok(None),
            kind => {
                if self.current.is_none() {
                    bail!(
                        "Batch {}: line {} appears before any Id header",
                        self.batch,
                        line_no
                    );
                }
                match kind {
                    LineKind::Scalar(keyword, value) => self.apply_scalar(keyword, value),
                    LineKind::CategoryPath(path) => self.add_category(path),
                    LineKind::Review(raw) => self.add_review(line_no, raw)?,
                    _ => {}
                }
                Ok(None)
            }
        }
    }

    /// Finalizes the open record and returns everything not yet flushed.
    pub fn finish(mut self) -> BatchData {
        self.finalize();
        std::mem::take(&mut self.data)
    }

    fn apply_scalar(&mut self, keyword: Keyword, value: &str) {
        let Some(record) = self.current.as_mut() else {
            return;
        };
        let product = &mut record.product;

        match keyword {
            Keyword::Asin => product.asin = value.to_string(),
            Keyword::Title => product.title = Some(value.to_string()),
            Keyword::Group => product.group = Some(value.to_string()),
            Keyword::SalesRank => {
                product.salesrank = value.parse().ok();
                if product.salesrank.is_none() {
                    debug!(product = product.id, value, "Unparseable salesrank");
                }
            }
            Keyword::Similar => product.similar = parse_similar(value),
            Keyword::Reviews => match parse_review_summary(value) {
                Some(summary) => {
                    product.reviews_total = Some(summary.total);
                    product.reviews_downloaded = Some(summary.downloaded);
                    product.reviews_avg_rating = Some(summary.avg_rating);
                }
                None => debug!(product = product.id, value, "Unparseable review summary"),
            },
            Keyword::Discontinued => product.discontinued = true,
            // Path count is recomputed from the path lines themselves
            Keyword::Categories | Keyword::Unknown => {}
        }
    }

    fn add_category(&mut self, path: &str) {
        let Some(record) = self.current.as_mut() else {
            return;
        };

        let id = match self.path_ids.get(path) {
            Some(id) => id.clone(),
            None => {
                let id = category_id(path);
                self.path_ids.insert(path.to_string(), id.clone());
                id
            }
        };
        if record.product.category_ids.contains(&id) {
            return;
        }

        let depth = category_depth(path);
        record.depths.push(depth);
        record.product.category_ids.push(id.clone());

        let node = self
            .data
            .categories
            .entry(id)
            .or_insert_with_key(|id| CategoryPath {
                id: id.clone(),
                path: path.to_string(),
                depth,
                products: Vec::new(),
            });
        node.products.push(record.product.asin.clone());
    }

    fn add_review(&mut self, line_no: usize, raw: &str) -> Result<()> {
        let batch = self.batch;
        let Some(record) = self.current.as_mut() else {
            return Ok(());
        };

        let fields = parse_review_line(raw)
            .with_context(|| format!("Batch {}: malformed review at line {}", batch, line_no))?;
        let id = review_id(record.product.id, raw);
        if !record.review_ids.insert(id.clone()) {
            debug!(product = record.product.id, line = line_no, "Duplicate review line");
            return Ok(());
        }

        let ratio = helpful_ratio(fields.helpful, fields.votes);
        let weighted = weighted_rating(fields.rating, ratio);
        record.reviews.push(ReviewSample {
            date: fields.date,
            reviewer: &fields.customer,
            rating: fields.rating,
            votes: fields.votes,
            helpful_ratio: ratio,
            weighted_rating: weighted,
        });

        let review = Review {
            id: id.clone(),
            product_id: record.product.id,
            asin: record.product.asin.clone(),
            customer: fields.customer,
            date: fields.date,
            rating: fields.rating,
            votes: fields.votes,
            helpful: fields.helpful,
            helpful_ratio: ratio,
            weighted_rating: weighted,
        };

        self.data
            .customers
            .entry(review.customer.clone())
            .or_insert_with_key(|customer| CustomerHistory {
                customer: customer.clone(),
                entries: Vec::new(),
            })
            .entries
            .push(CustomerReview::from(&review));
        self.data.reviews.insert(id, review);
        Ok(())
    }

    /// Attaches derived statistics and moves the open product into the batch.
    fn finalize(&mut self) {
        let Some(record) = self.current.take() else {
            return;
        };
        let OpenRecord {
            mut product,
            reviews,
            depths,
            ..
        } = record;

        if product.discontinued {
            product.mark_discontinued();
        } else {
            product.reviews = reviews.finish();
            product.categories = category_stats(&depths);
        }
        self.data.products.push(product);
    }

    fn take_if_full(&mut self) -> Option<BatchData> {
        if self.data.entity_count() >= self.flush_threshold {
            Some(std::mem::take(&mut self.data))
        } else {
            None
        }
    }
}

/// Writes flushed chunks of one batch to the run store.
struct ChunkSink<'a> {
    store: &'a RunStore,
    stats: &'a PipelineStats,
    manifest: BatchManifest,
}

impl ChunkSink<'_> {
    fn write(&mut self, data: BatchData) -> Result<()> {
        let batch = self.manifest.batch;
        let chunk = self.manifest.chunks;
        let (products, categories, reviews, customers) = data.into_sorted_parts();

        if !products.is_empty() {
            self.store
                .write_chunk(Dataset::Product, batch, chunk, &products)?;
        }
        if !categories.is_empty() {
            self.store
                .write_chunk(Dataset::Category, batch, chunk, &categories)?;
        }
        if !reviews.is_empty() {
            self.store.write_chunk(Dataset::Review, batch, chunk, &reviews)?;
        }
        if !customers.is_empty() {
            self.store
                .write_chunk(Dataset::Customer, batch, chunk, &customers)?;
        }

        self.manifest.chunks += 1;
        self.manifest.products += products.len() as u64;
        self.manifest.reviews += reviews.len() as u64;
        self.manifest.category_paths += categories.len() as u64;
        self.manifest.customers += customers.len() as u64;

        self.stats.add_products(products.len() as u64);
        self.stats.add_reviews(reviews.len() as u64);
        self.stats.add_category_paths(categories.len() as u64);
        self.stats.inc_chunks_flushed();
        Ok(())
    }
}

/// Parses one batch file into the run store and returns its manifest.
///
/// Artifacts left by an earlier attempt at the same batch are removed first;
/// the manifest is written last so its presence means the batch is complete.
pub fn load_split(
    batch: &BatchFile,
    store: &RunStore,
    flush_threshold: usize,
    stats: &PipelineStats,
) -> Result<BatchManifest> {
    store.clear_batch(batch.index)?;

    let file = File::open(&batch.path)
        .with_context(|| format!("Failed to open batch file: {:?}", batch.path))?;
    let reader = BufReader::with_capacity(256 * 1024, file);

    let mut parser = BatchParser::new(batch.index, flush_threshold);
    let mut sink = ChunkSink {
        store,
        stats,
        manifest: BatchManifest {
            version: ARTIFACT_VERSION,
            run_id: store.run_id().to_string(),
            batch: batch.index,
            ..Default::default()
        },
    };

    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read batch file: {:?}", batch.path))?;
        if let Some(chunk) = parser.feed(i + 1, &line)? {
            sink.write(chunk)?;
        }
    }

    let rest = parser.finish();
    if !rest.is_empty() {
        sink.write(rest)?;
    }

    store.write_manifest(&sink.manifest)?;
    stats.inc_batches_parsed();

    info!(
        batch = batch.index,
        chunks = sink.manifest.chunks,
        products = sink.manifest.products,
        reviews = sink.manifest.reviews,
        "Batch parsed"
    );
    Ok(sink.manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    const RECORDS: &str = "Id:   1
ASIN: 0827229534
  title: Patterns of Preaching: A Sermon Sampler
  group: Book
  salesrank: 396585
  similar: 5  0804215715  156101074X  0687023955  0687074231  082721619X
  categories: 2
   |Books[283155]|Subjects[1000]|Religion & Spirituality[22]|Christianity[12290]|Clergy[12360]|Preaching[12368]
   |Books[283155]|Subjects[1000]|Religion & Spirituality[22]|Christianity[12290]|Clergy[12360]|Sermons[12370]
  reviews: total: 2  downloaded: 2  avg rating: 5
    2000-7-28  cutomer: A2JW67OY8U6HHK  rating: 5  votes:  10  helpful:   9
    2003-12-14  cutomer: A2VE83MZF98ITY  rating: 5  votes:   6  helpful:   5

Id:   2
ASIN: 0738700797
  title: Candlemas: Feast of Flames
  group: Book
  salesrank: 168596
  similar: 0
  categories: 1
   |Books[283155]|Subjects[1000]|Religion & Spirituality[22]|Earth-Based Religions[12472]|Wicca[12484]
  reviews: total: 3  downloaded: 3  avg rating: 4
    2001-12-16  cutomer: A11NCO6YTE4BTJ  rating: 5  votes:   5  helpful:   4
    2002-1-7  cutomer: A9CQ3PLRNIR83  rating: 4  votes:   5  helpful:   5
    2002-1-24  cutomer: A11NCO6YTE4BTJ  rating: 3  votes:   0  helpful:   0

Id:   3
ASIN: 0771044445
  discontinued product

Id:   4
ASIN: 0486287785
  title: World War II Allied Fighter Planes Trading Cards
  group: Book
  salesrank: 1270652
  similar: 0
  categories: 0
  reviews: total: 0  downloaded: 0  avg rating: 0
";

    fn parse_all(text: &str, threshold: usize) -> Result<Vec<BatchData>> {
        let mut parser = BatchParser::new(0, threshold);
        let mut chunks = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if let Some(chunk) = parser.feed(i + 1, line)? {
                chunks.push(chunk);
            }
        }
        chunks.push(parser.finish());
        Ok(chunks)
    }

    fn product(data: &BatchData, id: u64) -> &Product {
        data.products.iter().find(|p| p.id == id).unwrap()
    }

    #[test]
    fn parses_scalar_fields() {
        let chunks = parse_all(RECORDS, usize::MAX).unwrap();
        assert_eq!(chunks.len(), 1);
        let p = product(&chunks[0], 1);

        assert_eq!(p.asin, "0827229534");
        assert_eq!(
            p.title.as_deref(),
            Some("Patterns of Preaching: A Sermon Sampler")
        );
        assert_eq!(p.group.as_deref(), Some("Book"));
        assert_eq!(p.salesrank, Some(396585));
        assert_eq!(p.similar.len(), 5);
        assert_eq!(p.reviews_total, Some(2));
        assert_eq!(p.reviews_avg_rating, Some(5.0));
        assert_eq!(p.category_ids.len(), 2);
    }

    #[test]
    fn computes_review_statistics() {
        let chunks = parse_all(RECORDS, usize::MAX).unwrap();
        let stats = product(&chunks[0], 2).reviews.clone().unwrap();

        assert_eq!(stats.count, 3);
        assert_eq!(stats.rating_avg, 4.0);
        assert_eq!(stats.votes_total, 10);
        assert_eq!(stats.unique_reviewers, 2);
        // 2001-12-16 -> 2002-1-7 -> 2002-1-24: gaps of 22 and 17 days
        assert_eq!(stats.mttr, 19.5);
        // ratios 0.8, 1.0, 0.0
        assert_eq!(stats.helpful_ratio_avg, 0.6);
        assert_eq!(stats.weighted_rating_avg, 3.0);
    }

    #[test]
    fn computes_category_statistics() {
        let chunks = parse_all(RECORDS, usize::MAX).unwrap();
        let cats = product(&chunks[0], 1).categories.clone().unwrap();
        assert_eq!(cats.count, 2);
        assert_eq!(cats.depth_avg, 6.0);
        assert_eq!(cats.depth_std, 0.0);
    }

    #[test]
    fn products_without_reviews_have_no_review_stats() {
        let chunks = parse_all(RECORDS, usize::MAX).unwrap();
        let p = product(&chunks[0], 4);
        assert!(p.reviews.is_none());
        assert!(p.categories.is_none());
    }

    #[test]
    fn discontinued_record_yields_empty_product() {
        let chunks = parse_all(RECORDS, usize::MAX).unwrap();
        let p = product(&chunks[0], 3);
        assert!(p.discontinued);
        assert_eq!(p.asin, "0771044445");
        assert!(p.title.is_none());
        assert!(p.reviews.is_none());
    }

    #[test]
    fn reviews_and_customers_are_collected() {
        let chunks = parse_all(RECORDS, usize::MAX).unwrap();
        let data = &chunks[0];
        assert_eq!(data.reviews.len(), 5);

        let history = &data.customers["A11NCO6YTE4BTJ"];
        assert_eq!(history.entries.len(), 2);
        assert!(history.entries.iter().all(|e| e.asin == "0738700797"));

        let review = data
            .reviews
            .values()
            .find(|r| r.customer == "A2JW67OY8U6HHK")
            .unwrap();
        assert_eq!(review.date, NaiveDate::from_ymd_opt(2000, 7, 28).unwrap());
        assert_eq!(review.helpful_ratio, 0.9);
        assert_eq!(review.weighted_rating, 5.0);
        assert_eq!(review.product_id, 1);
    }

    #[test]
    fn shared_category_path_gets_one_node() {
        let text = "Id: 1\nASIN: A\n   |Books|Fiction\n\nId: 2\nASIN: B\n   |Books|Fiction\n";
        let chunks = parse_all(text, usize::MAX).unwrap();
        let data = &chunks[0];
        assert_eq!(data.categories.len(), 1);
        let node = data.categories.values().next().unwrap();
        assert_eq!(node.products, vec!["A", "B"]);
        assert_eq!(node.depth, 2);
        assert_eq!(node.id, category_id("|Books|Fiction"));
    }

    #[test]
    fn flush_never_splits_a_record() {
        let chunks = parse_all(RECORDS, 1).unwrap();
        // every record crosses the threshold on its own
        let non_empty: Vec<&BatchData> = chunks.iter().filter(|c| !c.is_empty()).collect();
        assert_eq!(non_empty.len(), 4);
        for chunk in &non_empty {
            assert_eq!(chunk.products.len(), 1);
        }
        let p2 = non_empty
            .iter()
            .find_map(|c| c.products.iter().find(|p| p.id == 2))
            .unwrap();
        assert_eq!(p2.reviews.as_ref().unwrap().count, 3);
        let chunk_with_p2 = non_empty.iter().find(|c| c.products[0].id == 2).unwrap();
        assert_eq!(chunk_with_p2.reviews.len(), 3);
    }

    #[test]
    fn line_before_header_is_error() {
        let err = parse_all("ASIN: 0827229534\nId: 1\n", 10).unwrap_err();
        assert!(err.to_string().contains("before any Id header"));
    }

    #[test]
    fn unknown_keywords_are_ignored() {
        let text = "Total items: 2\n\nId: 9\nASIN: X\n  edition: Paperback\n";
        let chunks = parse_all(text, 10).unwrap();
        assert_eq!(chunks[0].products.len(), 1);
        assert_eq!(chunks[0].products[0].asin, "X");
    }

    #[test]
    fn header_without_blank_line_finalizes_previous() {
        let text = "Id: 1\nASIN: A\nId: 2\nASIN: B\n";
        let chunks = parse_all(text, 10).unwrap();
        let ids: Vec<u64> = chunks[0].products.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn duplicate_review_line_counted_once() {
        let review = "    2001-1-1  cutomer: C  rating: 4  votes: 2  helpful: 1";
        let text = format!("Id: 1\nASIN: A\n{review}\n{review}\n");
        let chunks = parse_all(&text, 10).unwrap();
        assert_eq!(chunks[0].reviews.len(), 1);
        assert_eq!(chunks[0].products[0].reviews.as_ref().unwrap().count, 1);
        assert_eq!(chunks[0].customers["C"].entries.len(), 1);
    }

    #[test]
    fn malformed_review_is_error() {
        let text = "Id: 1\nASIN: A\n    2001-1-1  cutomer: C  rating: 4\n";
        assert!(parse_all(text, 10).is_err());
    }

    #[test]
    fn invalid_id_is_error() {
        assert!(parse_all("Id: abc\n", 10).is_err());
    }

    #[test]
    fn load_split_writes_artifacts_and_manifest() {
        let dir = TempDir::new().unwrap();
        let batch_path = dir.path().join("00007.txt");
        fs::write(&batch_path, RECORDS).unwrap();
        let batch = BatchFile {
            index: 7,
            path: batch_path,
        };
        let store = RunStore::new(dir.path().join("artifacts"), "r1");
        let stats = PipelineStats::new();

        let manifest = load_split(&batch, &store, 5, &stats).unwrap();

        assert!(manifest.chunks >= 2);
        assert_eq!(manifest.products, 4);
        assert_eq!(manifest.reviews, 5);
        assert_eq!(stats.products(), 4);
        assert_eq!(stats.batches_parsed(), 1);
        assert_eq!(store.load_manifest(7).unwrap(), Some(manifest));

        let products: usize = store
            .list(Dataset::Product)
            .unwrap()
            .iter()
            .map(|a| store.read_chunk::<Product>(a).unwrap().len())
            .sum();
        assert_eq!(products, 4);
    }

    #[test]
    fn load_split_failure_leaves_no_manifest() {
        let dir = TempDir::new().unwrap();
        let batch_path = dir.path().join("00000.txt");
        fs::write(&batch_path, "  title: orphan\n").unwrap();
        let batch = BatchFile {
            index: 0,
            path: batch_path,
        };
        let store = RunStore::new(dir.path().join("artifacts"), "r1");

        assert!(load_split(&batch, &store, 10, &PipelineStats::new()).is_err());
        assert!(store.load_manifest(0).unwrap().is_none());
    }
}
