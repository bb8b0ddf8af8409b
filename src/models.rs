use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The four datasets a run exports, in collation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dataset {
    Product,
    Category,
    Review,
    Customer,
}

impl Dataset {
    pub const ALL: [Dataset; 4] = [
        Dataset::Product,
        Dataset::Category,
        Dataset::Review,
        Dataset::Customer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Dataset::Product => "product",
            Dataset::Category => "category",
            Dataset::Review => "review",
            Dataset::Customer => "customer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Dataset::ALL.into_iter().find(|d| d.name() == name)
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A batch file produced by the splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub index: u32,
    pub path: PathBuf,
}

/// Review-derived statistics shared by products and customers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewStats {
    pub count: u64,
    pub rating_avg: f64,
    pub rating_std: f64,
    pub votes_total: u64,
    pub votes_avg: f64,
    pub votes_std: f64,
    pub helpful_ratio_avg: f64,
    pub helpful_ratio_std: f64,
    pub weighted_rating_avg: f64,
    pub weighted_rating_std: f64,
    /// Mean days between consecutive reviews, 0 with fewer than two reviews
    pub mttr: f64,
    pub unique_reviewers: u64,
}

/// Review statistics of one customer, computed over the merged history.
pub type CustomerStats = ReviewStats;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub count: u64,
    pub depth_avg: f64,
    pub depth_std: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: u64,
    pub asin: String,
    pub title: Option<String>,
    pub group: Option<String>,
    pub salesrank: Option<i64>,
    pub similar: Vec<String>,
    pub reviews_total: Option<u32>,
    pub reviews_downloaded: Option<u32>,
    pub reviews_avg_rating: Option<f64>,
    pub discontinued: bool,
    pub category_ids: Vec<String>,
    /// Populated at finalization, `None` when the product has no reviews
    pub reviews: Option<ReviewStats>,
    /// Populated at finalization, `None` when the product has no category paths
    pub categories: Option<CategoryStats>,
}

impl Product {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Clears every descriptive and derived field; the id and ASIN survive.
    pub fn mark_discontinued(&mut self) {
        self.discontinued = true;
        self.title = None;
        self.group = None;
        self.salesrank = None;
        self.similar.clear();
        self.reviews_total = None;
        self.reviews_downloaded = None;
        self.reviews_avg_rating = None;
        self.category_ids.clear();
        self.reviews = None;
        self.categories = None;
    }
}

/// A category path node, identified by the content hash of its path text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPath {
    pub id: String,
    pub path: String,
    pub depth: u32,
    /// ASINs that declared this path within the chunk
    pub products: Vec<String>,
}

impl CategoryPath {
    /// Leaf segment of the path, e.g. `Preaching[12368]`.
    pub fn leaf(&self) -> &str {
        self.path
            .rsplit(crate::config::CATEGORY_SEPARATOR)
            .find(|s| !s.is_empty())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub product_id: u64,
    pub asin: String,
    pub customer: String,
    pub date: NaiveDate,
    pub rating: u32,
    pub votes: u32,
    pub helpful: u32,
    pub helpful_ratio: f64,
    pub weighted_rating: f64,
}

/// A review as seen from the customer's side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerReview {
    pub review_id: String,
    pub product_id: u64,
    pub asin: String,
    pub date: NaiveDate,
    pub rating: u32,
    pub votes: u32,
    pub helpful: u32,
    pub helpful_ratio: f64,
    pub weighted_rating: f64,
}

impl From<&Review> for CustomerReview {
    fn from(review: &Review) -> Self {
        Self {
            review_id: review.id.clone(),
            product_id: review.product_id,
            asin: review.asin.clone(),
            date: review.date,
            rating: review.rating,
            votes: review.votes,
            helpful: review.helpful,
            helpful_ratio: review.helpful_ratio,
            weighted_rating: review.weighted_rating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerHistory {
    pub customer: String,
    pub entries: Vec<CustomerReview>,
}

/// A relationship row in an edge export.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: &'static str,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, kind: &'static str) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
        }
    }
}

pub const EDGE_SIMILAR: &str = "SIMILAR";
pub const EDGE_IN_CATEGORY: &str = "IN_CATEGORY";
pub const EDGE_REVIEW_OF: &str = "REVIEW_OF";
pub const EDGE_WROTE: &str = "WROTE";
