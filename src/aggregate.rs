use crate::config::STAT_PRECISION;
use crate::models::{CategoryStats, ReviewStats};
use chrono::NaiveDate;
use rustc_hash::FxHashSet;

/// Streaming mean / population standard deviation (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    sum: f64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Population standard deviation, 0 when empty.
    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

impl Extend<f64> for RunningStats {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

impl FromIterator<f64> for RunningStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stats = RunningStats::new();
        stats.extend(iter);
        stats
    }
}

pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

pub fn round(value: f64) -> f64 {
    round_to(value, STAT_PRECISION)
}

/// `helpful / votes`, 0 when there are no votes.
pub fn helpful_ratio(helpful: u32, votes: u32) -> f64 {
    if votes == 0 {
        0.0
    } else {
        round(helpful as f64 / votes as f64)
    }
}

/// Rating weighted by helpfulness, 0 when nobody found the review helpful.
///
/// NOTE: `rating * ratio / ratio` is the rating itself for any non-zero ratio.
/// Kept as the established derivation; consumers should not read it as a
/// helpfulness-adjusted score.
pub fn weighted_rating(rating: u32, helpful_ratio: f64) -> f64 {
    if helpful_ratio == 0.0 {
        0.0
    } else {
        round(rating as f64 * helpful_ratio / helpful_ratio)
    }
}

/// Mean gap in days between consecutive dates after sorting; 0 for fewer than two.
pub fn mean_days_between(dates: &mut [NaiveDate]) -> f64 {
    if dates.len() < 2 {
        return 0.0;
    }
    dates.sort_unstable();
    let gaps: RunningStats = dates
        .windows(2)
        .map(|w| (w[1] - w[0]).num_days() as f64)
        .collect();
    round(gaps.mean())
}

/// One review's contribution to a review aggregate.
#[derive(Debug, Clone, Copy)]
pub struct ReviewSample<'a> {
    pub date: NaiveDate,
    pub reviewer: &'a str,
    pub rating: u32,
    pub votes: u32,
    pub helpful_ratio: f64,
    pub weighted_rating: f64,
}

/// Accumulates the review-derived statistics of one product or customer.
#[derive(Debug, Default)]
pub struct ReviewAggregate {
    rating: RunningStats,
    votes: RunningStats,
    helpful_ratio: RunningStats,
    weighted_rating: RunningStats,
    votes_total: u64,
    dates: Vec<NaiveDate>,
    reviewers: FxHashSet<String>,
}

impl ReviewAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: ReviewSample<'_>) {
        self.rating.push(sample.rating as f64);
        self.votes.push(sample.votes as f64);
        self.helpful_ratio.push(sample.helpful_ratio);
        self.weighted_rating.push(sample.weighted_rating);
        self.votes_total += sample.votes as u64;
        self.dates.push(sample.date);
        if !self.reviewers.contains(sample.reviewer) {
            self.reviewers.insert(sample.reviewer.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rating.count() == 0
    }

    /// `None` when nothing was pushed.
    pub fn finish(mut self) -> Option<ReviewStats> {
        if self.is_empty() {
            return None;
        }
        Some(ReviewStats {
            count: self.rating.count(),
            rating_avg: round(self.rating.mean()),
            rating_std: round(self.rating.std_dev()),
            votes_total: self.votes_total,
            votes_avg: round(self.votes.mean()),
            votes_std: round(self.votes.std_dev()),
            helpful_ratio_avg: round(self.helpful_ratio.mean()),
            helpful_ratio_std: round(self.helpful_ratio.std_dev()),
            weighted_rating_avg: round(self.weighted_rating.mean()),
            weighted_rating_std: round(self.weighted_rating.std_dev()),
            mttr: mean_days_between(&mut self.dates),
            unique_reviewers: self.reviewers.len() as u64,
        })
    }
}

/// Category-path statistics from path depths; `None` for no paths.
pub fn category_stats(depths: &[u32]) -> Option<CategoryStats> {
    if depths.is_empty() {
        return None;
    }
    let stats: RunningStats = depths.iter().map(|&d| d as f64).collect();
    Some(CategoryStats {
        count: stats.count(),
        depth_avg: round(stats.mean()),
        depth_std: round(stats.std_dev()),
    })
}
