use crate::config::CATEGORY_SEPARATOR;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt::Write;

static REVIEW_DATE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})\s").unwrap());

static KEY_VALUE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z][A-Za-z ]*?):\s*(\S+)").unwrap());

static REVIEW_SUMMARY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"total:\s*(\d+)\s+downloaded:\s*(\d+)\s+avg rating:\s*([0-9.]+)").unwrap()
});

/// Bytes of the SHA-256 digest kept for content ids (32 hex chars).
const CONTENT_ID_BYTES: usize = 16;

/// Attribute keywords of a product record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Asin,
    Title,
    Group,
    SalesRank,
    Similar,
    Categories,
    Reviews,
    Discontinued,
    Unknown,
}

impl Keyword {
    fn lookup(key: &str) -> Self {
        match key {
            "ASIN" => Keyword::Asin,
            "title" => Keyword::Title,
            "group" => Keyword::Group,
            "salesrank" => Keyword::SalesRank,
            "similar" => Keyword::Similar,
            "categories" => Keyword::Categories,
            "reviews" => Keyword::Reviews,
            _ => Keyword::Unknown,
        }
    }
}

/// One line of the dump, classified once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind<'a> {
    Blank,
    Comment,
    /// `Id:   <n>`, carrying the raw id text
    Header(&'a str),
    Scalar(Keyword, &'a str),
    CategoryPath(&'a str),
    Review(&'a str),
}

pub fn classify(line: &str) -> LineKind<'_> {
    let trimmed = line.trim();

    if trimmed.is_empty() {
        return LineKind::Blank;
    }
    if trimmed.starts_with('#') {
        return LineKind::Comment;
    }
    if trimmed.starts_with(CATEGORY_SEPARATOR) {
        return LineKind::CategoryPath(trimmed);
    }
    if REVIEW_DATE_REGEX.is_match(trimmed) {
        return LineKind::Review(trimmed);
    }
    if trimmed == "discontinued product" {
        return LineKind::Scalar(Keyword::Discontinued, "");
    }

    match trimmed.split_once(':') {
        Some(("Id", value)) => LineKind::Header(value.trim()),
        Some((key, value)) => LineKind::Scalar(Keyword::lookup(key.trim()), value.trim()),
        None => LineKind::Scalar(Keyword::Unknown, trimmed),
    }
}

/// `5  0804215715  156101074X ...` -> the ASINs after the leading count.
pub fn parse_similar(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .skip(1)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReviewSummary {
    pub total: u32,
    pub downloaded: u32,
    pub avg_rating: f64,
}

/// Parses the value of a `reviews:` line.
pub fn parse_review_summary(value: &str) -> Option<ReviewSummary> {
    let caps = REVIEW_SUMMARY_REGEX.captures(value)?;
    Some(ReviewSummary {
        total: caps[1].parse().ok()?,
        downloaded: caps[2].parse().ok()?,
        avg_rating: caps[3].parse().ok()?,
    })
}

/// Fields of a dated review line.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewFields {
    pub date: NaiveDate,
    pub customer: String,
    pub rating: u32,
    pub votes: u32,
    pub helpful: u32,
}

/// Parses `2000-7-28  cutomer: A2JW67OY8U6HHK  rating: 5  votes:  10  helpful:   9`.
///
/// The dump misspells `customer` as `cutomer`; both spellings are accepted.
/// Unknown keys are ignored, missing required keys are an error.
pub fn parse_review_line(line: &str) -> Result<ReviewFields> {
    let line = line.trim();
    let caps = REVIEW_DATE_REGEX
        .captures(line)
        .with_context(|| format!("Review line has no leading date: {line}"))?;
    let date = parse_date(&caps[1], &caps[2], &caps[3])
        .with_context(|| format!("Invalid review date in: {line}"))?;

    let rest = &line[caps.get(0).map(|m| m.end()).unwrap_or(0)..];
    let mut customer = None;
    let mut rating = None;
    let mut votes = None;
    let mut helpful = None;

    for kv in KEY_VALUE_REGEX.captures_iter(rest) {
        let value = &kv[2];
        match kv[1].trim() {
            "customer" | "cutomer" => customer = Some(value.to_string()),
            "rating" => rating = Some(parse_count(value, "rating", line)?),
            "votes" => votes = Some(parse_count(value, "votes", line)?),
            "helpful" => helpful = Some(parse_count(value, "helpful", line)?),
            _ => {}
        }
    }

    match (customer, rating, votes, helpful) {
        (Some(customer), Some(rating), Some(votes), Some(helpful)) => Ok(ReviewFields {
            date,
            customer,
            rating,
            votes,
            helpful,
        }),
        _ => bail!("Review line is missing customer, rating, votes or helpful: {line}"),
    }
}

fn parse_count(value: &str, field: &str, line: &str) -> Result<u32> {
    value
        .parse()
        .with_context(|| format!("Invalid {field} value {value:?} in: {line}"))
}

fn parse_date(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

/// Number of separators in a category path.
pub fn category_depth(path: &str) -> u32 {
    path.matches(CATEGORY_SEPARATOR).count() as u32
}

/// Content-addressed id: the same parts always yield the same id, in any
/// process. Parts are joined with a unit separator before hashing.
pub fn content_id(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part);
    }
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(CONTENT_ID_BYTES * 2);
    for b in &digest[..CONTENT_ID_BYTES] {
        let _ = write!(hex, "{:02x}", b);
    }
    hex
}

pub fn category_id(path: &str) -> String {
    content_id(&[path.as_bytes()])
}

pub fn review_id(product_id: u64, raw_line: &str) -> String {
    let mut buf = itoa::Buffer::new();
    content_id(&[buf.format(product_id).as_bytes(), raw_line.trim().as_bytes()])
}
