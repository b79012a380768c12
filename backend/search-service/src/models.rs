use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SearchError;

/// Hard cap on page size; bounds the merge cost of a single request.
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Per-source retrieval cap applied before merging.
pub const SOURCE_FETCH_CAP: i64 = 100;

/// The backing stores a searchable item can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Trend,
    Repo,
    KnowledgeEntry,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [
        SourceType::Trend,
        SourceType::Repo,
        SourceType::KnowledgeEntry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Trend => "trend",
            SourceType::Repo => "repo",
            SourceType::KnowledgeEntry => "knowledge_entry",
        }
    }

    pub fn parse(s: &str) -> Option<SourceType> {
        match s {
            "trend" => Some(SourceType::Trend),
            "repo" => Some(SourceType::Repo),
            "knowledge_entry" => Some(SourceType::KnowledgeEntry),
            _ => None,
        }
    }
}

/// Common projection of one item from any source store.
///
/// `id` is unique within a `source_type`, not globally; the pair is the
/// identity used for trending-score lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchableItem {
    pub id: String,
    pub source_type: SourceType,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub engagement: i64,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub language: Option<String>,
    /// Text-match relevance assigned by the retriever; 0 when no query ran.
    #[serde(skip)]
    pub text_score: f32,
}

/// Sort strategies applied to the merged result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Relevance,
    Trending,
    Recent,
    Popular,
    Velocity,
}

impl Default for SortKey {
    fn default() -> Self {
        SortKey::Relevance
    }
}

impl SortKey {
    pub fn parse(s: &str) -> Result<SortKey, SearchError> {
        match s {
            "relevance" => Ok(SortKey::Relevance),
            "trending" => Ok(SortKey::Trending),
            "recent" => Ok(SortKey::Recent),
            "popular" => Ok(SortKey::Popular),
            "velocity" => Ok(SortKey::Velocity),
            other => Err(SearchError::validation(
                "sort_by",
                format!("unknown sort key '{other}'"),
            )),
        }
    }
}

/// Generic filter set compiled by each retriever into its store's query.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchFilters {
    pub query: Option<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub languages: Vec<String>,
    /// Empty means all sources.
    pub sources: Vec<SourceType>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub min_engagement: Option<i64>,
    pub sort_by: SortKey,
    pub limit: i64,
    pub offset: i64,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            query: None,
            categories: Vec::new(),
            tags: Vec::new(),
            languages: Vec::new(),
            sources: Vec::new(),
            date_from: None,
            date_to: None,
            min_engagement: None,
            sort_by: SortKey::Relevance,
            limit: 20,
            offset: 0,
        }
    }
}

impl SearchFilters {
    /// Normalizes caller-supplied paging values and rejects inconsistent
    /// ranges. `limit` is clamped rather than rejected; a malformed date
    /// range is a caller error.
    pub fn validated(mut self) -> Result<Self, SearchError> {
        if self.limit < 1 {
            self.limit = 1;
        }
        if self.limit > MAX_PAGE_LIMIT {
            self.limit = MAX_PAGE_LIMIT;
        }
        if self.offset < 0 {
            return Err(SearchError::validation("offset", "must be non-negative"));
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(SearchError::validation(
                    "date_from",
                    "must not be later than date_to",
                ));
            }
        }
        if let Some(min) = self.min_engagement {
            if min < 0 {
                return Err(SearchError::validation(
                    "min_engagement",
                    "must be non-negative",
                ));
            }
        }
        Ok(self)
    }

    /// Sources selected by this filter set, in canonical merge order.
    pub fn selected_sources(&self) -> Vec<SourceType> {
        if self.sources.is_empty() {
            SourceType::ALL.to_vec()
        } else {
            let mut selected: Vec<SourceType> = SourceType::ALL
                .iter()
                .copied()
                .filter(|s| self.sources.contains(s))
                .collect();
            selected.dedup();
            selected
        }
    }
}

/// Cached composite ranking signals, keyed by `(item_type, item_id)`.
///
/// Written only by the batch recompute; the read path treats missing or
/// orphaned rows as absent scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendingScoreRow {
    pub item_type: SourceType,
    pub item_id: String,
    pub trending_score: f64,
    pub velocity_score: f64,
    pub engagement_score: f64,
    pub recency_score: f64,
    pub calculated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// One hour-granularity usage counter for a caller.
///
/// `daily_count` carries forward across hour buckets within the same
/// date; counters are increment-only within their hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub caller_id: String,
    pub bucket_date: NaiveDate,
    pub bucket_hour: i16,
    pub hourly_count: i64,
    pub daily_count: i64,
}

/// A named quota/feature profile. Immutable reference data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionTier {
    pub name: String,
    pub hourly_limit: i64,
    pub daily_limit: i64,
    pub features: Vec<String>,
}

impl SubscriptionTier {
    /// The well-known default tier applied when no active subscription
    /// exists or the referenced tier is missing.
    pub fn default_free(hourly_limit: i64, daily_limit: i64) -> Self {
        Self {
            name: "free".to_string(),
            hourly_limit,
            daily_limit,
            features: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaDenialReason {
    Hourly,
    Daily,
}

/// Outcome of a quota admission or read-only check.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<QuotaDenialReason>,
}

/// One entry of a facet breakdown, e.g. `{"name": "rust", "count": 12}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Facets {
    pub categories: Vec<FacetCount>,
    pub tags: Vec<FacetCount>,
    pub languages: Vec<FacetCount>,
    pub sources: Vec<FacetCount>,
}

/// A retriever that failed and was degraded to an empty result set.
#[derive(Debug, Clone, Serialize)]
pub struct DegradedSource {
    pub source: SourceType,
    pub error: String,
}

/// One ranked item on the response wire.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub engagement: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trending_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity_score: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SearchResponseBody {
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub has_more: bool,
    pub facets: Facets,
    pub search_id: Uuid,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<DegradedSource>,
}
