//! Sort strategies and offset/limit pagination over the merged set.

use crate::models::{SearchResult, SortKey};

/// Applies the requested sort strategy in place.
///
/// `relevance` is the merge order as produced and performs no re-sort.
/// Sorts are stable, so equal keys keep their merge order. Items without
/// a cached trending/velocity score rank as zero.
pub fn sort_results(results: &mut [SearchResult], sort_by: SortKey) {
    match sort_by {
        SortKey::Relevance => {}
        SortKey::Trending => results.sort_by(|a, b| {
            let left = b.trending_score.unwrap_or(0.0);
            let right = a.trending_score.unwrap_or(0.0);
            left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal)
        }),
        SortKey::Recent => results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
        SortKey::Popular => results.sort_by(|a, b| b.engagement.cmp(&a.engagement)),
        SortKey::Velocity => results.sort_by(|a, b| {
            let left = b.velocity_score.unwrap_or(0.0);
            let right = a.velocity_score.unwrap_or(0.0);
            left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
}

/// Slices one page out of the sorted set.
///
/// Returns `(page, total, has_more)` where `total` is the size of the
/// full sorted set and `has_more` holds iff the page came back full.
pub fn paginate(
    results: Vec<SearchResult>,
    offset: i64,
    limit: i64,
) -> (Vec<SearchResult>, usize, bool) {
    let total = results.len();
    let start = (offset.max(0) as usize).min(total);
    let end = start.saturating_add(limit.max(0) as usize).min(total);
    let page: Vec<SearchResult> = results[start..end].to_vec();
    let has_more = page.len() as i64 == limit;
    (page, total, has_more)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use chrono::{Duration, Utc};

    fn result(
        id: &str,
        engagement: i64,
        hours_old: i64,
        trending: Option<f64>,
        velocity: Option<f64>,
    ) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            source_type: SourceType::Trend,
            title: id.to_string(),
            description: None,
            url: None,
            category: None,
            tags: Vec::new(),
            language: None,
            engagement,
            trending_score: trending,
            velocity_score: velocity,
            timestamp: Utc::now() - Duration::hours(hours_old),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_recent_sort_timestamps_non_increasing() {
        let mut results = vec![
            result("a", 0, 5, None, None),
            result("b", 0, 1, None, None),
            result("c", 0, 10, None, None),
        ];
        sort_results(&mut results, SortKey::Recent);

        for pair in results.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    #[test]
    fn test_popular_sort_engagement_non_increasing() {
        let mut results = vec![
            result("a", 10, 0, None, None),
            result("b", 500, 0, None, None),
            result("c", 50, 0, None, None),
        ];
        sort_results(&mut results, SortKey::Popular);

        for pair in results.windows(2) {
            assert!(pair[0].engagement >= pair[1].engagement);
        }
    }

    #[test]
    fn test_trending_sort_missing_score_is_zero() {
        let mut results = vec![
            result("unscored", 0, 0, None, None),
            result("scored", 0, 0, Some(42.0), None),
        ];
        sort_results(&mut results, SortKey::Trending);

        assert_eq!(results[0].id, "scored");
        assert_eq!(results[1].id, "unscored");
    }

    #[test]
    fn test_velocity_sort_missing_score_is_zero() {
        let mut results = vec![
            result("slow", 0, 0, None, Some(1.5)),
            result("fast", 0, 0, None, Some(9.0)),
            result("unscored", 0, 0, None, None),
        ];
        sort_results(&mut results, SortKey::Velocity);

        assert_eq!(results[0].id, "fast");
        assert_eq!(results[2].id, "unscored");
    }

    #[test]
    fn test_relevance_keeps_merge_order() {
        let mut results = vec![
            result("first", 1, 9, None, None),
            result("second", 99, 0, None, None),
        ];
        sort_results(&mut results, SortKey::Relevance);

        assert_eq!(results[0].id, "first");
        assert_eq!(results[1].id, "second");
    }

    #[test]
    fn test_paginate_bounds() {
        let results: Vec<SearchResult> = (0..25)
            .map(|i| result(&i.to_string(), 0, 0, None, None))
            .collect();

        let (page, total, has_more) = paginate(results.clone(), 0, 10);
        assert_eq!(page.len(), 10);
        assert_eq!(total, 25);
        assert!(has_more);
        assert!(page.len() <= total);

        let (page, total, has_more) = paginate(results.clone(), 20, 10);
        assert_eq!(page.len(), 5);
        assert_eq!(total, 25);
        assert!(!has_more);

        let (page, _, has_more) = paginate(results, 100, 10);
        assert!(page.is_empty());
        assert!(!has_more);
    }

    #[test]
    fn test_has_more_iff_full_page() {
        let results: Vec<SearchResult> = (0..10)
            .map(|i| result(&i.to_string(), 0, 0, None, None))
            .collect();

        let (page, _, has_more) = paginate(results.clone(), 0, 10);
        assert_eq!(page.len(), 10);
        assert!(has_more);

        let (page, _, has_more) = paginate(results, 5, 10);
        assert_eq!(page.len(), 5);
        assert!(!has_more);
    }
}
