//! Facet aggregation over the merged, pre-pagination result set.

use std::collections::HashMap;

use crate::models::{FacetCount, Facets, SearchableItem};

const CATEGORY_FACET_LIMIT: usize = 10;
const TAG_FACET_LIMIT: usize = 20;
const LANGUAGE_FACET_LIMIT: usize = 15;

/// Tallies one facet dimension: descending count, ties broken by
/// ascending name so output is deterministic, truncated to `limit`
/// (`None` = unbounded).
fn tally(counts: HashMap<String, u64>, limit: Option<usize>) -> Vec<FacetCount> {
    let mut facets: Vec<FacetCount> = counts
        .into_iter()
        .map(|(name, count)| FacetCount { name, count })
        .collect();
    facets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    if let Some(limit) = limit {
        facets.truncate(limit);
    }
    facets
}

/// Computes all facet tallies over the full merged set. Items lacking an
/// attribute are excluded from that dimension (so per-dimension counts
/// sum to at most the merged total).
pub fn aggregate_facets(items: &[SearchableItem]) -> Facets {
    let mut categories: HashMap<String, u64> = HashMap::new();
    let mut tags: HashMap<String, u64> = HashMap::new();
    let mut languages: HashMap<String, u64> = HashMap::new();
    let mut sources: HashMap<String, u64> = HashMap::new();

    for item in items {
        if let Some(category) = &item.category {
            *categories.entry(category.clone()).or_insert(0) += 1;
        }
        for tag in &item.tags {
            *tags.entry(tag.clone()).or_insert(0) += 1;
        }
        if let Some(language) = &item.language {
            *languages.entry(language.clone()).or_insert(0) += 1;
        }
        *sources.entry(item.source_type.as_str().to_string()).or_insert(0) += 1;
    }

    Facets {
        categories: tally(categories, Some(CATEGORY_FACET_LIMIT)),
        tags: tally(tags, Some(TAG_FACET_LIMIT)),
        languages: tally(languages, Some(LANGUAGE_FACET_LIMIT)),
        sources: tally(sources, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use chrono::Utc;

    fn item(category: Option<&str>, tags: &[&str], language: Option<&str>) -> SearchableItem {
        SearchableItem {
            id: "x".to_string(),
            source_type: SourceType::Trend,
            title: "t".to_string(),
            description: None,
            url: None,
            timestamp: Utc::now(),
            engagement: 0,
            category: category.map(str::to_string),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            language: language.map(str::to_string),
            text_score: 0.0,
        }
    }

    #[test]
    fn test_facet_counts() {
        let items = vec![
            item(Some("ai"), &["ml", "llm"], Some("python")),
            item(Some("ai"), &["ml"], Some("rust")),
            item(Some("devops"), &[], None),
        ];

        let facets = aggregate_facets(&items);

        assert_eq!(facets.categories[0].name, "ai");
        assert_eq!(facets.categories[0].count, 2);
        assert_eq!(facets.tags[0].name, "ml");
        assert_eq!(facets.tags[0].count, 2);
        assert_eq!(facets.languages.len(), 2);
        assert_eq!(facets.sources[0].count, 3);
    }

    #[test]
    fn test_missing_attribute_excluded_from_dimension() {
        let items = vec![item(None, &[], None), item(Some("ai"), &[], None)];
        let facets = aggregate_facets(&items);

        let category_sum: u64 = facets.categories.iter().map(|f| f.count).sum();
        assert_eq!(category_sum, 1);
        assert!(category_sum <= items.len() as u64);
        assert!(facets.languages.is_empty());
    }

    #[test]
    fn test_equal_counts_break_ties_lexically() {
        let items = vec![
            item(Some("zeta"), &[], None),
            item(Some("alpha"), &[], None),
        ];
        let facets = aggregate_facets(&items);

        assert_eq!(facets.categories[0].name, "alpha");
        assert_eq!(facets.categories[1].name, "zeta");
    }

    #[test]
    fn test_tag_facet_truncated_to_limit() {
        let tags: Vec<String> = (0..40).map(|i| format!("tag{i:02}")).collect();
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
        let items = vec![item(None, &tag_refs, None)];

        let facets = aggregate_facets(&items);
        assert_eq!(facets.tags.len(), TAG_FACET_LIMIT);
    }
}
