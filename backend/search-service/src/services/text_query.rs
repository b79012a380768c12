//! Store-agnostic free-text query grammar.
//!
//! A query string is parsed into required terms (implicit AND), optional
//! `?term` boosts, `"quoted phrases"` and negated `-term` / `-"phrase"`
//! exclusions, then matched against weighted item fields. Matching is a
//! case-insensitive substring scan, so any backing store can implement
//! the same contract without a native text-search feature.

use crate::models::SearchableItem;

/// Field weights, decreasing: primary identifier, descriptive body,
/// category/tag terms.
const TITLE_WEIGHT: f32 = 3.0;
const BODY_WEIGHT: f32 = 2.0;
const TERMS_WEIGHT: f32 = 1.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    pub required_terms: Vec<String>,
    pub optional_terms: Vec<String>,
    pub phrases: Vec<String>,
    pub negated_terms: Vec<String>,
    pub negated_phrases: Vec<String>,
}

impl ParsedQuery {
    /// Parses a raw query string. Returns `None` when the string carries
    /// no actionable tokens (empty or whitespace).
    pub fn parse(raw: &str) -> Option<ParsedQuery> {
        let mut query = ParsedQuery::default();
        let mut chars = raw.char_indices().peekable();

        while let Some(&(start, c)) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
                continue;
            }

            let negated = c == '-';
            let optional = c == '?';
            let mut pos = start;
            if negated || optional {
                chars.next();
                pos = chars.peek().map(|&(i, _)| i).unwrap_or(raw.len());
            }

            if raw[pos..].starts_with('"') {
                chars.next(); // consume opening quote
                let phrase_start = chars.peek().map(|&(i, _)| i).unwrap_or(raw.len());
                let mut phrase_end = raw.len();
                for (i, pc) in chars.by_ref() {
                    if pc == '"' {
                        phrase_end = i;
                        break;
                    }
                }
                let phrase = raw[phrase_start..phrase_end.min(raw.len())]
                    .trim()
                    .to_lowercase();
                if !phrase.is_empty() {
                    if negated {
                        query.negated_phrases.push(phrase);
                    } else {
                        query.phrases.push(phrase);
                    }
                }
            } else {
                let term_start = pos;
                let mut term_end = raw.len();
                while let Some(&(i, tc)) = chars.peek() {
                    if tc.is_whitespace() {
                        term_end = i;
                        break;
                    }
                    chars.next();
                }
                let term = raw[term_start..term_end].to_lowercase();
                if !term.is_empty() {
                    if negated {
                        query.negated_terms.push(term);
                    } else if optional {
                        query.optional_terms.push(term);
                    } else {
                        query.required_terms.push(term);
                    }
                }
            }
        }

        if query.is_empty() {
            None
        } else {
            Some(query)
        }
    }

    fn is_empty(&self) -> bool {
        self.required_terms.is_empty()
            && self.optional_terms.is_empty()
            && self.phrases.is_empty()
            && self.negated_terms.is_empty()
            && self.negated_phrases.is_empty()
    }
}

/// Lowercased weighted fields of one item.
struct FieldSet {
    title: String,
    body: String,
    terms: String,
}

impl FieldSet {
    fn of(item: &SearchableItem) -> FieldSet {
        let mut terms = String::new();
        if let Some(category) = &item.category {
            terms.push_str(category);
            terms.push(' ');
        }
        for tag in &item.tags {
            terms.push_str(tag);
            terms.push(' ');
        }
        if let Some(language) = &item.language {
            terms.push_str(language);
        }
        FieldSet {
            title: item.title.to_lowercase(),
            body: item
                .description
                .as_deref()
                .unwrap_or_default()
                .to_lowercase(),
            terms: terms.to_lowercase(),
        }
    }

    /// Highest weight of a field containing `needle`, if any.
    fn best_weight(&self, needle: &str) -> Option<f32> {
        if self.title.contains(needle) {
            Some(TITLE_WEIGHT)
        } else if self.body.contains(needle) {
            Some(BODY_WEIGHT)
        } else if self.terms.contains(needle) {
            Some(TERMS_WEIGHT)
        } else {
            None
        }
    }

    fn contains_anywhere(&self, needle: &str) -> bool {
        self.best_weight(needle).is_some()
    }
}

/// Scores one item against a parsed query.
///
/// `None` means no match: a required term or phrase is absent, or a
/// negated one is present. The score is the sum of the highest field
/// weight per matched required/phrase/optional token.
pub fn score_item(query: &ParsedQuery, item: &SearchableItem) -> Option<f32> {
    let fields = FieldSet::of(item);

    for negated in query
        .negated_terms
        .iter()
        .chain(query.negated_phrases.iter())
    {
        if fields.contains_anywhere(negated) {
            return None;
        }
    }

    let mut score = 0.0;
    for required in query.required_terms.iter().chain(query.phrases.iter()) {
        match fields.best_weight(required) {
            Some(weight) => score += weight,
            None => return None,
        }
    }

    for optional in &query.optional_terms {
        if let Some(weight) = fields.best_weight(optional) {
            score += weight;
        }
    }

    Some(score)
}

/// Filters a retriever's candidate set against the query and orders it
/// by text relevance (descending), then recency. Used by every retriever
/// as the pre-merge baseline when a free-text query is present.
pub fn rank_matches(items: Vec<SearchableItem>, query: &ParsedQuery) -> Vec<SearchableItem> {
    let mut matched: Vec<SearchableItem> = items
        .into_iter()
        .filter_map(|mut item| {
            let score = score_item(query, &item)?;
            item.text_score = score;
            Some(item)
        })
        .collect();

    matched.sort_by(|a, b| {
        b.text_score
            .partial_cmp(&a.text_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });

    matched
}
