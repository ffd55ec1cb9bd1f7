use super::types::Article;

/// Upper bound on a saved predicate; longer ones match nothing.
const MAX_QUERY_LENGTH: usize = 256;

/// Evaluates a query feed's saved predicate over the article universe.
///
/// Called when a query feed is read, never during sync. Implementations
/// return the matching subset in the order they want it presented.
pub trait QueryEvaluator: Send + Sync {
    fn evaluate(&self, query: &str, universe: Vec<Article>) -> Vec<Article>;
}

/// Matches articles containing every whitespace-separated term of the query
/// in their title, summary or content, ignoring case.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordEvaluator;

impl QueryEvaluator for KeywordEvaluator {
    fn evaluate(&self, query: &str, universe: Vec<Article>) -> Vec<Article> {
        if query.len() > MAX_QUERY_LENGTH {
            tracing::warn!(len = query.len(), "Saved query too long, matching nothing");
            return Vec::new();
        }
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() {
            return Vec::new();
        }

        universe
            .into_iter()
            .filter(|article| {
                let haystack = [
                    Some(&*article.title),
                    article.summary.as_deref(),
                    article.content.as_deref(),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join("\n")
                .to_lowercase();
                terms.iter().all(|term| haystack.contains(term.as_str()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn article(id: i64, title: &str, summary: Option<&str>) -> Article {
        Article {
            id,
            feed_id: 1,
            identifier: id.to_string(),
            title: Arc::from(title),
            link: None,
            summary: summary.map(Arc::from),
            author: None,
            content: None,
            published: None,
            updated_at: 0,
            read: false,
            attributes: Default::default(),
        }
    }

    #[test]
    fn test_all_terms_must_match() {
        let universe = vec![
            article(1, "Rust 2.0 released", Some("async closures")),
            article(2, "Rust meetup", None),
            article(3, "Go generics", Some("rust comparison")),
        ];
        let hits = KeywordEvaluator.evaluate("RUST async", universe);
        assert_eq!(hits.iter().map(|a| a.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_blank_query_matches_nothing() {
        let universe = vec![article(1, "Anything", None)];
        assert!(KeywordEvaluator.evaluate("   ", universe).is_empty());
    }

    #[test]
    fn test_overlong_query_matches_nothing() {
        let universe = vec![article(1, "aaaa", None)];
        let query = "a ".repeat(200);
        assert!(KeywordEvaluator.evaluate(&query, universe).is_empty());
    }
}
