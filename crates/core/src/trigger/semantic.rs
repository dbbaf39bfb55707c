//! LUI matching: utterance fragments against semantic trigger corpora.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::capability::SemanticSearch;

const OPENERS: [char; 6] = ['(', '[', '{', '（', '【', '｛'];
const CLOSERS: [char; 6] = [')', ']', '}', '）', '】', '｝'];
const TERMINALS: [char; 13] = [';', '.', ',', '?', '!', '\n', '；', '。', '，', '？', '！', '、', '…'];

/// Matches free text against a restricted set of semantic triggers.
/// Cheap to share: all state is behind `Arc`s and every call is independent.
#[derive(Clone)]
pub struct SemanticMatcher {
    search: Arc<dyn SemanticSearch>,
    workers: usize,
    top_k: usize,
    threshold: f32,
}

impl SemanticMatcher {
    pub fn new(search: Arc<dyn SemanticSearch>, workers: usize, top_k: usize, threshold: f32) -> Self {
        Self { search, workers: workers.max(1), top_k: top_k.max(1), threshold }
    }

    /// Trigger ids (from `candidates`) whose corpus is close to any fragment
    /// of `text`. One query per fragment, run in parallel on a bounded pool.
    /// Query failures count as "no match".
    pub async fn match_text(&self, text: &str, candidates: &[String]) -> BTreeSet<String> {
        let fragments = split_fragments(&strip_brackets(text));
        if fragments.is_empty() || candidates.is_empty() {
            return BTreeSet::new();
        }

        let candidates: Arc<[String]> = candidates.into();
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for fragment in fragments {
            let search = self.search.clone();
            let candidates = candidates.clone();
            let permits = permits.clone();
            let (top_k, threshold) = (self.top_k, self.threshold);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Vec::new();
                };
                match search.nearest_neighbors(&fragment, &candidates, top_k, threshold).await {
                    Ok(hits) => hits,
                    Err(e) => {
                        tracing::warn!(fragment = %fragment, error = %e, "semantic query failed, treating as no match");
                        Vec::new()
                    }
                }
            });
        }

        let mut matched = BTreeSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(hits) => {
                    matched.extend(
                        hits.into_iter()
                            .filter(|(id, score)| *score >= self.threshold && candidates.contains(id))
                            .map(|(id, _)| id),
                    );
                }
                Err(e) => tracing::warn!(error = %e, "semantic query task failed"),
            }
        }
        matched
    }
}

/// Drop bracketed asides (stage directions, emotes), including nested ones.
pub fn strip_brackets(text: &str) -> String {
    let mut depth = 0usize;
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if OPENERS.contains(&c) {
            depth += 1;
        } else if CLOSERS.contains(&c) {
            depth = depth.saturating_sub(1);
        } else if depth == 0 {
            out.push(c);
        }
    }
    out
}

/// Split on sentence and clause punctuation, dropping blank pieces.
pub fn split_fragments(text: &str) -> Vec<String> {
    text.split(|c| TERMINALS.contains(&c))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearchError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn brackets_are_stripped_with_nesting() {
        assert_eq!(strip_brackets("hello (waves [happily]) there"), "hello  there");
        assert_eq!(strip_brackets("（笑）你好"), "你好");
        assert_eq!(strip_brackets("unbalanced) text"), "unbalanced text");
    }

    #[test]
    fn fragments_split_on_punctuation() {
        assert_eq!(
            split_fragments("Hi there! How is the weather? ok;;"),
            vec!["Hi there", "How is the weather", "ok"]
        );
        assert_eq!(split_fragments("今天好吗？很好。"), vec!["今天好吗", "很好"]);
        assert!(split_fragments(" ... ").is_empty());
    }

    /// Matches a fragment to a candidate whose id appears in it.
    #[derive(Default)]
    struct EchoSearch {
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SemanticSearch for EchoSearch {
        async fn nearest_neighbors(
            &self,
            text: &str,
            candidate_ids: &[String],
            _top_k: usize,
            _threshold: f32,
        ) -> Result<Vec<(String, f32)>, SearchError> {
            self.queries.lock().unwrap().push(text.to_string());
            if text.contains("fail") {
                return Err(SearchError::Unavailable("index offline".into()));
            }
            Ok(candidate_ids
                .iter()
                .filter(|id| text.contains(id.as_str()))
                .map(|id| (id.clone(), 0.9))
                .chain(std::iter::once(("outsider".to_string(), 0.99)))
                .collect())
        }
    }

    #[tokio::test]
    async fn union_across_fragments_restricted_to_candidates() {
        let search = Arc::new(EchoSearch::default());
        let matcher = SemanticMatcher::new(search.clone(), 2, 3, 0.75);
        let candidates = vec!["weather".to_string(), "music".to_string(), "food".to_string()];

        let matched = matcher
            .match_text("weather today? play music (not food). fail here", &candidates)
            .await;
        assert_eq!(matched, BTreeSet::from(["music".to_string(), "weather".to_string()]));
        assert_eq!(search.queries.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn below_threshold_is_dropped() {
        let matcher = SemanticMatcher::new(Arc::new(EchoSearch::default()), 1, 3, 0.95);
        let matched = matcher.match_text("weather", &["weather".to_string()]).await;
        assert!(matched.is_empty());
    }
}
