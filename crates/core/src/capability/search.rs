use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SearchError;
use crate::trigger::TriggerRegistry;

/// Nearest-neighbour lookup of text against trigger corpora.
/// Returns at most `top_k` `(trigger_id, score)` pairs scoring at least
/// `threshold`, best first.
#[async_trait]
pub trait SemanticSearch: Send + Sync {
    async fn nearest_neighbors(
        &self,
        text: &str,
        candidate_ids: &[String],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<(String, f32)>, SearchError>;
}

/// In-process [`SemanticSearch`] over the live trigger registry. Scores are
/// token-set cosine similarity; the best phrase of a corpus scores the trigger.
pub struct LexicalIndex {
    registry: Arc<TriggerRegistry>,
}

impl LexicalIndex {
    pub fn new(registry: Arc<TriggerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SemanticSearch for LexicalIndex {
    async fn nearest_neighbors(
        &self,
        text: &str,
        candidate_ids: &[String],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<(String, f32)>, SearchError> {
        let query = tokens(text);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(String, f32)> = candidate_ids
            .iter()
            .filter_map(|id| self.registry.get_trigger(id))
            .filter_map(|trigger| {
                let best = trigger
                    .corpus()
                    .iter()
                    .map(|phrase| cosine(&query, &tokens(phrase)))
                    .fold(0.0f32, f32::max);
                (best >= threshold).then(|| (trigger.trigger_id.clone(), best))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Lowercased word tokens. CJK characters count as one token each.
fn tokens(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut word = String::new();
    for c in text.chars() {
        if is_cjk(c) {
            if !word.is_empty() {
                out.insert(std::mem::take(&mut word));
            }
            out.insert(c.to_string());
        } else if c.is_alphanumeric() || c == '\'' {
            word.extend(c.to_lowercase());
        } else if !word.is_empty() {
            out.insert(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        out.insert(word);
    }
    out
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}')
}

fn cosine(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f32;
    shared / ((a.len() as f32).sqrt() * (b.len() as f32).sqrt())
}
