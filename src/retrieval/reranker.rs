//! Generator-judged reranking with a distance-order fallback

use crate::config::{Config, RerankMethod};
use crate::generation::{complete_with_timeout, ChatMessage, Purpose, TextGenerator};
use crate::recovery::JsonRecovery;
use crate::retrieval::{sort_by_distance, truncate_snippet, Hit};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RerankerSettings {
    pub enabled: bool,
    pub method: RerankMethod,
    /// Lower bound on the pool handed to the judge
    pub recall_min: usize,
    /// Per-document character cap in the judge prompt
    pub max_chars: usize,
    pub timeout: Duration,
}

impl From<&Config> for RerankerSettings {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.retrieval.reranker_enabled,
            method: config.retrieval.reranker_method,
            recall_min: config.retrieval.initial_recall_min,
            max_chars: config.retrieval.rerank_max_chars,
            timeout: Duration::from_secs(config.llm.request_timeout_secs),
        }
    }
}

/// One entry of the judge's ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankDecision {
    /// 1-based position in the pool
    pub doc_id: usize,
    pub score: f32,
    pub reason: String,
}

/// How the final order was produced
#[derive(Debug, Clone)]
pub enum RerankOutcome {
    /// Ordered by the judge, backfilled in distance order
    Judged(Vec<Hit>),
    /// Reranking disabled or not generator-based
    DistanceOrder(Vec<Hit>),
    /// The judge failed; candidates keep their incoming order
    Fallback { hits: Vec<Hit>, reason: String },
}

impl RerankOutcome {
    pub fn hits(&self) -> &[Hit] {
        match self {
            Self::Judged(hits) | Self::DistanceOrder(hits) | Self::Fallback { hits, .. } => hits,
        }
    }

    pub fn into_hits(self) -> Vec<Hit> {
        match self {
            Self::Judged(hits) | Self::DistanceOrder(hits) | Self::Fallback { hits, .. } => hits,
        }
    }
}

pub struct Reranker {
    settings: RerankerSettings,
    generator: Arc<dyn TextGenerator>,
    recovery: Arc<JsonRecovery>,
    digit_run: Regex,
}

impl Reranker {
    pub fn new(
        settings: RerankerSettings,
        generator: Arc<dyn TextGenerator>,
        recovery: Arc<JsonRecovery>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            settings,
            generator,
            recovery,
            digit_run: Regex::new(r"\d+")?,
        })
    }

    pub fn settings(&self) -> &RerankerSettings {
        &self.settings
    }

    /// `min(candidate_count, max(top_k, recall_min))`
    pub fn pool_size(&self, candidate_count: usize, top_k: usize) -> usize {
        candidate_count.min(top_k.max(self.settings.recall_min))
    }

    /// Order `candidates` (ascending distance) and keep at most `top_k`
    ///
    /// Never fails. Every returned hit is one of the candidates.
    pub async fn rerank(&self, query: &str, mut candidates: Vec<Hit>, top_k: usize) -> RerankOutcome {
        if !self.settings.enabled || self.settings.method != RerankMethod::Llm {
            sort_by_distance(&mut candidates);
            candidates.truncate(top_k);
            return RerankOutcome::DistanceOrder(candidates);
        }
        if candidates.is_empty() || top_k == 0 {
            return RerankOutcome::Judged(Vec::new());
        }

        let pool_size = self.pool_size(candidates.len(), top_k);
        candidates.truncate(pool_size);
        let pool = candidates;

        let prompt = self.build_prompt(query, &pool, top_k);
        let response = match complete_with_timeout(
            self.generator.as_ref(),
            &[ChatMessage::user(prompt)],
            Purpose::Rerank,
            self.settings.timeout,
        )
        .await
        {
            Ok(response) => response,
            Err(e) => return fallback(pool, top_k, format!("judge call failed: {}", e)),
        };

        let value = match self.recovery.recover(&response).await {
            Ok(value) => value,
            Err(e) => return fallback(pool, top_k, format!("unusable judge output: {}", e)),
        };

        let decisions = self.parse_decisions(&value);
        let ordered = apply_decisions(&pool, &decisions, top_k);
        if ordered.judged == 0 {
            return fallback(pool, top_k, "judge returned no usable doc ids".to_string());
        }

        tracing::debug!(
            "Reranked pool of {} with {} judged ids",
            pool.len(),
            ordered.judged
        );
        RerankOutcome::Judged(ordered.hits)
    }

    fn build_prompt(&self, query: &str, pool: &[Hit], top_k: usize) -> String {
        let documents = pool
            .iter()
            .enumerate()
            .map(|(i, hit)| {
                format!(
                    "Document {}:\nSource: {}\nDistance: {:.4}\nContent: {}",
                    i + 1,
                    hit.source,
                    hit.distance,
                    truncate_snippet(&hit.content, self.settings.max_chars)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "Question: {query}\n\n\
             Documents:\n{documents}\n\n\
             Rate every document's relevance to the question. Reply with JSON of the form:\n\
             {{\n  \"ranking\": [\n    {{\"doc_id\": 1, \"score\": 0.95, \"reason\": \"short justification\"}}\n  ]\n}}\n\
             doc_id is the document number (integer) and score is a relevance between 0 and 1.\n\
             Return at least {min_return} entries, sorted by score from high to low.",
            min_return = top_k.max(1),
        )
    }

    /// Extract decisions from `{"ranking": [...]}`, `{"results": [...]}` or a
    /// bare array. Entries without a positive id are dropped.
    pub fn parse_decisions(&self, value: &Value) -> Vec<RerankDecision> {
        let entries = match value {
            Value::Array(entries) => entries.as_slice(),
            Value::Object(map) => ["ranking", "results"]
                .iter()
                .filter_map(|key| map.get(*key).and_then(Value::as_array))
                .find(|entries| !entries.is_empty())
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            _ => &[],
        };

        entries
            .iter()
            .filter_map(|entry| {
                let raw_id = match entry {
                    Value::Object(fields) => fields.get("doc_id")?,
                    other => other,
                };
                let doc_id = self.parse_doc_id(raw_id)?;
                Some(RerankDecision {
                    doc_id,
                    score: entry
                        .get("score")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0) as f32,
                    reason: entry
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect()
    }

    /// Integer, float (truncated) or the first digit run of a string
    fn parse_doc_id(&self, raw: &Value) -> Option<usize> {
        let id = match raw {
            Value::Number(n) => match n.as_u64() {
                Some(id) => usize::try_from(id).ok()?,
                None => {
                    let f = n.as_f64()?;
                    if !f.is_finite() || f < 1.0 {
                        return None;
                    }
                    f.trunc() as usize
                }
            },
            Value::String(s) => self.digit_run.find(s)?.as_str().parse().ok()?,
            _ => return None,
        };
        (id > 0).then_some(id)
    }
}

struct Ordered {
    hits: Vec<Hit>,
    judged: usize,
}

/// Judged ids in the given order, skipping out-of-range and repeated ids,
/// then unused pool entries in pool order
fn apply_decisions(pool: &[Hit], decisions: &[RerankDecision], top_k: usize) -> Ordered {
    let mut used = vec![false; pool.len()];
    let mut hits = Vec::with_capacity(top_k.min(pool.len()));

    for decision in decisions {
        if hits.len() >= top_k {
            break;
        }
        let Some(slot) = decision.doc_id.checked_sub(1) else {
            continue;
        };
        if slot >= pool.len() || used[slot] {
            continue;
        }
        used[slot] = true;
        hits.push(pool[slot].clone());
    }
    let judged = hits.len();

    for (slot, hit) in pool.iter().enumerate() {
        if hits.len() >= top_k {
            break;
        }
        if !used[slot] {
            hits.push(hit.clone());
        }
    }

    Ordered { hits, judged }
}

fn fallback(mut pool: Vec<Hit>, top_k: usize, reason: String) -> RerankOutcome {
    tracing::warn!("LLM reranker fell back to distance order: {}", reason);
    pool.truncate(top_k);
    RerankOutcome::Fallback { hits: pool, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::generation::GenerationError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedJudge {
        reply: Result<String, ()>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for ScriptedJudge {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _purpose: Purpose,
        ) -> Result<String, GenerationError> {
            self.prompts
                .lock()
                .unwrap()
                .push(messages[0].content.clone());
            self.reply
                .clone()
                .map_err(|_| GenerationError::Api {
                    status: 503,
                    body: "overloaded".to_string(),
                })
        }
    }

    fn settings() -> RerankerSettings {
        RerankerSettings {
            enabled: true,
            method: RerankMethod::Llm,
            recall_min: 4,
            max_chars: 120,
            timeout: Duration::from_secs(5),
        }
    }

    fn reranker(reply: Result<&str, ()>) -> (Reranker, Arc<ScriptedJudge>) {
        let judge = Arc::new(ScriptedJudge {
            reply: reply.map(str::to_string),
            prompts: Mutex::new(Vec::new()),
        });
        let recovery = Arc::new(JsonRecovery::new(&RecoveryConfig::default()).unwrap());
        let reranker = Reranker::new(settings(), judge.clone(), recovery).unwrap();
        (reranker, judge)
    }

    fn candidates(n: usize) -> Vec<Hit> {
        (1..=n)
            .map(|i| Hit::new(format!("doc{}", i), format!("kb:{}.pdf", i), i as f32 * 0.1))
            .collect()
    }

    fn contents(outcome: &RerankOutcome) -> Vec<&str> {
        outcome.hits().iter().map(|h| h.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_fenced_trailing_comma_judgment() {
        let reply = "```json\n{\"ranking\": [{\"doc_id\": 3, \"score\": 0.9, \"reason\": \"direct\",}, {\"doc_id\": \"Document 1\", \"score\": 0.5},],}\n```";
        let (reranker, _) = reranker(Ok(reply));

        let outcome = reranker.rerank("q", candidates(5), 3).await;
        assert!(matches!(outcome, RerankOutcome::Judged(_)));
        assert_eq!(contents(&outcome), vec!["doc3", "doc1", "doc2"]);
    }

    #[tokio::test]
    async fn test_invalid_and_duplicate_ids_are_skipped() {
        let reply = r#"{"results": [{"doc_id": 0}, {"doc_id": 99}, {"doc_id": 2}, {"doc_id": "2"}, {"doc_id": 4.7}]}"#;
        let (reranker, _) = reranker(Ok(reply));

        let outcome = reranker.rerank("q", candidates(5), 3).await;
        assert_eq!(contents(&outcome), vec!["doc2", "doc4", "doc1"]);
    }

    #[tokio::test]
    async fn test_judge_failure_falls_back_deterministically() {
        let (reranker, _) = reranker(Err(()));

        let first = reranker.rerank("q", candidates(6), 3).await;
        let second = reranker.rerank("q", candidates(6), 3).await;

        assert!(matches!(first, RerankOutcome::Fallback { .. }));
        assert_eq!(contents(&first), vec!["doc1", "doc2", "doc3"]);
        assert_eq!(contents(&first), contents(&second));
    }

    #[tokio::test]
    async fn test_unparseable_judgment_falls_back() {
        let (reranker, _) = reranker(Ok("I think document three is best."));
        let outcome = reranker.rerank("q", candidates(4), 2).await;

        let RerankOutcome::Fallback { reason, .. } = &outcome else {
            panic!("expected fallback");
        };
        assert!(reason.contains("unusable"));
        assert_eq!(contents(&outcome), vec!["doc1", "doc2"]);
    }

    #[tokio::test]
    async fn test_disabled_keeps_distance_order() {
        let (mut reranker, judge) = reranker(Ok("{}"));
        reranker.settings.enabled = false;

        let mut shuffled = candidates(4);
        shuffled.reverse();
        let outcome = reranker.rerank("q", shuffled, 2).await;

        assert!(matches!(outcome, RerankOutcome::DistanceOrder(_)));
        assert_eq!(contents(&outcome), vec!["doc1", "doc2"]);
        assert!(judge.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_numbers_the_bounded_pool() {
        let (reranker, judge) = reranker(Ok(r#"[{"doc_id": 1}]"#));
        reranker.rerank("what is chlorophyll?", candidates(10), 2).await;

        let prompts = judge.prompts.lock().unwrap();
        // Pool is max(top_k, recall_min) = 4
        assert!(prompts[0].contains("Document 4:"));
        assert!(!prompts[0].contains("Document 5:"));
        assert!(prompts[0].contains("what is chlorophyll?"));
        assert!(prompts[0].contains("at least 2 entries"));
    }

    #[test]
    fn test_parse_decisions_shapes() {
        let (reranker, _) = reranker(Ok(""));

        let bare = reranker.parse_decisions(&json!([2, "doc 3", {"doc_id": 1, "score": 0.4}]));
        let ids: Vec<_> = bare.iter().map(|d| d.doc_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert_eq!(bare[2].score, 0.4);

        // An empty ranking list defers to results
        let keyed = reranker.parse_decisions(&json!({"ranking": [], "results": [{"doc_id": 5}]}));
        assert_eq!(keyed[0].doc_id, 5);

        assert!(reranker.parse_decisions(&json!({"order": [1]})).is_empty());
        assert!(reranker.parse_decisions(&json!("1")).is_empty());
    }

    #[test]
    fn test_pool_size() {
        let (reranker, _) = reranker(Ok(""));
        assert_eq!(reranker.pool_size(10, 2), 4);
        assert_eq!(reranker.pool_size(3, 2), 3);
        assert_eq!(reranker.pool_size(20, 6), 6);
    }
}
