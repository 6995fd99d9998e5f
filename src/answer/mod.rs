//! Citation-ready answers over retrieved hits

use crate::config::AnswerConfig;
use crate::generation::{
    complete_with_timeout, ChatMessage, GenerationError, Purpose, TextGenerator,
    NO_INFORMATION_PHRASE,
};
use crate::retrieval::{normalize_source, truncate_snippet, Hit, KB_SEPARATOR, UNKNOWN_SOURCE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Returned when retrieval finds nothing; no generation call is made
pub const NO_RESULTS_ANSWER: &str =
    "No relevant information found. The knowledge base may be empty or may not cover this question.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    /// 1-based, matches the `[n]` markers in the answer
    pub index: usize,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    Generated,
    /// Retrieval returned nothing
    NoResults,
    /// Hits exist but no answer was generated; lists likely sources instead
    SourceList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub references: Vec<Reference>,
    pub kind: AnswerKind,
}

impl Answer {
    pub fn no_results() -> Self {
        Self {
            answer: NO_RESULTS_ANSWER.to_string(),
            references: Vec::new(),
            kind: AnswerKind::NoResults,
        }
    }
}

/// Source as shown to a reader: knowledge-base tag dropped, file name only
pub fn display_source(source: &str) -> String {
    let normalized = normalize_source(source);
    let tail = normalized.rsplit(KB_SEPARATOR).next().unwrap_or(normalized);
    let name = Path::new(tail)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| tail.to_string());

    if name.trim().is_empty() {
        UNKNOWN_SOURCE.to_string()
    } else {
        name
    }
}

pub struct AnswerAssembler {
    config: AnswerConfig,
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl AnswerAssembler {
    pub fn new(config: AnswerConfig, generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self {
            config,
            generator,
            timeout,
        }
    }

    /// Answer `question` from `hits`, citing them as `[1]..[k]`
    pub async fn assemble(&self, question: &str, hits: &[Hit]) -> Result<Answer, GenerationError> {
        if hits.is_empty() {
            return Ok(Answer::no_results());
        }

        let mut blocks = Vec::with_capacity(hits.len());
        let mut references = Vec::with_capacity(hits.len());
        for (i, hit) in hits.iter().enumerate() {
            let index = i + 1;
            let source = display_source(&hit.source);
            let snippet = truncate_snippet(&hit.content, self.config.context_chars);

            blocks.push(format!("[{}] Source: {}\n{}", index, source, snippet));
            references.push(Reference {
                index,
                source,
                content: self
                    .config
                    .include_reference_content
                    .then(|| hit.content.clone()),
            });
        }

        let messages = [
            ChatMessage::system(Purpose::KnowledgeQa.system_prompt()),
            ChatMessage::user(format!(
                "Question: {}\n\nReference snippets:\n{}\n\n\
                 Answer in bullet points based on the snippets, ending each point with its [n] \
                 marker. If the snippets only partly cover the question, summarize what they do say.",
                question,
                blocks.join("\n")
            )),
        ];

        let answer = match complete_with_timeout(
            self.generator.as_ref(),
            &messages,
            Purpose::KnowledgeQa,
            self.timeout,
        )
        .await
        {
            Ok(answer) => answer,
            Err(GenerationError::Disabled) => return Ok(self.source_list(references)),
            Err(e) => return Err(e),
        };

        if claims_no_information(&answer) {
            tracing::warn!("Generator claimed no information despite {} hits", hits.len());
            return Ok(self.source_list(references));
        }

        Ok(Answer {
            answer,
            references,
            kind: AnswerKind::Generated,
        })
    }

    fn source_list(&self, references: Vec<Reference>) -> Answer {
        let sources: Vec<&str> = references
            .iter()
            .take(self.config.max_fallback_sources)
            .map(|r| r.source.as_str())
            .collect();
        let answer = format!(
            "Could not generate an answer directly. Possibly relevant documents:\n- {}",
            sources.join("\n- ")
        );

        Answer {
            answer,
            references,
            kind: AnswerKind::SourceList,
        }
    }
}

fn claims_no_information(answer: &str) -> bool {
    let marker = NO_INFORMATION_PHRASE.trim_end_matches('.').to_lowercase();
    answer.to_lowercase().contains(&marker)
}
