//! Generation purposes and their system templates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentence the question-answering template reserves for "nothing relevant"
pub const NO_INFORMATION_PHRASE: &str = "No relevant information found.";

/// Why a generation call is made
///
/// Selects the system template and, through `llm.purpose_models`, the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Relevance judgment over numbered documents
    Rerank,
    /// Rewrite near-JSON into strict JSON
    JsonRepair,
    /// Answer a question from numbered reference snippets
    KnowledgeQa,
    #[default]
    General,
}

impl Purpose {
    /// Tag sent to model routing and logs
    pub fn tag(self) -> &'static str {
        match self {
            Self::Rerank => "rag_rerank",
            Self::JsonRepair => "json_fix",
            Self::KnowledgeQa => "paper_qa",
            Self::General => "general",
        }
    }

    /// Unknown tags map to `General`
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim() {
            "rag_rerank" => Self::Rerank,
            "json_fix" => Self::JsonRepair,
            "paper_qa" => Self::KnowledgeQa,
            _ => Self::General,
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::Rerank => {
                "You are a precise retrieval reranker. Judge how relevant each numbered \
                 document is to the user's question using only the text provided. Never \
                 invent information. Reply with JSON only."
            }
            Self::JsonRepair => {
                "You repair malformed JSON. Return only the corrected JSON document, \
                 without Markdown fences or commentary."
            }
            Self::KnowledgeQa => {
                "You answer questions strictly from the numbered reference snippets you \
                 are given.\n\
                 1) When snippets are provided, answer in 2-5 bullet points.\n\
                 2) Cite snippets as [n], using only the numbers provided.\n\
                 3) Do not invent content, formulas or data that the snippets lack.\n\
                 4) Reply exactly \"No relevant information found.\" only when no \
                 snippet is provided."
            }
            Self::General => "You are a helpful assistant.",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for purpose in [
            Purpose::Rerank,
            Purpose::JsonRepair,
            Purpose::KnowledgeQa,
            Purpose::General,
        ] {
            assert_eq!(Purpose::from_tag(purpose.tag()), purpose);
        }
    }

    #[test]
    fn test_unknown_tag_is_general() {
        assert_eq!(Purpose::from_tag("lesson_plan"), Purpose::General);
        assert_eq!(Purpose::default(), Purpose::General);
    }

    #[test]
    fn test_qa_template_names_the_sentinel() {
        assert!(Purpose::KnowledgeQa
            .system_prompt()
            .contains(NO_INFORMATION_PHRASE));
    }
}
