//! kbsift - retrieval across many knowledge bases
//!
//! Searches several independently stored vector indexes at once, merges and
//! de-duplicates their hits, spreads candidates across sources, reranks them
//! with an optional LLM judge and answers questions with numbered references.
//! Near-JSON model output is salvaged by a layered recovery pipeline.

pub mod answer;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod recovery;
pub mod retrieval;

pub use answer::{Answer, AnswerKind, Reference};
pub use error::{KbsiftError, Result};
pub use retrieval::{Chunk, Hit, PipelineFactory, RetrievalPipeline};
