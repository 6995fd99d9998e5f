//! Structured-output recovery
//!
//! Turns near-JSON generator output into a `serde_json::Value`. Cheap local
//! repairs are tried first; a single generator call is the last resort. The
//! chain either returns a value parsed by `serde_json` or fails, it never
//! guesses at structure.

use crate::config::RecoveryConfig;
use crate::generation::{complete_with_timeout, ChatMessage, Purpose, TextGenerator};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error(
        "Could not recover JSON from output starting {prefix:?}... \
         (direct parse: {direct}; extracted object: {stage2}; repair: {repair})",
        stage2 = .extracted.as_deref().unwrap_or("no candidate")
    )]
    Exhausted {
        /// Leading characters of the cleaned output
        prefix: String,
        direct: String,
        extracted: Option<String>,
        repair: String,
    },

    #[error("Invalid recovery pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Regexes used by the local stages, compiled once
struct RecoveryPatterns {
    fence_open: Regex,
    fence_close: Regex,
    controls: Regex,
    trailing_comma: Regex,
    greedy_object: Regex,
}

impl RecoveryPatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            fence_open: Regex::new(r"^```[a-zA-Z0-9_-]*\n")?,
            fence_close: Regex::new(r"\n```\s*$")?,
            controls: Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F]")?,
            trailing_comma: Regex::new(r",\s*([}\]])")?,
            greedy_object: Regex::new(r"\{[\s\S]*\}")?,
        })
    }
}

/// Where the local stages gave up
#[derive(Debug)]
pub struct LocalFailure {
    /// Output after fence and control stripping
    pub working: String,
    pub direct: String,
    pub extracted: Option<String>,
}

pub struct JsonRecovery {
    patterns: RecoveryPatterns,
    generator: Option<Arc<dyn TextGenerator>>,
    timeout: Duration,
    repair_max_chars: usize,
    error_prefix_chars: usize,
}

impl JsonRecovery {
    /// Local stages only; see `with_generator` for the repair call
    pub fn new(config: &RecoveryConfig) -> Result<Self, RecoveryError> {
        Ok(Self {
            patterns: RecoveryPatterns::new()?,
            generator: None,
            timeout: Duration::from_secs(60),
            repair_max_chars: config.repair_max_chars,
            error_prefix_chars: config.error_prefix_chars,
        })
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        self.generator = Some(generator);
        self.timeout = timeout;
        self
    }

    /// Remove a wrapping Markdown fence, with or without a language tag
    pub fn strip_fences(&self, text: &str) -> String {
        let trimmed = text.trim();
        if !trimmed.starts_with("```") {
            return trimmed.to_string();
        }
        let opened = self.patterns.fence_open.replace(trimmed, "");
        self.patterns.fence_close.replace(&opened, "").into_owned()
    }

    /// Drop a leading BOM and blank out C0 controls other than tab, LF and CR
    pub fn strip_controls(&self, text: &str) -> String {
        let text = text.trim_start_matches('\u{feff}');
        self.patterns.controls.replace_all(text, " ").into_owned()
    }

    pub fn remove_trailing_commas(&self, text: &str) -> String {
        self.patterns.trailing_comma.replace_all(text, "$1").into_owned()
    }

    /// Stages that need no generator: strict parse, then object extraction
    /// with trailing-comma cleanup
    pub fn recover_local(&self, text: &str) -> Result<Value, LocalFailure> {
        let working = self.strip_controls(&self.strip_fences(text));

        let direct = match serde_json::from_str(&working) {
            Ok(value) => return Ok(value),
            Err(e) => e.to_string(),
        };

        let candidate = extract_balanced_object(&working).or_else(|| {
            self.patterns
                .greedy_object
                .find(&working)
                .map(|m| m.as_str())
        });

        let mut extracted = None;
        if let Some(candidate) = candidate {
            let cleaned = self.remove_trailing_commas(&self.strip_controls(candidate));
            match serde_json::from_str(&cleaned) {
                Ok(value) => {
                    tracing::debug!("Recovered JSON after object extraction");
                    return Ok(value);
                }
                Err(e) => extracted = Some(e.to_string()),
            }
        }

        Err(LocalFailure {
            working,
            direct,
            extracted,
        })
    }

    /// Full chain, ending with one generator repair call
    pub async fn recover(&self, text: &str) -> Result<Value, RecoveryError> {
        let failure = match self.recover_local(text) {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        let repair = match self.repair(&failure.working).await {
            Ok(value) => {
                tracing::info!("Recovered JSON through a repair call");
                return Ok(value);
            }
            Err(reason) => reason,
        };

        tracing::warn!("JSON recovery exhausted: {}", repair);
        Err(RecoveryError::Exhausted {
            prefix: truncate_chars(&failure.working, self.error_prefix_chars).to_string(),
            direct: failure.direct,
            extracted: failure.extracted,
            repair,
        })
    }

    async fn repair(&self, working: &str) -> Result<Value, String> {
        let generator = self
            .generator
            .as_ref()
            .ok_or_else(|| "no generator configured".to_string())?;

        let prompt = format!(
            "Fix the following model output so that it is valid JSON. Return only the \
             corrected JSON, without Markdown fences and without this instruction.\n\n{}",
            truncate_chars(working, self.repair_max_chars)
        );
        let response = complete_with_timeout(
            generator.as_ref(),
            &[ChatMessage::user(prompt)],
            Purpose::JsonRepair,
            self.timeout,
        )
        .await
        .map_err(|e| e.to_string())?;

        let repaired = self.strip_fences(&self.strip_controls(&response));
        serde_json::from_str(&repaired).map_err(|e| e.to_string())
    }
}

/// First `{...}` whose braces balance, ignoring braces inside strings
pub fn extract_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Longest prefix of at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
