//! Answer generation boundary.
//!
//! The language model that turns passages into prose lives outside this
//! crate and plugs in through [`AnswerGenerator`]. [`ExtractiveGenerator`]
//! is a deterministic stand-in that quotes the best passages with their
//! sources.

use async_trait::async_trait;
use serde::Serialize;

use policy_retrieval_core::models::{Citation, RoleScope, ScoredChunk};

use crate::error::Result;
use crate::query::ServiceStatus;

/// Returned when no passage clears the confidence threshold.
pub const NO_POLICY_FOUND: &str = "I couldn't find a policy that answers this question. \
Please rephrase it or contact HR directly.";

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Produce answer text from ranked passages. `passages` is never empty.
    async fn generate(&self, question: &str, passages: &[ScoredChunk]) -> Result<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub role: RoleScope,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub cached: bool,
    pub fingerprint: String,
    pub status: ServiceStatus,
}

pub struct ExtractiveGenerator {
    max_passages: usize,
    max_chars: usize,
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self {
            max_passages: 3,
            max_chars: 600,
        }
    }
}

impl ExtractiveGenerator {
    pub fn new(max_passages: usize, max_chars: usize) -> Self {
        Self {
            max_passages: max_passages.max(1),
            max_chars: max_chars.max(1),
        }
    }
}

#[async_trait]
impl AnswerGenerator for ExtractiveGenerator {
    async fn generate(&self, _question: &str, passages: &[ScoredChunk]) -> Result<String> {
        let mut out = String::from("Here is what the policy documents say:\n");
        for passage in passages.iter().take(self.max_passages) {
            out.push_str("\n> ");
            out.push_str(&excerpt(&passage.text, self.max_chars).replace('\n', "\n> "));
            out.push_str(&format!("\n(Source: {})\n", passage.title));
        }
        Ok(out)
    }
}

/// At most `max_chars` characters, cut back to a word boundary.
fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    let cut = match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(title: &str, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk_id: "c".into(),
            role: RoleScope::Employee,
            document_key: format!("employee/{}", title),
            title: title.into(),
            chunk_index: 0,
            text: text.into(),
            score: 0.8,
            lexical_score: 0.7,
            vector_score: 0.9,
        }
    }

    #[tokio::test]
    async fn test_extractive_answer_cites_sources() {
        let g = ExtractiveGenerator::default();
        let text = g
            .generate(
                "how do i apply for leave?",
                &[passage("Leave-Policy.pdf", "Apply through the portal.\nManager approves.")],
            )
            .await
            .unwrap();
        assert!(text.contains("> Apply through the portal.\n> Manager approves."));
        assert!(text.contains("(Source: Leave-Policy.pdf)"));
    }

    #[tokio::test]
    async fn test_passage_limit() {
        let g = ExtractiveGenerator::new(1, 100);
        let text = g
            .generate("q", &[passage("a.md", "first"), passage("b.md", "second")])
            .await
            .unwrap();
        assert!(text.contains("a.md"));
        assert!(!text.contains("b.md"));
    }

    #[test]
    fn test_excerpt_cuts_at_word_boundary() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("alpha beta gamma", 12), "alpha beta…");
    }
}
