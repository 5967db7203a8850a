//! Session memory: post-hoc summaries of completed root tasks.
//!
//! Each completed depth-0 task leaves behind one summary row. Later
//! depth-0 workers get recent summaries injected into their system prompt
//! and keyword-matched summaries injected as a leading conversation turn,
//! so the reasoning service has situational context it otherwise lacks
//! between calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{TaskId, TaskRole};
use crate::util::truncate_chars;

/// Maximum characters of the task description kept in a summary.
const DESCRIPTION_EXCERPT: usize = 200;
/// Maximum characters of the result kept in a summary.
const RESULT_EXCERPT: usize = 300;
/// Maximum keywords extracted from a description.
const MAX_KEYWORDS: usize = 5;

/// Summary of one completed root task. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMemory {
    pub id: String,
    pub task_id: TaskId,
    pub description: String,
    pub result: String,
    pub tags: Vec<String>,
    pub tier: String,
    pub steps: u32,
    pub role: TaskRole,
    pub created_at: DateTime<Utc>,
}

impl SessionMemory {
    /// Build the summary for a completed root task.
    pub fn from_completion(
        task_id: TaskId,
        description: &str,
        result: &str,
        tier: &str,
        steps: u32,
        role: TaskRole,
    ) -> Self {
        let result = if result.is_empty() {
            "No text output".to_string()
        } else {
            truncate_chars(result, RESULT_EXCERPT)
        };
        Self {
            id: format!("sm_{}", task_id),
            task_id,
            description: truncate_chars(description, DESCRIPTION_EXCERPT),
            result,
            tags: extract_keywords(description),
            tier: tier.to_string(),
            steps,
            role,
            created_at: Utc::now(),
        }
    }

    /// Format this memory as a one-line context entry.
    pub fn as_context_line(&self) -> String {
        format!("- {}: {}", self.description, self.result)
    }
}

/// Extract up to five unique keywords from free text, for memory search.
///
/// Words of three or more characters survive, minus a stop-word list;
/// surrounding punctuation is stripped.
pub fn extract_keywords(text: &str) -> Vec<String> {
    const STOP_WORDS: &[&str] = &[
        "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
        "do", "does", "did", "will", "would", "could", "should", "may", "might", "can", "shall",
        "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "about",
        "between", "through", "after", "before", "during", "without", "it", "its", "this", "that",
        "these", "those", "i", "you", "he", "she", "we", "they", "my", "your", "his", "her",
        "our", "their", "me", "him", "and", "or", "but", "not", "so", "if", "then", "than",
        "also", "just", "please", "help", "want", "need", "make", "get", "run",
    ];

    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();

    for raw in text.to_lowercase().split_whitespace() {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
        if word.len() < 3 || STOP_WORDS.contains(&word) {
            continue;
        }
        if seen.insert(word.to_string()) {
            keywords.push(word.to_string());
        }
        if keywords.len() >= MAX_KEYWORDS {
            break;
        }
    }

    keywords
}

/// Format a set of memories into a context block, empty string when none.
pub fn format_context(memories: &[SessionMemory]) -> String {
    memories
        .iter()
        .map(|m| m.as_context_line())
        .collect::<Vec<_>>()
        .join("\n")
}
