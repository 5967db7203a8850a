//! Tier routing: picks a reasoning tier (model + token ceilings) for a
//! worker node.
//!
//! Routing itself goes through the light model; if the routing call fails
//! the classifier falls back to the standard tier rather than blocking the
//! task. Planner nodes never consult the classifier - the engine pins them
//! to the complex tier.

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{ChatMessage, ChatOptions, LlmClient, Role};

/// Output-token ceiling for the routing call itself.
const ROUTE_OUTPUT_TOKENS: u64 = 100;

const ROUTER_PROMPT: &str = "Classify this task into exactly one category. Respond with ONLY the category name, nothing else.

LIGHT - file reads, status checks, simple formatting, short summaries, listing files, simple questions
HEAVY - long-form writing, analysis, experiment design, code debugging, multi-step reasoning, data interpretation

Task: ";

/// Keywords that push an unrouted task to the complex tier.
const COMPLEX_KEYWORDS: &[&str] = &["write", "analyze", "design", "debug", "compare", "explain"];

/// Reasoning tier for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Simple,
    Standard,
    Complex,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Simple => "simple",
            Tier::Standard => "standard",
            Tier::Complex => "complex",
        }
    }

    /// Input-token ceiling for calls at this tier.
    pub fn input_ceiling(&self) -> u64 {
        match self {
            Tier::Simple => 2_000,
            Tier::Standard => 8_000,
            Tier::Complex => 12_000,
        }
    }

    /// Output-token ceiling for calls at this tier.
    pub fn output_ceiling(&self) -> u64 {
        match self {
            Tier::Simple => 500,
            Tier::Standard => 2_000,
            Tier::Complex => 4_000,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The classifier's pick for one node.
#[derive(Debug, Clone)]
pub struct Classification {
    pub model: String,
    pub tier: Tier,
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
}

/// External capability that picks a reasoning tier for a task description.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a task description into a tier.
    async fn classify(&self, description: &str) -> Classification;

    /// Explicit override: the classification for a named tier.
    fn classification_for(&self, tier: Tier) -> Classification;
}

/// LLM-backed classifier routing through the light model.
pub struct LlmClassifier {
    llm: Arc<dyn LlmClient>,
    model_light: String,
    model_heavy: String,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, model_light: String, model_heavy: String) -> Self {
        Self {
            llm,
            model_light,
            model_heavy,
        }
    }

    fn model_for(&self, tier: Tier) -> String {
        match tier {
            Tier::Simple => self.model_light.clone(),
            Tier::Standard | Tier::Complex => self.model_heavy.clone(),
        }
    }

    /// Parse a leading tier directive (`!light` / `!deep`) from a description.
    fn override_tier(description: &str) -> Option<Tier> {
        let lower = description.trim_start().to_lowercase();
        if lower.starts_with("!light") {
            Some(Tier::Simple)
        } else if lower.starts_with("!deep") {
            Some(Tier::Complex)
        } else {
            None
        }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, description: &str) -> Classification {
        if let Some(tier) = Self::override_tier(description) {
            return self.classification_for(tier);
        }

        let messages = [ChatMessage::new(
            Role::User,
            format!("{}{}", ROUTER_PROMPT, description),
        )];
        let options = ChatOptions {
            temperature: Some(0.0),
            max_tokens: Some(ROUTE_OUTPUT_TOKENS),
        };

        match self
            .llm
            .chat_completion_with_options(&self.model_light, &messages, None, options)
            .await
        {
            Ok(response) => {
                let verdict = response.content.unwrap_or_default().to_uppercase();
                if verdict.contains("LIGHT") {
                    return self.classification_for(Tier::Simple);
                }
                let lower = description.to_lowercase();
                let heavy = description.len() > 500
                    || COMPLEX_KEYWORDS.iter().any(|kw| lower.contains(kw));
                if heavy {
                    self.classification_for(Tier::Complex)
                } else {
                    self.classification_for(Tier::Standard)
                }
            }
            Err(e) => {
                // Routing failure must not block the task
                tracing::warn!("Tier routing failed, defaulting to standard: {}", e);
                self.classification_for(Tier::Standard)
            }
        }
    }

    fn classification_for(&self, tier: Tier) -> Classification {
        Classification {
            model: self.model_for(tier),
            tier,
            max_input_tokens: tier.input_ceiling(),
            max_output_tokens: tier.output_ceiling(),
        }
    }
}
