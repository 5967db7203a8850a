//! Cost calculation from token usage and model pricing.
//!
//! Single source of truth for turning per-call token usage into spend.
//! Amounts are nanodollars per token (1 USD = 1_000_000_000 nanodollars);
//! integer arithmetic avoids floating-point rounding drift in the running
//! totals the budget guards compare against.

/// Model pricing in nanodollars per token.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars
    pub input_nano_per_token: u64,
    /// Cost per output token in nanodollars
    pub output_nano_per_token: u64,
}

/// Normalize model names to canonical form for pricing lookup.
fn normalize_model(model: &str) -> &str {
    let trimmed = model.trim();

    match trimmed {
        s if s.contains("claude-haiku-4") || s.contains("claude-4-haiku") => "claude-haiku-4",
        s if s.contains("claude-sonnet-4") || s.contains("claude-4-sonnet") => "claude-sonnet-4",
        s if s.contains("claude-opus-4") || s.contains("claude-4-opus") => "claude-opus-4",
        s if s.contains("claude-3-5-haiku") || s.contains("claude-3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("claude-3-5-sonnet") || s.contains("claude-3.5-sonnet") => {
            "claude-3-5-sonnet"
        }
        _ => trimmed,
    }
}

/// Get pricing for a model. Returns None if the model is unknown.
///
/// Prices are per 1M tokens converted to nanodollars per token:
/// - $3/1M input = 3_000 nanodollars per token
/// - $15/1M output = 15_000 nanodollars per token
pub fn pricing_for_model(model: &str) -> Option<ModelPricing> {
    match normalize_model(model) {
        // Claude Haiku 4.x: $0.80/1M input, $4/1M output
        "claude-haiku-4" | "claude-3-5-haiku" => Some(ModelPricing {
            input_nano_per_token: 800,
            output_nano_per_token: 4_000,
        }),

        // Claude Sonnet 4.x: $3/1M input, $15/1M output
        "claude-sonnet-4" | "claude-3-5-sonnet" => Some(ModelPricing {
            input_nano_per_token: 3_000,
            output_nano_per_token: 15_000,
        }),

        // Claude Opus 4.x: $15/1M input, $75/1M output
        "claude-opus-4" => Some(ModelPricing {
            input_nano_per_token: 15_000,
            output_nano_per_token: 75_000,
        }),

        _ => None,
    }
}

/// Calculate the cost of one reasoning-service call in nanodollars.
///
/// Returns 0 for unknown models (with a warning) and for calls that report
/// no token usage.
pub fn cost_nanos(model: &str, input_tokens: u64, output_tokens: u64) -> u64 {
    if input_tokens == 0 && output_tokens == 0 {
        return 0;
    }

    let Some(pricing) = pricing_for_model(model) else {
        tracing::warn!(model = %model, "Unknown model for cost calculation, using 0 cost");
        return 0;
    };

    input_tokens
        .saturating_mul(pricing.input_nano_per_token)
        .saturating_add(output_tokens.saturating_mul(pricing.output_nano_per_token))
}
