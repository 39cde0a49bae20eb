//! Model pricing used to attach a cost to each usage record.
//!
//! Costs are computed in nanodollars (1 USD = 1_000_000_000) to avoid
//! floating-point rounding when many small calls are summed.

/// Model pricing in nanodollars per token.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_nano_per_token: u64,
    pub output_nano_per_token: u64,
    /// Rate for cached prompt tokens, when the host discounts them
    pub cached_input_nano_per_token: Option<u64>,
}

/// Host-independent token counts extracted from a usage record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Portion of `input_tokens` served from the prompt cache
    pub cached_input_tokens: u64,
}

impl TokenCounts {
    pub fn has_usage(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0
    }
}

/// Normalize model names to canonical form for pricing lookup.
///
/// Strips an `org/` prefix (OpenRouter style) and dated suffixes.
fn normalize_model(model: &str) -> &str {
    let trimmed = model.trim();
    let bare = trimmed.rsplit('/').next().unwrap_or(trimmed);

    match bare {
        s if s.contains("gpt-4o-mini") => "gpt-4o-mini",
        s if s.contains("gpt-4o") => "gpt-4o",
        s if s.contains("gpt-4.1-mini") => "gpt-4.1-mini",
        s if s.contains("gpt-4.1-nano") => "gpt-4.1-nano",
        s if s.contains("gpt-4.1") => "gpt-4.1",
        s if s.contains("claude-3-5-sonnet") || s.contains("claude-3.5-sonnet") => {
            "claude-3-5-sonnet"
        }
        s if s.contains("claude-sonnet-4") => "claude-sonnet-4",
        s if s.contains("claude-3-5-haiku") || s.contains("claude-3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("text-embedding-3-small") => "text-embedding-3-small",
        s if s.contains("text-embedding-3-large") => "text-embedding-3-large",
        _ => bare,
    }
}

/// Get pricing for a model. Returns None if model is unknown.
///
/// Formula: $X per 1M tokens = X * 1000 nanodollars per token.
pub fn pricing_for_model(model: &str) -> Option<ModelPricing> {
    let (input, output, cached) = match normalize_model(model) {
        // $0.15 / $0.60
        "gpt-4o-mini" => (150, 600, Some(75)),
        // $2.50 / $10
        "gpt-4o" => (2_500, 10_000, Some(1_250)),
        // $2 / $8
        "gpt-4.1" => (2_000, 8_000, Some(500)),
        // $0.40 / $1.60
        "gpt-4.1-mini" => (400, 1_600, Some(100)),
        // $0.10 / $0.40
        "gpt-4.1-nano" => (100, 400, Some(25)),
        // $3 / $15
        "claude-3-5-sonnet" | "claude-sonnet-4" => (3_000, 15_000, Some(300)),
        // $0.80 / $4
        "claude-3-5-haiku" => (800, 4_000, Some(80)),
        // embeddings have no output tokens
        "text-embedding-3-small" => (20, 0, None),
        "text-embedding-3-large" => (130, 0, None),
        _ => return None,
    };

    Some(ModelPricing {
        input_nano_per_token: input,
        output_nano_per_token: output,
        cached_input_nano_per_token: cached,
    })
}

/// Cost of one call in nanodollars, or `None` if the model is unknown.
pub fn cost_nanodollars(model: &str, counts: &TokenCounts) -> Option<u64> {
    let pricing = pricing_for_model(model)?;
    if !counts.has_usage() {
        return Some(0);
    }

    let cached = counts.cached_input_tokens.min(counts.input_tokens);
    let regular_input = counts.input_tokens - cached;
    let cached_rate = pricing
        .cached_input_nano_per_token
        .unwrap_or(pricing.input_nano_per_token);

    Some(
        regular_input
            .saturating_mul(pricing.input_nano_per_token)
            .saturating_add(cached.saturating_mul(cached_rate))
            .saturating_add(counts.output_tokens.saturating_mul(pricing.output_nano_per_token)),
    )
}
