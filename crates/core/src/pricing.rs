use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::wallet::TokenUsage;

/// Scale every stored money amount is rounded to.
pub const MONEY_SCALE: u32 = 8;

/// Characters per token used by the pre-call estimate.
pub const CHARS_PER_TOKEN: u64 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPrices {
    pub input: Decimal,
    pub output: Decimal,
}

impl TokenPrices {
    pub fn cost(&self, usage: TokenUsage) -> Decimal {
        (self.input * Decimal::from(usage.input_tokens)
            + self.output * Decimal::from(usage.output_tokens))
        .round_dp(MONEY_SCALE)
    }
}

/// Tenant-facing pricing: provider cost marked up by `margin`, and cache hits
/// billed at `cache_hit_fraction` of the original provider cost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginPolicy {
    pub margin: Decimal,
    pub cache_hit_fraction: Decimal,
}

impl Default for MarginPolicy {
    fn default() -> Self {
        Self { margin: Decimal::new(30, 2), cache_hit_fraction: Decimal::new(10, 2) }
    }
}

impl MarginPolicy {
    pub fn client_cost(&self, provider_cost: Decimal) -> Decimal {
        client_cost(provider_cost, self.margin)
    }

    /// Provider-side cost attributed to a cache hit.
    pub fn symbolic_cost(&self, original_provider_cost: Decimal) -> Decimal {
        (original_provider_cost * self.cache_hit_fraction).round_dp(MONEY_SCALE)
    }
}

pub fn client_cost(provider_cost: Decimal, margin: Decimal) -> Decimal {
    (provider_cost * (Decimal::ONE + margin)).round_dp(MONEY_SCALE)
}

pub fn estimate_tokens(prompt: &str) -> u64 {
    let chars = prompt.chars().count() as u64;
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Best-effort provider cost guess made before any provider call.
pub fn estimate_provider_cost(prompt: &str, per_token_estimate: Decimal) -> Decimal {
    (Decimal::from(estimate_tokens(prompt)) * per_token_estimate).round_dp(MONEY_SCALE)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{estimate_provider_cost, estimate_tokens, MarginPolicy, TokenPrices};
    use crate::domain::wallet::TokenUsage;

    #[test]
    fn client_cost_applies_thirty_percent_margin() {
        let policy = MarginPolicy::default();
        assert_eq!(policy.client_cost(Decimal::new(50, 2)), Decimal::new(65, 2));
    }

    #[test]
    fn cache_hit_costs_ten_percent_marked_up() {
        let policy = MarginPolicy::default();
        let symbolic = policy.symbolic_cost(Decimal::new(50, 2));

        assert_eq!(symbolic, Decimal::new(5, 2));
        assert_eq!(policy.client_cost(symbolic), Decimal::new(65, 3));
    }

    #[test]
    fn token_prices_sum_input_and_output() {
        let prices = TokenPrices { input: Decimal::new(1, 6), output: Decimal::new(2, 6) };
        let cost = prices.cost(TokenUsage::new(1_000, 500));
        assert_eq!(cost, Decimal::new(2, 3));
    }

    #[test]
    fn estimate_rounds_token_count_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_provider_cost("abcdefgh", Decimal::new(1, 2)), Decimal::new(2, 2));
    }
}
