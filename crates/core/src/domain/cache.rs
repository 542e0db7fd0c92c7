use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::analysis::AnalysisResult;
use crate::domain::tenant::TenantId;

/// Cached LLM response keyed by `(tenant, normalized prompt hash)`.
///
/// `original_cost` is always the cost of a real provider invocation; a cache
/// hit never rewrites it, so the symbolic charge cannot compound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub tenant_id: TenantId,
    pub prompt_hash: String,
    pub response: String,
    pub provider: String,
    pub model: String,
    pub original_cost: Decimal,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub hit_count: u64,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: TenantId,
        prompt_hash: impl Into<String>,
        response: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        original_cost: Decimal,
        input_tokens: u32,
        output_tokens: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            prompt_hash: prompt_hash.into(),
            response: response.into(),
            provider: provider.into(),
            model: model.into(),
            original_cost,
            input_tokens,
            output_tokens,
            hit_count: 0,
            last_used_at: now,
            expires_at: now + ttl,
            active: true,
            created_at: now,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at > now
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCacheEntry {
    pub tenant_id: TenantId,
    pub content_hash: String,
    pub result: AnalysisResult,
    pub provider: String,
    pub model: String,
    pub processing_ms: u64,
    pub hit_count: u64,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AnalysisCacheEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub live_entries: u64,
    pub expired_entries: u64,
    pub total_hits: u64,
    /// Provider spend avoided by serving hits instead of regenerating.
    pub provider_cost_avoided: Decimal,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_provider_cost: Decimal,
    pub total_client_cost: Decimal,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub pending_reconciliations: u64,
}

impl BrokerStats {
    /// Hit rate in percent, rounded to two decimals.
    pub fn hit_rate_pct(&self) -> Decimal {
        if self.total_requests == 0 {
            return Decimal::ZERO;
        }
        (Decimal::from(self.cache_hits) * Decimal::ONE_HUNDRED / Decimal::from(self.total_requests))
            .round_dp(2)
    }

    pub fn margin_earned(&self) -> Decimal {
        self.total_client_cost - self.total_provider_cost
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use super::{BrokerStats, CacheEntry};
    use crate::domain::tenant::TenantId;

    #[test]
    fn entry_expires_after_ttl() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            TenantId::new("t-1"),
            "abc",
            "hello",
            "openai",
            "gpt-4o-mini",
            Decimal::new(5, 1),
            10,
            20,
            Duration::days(30),
            now,
        );

        assert!(entry.is_live(now + Duration::days(29)));
        assert!(!entry.is_live(now + Duration::days(30)));
    }

    #[test]
    fn hit_rate_handles_empty_and_partial_traffic() {
        assert_eq!(BrokerStats::default().hit_rate_pct(), Decimal::ZERO);

        let stats = BrokerStats { total_requests: 3, cache_hits: 1, ..BrokerStats::default() };
        assert_eq!(stats.hit_rate_pct(), Decimal::new(3333, 2));
    }
}
