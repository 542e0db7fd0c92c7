use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Duration as TtlDuration;
use tracing::{debug, info, warn};

use tollgate_core::analysis::{analysis_prompt, fallback_analysis, parse_analysis};
use tollgate_core::clock::Clock;
use tollgate_core::config::AnalyzerConfig;
use tollgate_core::domain::analysis::AnalysisResult;
use tollgate_core::domain::cache::AnalysisCacheEntry;
use tollgate_core::domain::tenant::TenantId;
use tollgate_core::normalize::content_hash;
use tollgate_db::repositories::AnalysisCacheRepository;

use crate::broker::{CompletionService, RequestOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalysisSource {
    Cache,
    Model,
    Fallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisOutcome {
    pub result: AnalysisResult,
    pub source: AnalysisSource,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyzerSettings {
    pub cache_ttl_days: u32,
    pub timeout: Duration,
    pub max_keywords: usize,
}

impl From<&AnalyzerConfig> for AnalyzerSettings {
    fn from(config: &AnalyzerConfig) -> Self {
        Self {
            cache_ttl_days: config.cache_ttl_days,
            timeout: Duration::from_secs(config.timeout_secs),
            max_keywords: config.max_keywords,
        }
    }
}

/// Classifies inbound messages. Never fails: any cache, provider, or parse
/// problem degrades to the rule-based fallback.
pub struct MessageAnalyzer {
    completions: Arc<dyn CompletionService>,
    cache: Arc<dyn AnalysisCacheRepository>,
    clock: Arc<dyn Clock>,
    settings: AnalyzerSettings,
}

impl MessageAnalyzer {
    pub fn new(
        completions: Arc<dyn CompletionService>,
        cache: Arc<dyn AnalysisCacheRepository>,
        clock: Arc<dyn Clock>,
        settings: AnalyzerSettings,
    ) -> Self {
        Self { completions, cache, clock, settings }
    }

    pub async fn analyze(&self, tenant_id: &TenantId, text: &str) -> AnalysisResult {
        self.analyze_with_source(tenant_id, text).await.result
    }

    pub async fn analyze_with_source(&self, tenant_id: &TenantId, text: &str) -> AnalysisOutcome {
        let hash = content_hash(text);

        match self.cache.find_live(tenant_id, &hash, self.clock.now()).await {
            Ok(Some(entry)) => {
                if let Err(error) = self.cache.record_hit(tenant_id, &hash, self.clock.now()).await {
                    warn!(
                        event_name = "analyzer.cache.hit_count_failed",
                        tenant_id = %tenant_id,
                        error = %error,
                        "could not record analysis cache hit"
                    );
                }
                debug!(event_name = "analyzer.cache.hit", tenant_id = %tenant_id, "analysis cache hit");
                return AnalysisOutcome { result: entry.result, source: AnalysisSource::Cache };
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    event_name = "analyzer.cache.lookup_failed",
                    tenant_id = %tenant_id,
                    error = %error,
                    "analysis cache unavailable; analyzing without it"
                );
            }
        }

        let started = Instant::now();
        let prompt = analysis_prompt(text, self.settings.max_keywords);
        let call = self.completions.complete(tenant_id, &prompt, RequestOptions::default());

        let reply = match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => {
                return self.fallback(tenant_id, text, &error.to_string());
            }
            Err(_elapsed) => {
                return self.fallback(tenant_id, text, "analysis timed out");
            }
        };

        let result = match parse_analysis(&reply.response, self.settings.max_keywords) {
            Ok(result) => result,
            Err(error) => return self.fallback(tenant_id, text, &error.to_string()),
        };

        let now = self.clock.now();
        let entry = AnalysisCacheEntry {
            tenant_id: tenant_id.clone(),
            content_hash: hash,
            result: result.clone(),
            provider: reply.provider,
            model: reply.model,
            processing_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            hit_count: 0,
            last_used_at: now,
            expires_at: now + TtlDuration::days(i64::from(self.settings.cache_ttl_days)),
            created_at: now,
        };
        if let Err(error) = self.cache.upsert(entry).await {
            warn!(
                event_name = "analyzer.cache.store_failed",
                tenant_id = %tenant_id,
                error = %error,
                "could not cache analysis result"
            );
        }

        info!(
            event_name = "analyzer.completed",
            tenant_id = %tenant_id,
            intentions = ?result.intentions,
            confidence = result.confidence,
            "message analyzed"
        );
        AnalysisOutcome { result, source: AnalysisSource::Model }
    }

    fn fallback(&self, tenant_id: &TenantId, text: &str, reason: &str) -> AnalysisOutcome {
        warn!(
            event_name = "analyzer.fallback",
            tenant_id = %tenant_id,
            reason,
            "falling back to rule-based analysis"
        );
        AnalysisOutcome {
            result: fallback_analysis(text, self.settings.max_keywords),
            source: AnalysisSource::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use tollgate_core::clock::FixedClock;
    use tollgate_core::domain::analysis::{Intention, Sentiment};
    use tollgate_core::domain::tenant::TenantId;
    use tollgate_core::domain::wallet::TokenUsage;
    use tollgate_db::repositories::InMemoryAnalysisCacheRepository;

    use super::{AnalysisSource, AnalyzerSettings, MessageAnalyzer};
    use crate::broker::{BrokerError, BrokerResponse, CompletionService, RequestOptions};

    struct ScriptedCompletions {
        answer: Result<String, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletions {
        async fn complete(
            &self,
            _tenant_id: &TenantId,
            _prompt: &str,
            _options: RequestOptions,
        ) -> Result<BrokerResponse, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.answer {
                Ok(text) => Ok(BrokerResponse {
                    response: text.clone(),
                    transaction_id: None,
                    provider_cost: Decimal::ZERO,
                    client_cost: Decimal::ZERO,
                    usage: TokenUsage::new(10, 10),
                    provider: "openai".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    cache_hit: false,
                    processing_ms: 1,
                    reconciliation: None,
                }),
                Err(message) => Err(BrokerError::Provider {
                    provider: "openai".to_string(),
                    message: message.clone(),
                }),
            }
        }
    }

    fn analyzer(answer: Result<String, String>) -> (MessageAnalyzer, Arc<ScriptedCompletions>) {
        let completions = Arc::new(ScriptedCompletions { answer, calls: AtomicUsize::new(0) });
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap());
        let analyzer = MessageAnalyzer::new(
            completions.clone(),
            Arc::new(InMemoryAnalysisCacheRepository::default()),
            Arc::new(clock),
            AnalyzerSettings { cache_ttl_days: 7, timeout: Duration::from_secs(5), max_keywords: 10 },
        );
        (analyzer, completions)
    }

    #[tokio::test]
    async fn model_answer_is_parsed_then_served_from_cache() {
        let (analyzer, completions) = analyzer(Ok(
            r#"{"intentions":["SALES"],"confidence":0.8,"sentiment":"positive","keywords":["pricing"]}"#
                .to_string(),
        ));
        let tenant = TenantId::new("t-an");

        let first = analyzer.analyze_with_source(&tenant, "What is your pricing?").await;
        assert_eq!(first.source, AnalysisSource::Model);
        assert_eq!(first.result.intentions, vec![Intention::Sales]);
        assert_eq!(first.result.sentiment, Sentiment::Positive);

        let second = analyzer.analyze_with_source(&tenant, "  what is your PRICING?  ").await;
        assert_eq!(second.source, AnalysisSource::Cache);
        assert_eq!(second.result, first.result);
        assert_eq!(completions.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_fallback() {
        let (analyzer, _) = analyzer(Err("502 bad gateway".to_string()));

        let outcome =
            analyzer.analyze_with_source(&TenantId::new("t-an"), "Refund my order please").await;

        assert_eq!(outcome.source, AnalysisSource::Fallback);
        assert_eq!(outcome.result.intentions, vec![Intention::Other]);
        assert!((outcome.result.confidence - 0.1).abs() < f64::EPSILON);
        assert!(outcome.result.keywords.contains(&"refund".to_string()));
    }

    #[tokio::test]
    async fn unparseable_answer_is_not_cached() {
        let (analyzer, completions) = analyzer(Ok("I think it's about sales".to_string()));
        let tenant = TenantId::new("t-an");

        let first = analyzer.analyze_with_source(&tenant, "hello").await;
        let second = analyzer.analyze_with_source(&tenant, "hello").await;

        assert_eq!(first.source, AnalysisSource::Fallback);
        assert_eq!(second.source, AnalysisSource::Fallback);
        assert_eq!(completions.calls.load(Ordering::SeqCst), 2);
    }
}
