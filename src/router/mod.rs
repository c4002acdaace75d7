//! Tiered LLM router with quality-driven fallback and cost accounting.
//!
//! Calls are classified by complexity, dispatched to the cheapest
//! acceptable tier (local_fast / local_quality / api_fallback), quality
//! checked, and retried up the fallback chain when the response scores
//! below threshold or the provider fails. Every attempt is recorded in the
//! usage log; a daily budget cap aborts api_fallback calls.

mod classify;
mod provider;
mod quality;
mod usage;

pub use classify::{Complexity, ComplexityClassifier};
pub use provider::{
    AnthropicProvider, LlmProvider, LlmRequest, LlmResponse, ModelConfig, OllamaProvider,
    RouteTier, ScriptedProvider,
};
pub use quality::{critique_prompt, parse_critique, score_response, ResponseExpectations};
pub use usage::{TierStats, UsageLog, UsageRecord, UsageSummary};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retrieval::Summarizer;

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Minimum acceptable quality score.
    pub quality_threshold: f64,
    /// Quality- or error-driven fallbacks allowed after the first attempt.
    pub max_fallback_attempts: u32,
    /// When false, route one tier above the classified choice.
    pub prefer_local: bool,
    /// Ask a fast-tier model to validate responses (the 20% critique
    /// component).
    pub self_critique: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 0.7,
            max_fallback_attempts: 2,
            prefer_local: true,
            self_critique: false,
        }
    }
}

/// Per-call routing context.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Action type driving classification (e.g. `classify`, `code_edit`,
    /// `orchestrate`).
    pub action_type: String,
    /// Force the api_fallback tier regardless of classification.
    pub quality_critical: bool,
    /// Response shape expectations for quality scoring.
    pub expectations: ResponseExpectations,
}

impl CallContext {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            ..Self::default()
        }
    }

    pub fn quality_critical(mut self) -> Self {
        self.quality_critical = true;
        self
    }

    pub fn with_expectations(mut self, expectations: ResponseExpectations) -> Self {
        self.expectations = expectations;
        self
    }
}

/// Successful routing result.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub content: String,
    pub tier: RouteTier,
    pub model: String,
    pub quality: f64,
    pub cost: f64,
    pub attempts: u32,
}

struct TierModel {
    config: ModelConfig,
    provider: Arc<dyn LlmProvider>,
}

/// The three-tier router.
pub struct TieredRouter {
    tiers: HashMap<RouteTier, Vec<TierModel>>,
    classifier: ComplexityClassifier,
    config: RouterConfig,
    usage: UsageLog,
}

impl TieredRouter {
    pub fn new(config: RouterConfig, daily_budget_usd: f64) -> Self {
        Self {
            tiers: HashMap::new(),
            classifier: ComplexityClassifier::new(),
            config,
            usage: UsageLog::new(daily_budget_usd),
        }
    }

    pub fn with_classifier(mut self, classifier: ComplexityClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Register a model under a tier; ordering within a tier is fallback
    /// order.
    pub fn add_model(
        &mut self,
        tier: RouteTier,
        config: ModelConfig,
        provider: Arc<dyn LlmProvider>,
    ) {
        self.tiers
            .entry(tier)
            .or_default()
            .push(TierModel { config, provider });
    }

    pub fn usage(&self) -> &UsageLog {
        &self.usage
    }

    /// Map complexity to a starting tier, honoring overrides.
    fn select_tier(&self, complexity: Complexity, context: &CallContext) -> RouteTier {
        if context.quality_critical {
            return RouteTier::ApiFallback;
        }
        let base = match complexity {
            Complexity::Simple => RouteTier::LocalFast,
            Complexity::Moderate => RouteTier::LocalQuality,
            Complexity::Complex => RouteTier::ApiFallback,
        };
        if self.config.prefer_local {
            base
        } else {
            base.next().unwrap_or(base)
        }
    }

    /// Route one call through the fallback chain.
    pub async fn route(
        &self,
        request: &LlmRequest,
        context: &CallContext,
    ) -> Result<RoutedResponse> {
        let complexity = self.classifier.classify(&context.action_type, &request.prompt);
        let start_tier = self.select_tier(complexity, context);
        debug!(
            action = %context.action_type,
            %complexity,
            tier = %start_tier,
            "routing LLM call"
        );

        // Flatten the fallback chain: models of the starting tier in
        // order, then every higher tier's models.
        let mut chain: Vec<(RouteTier, &TierModel)> = Vec::new();
        let mut tier = Some(start_tier);
        while let Some(current) = tier {
            if let Some(models) = self.tiers.get(&current) {
                for model in models.iter().filter(|m| m.config.enabled) {
                    chain.push((current, model));
                }
            }
            tier = current.next();
        }

        if chain.is_empty() {
            return Err(Error::RoutingExhausted {
                attempts: 0,
                last_error: "no enabled models in any reachable tier".to_string(),
            });
        }

        let max_attempts = 1 + self.config.max_fallback_attempts;
        let mut attempts = 0u32;
        let mut last_error = String::new();
        let mut fallback_from: Option<RouteTier> = None;

        for (tier, model) in chain {
            if attempts >= max_attempts {
                break;
            }

            if tier == RouteTier::ApiFallback && !self.usage.api_budget_available() {
                last_error = "daily budget exhausted for api_fallback".to_string();
                warn!("skipping api_fallback model: daily budget exhausted");
                continue;
            }

            attempts += 1;
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                Duration::from_secs(model.config.timeout_s),
                model.provider.complete(&model.config.model_id, request),
            )
            .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    self.record_attempt(tier, model, 0, 0, latency_ms, None, fallback_from, false);
                    fallback_from = Some(tier);
                    continue;
                }
                Err(_) => {
                    last_error = format!("timeout after {}s", model.config.timeout_s);
                    self.record_attempt(tier, model, 0, 0, latency_ms, None, fallback_from, false);
                    fallback_from = Some(tier);
                    continue;
                }
            };

            let critique = if self.config.self_critique {
                self.run_critique(&request.prompt, &response.content).await
            } else {
                None
            };
            let quality = score_response(&response.content, &context.expectations, critique);
            let cost = model.config.cost(response.tokens_in, response.tokens_out);
            self.record_attempt(
                tier,
                model,
                response.tokens_in,
                response.tokens_out,
                latency_ms,
                Some(quality),
                fallback_from,
                true,
            );

            if quality >= self.config.quality_threshold {
                info!(
                    tier = %tier,
                    model = %model.config.name,
                    quality,
                    attempts,
                    "LLM call routed"
                );
                return Ok(RoutedResponse {
                    content: response.content,
                    tier,
                    model: model.config.name.clone(),
                    quality,
                    cost,
                    attempts,
                });
            }

            last_error = format!(
                "quality {:.2} below threshold {:.2} on {}",
                quality, self.config.quality_threshold, model.config.name
            );
            debug!(%last_error, "falling back");
            fallback_from = Some(tier);
        }

        Err(Error::RoutingExhausted {
            attempts,
            last_error,
        })
    }

    /// Ask the first enabled local_fast model for a yes/no validation.
    async fn run_critique(&self, prompt: &str, response: &str) -> Option<bool> {
        let model = self
            .tiers
            .get(&RouteTier::LocalFast)?
            .iter()
            .find(|m| m.config.enabled)?;
        let request = LlmRequest::new(critique_prompt(prompt, response)).with_max_tokens(8);
        let reply = tokio::time::timeout(
            Duration::from_secs(model.config.timeout_s),
            model.provider.complete(&model.config.model_id, &request),
        )
        .await
        .ok()?
        .ok()?;
        parse_critique(&reply.content)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_attempt(
        &self,
        tier: RouteTier,
        model: &TierModel,
        tokens_in: u64,
        tokens_out: u64,
        latency_ms: u64,
        quality: Option<f64>,
        fallback_from: Option<RouteTier>,
        success: bool,
    ) {
        self.usage.record(UsageRecord {
            timestamp: Utc::now(),
            tier,
            model: model.config.name.clone(),
            tokens_in,
            tokens_out,
            cost: model.config.cost(tokens_in, tokens_out),
            latency_ms,
            quality,
            fallback_from,
            success,
        });
    }
}

#[async_trait]
impl Summarizer for TieredRouter {
    /// Consolidation text synthesis, routed at moderate complexity.
    async fn summarize(&self, texts: &[String]) -> Result<String> {
        let prompt = format!(
            "Merge these near-duplicate memory records into one concise record that \
             preserves every distinct fact. Reply with the merged text only.\n\n{}",
            texts
                .iter()
                .map(|t| format!("- {}", t))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let response = self
            .route(
                &LlmRequest::new(prompt),
                &CallContext::new("consolidate")
                    .with_expectations(ResponseExpectations::text(10)),
            )
            .await?;
        Ok(response.content.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn router_with(
        fast: Option<Arc<ScriptedProvider>>,
        quality_tier: Option<Arc<ScriptedProvider>>,
        api: Option<Arc<ScriptedProvider>>,
    ) -> TieredRouter {
        let mut router = TieredRouter::new(RouterConfig::default(), 10.0);
        if let Some(p) = fast {
            router.add_model(RouteTier::LocalFast, ModelConfig::local("fast", "fast:1b"), p);
        }
        if let Some(p) = quality_tier {
            router.add_model(
                RouteTier::LocalQuality,
                ModelConfig::local("quality", "quality:7b"),
                p,
            );
        }
        if let Some(p) = api {
            router.add_model(
                RouteTier::ApiFallback,
                ModelConfig::api("api", "claude-3-5-sonnet-20241022", 0.009),
                p,
            );
        }
        router
    }

    fn ok(text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    #[tokio::test]
    async fn test_simple_call_stays_local() {
        let fast = Arc::new(ScriptedProvider::new("fast", vec![ok("bug_report")]));
        let router = router_with(Some(fast.clone()), None, None);

        let response = router
            .route(
                &LlmRequest::new("Classify this issue: crash on startup"),
                &CallContext::new("classify")
                    .with_expectations(ResponseExpectations::text(3)),
            )
            .await
            .unwrap();

        assert_eq!(response.tier, RouteTier::LocalFast);
        assert_eq!(response.cost, 0.0);
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn test_quality_driven_fallback_to_api() {
        // Local quality model returns a refusal (scores low); the API model
        // answers properly.
        let quality_tier = Arc::new(ScriptedProvider::new(
            "quality",
            vec![ok("I cannot help with that request.")],
        ));
        let api = Arc::new(ScriptedProvider::new(
            "api",
            vec![ok("The fix is to rotate the token cache before retries.")],
        ));
        let router = router_with(None, Some(quality_tier), Some(api));

        let response = router
            .route(
                &LlmRequest::new("Summarize the token bug fix"),
                &CallContext::new("summarize")
                    .with_expectations(ResponseExpectations::text(20)),
            )
            .await
            .unwrap();

        assert_eq!(response.tier, RouteTier::ApiFallback);
        assert_eq!(response.attempts, 2);
        assert!(response.quality >= 0.7);
        assert!(response.cost > 0.0);

        // One attempt recorded per tier
        assert_eq!(router.usage().tier_calls(RouteTier::LocalQuality), 1);
        assert_eq!(router.usage().tier_calls(RouteTier::ApiFallback), 1);

        let records = router.usage().records();
        assert_eq!(records[0].cost, 0.0);
        assert!(records[0].quality.unwrap() < 0.7);
        assert_eq!(records[1].fallback_from, Some(RouteTier::LocalQuality));
    }

    #[tokio::test]
    async fn test_provider_error_falls_back() {
        let quality_tier = Arc::new(ScriptedProvider::new(
            "quality",
            vec![Err(Error::provider("ollama", "connection refused"))],
        ));
        let api = Arc::new(ScriptedProvider::new(
            "api",
            vec![ok("A complete answer about the summarized change.")],
        ));
        let router = router_with(None, Some(quality_tier), Some(api));

        let response = router
            .route(
                &LlmRequest::new("Summarize the change"),
                &CallContext::new("summarize")
                    .with_expectations(ResponseExpectations::text(10)),
            )
            .await
            .unwrap();
        assert_eq!(response.tier, RouteTier::ApiFallback);
    }

    #[tokio::test]
    async fn test_chain_exhaustion_is_typed_error() {
        let quality_tier = Arc::new(ScriptedProvider::new(
            "quality",
            vec![Err(Error::provider("ollama", "down"))],
        ));
        let api = Arc::new(ScriptedProvider::new(
            "api",
            vec![Err(Error::provider("anthropic", "rate limited"))],
        ));
        let router = router_with(None, Some(quality_tier), Some(api));

        let err = router
            .route(
                &LlmRequest::new("Summarize the change"),
                &CallContext::new("summarize"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RoutingExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_quality_critical_forces_api() {
        let fast = Arc::new(ScriptedProvider::new("fast", vec![ok("fast answer")]));
        let api = Arc::new(ScriptedProvider::new(
            "api",
            vec![ok("A careful, complete answer.")],
        ));
        let router = router_with(Some(fast.clone()), None, Some(api));

        let response = router
            .route(
                &LlmRequest::new("short check"),
                &CallContext::new("classify")
                    .quality_critical()
                    .with_expectations(ResponseExpectations::text(5)),
            )
            .await
            .unwrap();

        assert_eq!(response.tier, RouteTier::ApiFallback);
        assert_eq!(fast.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_budget_cap_aborts_api_calls() {
        let api = Arc::new(ScriptedProvider::new("api", vec![ok("answer"), ok("answer")]));
        let mut router = TieredRouter::new(RouterConfig::default(), 0.000001);
        router.add_model(
            RouteTier::ApiFallback,
            ModelConfig::api("api", "claude-3-5-sonnet-20241022", 10.0),
            api,
        );

        // First call spends past the tiny budget
        router
            .route(
                &LlmRequest::new("orchestrate the rollout across the codebase"),
                &CallContext::new("orchestrate")
                    .with_expectations(ResponseExpectations::text(3)),
            )
            .await
            .unwrap();

        let err = router
            .route(
                &LlmRequest::new("orchestrate the rollout across the codebase"),
                &CallContext::new("orchestrate"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("budget"));
    }

    #[tokio::test]
    async fn test_max_fallback_attempts_respected() {
        // Three failing models but only 1 + 2 attempts permitted
        let fast = Arc::new(ScriptedProvider::new(
            "fast",
            vec![Err(Error::provider("ollama", "down"))],
        ));
        let quality_tier = Arc::new(ScriptedProvider::new(
            "quality",
            vec![Err(Error::provider("ollama", "down"))],
        ));
        let api = Arc::new(ScriptedProvider::new(
            "api",
            vec![Err(Error::provider("anthropic", "down"))],
        ));
        let router = router_with(Some(fast), Some(quality_tier), Some(api));

        let err = router
            .route(
                &LlmRequest::new("label this"),
                &CallContext::new("classify"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RoutingExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_summarizer_uses_moderate_route() {
        let quality_tier = Arc::new(ScriptedProvider::new(
            "quality",
            vec![ok("Tokens rotate hourly and are cached per session.")],
        ));
        let router = router_with(None, Some(quality_tier), None);

        let summary = router
            .summarize(&[
                "tokens rotate hourly".to_string(),
                "token cache is per session".to_string(),
            ])
            .await
            .unwrap();
        assert!(summary.contains("rotate"));
        assert_eq!(router.usage().tier_calls(RouteTier::LocalQuality), 1);
    }
}
