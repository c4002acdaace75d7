//! LLM provider contract and implementations.
//!
//! Specific backends are external collaborators behind one trait: an
//! Anthropic HTTP client for the api_fallback tier and an Ollama client for
//! the local tiers. A missing credential disables the provider and the
//! router routes around it.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Routing tier for LLM calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTier {
    /// Small local models: classification, extraction, yes/no.
    LocalFast = 0,
    /// Mid-size local models: code edits, summarization, consolidation.
    LocalQuality = 1,
    /// Remote high-quality models: orchestration, critical paths.
    ApiFallback = 2,
}

impl RouteTier {
    /// The next tier in the fallback chain, if any.
    pub fn next(&self) -> Option<RouteTier> {
        match self {
            Self::LocalFast => Some(Self::LocalQuality),
            Self::LocalQuality => Some(Self::ApiFallback),
            Self::ApiFallback => None,
        }
    }
}

impl std::fmt::Display for RouteTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalFast => write!(f, "local_fast"),
            Self::LocalQuality => write!(f, "local_quality"),
            Self::ApiFallback => write!(f, "api_fallback"),
        }
    }
}

/// One routable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    pub model_id: String,
    pub cost_per_1k_tokens: f64,
    pub timeout_s: u64,
    pub context_window: u32,
    pub enabled: bool,
}

impl ModelConfig {
    pub fn local(name: &str, model_id: &str) -> Self {
        Self {
            name: name.to_string(),
            provider: "ollama".to_string(),
            model_id: model_id.to_string(),
            cost_per_1k_tokens: 0.0,
            timeout_s: 30,
            context_window: 8192,
            enabled: true,
        }
    }

    pub fn api(name: &str, model_id: &str, cost_per_1k_tokens: f64) -> Self {
        Self {
            name: name.to_string(),
            provider: "anthropic".to_string(),
            model_id: model_id.to_string(),
            cost_per_1k_tokens,
            timeout_s: 120,
            context_window: 200_000,
            enabled: true,
        }
    }

    /// Cost for a completed call.
    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in + tokens_out) as f64 / 1000.0 * self.cost_per_1k_tokens
    }
}

/// A completion request routed to some provider.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: 2048,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A provider completion.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Provider contract.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt with a specific model.
    async fn complete(&self, model_id: &str, request: &LlmRequest) -> Result<LlmResponse>;

    /// Provider name for error reporting and usage records.
    fn name(&self) -> &str;
}

// ==================== Anthropic ====================

/// Anthropic messages-API client.
pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl AnthropicProvider {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(api_key: impl Into<String>, timeout_s: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|e| Error::provider("anthropic", format!("http client: {}", e)))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            http,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, model_id: &str, request: &LlmRequest) -> Result<LlmResponse> {
        let api_request = AnthropicRequest {
            model: model_id.to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            max_tokens: request.max_tokens,
            system: request.system.clone(),
        };

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::provider("anthropic", format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider("anthropic", format!("read body: {}", e)))?;

        if !status.is_success() {
            return Err(Error::provider(
                "anthropic",
                format!("status {}: {}", status, body),
            ));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::provider("anthropic", format!("parse response: {}", e)))?;

        Ok(LlmResponse {
            content: parsed
                .content
                .iter()
                .filter_map(|c| c.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
            tokens_in: parsed.usage.input_tokens,
            tokens_out: parsed.usage.output_tokens,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ==================== Ollama ====================

/// Local Ollama server client; powers both local tiers at zero cost.
pub struct OllamaProvider {
    base_url: String,
    http: Client,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, timeout_s: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|e| Error::provider("ollama", format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(&self, model_id: &str, request: &LlmRequest) -> Result<LlmResponse> {
        let api_request = OllamaRequest {
            model: model_id.to_string(),
            prompt: request.prompt.clone(),
            system: request.system.clone(),
            stream: false,
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::provider("ollama", format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider("ollama", format!("read body: {}", e)))?;

        if !status.is_success() {
            return Err(Error::provider("ollama", format!("status {}: {}", status, body)));
        }

        let parsed: OllamaResponse = serde_json::from_str(&body)
            .map_err(|e| Error::provider("ollama", format!("parse response: {}", e)))?;

        Ok(LlmResponse {
            content: parsed.response,
            tokens_in: parsed.prompt_eval_count,
            tokens_out: parsed.eval_count,
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

// ==================== Test double ====================

/// Scripted provider replaying canned responses; errors once the script is
/// exhausted. Used throughout router and runtime tests.
pub struct ScriptedProvider {
    name: String,
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String>>>,
    pub calls: std::sync::atomic::AtomicU32,
}

impl ScriptedProvider {
    pub fn new(name: &str, responses: Vec<Result<String>>) -> Self {
        Self {
            name: name.to_string(),
            responses: std::sync::Mutex::new(responses.into()),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, _model_id: &str, _request: &LlmRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .map_err(|e| Error::Internal(format!("script lock poisoned: {}", e)))?
            .pop_front();
        match next {
            Some(Ok(content)) => Ok(LlmResponse {
                tokens_in: 100,
                tokens_out: content.split_whitespace().count() as u64,
                content,
            }),
            Some(Err(e)) => Err(e),
            None => Err(Error::provider(&self.name, "script exhausted")),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
