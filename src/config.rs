//! Environment-derived configuration.
//!
//! Every process (head, manager, worker, spawned daemon) reads the same set
//! of environment variables. Paths pass through shell expansion so `~` and
//! `$VAR` forms work from hook shims and cron entries. A missing provider
//! credential disables that provider rather than failing startup.

use std::path::PathBuf;

/// Default TTL for task claims, in minutes.
pub const DEFAULT_CLAIM_TTL_MINUTES: i64 = 30;

/// Runtime configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the indexed store (`MEMORY_DB`).
    pub memory_db: PathBuf,
    /// Path to the append-only mirror log (`ANCHORS_FILE`).
    pub anchors_file: PathBuf,
    /// Session identifier for scope filtering (`CHAT_ID`).
    pub chat_id: Option<String>,
    /// Default claim owner (`TODO_OWNER`).
    pub todo_owner: Option<String>,
    /// Default agent role (`TODO_ROLE`).
    pub todo_role: Option<String>,
    /// Claim TTL in minutes (`TODO_CLAIM_TTL_MINUTES`).
    pub claim_ttl_minutes: i64,
    /// Anthropic API key; absence disables the api_fallback provider.
    pub anthropic_api_key: Option<String>,
    /// Base URL of the local Ollama server (`OLLAMA_URL`).
    pub ollama_url: String,
    /// Daily spend ceiling for api_fallback calls (`DAILY_BUDGET_USD`).
    pub daily_budget_usd: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_db: PathBuf::from("memory.db"),
            anchors_file: PathBuf::from("anchors.jsonl"),
            chat_id: None,
            todo_owner: None,
            todo_role: None,
            claim_ttl_minutes: DEFAULT_CLAIM_TTL_MINUTES,
            anthropic_api_key: None,
            ollama_url: "http://localhost:11434".to_string(),
            daily_budget_usd: 5.0,
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(path) = env_path("MEMORY_DB") {
            config.memory_db = path;
        }
        if let Some(path) = env_path("ANCHORS_FILE") {
            config.anchors_file = path;
        }
        config.chat_id = env_string("CHAT_ID");
        config.todo_owner = env_string("TODO_OWNER");
        config.todo_role = env_string("TODO_ROLE");
        if let Some(ttl) = env_string("TODO_CLAIM_TTL_MINUTES").and_then(|s| s.parse().ok()) {
            config.claim_ttl_minutes = ttl;
        }
        config.anthropic_api_key = env_string("ANTHROPIC_API_KEY");
        if let Some(url) = env_string("OLLAMA_URL") {
            config.ollama_url = url;
        }
        if let Some(budget) = env_string("DAILY_BUDGET_USD").and_then(|s| s.parse().ok()) {
            config.daily_budget_usd = budget;
        }

        config
    }

    pub fn with_memory_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.memory_db = path.into();
        self
    }

    pub fn with_anchors_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.anchors_file = path.into();
        self
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_claim_ttl_minutes(mut self, minutes: i64) -> Self {
        self.claim_ttl_minutes = minutes;
        self
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(|raw| PathBuf::from(shellexpand::full(&raw).map_or(raw.clone(), |c| c.into_owned())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.claim_ttl_minutes, DEFAULT_CLAIM_TTL_MINUTES);
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert!(config.anthropic_api_key.is_none());
    }

    #[test]
    fn test_builder() {
        let config = Config::default()
            .with_memory_db("/tmp/test.db")
            .with_chat_id("chat-42")
            .with_claim_ttl_minutes(5);

        assert_eq!(config.memory_db, PathBuf::from("/tmp/test.db"));
        assert_eq!(config.chat_id.as_deref(), Some("chat-42"));
        assert_eq!(config.claim_ttl_minutes, 5);
    }
}
