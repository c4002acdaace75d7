//! Task-complexity classification for tier selection.
//!
//! Every LLM call is classified SIMPLE / MODERATE / COMPLEX from its action
//! type and prompt content. Action-level overrides from configuration take
//! precedence over the pattern rules.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Complexity of one LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    /// Classification, extraction, yes/no checks.
    Simple,
    /// Code edits, reasoning, summarization.
    Moderate,
    /// Orchestration, multi-file work, critical paths.
    Complex,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "SIMPLE"),
            Self::Moderate => write!(f, "MODERATE"),
            Self::Complex => write!(f, "COMPLEX"),
        }
    }
}

/// Compiled prompt patterns, one set per bucket.
struct ComplexityPatterns {
    complex: Regex,
    moderate: Regex,
    simple: Regex,
}

impl ComplexityPatterns {
    fn new() -> Self {
        Self {
            complex: Regex::new(
                r"(?x)
                orchestrat|multi.?file|across\s+the|codebase|
                architect|critical|refactor\s+everything|
                end.to.end|migration|rollout
                ",
            )
            .unwrap(),
            moderate: Regex::new(
                r"(?x)
                write|edit|implement|fix|refactor|
                summari[sz]e|consolidate|reason|explain\s+why|
                generate\s+code|patch|test
                ",
            )
            .unwrap(),
            simple: Regex::new(
                r"(?x)
                classif|extract|yes\s+or\s+no|true\s+or\s+false|
                label|tag|pick\s+one|which\s+of
                ",
            )
            .unwrap(),
        }
    }
}

/// Classifier with per-action overrides.
#[derive(Debug, Clone, Default)]
pub struct ComplexityClassifier {
    /// Action-type overrides; take precedence over pattern rules.
    overrides: HashMap<String, Complexity>,
}

impl ComplexityClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, action_type: impl Into<String>, complexity: Complexity) -> Self {
        self.overrides.insert(action_type.into(), complexity);
        self
    }

    /// Classify one call from its action type and prompt.
    pub fn classify(&self, action_type: &str, prompt: &str) -> Complexity {
        if let Some(overridden) = self.overrides.get(action_type) {
            return *overridden;
        }

        // Well-known action types have fixed buckets
        match action_type {
            "classify" | "extract" | "validate" | "yes_no" => return Complexity::Simple,
            "code_edit" | "summarize" | "consolidate" | "plan" => return Complexity::Moderate,
            "orchestrate" | "audit" | "multi_file" => return Complexity::Complex,
            _ => {}
        }

        static PATTERNS: OnceLock<ComplexityPatterns> = OnceLock::new();
        let patterns = PATTERNS.get_or_init(ComplexityPatterns::new);
        let prompt_lower = prompt.to_lowercase();

        if patterns.complex.is_match(&prompt_lower) {
            Complexity::Complex
        } else if patterns.moderate.is_match(&prompt_lower) {
            Complexity::Moderate
        } else if patterns.simple.is_match(&prompt_lower) {
            Complexity::Simple
        } else {
            // Long prompts lean moderate; short ones are cheap to get wrong
            if prompt.len() > 2000 {
                Complexity::Moderate
            } else {
                Complexity::Simple
            }
        }
    }
}
