//! Response quality scoring.
//!
//! Each response gets a confidence score in `[0, 1]` from weighted
//! components: format validity (30%), completeness (20%), coherence (30%),
//! and an optional fast-tier self-critique (20%). With critique disabled
//! the remaining weights are renormalized. Scores below the router's
//! threshold trigger fallback.

use regex::Regex;
use std::sync::OnceLock;

/// What the caller expects of the response shape.
#[derive(Debug, Clone, Default)]
pub struct ResponseExpectations {
    /// Response must parse as a JSON object.
    pub expect_json: bool,
    /// Minimum acceptable length in characters.
    pub min_length: usize,
    /// Field names that must be present in a JSON response.
    pub required_fields: Vec<String>,
}

impl ResponseExpectations {
    pub fn json_with_fields(fields: &[&str]) -> Self {
        Self {
            expect_json: true,
            min_length: 2,
            required_fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn text(min_length: usize) -> Self {
        Self {
            expect_json: false,
            min_length,
            required_fields: Vec::new(),
        }
    }
}

/// Component weights; critique redistributes when absent.
const FORMAT_WEIGHT: f64 = 0.3;
const COMPLETENESS_WEIGHT: f64 = 0.2;
const COHERENCE_WEIGHT: f64 = 0.3;
const CRITIQUE_WEIGHT: f64 = 0.2;

/// Score the three static components; `critique` is the optional yes/no
/// verdict from a fast-tier model.
pub fn score_response(
    content: &str,
    expectations: &ResponseExpectations,
    critique: Option<bool>,
) -> f64 {
    let format = format_score(content, expectations);
    let completeness = completeness_score(content, expectations);
    let coherence = coherence_score(content);

    let mut score = format * FORMAT_WEIGHT
        + completeness * COMPLETENESS_WEIGHT
        + coherence * COHERENCE_WEIGHT;
    let mut total_weight = FORMAT_WEIGHT + COMPLETENESS_WEIGHT + COHERENCE_WEIGHT;

    if let Some(verdict) = critique {
        score += if verdict { CRITIQUE_WEIGHT } else { 0.0 };
        total_weight += CRITIQUE_WEIGHT;
    }

    (score / total_weight).clamp(0.0, 1.0)
}

fn format_score(content: &str, expectations: &ResponseExpectations) -> f64 {
    if expectations.expect_json {
        match serde_json::from_str::<serde_json::Value>(content.trim()) {
            Ok(value) if value.is_object() => 1.0,
            Ok(_) => 0.5,
            Err(_) => {
                // A fenced or embedded JSON object still counts for half
                if content.contains('{') && content.contains('}') {
                    0.3
                } else {
                    0.0
                }
            }
        }
    } else if content.trim().is_empty() {
        0.0
    } else {
        1.0
    }
}

fn completeness_score(content: &str, expectations: &ResponseExpectations) -> f64 {
    let trimmed = content.trim();
    if trimmed.len() < expectations.min_length {
        return 0.0;
    }

    if expectations.required_fields.is_empty() {
        return 1.0;
    }

    let parsed: Option<serde_json::Value> = serde_json::from_str(trimmed).ok();
    let present = expectations
        .required_fields
        .iter()
        .filter(|field| {
            parsed
                .as_ref()
                .map(|v| v.get(field.as_str()).is_some())
                .unwrap_or_else(|| trimmed.contains(field.as_str()))
        })
        .count();
    present as f64 / expectations.required_fields.len() as f64
}

fn coherence_score(content: &str) -> f64 {
    static REFUSAL: OnceLock<Regex> = OnceLock::new();
    static CONTRADICTION: OnceLock<Regex> = OnceLock::new();

    let refusal = REFUSAL.get_or_init(|| {
        Regex::new(
            r"(?i)i cannot|i can't|i'm unable|as an ai|i am unable|i apologize, but",
        )
        .unwrap()
    });
    let contradiction = CONTRADICTION.get_or_init(|| {
        Regex::new(r"(?i)on second thought|actually, no|wait, that's wrong|ignore the above")
            .unwrap()
    });

    let mut score: f64 = 1.0;
    if refusal.is_match(content) {
        score -= 0.9;
    }
    if contradiction.is_match(content) {
        score -= 0.4;
    }
    // Heavy verbatim repetition reads as degeneration
    if has_heavy_repetition(content) {
        score -= 0.4;
    }
    score.max(0.0)
}

fn has_heavy_repetition(content: &str) -> bool {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.len() < 12 {
        return false;
    }
    let window = 4;
    let mut seen = std::collections::HashMap::new();
    for chunk in words.windows(window) {
        let key = chunk.join(" ");
        let count = seen.entry(key).or_insert(0u32);
        *count += 1;
        if *count >= 3 {
            return true;
        }
    }
    false
}

/// The yes/no validation prompt sent to a fast-tier model for the optional
/// self-critique component.
pub fn critique_prompt(original_prompt: &str, response: &str) -> String {
    format!(
        "Does the RESPONSE below adequately answer the REQUEST? Reply with exactly YES or NO.\n\n\
         REQUEST:\n{}\n\nRESPONSE:\n{}",
        original_prompt, response
    )
}

/// Parse a critique reply into a verdict.
pub fn parse_critique(reply: &str) -> Option<bool> {
    let normalized = reply.trim().to_uppercase();
    if normalized.starts_with("YES") {
        Some(true)
    } else if normalized.starts_with("NO") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_json_scores_high() {
        let expectations = ResponseExpectations::json_with_fields(&["action"]);
        let score = score_response(r#"{"action": "done", "summary": "ok"}"#, &expectations, None);
        assert!(score > 0.9, "score was {}", score);
    }

    #[test]
    fn test_invalid_json_scores_low() {
        let expectations = ResponseExpectations::json_with_fields(&["action"]);
        let score = score_response("I think we should probably...", &expectations, None);
        assert!(score < 0.7, "score was {}", score);
    }

    #[test]
    fn test_refusal_tanks_coherence() {
        let expectations = ResponseExpectations::text(10);
        let good = score_response("The fix is to rotate the token cache.", &expectations, None);
        let refused = score_response(
            "I cannot help with that request as an AI assistant.",
            &expectations,
            None,
        );
        assert!(good > refused);
        assert!(refused < 0.7);
    }

    #[test]
    fn test_too_short_fails_completeness() {
        let expectations = ResponseExpectations::text(50);
        let score = score_response("ok", &expectations, None);
        assert!(score < 0.7);
    }

    #[test]
    fn test_repetition_penalized() {
        let expectations = ResponseExpectations::text(10);
        let degenerate = "the token the token the token the token the token the token \
                          the token the token the token";
        assert!(score_response(degenerate, &expectations, None) < 0.8);
    }

    #[test]
    fn test_critique_shifts_score() {
        let expectations = ResponseExpectations::text(5);
        let base = score_response("A plausible answer here.", &expectations, None);
        let endorsed = score_response("A plausible answer here.", &expectations, Some(true));
        let rejected = score_response("A plausible answer here.", &expectations, Some(false));
        assert!(endorsed >= base);
        assert!(rejected < base);
    }

    #[test]
    fn test_critique_parsing() {
        assert_eq!(parse_critique("YES"), Some(true));
        assert_eq!(parse_critique("  no, it misses the point"), Some(false));
        assert_eq!(parse_critique("maybe"), None);
    }
}
