//! The JSON action protocol.
//!
//! Each iteration the LLM must return exactly one JSON object with an
//! `action` field from a closed vocabulary. The variants form a tagged sum
//! type; unknown tags and malformed payloads are rejected before anything
//! reaches the firewall.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

fn default_spawn_timeout() -> u64 {
    600
}

fn default_max_iterations() -> u32 {
    10
}

/// One agent action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    ListFiles {
        #[serde(default)]
        path: Option<String>,
    },
    ReadFile {
        path: String,
    },
    SearchText {
        pattern: String,
        #[serde(default)]
        path: Option<String>,
    },
    WriteMemory {
        #[serde(rename = "type")]
        glyph_type: String,
        #[serde(default)]
        topic: Option<String>,
        text: String,
        #[serde(default)]
        choice: Option<String>,
    },
    OrchStatus {
        orch_id: String,
    },
    SpawnDaemon {
        objective: String,
        #[serde(default)]
        wait: bool,
        #[serde(default = "default_spawn_timeout")]
        timeout: u64,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
    Run {
        command: String,
    },
    Exec {
        command: String,
    },
    HttpRequest {
        url: String,
        #[serde(default)]
        method: Option<String>,
    },
    EditFile {
        path: String,
        content: String,
    },
    Done {
        summary: String,
    },
}

impl Action {
    /// The tool name used for policy lookup and audit rows.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListFiles { .. } => "list_files",
            Self::ReadFile { .. } => "read_file",
            Self::SearchText { .. } => "search_text",
            Self::WriteMemory { .. } => "write_memory",
            Self::OrchStatus { .. } => "orch_status",
            Self::SpawnDaemon { .. } => "spawn_daemon",
            Self::Run { .. } => "run",
            Self::Exec { .. } => "exec",
            Self::HttpRequest { .. } => "http_request",
            Self::EditFile { .. } => "edit_file",
            Self::Done { .. } => "done",
        }
    }

    /// The action's payload as a JSON object (tag included), as it is
    /// audited and replayed.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Parse one action from raw LLM output.
///
/// Accepts bare JSON, fenced JSON, or an object embedded in surrounding
/// prose — but exactly one action. Unknown `action` tags are rejected.
pub fn parse_action(raw: &str) -> Result<Action> {
    let candidate = extract_json_object(raw)
        .ok_or_else(|| Error::validation("no JSON object found in response"))?;
    serde_json::from_str::<Action>(&candidate)
        .map_err(|e| Error::validation(format!("bad action: {}", e)))
}

/// Extract the first balanced top-level `{...}` from free-form text.
fn extract_json_object(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_each_variant() {
        assert_eq!(
            parse_action(r#"{"action":"list_files","path":"src"}"#).unwrap(),
            Action::ListFiles {
                path: Some("src".to_string())
            }
        );
        assert_eq!(
            parse_action(r#"{"action":"read_file","path":"a.rs"}"#).unwrap().name(),
            "read_file"
        );
        assert_eq!(
            parse_action(r#"{"action":"write_memory","type":"d","topic":"auth","text":"use bearer","choice":"bearer"}"#)
                .unwrap()
                .name(),
            "write_memory"
        );
        assert_eq!(
            parse_action(r#"{"action":"done","summary":"finished"}"#).unwrap(),
            Action::Done {
                summary: "finished".to_string()
            }
        );
    }

    #[test]
    fn test_spawn_defaults() {
        let action =
            parse_action(r#"{"action":"spawn_daemon","objective":"audit the repo"}"#).unwrap();
        match action {
            Action::SpawnDaemon {
                wait,
                timeout,
                max_iterations,
                ..
            } => {
                assert!(!wait);
                assert_eq!(timeout, 600);
                assert_eq!(max_iterations, 10);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = parse_action(r#"{"action":"teleport","to":"mars"}"#).unwrap_err();
        assert!(err.to_string().contains("bad action"));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        assert!(parse_action(r#"{"action":"read_file"}"#).is_err());
        assert!(parse_action(r#"{"action":"done"}"#).is_err());
    }

    #[test]
    fn test_embedded_and_fenced_json() {
        let fenced = "Here is my move:\n```json\n{\"action\":\"done\",\"summary\":\"ok\"}\n```";
        assert_eq!(
            parse_action(fenced).unwrap(),
            Action::Done {
                summary: "ok".to_string()
            }
        );

        let chatty = "I'll check the files first. {\"action\":\"list_files\",\"path\":null} then decide.";
        assert_eq!(parse_action(chatty).unwrap().name(), "list_files");
    }

    #[test]
    fn test_nested_braces_in_strings() {
        let tricky = r#"{"action":"edit_file","path":"a.json","content":"{\"nested\": {}}"}"#;
        let action = parse_action(tricky).unwrap();
        match action {
            Action::EditFile { content, .. } => assert_eq!(content, "{\"nested\": {}}"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_no_json_at_all() {
        assert!(parse_action("I think we should refactor first.").is_err());
    }

    #[test]
    fn test_payload_round_trips() {
        let action = Action::ReadFile {
            path: "src/main.rs".to_string(),
        };
        let payload = action.payload();
        assert_eq!(payload["action"], "read_file");
        assert_eq!(payload["path"], "src/main.rs");
    }
}
