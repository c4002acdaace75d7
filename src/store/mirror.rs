//! Append-only mirror log.
//!
//! Every successful store write is mirrored to a JSONL file: one JSON array
//! per line holding the canonical 13-field encoding
//! `[type, topic, text, choice, rationale, timestamp, session, source,
//! importance, due, links, task_id, metric]`. Null fields serialize as
//! `null`; trailing fields beyond the 13 are reserved and ignored on read.
//! The mirror is the crash-recovery source of truth: `sync` replays lines
//! past the recorded high-water mark, deduplicating by a hash over
//! `(timestamp, type, text)`.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::types::{Glyph, GlyphType, Importance};

/// Number of fields in the canonical line encoding.
pub const MIRROR_FIELDS: usize = 13;

/// Encode a glyph as its canonical mirror-log line (no trailing newline).
pub fn encode_line(glyph: &Glyph) -> String {
    let fields = json!([
        glyph.glyph_type.as_str(),
        glyph.topic,
        glyph.text,
        glyph.choice,
        glyph.rationale,
        glyph.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        glyph.session,
        glyph.source,
        glyph.importance.map(|i| i.as_str().to_string()),
        glyph.due,
        glyph.links,
        glyph.task_id,
        glyph.metric,
    ]);
    fields.to_string()
}

/// Decode one mirror-log line into a glyph shell.
///
/// Returns `None` for lines whose parsed shape violates the schema; such
/// lines are logged and skipped rather than failing the replay.
pub fn decode_line(line: &str) -> Option<Glyph> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "skipping unparseable mirror line");
            return None;
        }
    };

    let fields = match value.as_array() {
        Some(arr) if arr.len() >= MIRROR_FIELDS => arr,
        _ => {
            warn!("skipping mirror line with wrong shape");
            return None;
        }
    };

    let glyph_type: GlyphType = match fields[0].as_str().and_then(|s| s.parse().ok()) {
        Some(t) => t,
        None => {
            warn!(raw = %fields[0], "skipping mirror line with unknown type tag");
            return None;
        }
    };

    let text = match fields[2].as_str() {
        Some(t) => t.to_string(),
        None => {
            warn!("skipping mirror line without text");
            return None;
        }
    };

    let timestamp: DateTime<Utc> = match fields[5]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        Some(ts) => ts.with_timezone(&Utc),
        None => {
            warn!(raw = %fields[5], "skipping mirror line with bad timestamp");
            return None;
        }
    };

    let mut glyph = Glyph::new(glyph_type, text).with_timestamp(timestamp);
    glyph.topic = string_field(&fields[1]);
    glyph.choice = string_field(&fields[3]);
    glyph.rationale = string_field(&fields[4]);
    glyph.session = string_field(&fields[6]);
    glyph.source = string_field(&fields[7]);
    glyph.importance = string_field(&fields[8]).and_then(|s| s.parse::<Importance>().ok());
    glyph.due = string_field(&fields[9]);
    glyph.links = match &fields[10] {
        Value::Null => None,
        other => Some(other.clone()),
    };
    glyph.task_id = string_field(&fields[11]);
    glyph.metric = string_field(&fields[12]);

    Some(glyph)
}

fn string_field(value: &Value) -> Option<String> {
    value.as_str().map(|s| s.to_string())
}

/// Stable dedup key over the identity triple used by `sync` replay.
pub fn dedup_hash(timestamp: &DateTime<Utc>, glyph_type: GlyphType, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true).as_bytes());
    hasher.update([0u8]);
    hasher.update(glyph_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Append one encoded line to the mirror-log file, creating it if needed.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::storage(format!("mirror open '{}': {}", path.display(), e)))?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|e| Error::storage(format!("mirror append '{}': {}", path.display(), e)))
}

/// Read mirror-log lines strictly after `after_line` (1-based count).
///
/// Returns `(line_number, decoded_glyph)` pairs for well-formed lines and
/// the total number of lines in the file.
pub fn read_from(path: &Path, after_line: u64) -> Result<(Vec<(u64, Glyph)>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        // A missing mirror is an empty mirror: nothing to replay.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => {
            return Err(Error::storage(format!(
                "mirror read '{}': {}",
                path.display(),
                e
            )))
        }
    };

    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut total = 0u64;

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx as u64 + 1;
        total = line_no;
        let line = line
            .map_err(|e| Error::storage(format!("mirror read '{}': {}", path.display(), e)))?;
        if line_no <= after_line || line.trim().is_empty() {
            continue;
        }
        if let Some(glyph) = decode_line(&line) {
            entries.push((line_no, glyph));
        }
    }

    Ok((entries, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::Scope;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_decode_round_trip() {
        let glyph = Glyph::new(GlyphType::Decision, "Use bearer tokens")
            .with_topic("auth")
            .with_choice("bearer")
            .with_rationale("session storage overhead")
            .with_importance(Importance::H)
            .with_session("s1")
            .with_source("cli");

        let line = encode_line(&glyph);
        let decoded = decode_line(&line).unwrap();

        assert_eq!(decoded.glyph_type, GlyphType::Decision);
        assert_eq!(decoded.topic.as_deref(), Some("auth"));
        assert_eq!(decoded.text, "Use bearer tokens");
        assert_eq!(decoded.choice.as_deref(), Some("bearer"));
        assert_eq!(decoded.importance, Some(Importance::H));
        assert_eq!(decoded.timestamp, glyph.timestamp);
    }

    #[test]
    fn test_null_fields_round_trip() {
        let glyph = Glyph::new(GlyphType::Note, "bare note");
        let line = encode_line(&glyph);
        assert!(line.contains("null"));

        let decoded = decode_line(&line).unwrap();
        assert_eq!(decoded.topic, None);
        assert_eq!(decoded.links, None);
        // Store-side attributes are not part of the line encoding
        assert_eq!(decoded.scope, Scope::Shared);
    }

    #[test]
    fn test_trailing_fields_ignored() {
        let glyph = Glyph::new(GlyphType::Fact, "forward compat");
        let line = encode_line(&glyph);
        let mut value: Value = serde_json::from_str(&line).unwrap();
        value.as_array_mut().unwrap().push(json!("reserved"));

        let decoded = decode_line(&value.to_string()).unwrap();
        assert_eq!(decoded.text, "forward compat");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        assert!(decode_line("not json").is_none());
        assert!(decode_line("{\"object\": true}").is_none());
        assert!(decode_line("[\"fact\", null]").is_none());
        assert!(decode_line(
            "[\"widget\", null, \"x\", null, null, \"2024-01-01T00:00:00Z\", null, null, null, null, null, null, null]"
        )
        .is_none());
    }

    #[test]
    fn test_dedup_hash_stability() {
        let ts = Utc::now();
        let a = dedup_hash(&ts, GlyphType::Fact, "same text");
        let b = dedup_hash(&ts, GlyphType::Fact, "same text");
        let c = dedup_hash(&ts, GlyphType::Note, "same text");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_append_and_read_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchors.jsonl");

        let g1 = Glyph::new(GlyphType::Fact, "first");
        let g2 = Glyph::new(GlyphType::Fact, "second");
        append_line(&path, &encode_line(&g1)).unwrap();
        append_line(&path, &encode_line(&g2)).unwrap();

        let (all, total) = read_from(&path, 0).unwrap();
        assert_eq!(total, 2);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.text, "first");

        let (tail, _) = read_from(&path, 1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0, 2);
        assert_eq!(tail[0].1.text, "second");
    }

    #[test]
    fn test_missing_mirror_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (entries, total) = read_from(&dir.path().join("nope.jsonl"), 0).unwrap();
        assert!(entries.is_empty());
        assert_eq!(total, 0);
    }
}
