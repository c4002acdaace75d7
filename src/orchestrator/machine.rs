//! Phase state machine for supervised objectives.
//!
//! An orchestration drives `IMPLEMENT -> AUDIT -> [DONE | FIX -> AUDIT]`
//! with terminal `DONE` and `ESCALATED`. State is never held in memory
//! across iterations: the latest phase glyph by `(timestamp, id)` is
//! authoritative, so any agent can be killed and relaunched and the phase
//! re-derives from the store.

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::retrieval::{Caller, GlyphQuery};
use crate::store::{Glyph, GlyphStore, GlyphType};

/// Orchestration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Implement,
    Audit,
    Fix,
    Done,
    Escalated,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implement => "IMPLEMENT",
            Self::Audit => "AUDIT",
            Self::Fix => "FIX",
            Self::Done => "DONE",
            Self::Escalated => "ESCALATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Escalated)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IMPLEMENT" => Ok(Self::Implement),
            "AUDIT" => Ok(Self::Audit),
            "FIX" => Ok(Self::Fix),
            "DONE" => Ok(Self::Done),
            "ESCALATED" => Ok(Self::Escalated),
            other => Err(Error::validation(format!("unknown phase '{}'", other))),
        }
    }
}

/// Transition labels carried in phase-glyph `choice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    ImplementDone,
    AuditPass,
    AuditFail,
    FixDone,
    Escalate,
}

impl PhaseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImplementDone => "implement_done",
            Self::AuditPass => "audit:pass",
            Self::AuditFail => "audit:fail",
            Self::FixDone => "fix_done",
            Self::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Apply a transition event to a phase.
pub fn apply_event(phase: Phase, event: PhaseEvent) -> Result<Phase> {
    use Phase::*;
    use PhaseEvent::*;
    match (phase, event) {
        (_, Escalate) => Ok(Escalated),
        (Implement, ImplementDone) => Ok(Audit),
        (Audit, AuditPass) => Ok(Done),
        (Audit, AuditFail) => Ok(Fix),
        (Fix, FixDone) => Ok(Audit),
        (phase, event) => Err(Error::Orchestration(format!(
            "event '{}' not valid in phase {}",
            event, phase
        ))),
    }
}

/// Short orchestration identity derived from the objective.
pub fn orch_id(objective: &str) -> String {
    let digest = Sha256::digest(objective.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Topic slug carried by every glyph of an orchestration.
pub fn orch_topic(id: &str) -> String {
    format!("orch_{}", id)
}

/// Write a phase-transition glyph.
pub fn record_transition(
    store: &GlyphStore,
    topic: &str,
    event: PhaseEvent,
    from: Phase,
    to: Phase,
    round: u32,
    error: Option<&str>,
) -> Result<i64> {
    let mut links = json!({
        "from": from.as_str(),
        "to": to.as_str(),
        "round": round,
    });
    if let Some(error) = error {
        links["error"] = json!(error);
    }
    let glyph = Glyph::new(
        GlyphType::Phase,
        format!("{} -> {} ({})", from, to, event),
    )
    .with_topic(topic)
    .with_choice(event.as_str())
    .with_links(links);
    store.append(&glyph)
}

/// Write a spawn-boundary marker (phase unchanged).
pub fn record_spawn_marker(
    store: &GlyphStore,
    topic: &str,
    phase: Phase,
    round: u32,
    label: &str,
) -> Result<i64> {
    let glyph = Glyph::new(GlyphType::Phase, format!("{} {}", phase, label))
        .with_topic(topic)
        .with_choice(format!("{}:{}", phase.as_str(), label))
        .with_links(json!({
            "from": phase.as_str(),
            "to": phase.as_str(),
            "round": round,
        }));
    store.append(&glyph)
}

/// Derive the authoritative phase from the latest phase glyph's `links.to`.
/// A fresh orchestration starts at IMPLEMENT.
pub fn derive_phase(store: &GlyphStore, topic: &str) -> Result<Phase> {
    let latest = store.query(
        &GlyphQuery::new()
            .glyph_type(GlyphType::Phase)
            .topic(topic)
            .limit(1),
        &Caller::operator(),
    )?;
    let Some(glyph) = latest.first() else {
        return Ok(Phase::Implement);
    };
    glyph
        .links
        .as_ref()
        .and_then(|l| l.get("to"))
        .and_then(|v| v.as_str())
        .map(|s| s.parse())
        .unwrap_or(Ok(Phase::Implement))
}

/// Completed audit traversals so far (pass or fail), for round counting.
pub fn audit_rounds(store: &GlyphStore, topic: &str) -> Result<u32> {
    let glyphs = store.query(
        &GlyphQuery::new()
            .glyph_type(GlyphType::Phase)
            .topic(topic)
            .limit(10_000),
        &Caller::operator(),
    )?;
    Ok(glyphs
        .iter()
        .filter(|g| {
            matches!(
                g.choice.as_deref(),
                Some("audit:pass") | Some("audit:fail")
            )
        })
        .count() as u32)
}

/// Error signatures of the most recent audit failures, newest first.
pub fn recent_audit_failures(store: &GlyphStore, topic: &str, limit: usize) -> Result<Vec<String>> {
    let glyphs = store.query(
        &GlyphQuery::new()
            .glyph_type(GlyphType::Phase)
            .topic(topic)
            .choice("audit:fail")
            .limit(limit),
        &Caller::operator(),
    )?;
    Ok(glyphs
        .iter()
        .filter_map(|g| {
            g.links
                .as_ref()
                .and_then(|l| l.get("error"))
                .and_then(|v| v.as_str())
                .map(String::from)
        })
        .collect())
}
