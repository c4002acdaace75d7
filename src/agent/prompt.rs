//! Prompt assembly.
//!
//! Every iteration rebuilds the prompt from the store: the HUD block (open
//! tasks, critical memories, mandates), a scoped memory context, lessons
//! for the task topic, the agent's recent actions, and the objective with
//! any phase-specific instructions.

use std::sync::Arc;

use crate::error::Result;
use crate::retrieval::{Caller, GlyphQuery};
use crate::store::{GlyphStore, GlyphType, Importance, TaskStatus};
use crate::tasks::TaskRegistry;

/// How many of the agent's own recent actions to replay.
const HISTORY_ENTRIES: usize = 3;

/// Prompt builder bound to one agent identity.
pub struct PromptAssembler {
    store: Arc<GlyphStore>,
    registry: Arc<TaskRegistry>,
    caller: Caller,
}

impl PromptAssembler {
    pub fn new(store: Arc<GlyphStore>, registry: Arc<TaskRegistry>, caller: Caller) -> Self {
        Self {
            store,
            registry,
            caller,
        }
    }

    /// The HUD block: top open tasks, critical-importance memories, and
    /// standing mandates.
    pub fn hud(&self) -> Result<String> {
        let mut sections = Vec::new();

        let open_tasks = self.registry.list(None, Some(TaskStatus::Open), 5)?;
        if !open_tasks.is_empty() {
            let lines: Vec<String> = open_tasks
                .iter()
                .map(|t| {
                    format!(
                        "- [{}] {} {}",
                        t.task_id,
                        t.importance.map(|i| i.to_string()).unwrap_or_else(|| "-".into()),
                        t.text
                    )
                })
                .collect();
            sections.push(format!("OPEN TASKS:\n{}", lines.join("\n")));
        }

        let critical = self.store.render(
            &GlyphQuery::new().importance(Importance::H).limit(5),
            &self.caller,
        )?;
        if !critical.is_empty() {
            sections.push(format!("CRITICAL:\n{}", critical.join("\n")));
        }

        let mandates = self.store.render(
            &GlyphQuery::new()
                .glyph_type(GlyphType::Decision)
                .topic("mandates")
                .limit(5),
            &self.caller,
        )?;
        if !mandates.is_empty() {
            sections.push(format!("MANDATES:\n{}", mandates.join("\n")));
        }

        Ok(sections.join("\n\n"))
    }

    /// Scoped memory context: recent glyphs visible to this caller.
    pub fn memory_context(&self, limit: usize) -> Result<String> {
        let lines = self.store.render(
            &GlyphQuery::new().recent("7d")?.limit(limit),
            &self.caller,
        )?;
        Ok(lines.join("\n"))
    }

    /// Lessons recorded for a topic.
    pub fn lessons(&self, topic: &str, limit: usize) -> Result<String> {
        let lines = self.store.render(
            &GlyphQuery::new()
                .glyph_type(GlyphType::Lesson)
                .topic(topic)
                .limit(limit),
            &self.caller,
        )?;
        Ok(lines.join("\n"))
    }

    /// Tail of this agent's own action glyphs.
    pub fn own_history(&self, session: &str) -> Result<String> {
        let lines = self.store.render(
            &GlyphQuery::new()
                .glyph_type(GlyphType::Action)
                .session(session)
                .limit(HISTORY_ENTRIES),
            &Caller::operator(),
        )?;
        Ok(lines.join("\n"))
    }

    /// Assemble the full iteration prompt.
    pub fn assemble(
        &self,
        objective: &str,
        session: &str,
        task_topic: Option<&str>,
        phase_instructions: Option<&str>,
    ) -> Result<String> {
        let mut parts = Vec::new();

        let hud = self.hud()?;
        if !hud.is_empty() {
            parts.push(format!("=== HUD ===\n{}", hud));
        }

        let context = self.memory_context(20)?;
        if !context.is_empty() {
            parts.push(format!("=== MEMORY ===\n{}", context));
        }

        if let Some(topic) = task_topic {
            let lessons = self.lessons(topic, 5)?;
            if !lessons.is_empty() {
                parts.push(format!("=== LESSONS ({}) ===\n{}", topic, lessons));
            }
        }

        let history = self.own_history(session)?;
        if !history.is_empty() {
            parts.push(format!("=== YOUR RECENT ACTIONS ===\n{}", history));
        }

        parts.push(format!("=== OBJECTIVE ===\n{}", objective));

        if let Some(instructions) = phase_instructions {
            parts.push(format!("=== PHASE ===\n{}", instructions));
        }

        parts.push(
            "Respond with exactly one JSON object with an \"action\" field.".to_string(),
        );

        Ok(parts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Glyph;

    fn assembler() -> (Arc<GlyphStore>, PromptAssembler) {
        let store = Arc::new(GlyphStore::in_memory().unwrap());
        let registry = Arc::new(TaskRegistry::new(store.clone()));
        let assembler = PromptAssembler::new(store.clone(), registry, Caller::operator());
        (store, assembler)
    }

    #[test]
    fn test_hud_lists_open_tasks_and_critical() {
        let (store, assembler) = assembler();
        let registry = TaskRegistry::new(store.clone());
        registry
            .add_task("fix-auth", GlyphType::Todo, None, "Fix auth", Some(Importance::H))
            .unwrap();
        store
            .append(
                &Glyph::new(GlyphType::Fact, "prod deploys are frozen")
                    .with_importance(Importance::H),
            )
            .unwrap();

        let hud = assembler.hud().unwrap();
        assert!(hud.contains("OPEN TASKS:"));
        assert!(hud.contains("fix-auth"));
        assert!(hud.contains("CRITICAL:"));
        assert!(hud.contains("prod deploys are frozen"));
    }

    #[test]
    fn test_mandates_section() {
        let (store, assembler) = assembler();
        store
            .append(
                &Glyph::new(GlyphType::Decision, "never push directly to main")
                    .with_topic("mandates"),
            )
            .unwrap();

        let hud = assembler.hud().unwrap();
        assert!(hud.contains("MANDATES:"));
        assert!(hud.contains("never push directly to main"));
    }

    #[test]
    fn test_assemble_contains_objective_and_protocol() {
        let (store, assembler) = assembler();
        store
            .append(&Glyph::new(GlyphType::Lesson, "retry with backoff").with_topic("net"))
            .unwrap();

        let prompt = assembler
            .assemble("Ship the feature", "sess-1", Some("net"), Some("You are auditing."))
            .unwrap();

        assert!(prompt.contains("=== OBJECTIVE ===\nShip the feature"));
        assert!(prompt.contains("=== LESSONS (net) ==="));
        assert!(prompt.contains("retry with backoff"));
        assert!(prompt.contains("=== PHASE ===\nYou are auditing."));
        assert!(prompt.contains("exactly one JSON object"));
    }

    #[test]
    fn test_own_history_limited_to_session() {
        let (store, assembler) = assembler();
        store
            .append(&Glyph::new(GlyphType::Action, "listed files").with_session("sess-1"))
            .unwrap();
        store
            .append(&Glyph::new(GlyphType::Action, "other agent work").with_session("sess-2"))
            .unwrap();

        let history = assembler.own_history("sess-1").unwrap();
        assert!(history.contains("listed files"));
        assert!(!history.contains("other agent work"));
    }
}
