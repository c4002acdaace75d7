//! Orchestration of `IMPLEMENT -> AUDIT -> [DONE | FIX -> AUDIT]`.
//!
//! The driver spawns sub-agents per phase, persists a phase glyph around
//! every spawn, and re-derives state from the store on each iteration —
//! killing and relaunching the orchestrator resumes mid-objective. Escape
//! hatches: a round ceiling, repeated-error-signature detection, and
//! per-phase spawn timeouts.

mod machine;
mod spawn;

pub use machine::{
    apply_event, audit_rounds, derive_phase, orch_id, orch_topic, recent_audit_failures,
    record_spawn_marker, record_transition, Phase, PhaseEvent,
};
pub use spawn::{
    AgentLauncher, ProcessLauncher, ScriptedLauncher, SpawnHandle, SpawnSpec, SubAgentOutcome,
    SubAgentStatus,
};

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;
use crate::store::{Glyph, GlyphStore, GlyphType};
use crate::tasks::error_signature;

/// Anti-loop and timeout configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Audit traversals allowed before escalation.
    pub max_rounds: u32,
    pub implement_timeout_s: u64,
    pub audit_timeout_s: u64,
    pub fix_timeout_s: u64,
    /// Iteration cap passed to each sub-agent.
    pub sub_agent_max_iterations: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            implement_timeout_s: 600,
            audit_timeout_s: 300,
            fix_timeout_s: 600,
            sub_agent_max_iterations: 10,
        }
    }
}

/// Final report from a driven orchestration.
#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    pub orch_id: String,
    pub final_phase: Phase,
    pub rounds: u32,
}

/// The orchestration driver.
pub struct Orchestrator {
    store: Arc<GlyphStore>,
    launcher: Arc<dyn AgentLauncher>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<GlyphStore>, launcher: Arc<dyn AgentLauncher>) -> Self {
        Self {
            store,
            launcher,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Current phase of an objective without driving it.
    pub fn status(&self, objective: &str) -> Result<(String, Phase, u32)> {
        let id = orch_id(objective);
        let topic = orch_topic(&id);
        let phase = derive_phase(&self.store, &topic)?;
        let rounds = audit_rounds(&self.store, &topic)?;
        Ok((id, phase, rounds))
    }

    /// Drive an objective until a terminal phase.
    ///
    /// Resumable: the phase is re-derived from the store on every
    /// iteration, so a previously interrupted orchestration continues where
    /// its glyphs left off.
    pub async fn run(
        &self,
        objective: &str,
        repo_root: Option<&std::path::Path>,
    ) -> Result<OrchestrationOutcome> {
        let id = orch_id(objective);
        let topic = orch_topic(&id);
        info!(orch_id = %id, objective, "orchestration starting");

        loop {
            let phase = derive_phase(&self.store, &topic)?;
            let rounds = audit_rounds(&self.store, &topic)?;

            match phase {
                Phase::Done | Phase::Escalated => {
                    info!(orch_id = %id, final_phase = %phase, rounds, "orchestration finished");
                    return Ok(OrchestrationOutcome {
                        orch_id: id,
                        final_phase: phase,
                        rounds,
                    });
                }
                Phase::Implement => {
                    self.run_implement(&topic, objective, repo_root, rounds)
                        .await?;
                }
                Phase::Audit => {
                    if rounds >= self.config.max_rounds {
                        self.escalate(
                            &topic,
                            Phase::Audit,
                            rounds,
                            &format!("max_rounds {} exceeded", self.config.max_rounds),
                        )?;
                        continue;
                    }
                    self.run_audit(&topic, objective, repo_root, rounds).await?;
                }
                Phase::Fix => {
                    self.run_fix(&topic, objective, repo_root, rounds).await?;
                }
            }
        }
    }

    async fn run_implement(
        &self,
        topic: &str,
        objective: &str,
        repo_root: Option<&std::path::Path>,
        round: u32,
    ) -> Result<()> {
        let spec = self.spec(
            format!("Implement: {}", objective),
            repo_root,
            self.config.implement_timeout_s,
        );
        let outcome = self.spawn_phase(topic, Phase::Implement, round, &spec).await?;

        match outcome.status {
            SubAgentStatus::Done => {
                record_transition(
                    &self.store,
                    topic,
                    PhaseEvent::ImplementDone,
                    Phase::Implement,
                    Phase::Audit,
                    round,
                    None,
                )?;
            }
            _ => {
                // A failed implement run goes straight to audit as a
                // failure so the fix loop (and its guards) take over.
                let sig = error_signature(&outcome.result);
                record_transition(
                    &self.store,
                    topic,
                    PhaseEvent::ImplementDone,
                    Phase::Implement,
                    Phase::Audit,
                    round,
                    None,
                )?;
                record_transition(
                    &self.store,
                    topic,
                    PhaseEvent::AuditFail,
                    Phase::Audit,
                    Phase::Fix,
                    round + 1,
                    Some(&sig),
                )?;
            }
        }
        Ok(())
    }

    async fn run_audit(
        &self,
        topic: &str,
        objective: &str,
        repo_root: Option<&std::path::Path>,
        round: u32,
    ) -> Result<()> {
        let spec = self.spec(
            format!(
                "Audit the implementation of: {}. End your final line with PASS or FAIL.",
                objective
            ),
            repo_root,
            self.config.audit_timeout_s,
        );
        let outcome = self.spawn_phase(topic, Phase::Audit, round, &spec).await?;

        let passed =
            outcome.status == SubAgentStatus::Done && outcome.result.to_uppercase().contains("PASS");

        if passed {
            record_transition(
                &self.store,
                topic,
                PhaseEvent::AuditPass,
                Phase::Audit,
                Phase::Done,
                round + 1,
                None,
            )?;
            return Ok(());
        }

        let sig = error_signature(&outcome.result);

        // Two successive identical failure signatures mean the fix loop is
        // not converging.
        let previous = recent_audit_failures(&self.store, topic, 1)?;
        if previous.first().map(String::as_str) == Some(sig.as_str()) {
            record_transition(
                &self.store,
                topic,
                PhaseEvent::AuditFail,
                Phase::Audit,
                Phase::Fix,
                round + 1,
                Some(&sig),
            )?;
            self.escalate(
                topic,
                Phase::Fix,
                round + 1,
                &format!("repeated error signature {}", sig),
            )?;
            return Ok(());
        }

        record_transition(
            &self.store,
            topic,
            PhaseEvent::AuditFail,
            Phase::Audit,
            Phase::Fix,
            round + 1,
            Some(&sig),
        )?;
        Ok(())
    }

    async fn run_fix(
        &self,
        topic: &str,
        objective: &str,
        repo_root: Option<&std::path::Path>,
        round: u32,
    ) -> Result<()> {
        let failures = recent_audit_failures(&self.store, topic, 1)?;
        let hint = failures
            .first()
            .map(|sig| format!(" (failure signature {})", sig))
            .unwrap_or_default();

        let spec = self.spec(
            format!("Fix the audit failures for: {}{}", objective, hint),
            repo_root,
            self.config.fix_timeout_s,
        );
        let outcome = self.spawn_phase(topic, Phase::Fix, round, &spec).await?;

        // Even a struggling fix run hands control back to audit; the
        // repeated-signature guard catches non-progress.
        let _ = outcome;
        record_transition(
            &self.store,
            topic,
            PhaseEvent::FixDone,
            Phase::Fix,
            Phase::Audit,
            round,
            None,
        )?;
        Ok(())
    }

    /// Spawn with phase markers before and after. A launch failure is
    /// converted into an error outcome so the loop continues under its
    /// guards.
    async fn spawn_phase(
        &self,
        topic: &str,
        phase: Phase,
        round: u32,
        spec: &SpawnSpec,
    ) -> Result<SubAgentOutcome> {
        record_spawn_marker(&self.store, topic, phase, round, "spawn")?;
        let outcome = match self.launcher.launch_and_wait(spec).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(phase = %phase, error = %e, "sub-agent launch failed");
                SubAgentOutcome {
                    status: SubAgentStatus::Error,
                    result: format!("spawn failure: {}", e),
                    history: Vec::new(),
                }
            }
        };
        record_spawn_marker(&self.store, topic, phase, round, "return")?;
        Ok(outcome)
    }

    fn spec(
        &self,
        objective: String,
        repo_root: Option<&std::path::Path>,
        timeout_s: u64,
    ) -> SpawnSpec {
        let mut spec = SpawnSpec::new(objective)
            .with_max_iterations(self.config.sub_agent_max_iterations)
            .with_timeout(timeout_s);
        if let Some(root) = repo_root {
            spec = spec.with_repo_root(root);
        }
        spec
    }

    fn escalate(&self, topic: &str, from: Phase, round: u32, reason: &str) -> Result<()> {
        warn!(topic, reason, "orchestration escalating");
        record_transition(
            &self.store,
            topic,
            PhaseEvent::Escalate,
            from,
            Phase::Escalated,
            round,
            Some(reason),
        )?;
        // Escalations ask for a human
        let question = Glyph::new(
            GlyphType::Question,
            format!("orchestration stuck ({}); operator intervention needed", reason),
        )
        .with_topic(topic)
        .with_importance(crate::store::Importance::H);
        self.store.append(&question)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{Caller, GlyphQuery};
    use pretty_assertions::assert_eq;

    fn store() -> Arc<GlyphStore> {
        Arc::new(GlyphStore::in_memory().unwrap())
    }

    fn phase_choices(store: &GlyphStore, topic: &str) -> Vec<String> {
        let mut glyphs = store
            .query(
                &GlyphQuery::new()
                    .glyph_type(GlyphType::Phase)
                    .topic(topic)
                    .limit(100),
                &Caller::operator(),
            )
            .unwrap();
        glyphs.reverse(); // oldest first
        glyphs.into_iter().filter_map(|g| g.choice).collect()
    }

    #[tokio::test]
    async fn test_clean_pass() {
        let store = store();
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedLauncher::done("implemented the feature"),
            ScriptedLauncher::done("checked everything: PASS"),
        ]));
        let orch = Orchestrator::new(store.clone(), launcher);

        let outcome = orch.run("ship the widget", None).await.unwrap();
        assert_eq!(outcome.final_phase, Phase::Done);
        assert_eq!(outcome.rounds, 1);

        let topic = orch_topic(&outcome.orch_id);
        let choices = phase_choices(&store, &topic);
        assert!(choices.contains(&"implement_done".to_string()));
        assert!(choices.contains(&"audit:pass".to_string()));
        // Spawn markers bracket both spawns
        assert_eq!(choices.iter().filter(|c| c.ends_with(":spawn")).count(), 2);
        assert_eq!(choices.iter().filter(|c| c.ends_with(":return")).count(), 2);
    }

    #[tokio::test]
    async fn test_fail_fix_pass() {
        let store = store();
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedLauncher::done("implemented"),
            ScriptedLauncher::done("FAIL: two tests are red"),
            ScriptedLauncher::done("patched the tests"),
            ScriptedLauncher::done("all green: PASS"),
        ]));
        let orch = Orchestrator::new(store.clone(), launcher);

        let outcome = orch.run("fix the login flow", None).await.unwrap();
        assert_eq!(outcome.final_phase, Phase::Done);
        assert_eq!(outcome.rounds, 2);

        let topic = orch_topic(&outcome.orch_id);
        let choices = phase_choices(&store, &topic);
        let transitions: Vec<&String> = choices
            .iter()
            .filter(|c| !c.contains(':') || c.starts_with("audit"))
            .collect();
        assert_eq!(
            transitions,
            vec!["implement_done", "audit:fail", "fix_done", "audit:pass"]
        );
    }

    #[tokio::test]
    async fn test_max_rounds_escalates() {
        let store = store();
        // Every audit fails with a different signature so only the round
        // ceiling triggers.
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedLauncher::done("implemented"),
            ScriptedLauncher::done("FAIL: reason one"),
            ScriptedLauncher::done("fixed"),
            ScriptedLauncher::done("FAIL: other reason entirely"),
            ScriptedLauncher::done("fixed again"),
        ]));
        let orch = Orchestrator::new(store.clone(), launcher).with_config(OrchestratorConfig {
            max_rounds: 2,
            ..OrchestratorConfig::default()
        });

        let outcome = orch.run("hopeless objective", None).await.unwrap();
        assert_eq!(outcome.final_phase, Phase::Escalated);

        // Escalation leaves a question for the operator
        let questions = store
            .query(
                &GlyphQuery::new().glyph_type(GlyphType::Question).limit(10),
                &Caller::operator(),
            )
            .unwrap();
        assert_eq!(questions.len(), 1);
        assert!(questions[0].text.contains("max_rounds"));
    }

    #[tokio::test]
    async fn test_repeated_signature_escalates() {
        let store = store();
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedLauncher::done("implemented"),
            ScriptedLauncher::done("FAIL: TypeError: X is undefined"),
            ScriptedLauncher::done("tried a fix"),
            ScriptedLauncher::done("FAIL: TypeError: X is undefined"),
        ]));
        let orch = Orchestrator::new(store.clone(), launcher);

        let outcome = orch.run("stuck objective", None).await.unwrap();
        assert_eq!(outcome.final_phase, Phase::Escalated);
        assert!(outcome.rounds < 5, "escalated before the round ceiling");
    }

    #[tokio::test]
    async fn test_max_rounds_one_escalates_on_first_failure() {
        let store = store();
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            ScriptedLauncher::done("implemented"),
            ScriptedLauncher::done("FAIL: broken"),
        ]));
        let orch = Orchestrator::new(store.clone(), launcher).with_config(OrchestratorConfig {
            max_rounds: 1,
            ..OrchestratorConfig::default()
        });

        let outcome = orch.run("one shot", None).await.unwrap();
        assert_eq!(outcome.final_phase, Phase::Escalated);
    }

    #[tokio::test]
    async fn test_spawn_failure_feeds_fix_loop() {
        let store = store();
        let launcher = Arc::new(ScriptedLauncher::new(vec![
            Err(crate::error::Error::Orchestration("binary missing".to_string())),
            ScriptedLauncher::done("fixed the launcher"),
            ScriptedLauncher::done("PASS"),
        ]));
        let orch = Orchestrator::new(store.clone(), launcher);

        let outcome = orch.run("fragile spawn", None).await.unwrap();
        assert_eq!(outcome.final_phase, Phase::Done);
    }

    #[tokio::test]
    async fn test_resume_from_persisted_phase() {
        let store = store();
        let id = orch_id("resumable");
        let topic = orch_topic(&id);

        // A previous process already finished IMPLEMENT
        record_transition(
            &store,
            &topic,
            PhaseEvent::ImplementDone,
            Phase::Implement,
            Phase::Audit,
            0,
            None,
        )
        .unwrap();

        // Only the audit spawn is scripted; an implement spawn would
        // exhaust the script and error.
        let launcher = Arc::new(ScriptedLauncher::new(vec![ScriptedLauncher::done("PASS")]));
        let orch = Orchestrator::new(store.clone(), launcher);

        let outcome = orch.run("resumable", None).await.unwrap();
        assert_eq!(outcome.final_phase, Phase::Done);
    }

    #[tokio::test]
    async fn test_status_reports_phase() {
        let store = store();
        let launcher = Arc::new(ScriptedLauncher::new(vec![]));
        let orch = Orchestrator::new(store.clone(), launcher);

        let (id, phase, rounds) = orch.status("fresh objective").unwrap();
        assert_eq!(phase, Phase::Implement);
        assert_eq!(rounds, 0);
        assert_eq!(id.len(), 8);
    }
}
