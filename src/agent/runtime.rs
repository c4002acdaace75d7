//! The agent run-loop.
//!
//! Each iteration assembles a prompt from the store, routes it through the
//! LLM router, parses the returned action, and dispatches it through the
//! capability firewall. Side effects are glyph writes, task transitions, or
//! phase advances; everything else is denied or queued for approval. The
//! loop ends on `done`, exhausted budgets, or the iteration cap, and always
//! leaves a closing summary glyph.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::action::{parse_action, Action};
use crate::agent::prompt::PromptAssembler;
use crate::agent::tools;
use crate::error::{Error, Result};
use crate::firewall::{ActorRole, Firewall, GuardDecision, DEFAULT_READ_CAP};
use crate::orchestrator::{derive_phase, orch_topic, AgentLauncher, SpawnSpec};
use crate::retrieval::Caller;
use crate::router::{CallContext, LlmRequest, ResponseExpectations, TieredRouter};
use crate::store::{Glyph, GlyphStore, GlyphType, TaskStatus};
use crate::tasks::{Actor, TaskRegistry};

/// Launch-time execution mode, enforced by firewall tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Analysis only: the worker emits ATTEMPT/RESULT/LESSON lines.
    Planner,
    /// Performs guarded actions directly.
    Executor,
}

/// Terminal status of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Done,
    Failed,
    BudgetExceeded,
    MaxIterations,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::MaxIterations => write!(f, "max_iterations"),
        }
    }
}

/// Final report from a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub iterations: u32,
    pub summary: String,
    pub last_error: Option<String>,
}

/// Runtime configuration for one agent process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mode: AgentMode,
    pub session: String,
    pub chat_id: Option<String>,
    pub role: Option<String>,
    pub max_iterations: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: AgentMode::Executor,
            session: Uuid::new_v4().to_string(),
            chat_id: None,
            role: None,
            max_iterations: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn planner() -> Self {
        Self {
            mode: AgentMode::Planner,
            ..Self::default()
        }
    }
}

/// The agent runtime.
pub struct AgentRuntime {
    store: Arc<GlyphStore>,
    registry: Arc<TaskRegistry>,
    firewall: Arc<Firewall>,
    router: Arc<TieredRouter>,
    launcher: Option<Arc<dyn AgentLauncher>>,
    assembler: PromptAssembler,
    config: RuntimeConfig,
}

impl AgentRuntime {
    pub fn new(
        store: Arc<GlyphStore>,
        registry: Arc<TaskRegistry>,
        firewall: Arc<Firewall>,
        router: Arc<TieredRouter>,
        config: RuntimeConfig,
    ) -> Self {
        let caller = {
            let mut caller = Caller::new().with_session(config.session.clone());
            if let Some(chat_id) = &config.chat_id {
                caller = caller.with_chat_id(chat_id.clone());
            }
            if let Some(role) = &config.role {
                caller = caller.with_role(role.clone());
            }
            caller
        };
        let assembler = PromptAssembler::new(store.clone(), registry.clone(), caller);
        Self {
            store,
            registry,
            firewall,
            router,
            launcher: None,
            assembler,
            config,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn AgentLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    fn actor(&self) -> ActorRole {
        match self.config.mode {
            AgentMode::Planner => ActorRole::Planner,
            AgentMode::Executor => ActorRole::Worker,
        }
    }

    /// Drive an objective to completion.
    pub async fn run_objective(
        &self,
        objective: &str,
        task_topic: Option<&str>,
        phase_instructions: Option<&str>,
    ) -> Result<RunReport> {
        let mut iterations = 0u32;
        let mut last_error: Option<String> = None;

        while iterations < self.config.max_iterations {
            iterations += 1;

            let prompt = self.assembler.assemble(
                objective,
                &self.config.session,
                task_topic,
                phase_instructions,
            )?;

            let routed = match self
                .router
                .route(
                    &LlmRequest::new(prompt),
                    &CallContext::new("agent_step")
                        .with_expectations(ResponseExpectations::json_with_fields(&["action"])),
                )
                .await
            {
                Ok(routed) => routed,
                Err(e) => {
                    // Chain exhaustion surfaces as a failed attempt
                    let attempt = Glyph::new(
                        GlyphType::Attempt,
                        format!("LLM routing failed: {}", e),
                    )
                    .with_session(&self.config.session)
                    .with_source("daemon");
                    self.store.append(&attempt)?;
                    return self.finish(RunStatus::Failed, iterations, objective, Some(e.to_string()));
                }
            };

            let action = match parse_action(&routed.content) {
                Ok(action) => action,
                Err(e) => {
                    warn!(error = %e, "unparseable action; continuing");
                    last_error = Some(e.to_string());
                    self.record_step(&format!("rejected response: {}", e))?;
                    continue;
                }
            };

            debug!(action = action.name(), iteration = iterations, "dispatching action");

            if let Action::Done { summary } = &action {
                self.record_step(&format!("done: {}", summary))?;
                return self.finish(RunStatus::Done, iterations, summary, last_error);
            }

            let outcome =
                self.firewall
                    .guard_action(action.name(), &action.payload(), self.actor())?;

            match outcome.decision {
                GuardDecision::Allow => {
                    match self.execute(&action, &outcome.sanitized_payload).await {
                        Ok(output) => {
                            self.record_step(&format!(
                                "{}: {}",
                                action.name(),
                                truncate(&output, 400)
                            ))?;
                        }
                        Err(e) => {
                            self.firewall.record_tool_failure(
                                action.name(),
                                &action.payload(),
                                &e,
                                self.actor(),
                            )?;
                            last_error = Some(e.to_string());
                            self.record_step(&format!("{} failed: {}", action.name(), e))?;
                        }
                    }
                }
                GuardDecision::Escalate => {
                    let pending = outcome
                        .pending_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "?".to_string());
                    self.record_step(&format!(
                        "{} escalated (pending {})",
                        action.name(),
                        pending
                    ))?;
                    // The iteration ends here; the operator decides
                    continue;
                }
                GuardDecision::Deny => {
                    last_error = Some(outcome.reason.clone());
                    self.record_step(&format!("{} denied: {}", action.name(), outcome.reason))?;
                    if outcome.reason.contains("max_steps") || outcome.reason.contains("max_seconds")
                    {
                        return self.finish(
                            RunStatus::BudgetExceeded,
                            iterations,
                            objective,
                            last_error,
                        );
                    }
                }
            }
        }

        self.finish(RunStatus::MaxIterations, iterations, objective, last_error)
    }

    /// Claim the next open task and work it to a terminal state, emitting
    /// the attempt/result/lesson protocol.
    pub async fn run_next_task(&self, owner: &str) -> Result<Option<RunReport>> {
        let Some(task) = self.registry.claim_next_open(
            owner,
            self.config.role.as_deref(),
            self.config.chat_id.as_deref(),
            None,
        )?
        else {
            return Ok(None);
        };
        info!(task_id = %task.task_id, owner, "working claimed task");

        let report = match self.config.mode {
            AgentMode::Planner => self.run_planner_task(&task).await?,
            AgentMode::Executor => {
                let report = self
                    .run_objective(&task.text, task.topic.as_deref(), None)
                    .await?;
                self.settle_task(&task.task_id, &report)?;
                report
            }
        };
        Ok(Some(report))
    }

    /// Planner mode: one routed analysis call, parsed into structured
    /// ATTEMPT / RESULT / LESSON glyphs.
    async fn run_planner_task(&self, task: &crate::tasks::Task) -> Result<RunReport> {
        let prompt = format!(
            "{}\n\nYou are in planner mode: do not act, only analyze.\n\
             Emit lines starting with ATTEMPT:, RESULT: success|failure - <text>, \
             and optionally LESSON:.",
            self.assembler
                .assemble(&task.text, &self.config.session, task.topic.as_deref(), None)?
        );

        let routed = self
            .router
            .route(
                &LlmRequest::new(prompt),
                &CallContext::new("plan").with_expectations(ResponseExpectations::text(20)),
            )
            .await;

        let routed = match routed {
            Ok(routed) => routed,
            Err(e) => {
                self.registry.log_result(
                    &task.task_id,
                    false,
                    &format!("planner routing failed: {}", e),
                    None,
                    Some("daemon"),
                )?;
                let report = RunReport {
                    status: RunStatus::Failed,
                    iterations: 1,
                    summary: task.text.clone(),
                    last_error: Some(e.to_string()),
                };
                self.settle_task(&task.task_id, &report)?;
                return Ok(report);
            }
        };

        let parsed = parse_planner_output(&routed.content);
        for attempt in &parsed.attempts {
            self.registry
                .log_attempt(&task.task_id, attempt, Some("planner"))?;
        }
        for lesson in &parsed.lessons {
            self.registry.log_lesson(
                Some(&task.task_id),
                task.topic.as_deref(),
                lesson,
                Some("planner"),
            )?;
        }

        let (success, result_text) = parsed
            .results
            .last()
            .cloned()
            .unwrap_or((false, "planner emitted no result".to_string()));
        self.registry
            .log_result(&task.task_id, success, &result_text, None, Some("planner"))?;

        let report = RunReport {
            status: if success { RunStatus::Done } else { RunStatus::Failed },
            iterations: 1,
            summary: result_text,
            last_error: None,
        };
        self.transition_after_result(&task.task_id, success)?;
        self.emit_closing_glyph(&report)?;
        Ok(report)
    }

    /// Apply the task-outcome protocol after an executor run.
    fn settle_task(&self, task_id: &str, report: &RunReport) -> Result<()> {
        match report.status {
            RunStatus::Done => {
                self.registry
                    .log_attempt(task_id, &report.summary, Some("daemon"))?;
                self.registry
                    .log_result(task_id, true, &report.summary, None, Some("daemon"))?;
                self.transition_after_result(task_id, true)?;
            }
            _ => {
                let reason = report
                    .last_error
                    .clone()
                    .unwrap_or_else(|| report.status.to_string());
                self.registry
                    .log_attempt(task_id, &report.summary, Some("daemon"))?;
                self.registry
                    .log_result(task_id, false, &reason, None, Some("daemon"))?;
                self.registry.log_lesson(
                    Some(task_id),
                    None,
                    &format!("run ended {}: {}", report.status, reason),
                    Some("daemon"),
                )?;
                self.transition_after_result(task_id, false)?;
            }
        }
        Ok(())
    }

    /// DONE on success; BLOCKED on failure. Workers never re-open.
    fn transition_after_result(&self, task_id: &str, success: bool) -> Result<()> {
        let target = if success { TaskStatus::Done } else { TaskStatus::Blocked };
        // Doom-loop detection may have blocked the task already
        if let Some(current) = self.registry.get(task_id)? {
            if current.status == TaskStatus::InProgress {
                self.registry.update_status(task_id, target, Actor::Worker)?;
            }
        }
        Ok(())
    }

    /// Execute an allowed action against the sanitized payload.
    async fn execute(&self, action: &Action, sanitized: &serde_json::Value) -> Result<String> {
        let policy = self.firewall.policy().get(action.name());
        let timeout_s = policy.map(|p| p.timeout_s).unwrap_or(30);
        let read_cap = policy.and_then(|p| p.max_bytes).unwrap_or(DEFAULT_READ_CAP);
        let sandbox_root = self.firewall.sandbox().root().to_path_buf();

        let sanitized_path = sanitized
            .get("path")
            .and_then(|p| p.as_str())
            .map(Path::new);

        match action {
            Action::ListFiles { .. } => {
                tools::list_files(sanitized_path.unwrap_or(&sandbox_root))
            }
            Action::ReadFile { .. } => {
                let path = sanitized_path
                    .ok_or_else(|| Error::validation("read_file requires a path"))?;
                tools::read_file(path, read_cap)
            }
            Action::SearchText { pattern, .. } => {
                tools::search_text(sanitized_path.unwrap_or(&sandbox_root), pattern, 100)
            }
            Action::WriteMemory {
                glyph_type,
                topic,
                text,
                choice,
            } => {
                let parsed_type: GlyphType = glyph_type.parse()?;
                let mut glyph = Glyph::new(parsed_type, text)
                    .with_session(&self.config.session)
                    .with_source("daemon");
                glyph.topic = topic.clone();
                glyph.choice = choice.clone();
                glyph.chat_id = self.config.chat_id.clone();
                glyph.agent_role = self.config.role.clone();
                let id = self.store.append(&glyph)?;
                Ok(format!("wrote glyph {}", id))
            }
            Action::OrchStatus { orch_id } => {
                let topic = orch_topic(orch_id);
                let phase = derive_phase(&self.store, &topic)?;
                Ok(format!("orch {} phase={}", orch_id, phase))
            }
            Action::SpawnDaemon {
                objective,
                wait,
                timeout,
                max_iterations,
            } => {
                let launcher = self
                    .launcher
                    .as_ref()
                    .ok_or_else(|| Error::Orchestration("no launcher configured".to_string()))?;
                if !self.firewall.can_spawn() {
                    return Err(Error::budget_exhausted("max_recursion"));
                }
                let spec = SpawnSpec::new(objective.clone())
                    .with_timeout(*timeout)
                    .with_max_iterations(*max_iterations);
                if *wait {
                    let outcome = launcher.launch_and_wait(&spec).await?;
                    Ok(format!(
                        "sub_status={} sub_result={} sub_history={:?}",
                        outcome.status, outcome.result, outcome.history
                    ))
                } else {
                    let handle = launcher.launch_detached(&spec).await?;
                    Ok(format!("spawned pid {}", handle.pid))
                }
            }
            Action::Run { command } | Action::Exec { command } => {
                tools::run_command(command, &sandbox_root, timeout_s).await
            }
            Action::HttpRequest { url, method } => {
                tools::http_request(url, method.as_deref(), timeout_s).await
            }
            Action::EditFile { content, .. } => {
                let path = sanitized_path
                    .ok_or_else(|| Error::validation("edit_file requires a path"))?;
                tools::edit_file(path, content)
            }
            Action::Done { .. } => unreachable!("handled before dispatch"),
        }
    }

    /// Record one iteration step as this agent's own action glyph.
    fn record_step(&self, text: &str) -> Result<()> {
        let glyph = Glyph::new(GlyphType::Action, text)
            .with_session(&self.config.session)
            .with_source("daemon");
        self.store.append(&glyph)?;
        Ok(())
    }

    fn finish(
        &self,
        status: RunStatus,
        iterations: u32,
        summary: &str,
        last_error: Option<String>,
    ) -> Result<RunReport> {
        let report = RunReport {
            status,
            iterations,
            summary: summary.to_string(),
            last_error,
        };
        self.emit_closing_glyph(&report)?;
        info!(status = %report.status, iterations, "agent run finished");
        Ok(report)
    }

    /// The final summary glyph every termination leaves behind.
    fn emit_closing_glyph(&self, report: &RunReport) -> Result<()> {
        let glyph = Glyph::new(
            GlyphType::Action,
            json!({
                "status": report.status.to_string(),
                "iterations": report.iterations,
                "last_error": report.last_error,
            })
            .to_string(),
        )
        .with_topic("daemon")
        .with_session(&self.config.session)
        .with_source("daemon");
        self.store.append(&glyph)?;
        Ok(())
    }
}

/// Structured lines a planner-mode worker emits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlannerOutput {
    pub attempts: Vec<String>,
    pub results: Vec<(bool, String)>,
    pub lessons: Vec<String>,
}

/// Parse ATTEMPT / RESULT / LESSON lines out of planner output.
pub fn parse_planner_output(raw: &str) -> PlannerOutput {
    let mut output = PlannerOutput::default();
    for line in raw.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("ATTEMPT:") {
            output.attempts.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("RESULT:") {
            let rest = rest.trim();
            let (verdict, text) = match rest.split_once('-') {
                Some((v, t)) => (v.trim(), t.trim()),
                None => (rest, rest),
            };
            let success = verdict.to_lowercase().starts_with("success");
            output.results.push((success, text.to_string()));
        } else if let Some(rest) = line.strip_prefix("LESSON:") {
            output.lessons.push(rest.trim().to_string());
        }
    }
    output
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}
