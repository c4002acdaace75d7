//! # glyphos
//!
//! A persistent, shared memory operating system for autonomous LLM agent
//! swarms. Multiple agent processes — a conversational head, a manager
//! planner, spawned worker daemons — coordinate through one durable store
//! of typed records ("glyphs") driving an IMPLEMENT -> AUDIT -> FIX loop
//! over external objectives.
//!
//! ## Core Components
//!
//! - **Store**: append-only typed record log over SQLite with a JSONL
//!   mirror for crash recovery
//! - **Retrieval**: filtered queries, hybrid semantic ranking with
//!   temporal decay, topic indexing, consolidation
//! - **Tasks**: todo/goal lifecycle, atomic single-claimer acquisition,
//!   doom-loop detection
//! - **Orchestrator**: phase state machine over spawned sub-agents with
//!   anti-loop guards
//! - **Firewall**: tiered capability policy, sandbox jail, budgets,
//!   approval queue, audit log
//! - **Router**: three-tier LLM dispatch with quality-driven fallback and
//!   cost accounting
//! - **Agent**: the run-loop gluing the above into guarded iterations
//!
//! ## Example
//!
//! ```rust,ignore
//! use glyphos::{Glyph, GlyphStore, GlyphType};
//!
//! let store = GlyphStore::open("memory.db", "anchors.jsonl")?;
//! store.append(
//!     &Glyph::new(GlyphType::Decision, "Use bearer tokens")
//!         .with_topic("auth")
//!         .with_choice("bearer"),
//! )?;
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod firewall;
pub mod orchestrator;
pub mod retrieval;
pub mod router;
pub mod store;
pub mod tasks;

// Re-exports for convenience
pub use agent::{
    parse_action, parse_planner_output, Action, AgentMode, AgentRuntime, PlannerOutput,
    PromptAssembler, RunReport, RunStatus, RuntimeConfig,
};
pub use config::Config;
pub use error::{Error, Result};
pub use firewall::{
    ActorRole, AuditEntry, BudgetLimits, CapabilityTier, ExecutionBudget, Firewall,
    GuardDecision, GuardOutcome, PendingChange, PolicyTable, SandboxGuard, ToolPolicy,
};
pub use orchestrator::{
    orch_id, orch_topic, AgentLauncher, Orchestrator, OrchestratorConfig, OrchestrationOutcome,
    Phase, PhaseEvent, ProcessLauncher, ScriptedLauncher, SpawnHandle, SpawnSpec,
    SubAgentOutcome, SubAgentStatus,
};
pub use retrieval::{
    consolidate, embed_glyphs, hierarchical_search, semantic_search, topic_index_build, Caller,
    ConsolidationReport, EmbedReport, Embedder, GlyphQuery, HashEmbedder, RecentWindow,
    ScoredGlyph, SemanticParams, Summarizer, TopicEntry, TopicIndexReport,
};
pub use router::{
    AnthropicProvider, CallContext, Complexity, ComplexityClassifier, LlmProvider, LlmRequest,
    LlmResponse, ModelConfig, OllamaProvider, ResponseExpectations, RoutedResponse, RouteTier,
    RouterConfig, TieredRouter, UsageLog, UsageRecord, UsageSummary,
};
pub use store::{
    Glyph, GlyphStatus, GlyphStore, GlyphType, Importance, Scope, StoreHealth, StoreStatus,
    SyncReport, TaskStatus, Visibility,
};
pub use tasks::{error_signature, Actor, Task, TaskRegistry, DOOM_LOOP_THRESHOLD};
