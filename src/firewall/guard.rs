//! The guard contract: every agent action passes through `guard_action`,
//! which yields allow / escalate / deny, an audit row, and — on escalation
//! — a pending-changes entry awaiting operator review.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::firewall::budget::{BudgetLimits, ExecutionBudget};
use crate::firewall::policy::{CapabilityTier, PolicyTable, DEFAULT_PAYLOAD_CAP};
use crate::firewall::sandbox::SandboxGuard;
use crate::store::GlyphStore;

/// Who is performing the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    /// Analysis-only worker; executable actions are forbidden.
    Planner,
    /// Executing worker; dangerous actions escalate.
    Worker,
    /// Human operator replaying approved actions; nothing escalates.
    Operator,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planner => write!(f, "planner"),
            Self::Worker => write!(f, "worker"),
            Self::Operator => write!(f, "operator"),
        }
    }
}

/// Policy verdict for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Escalate,
    Deny,
}

impl std::fmt::Display for GuardDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Escalate => write!(f, "escalate"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// Outcome of `guard_action`. Callers must execute only `Allow` outcomes,
/// and only with the sanitized payload.
#[derive(Debug, Clone)]
pub struct GuardOutcome {
    pub decision: GuardDecision,
    pub reason: String,
    pub sanitized_payload: Value,
    pub pending_id: Option<i64>,
}

/// A row in the approval queue.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub id: i64,
    pub action_type: String,
    pub action_data: Value,
    pub proposed_by: String,
    pub status: String,
}

/// An immutable audit row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub action_type: String,
    pub action_data: Value,
    pub decision: String,
    pub reason: String,
    pub actor: String,
}

/// The capability firewall for one agent process.
pub struct Firewall {
    store: Arc<GlyphStore>,
    policy: PolicyTable,
    sandbox: SandboxGuard,
    budget: Mutex<ExecutionBudget>,
}

impl Firewall {
    pub fn new(store: Arc<GlyphStore>, sandbox_root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            store,
            policy: PolicyTable::default(),
            sandbox: SandboxGuard::new(sandbox_root),
            budget: Mutex::new(ExecutionBudget::new(BudgetLimits::default())),
        }
    }

    pub fn with_policy(mut self, policy: PolicyTable) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_budget(mut self, limits: BudgetLimits) -> Self {
        self.budget = Mutex::new(ExecutionBudget::new(limits));
        self
    }

    pub fn sandbox(&self) -> &SandboxGuard {
        &self.sandbox
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// Whether this process may spawn another sub-agent.
    pub fn can_spawn(&self) -> bool {
        self.budget.lock().map(|b| b.can_spawn()).unwrap_or(false)
    }

    /// Gate one action. Always records an audit row; never panics into the
    /// agent loop.
    pub fn guard_action(
        &self,
        action_type: &str,
        payload: &Value,
        actor: ActorRole,
    ) -> Result<GuardOutcome> {
        let outcome = self.evaluate(action_type, payload, actor)?;
        self.record_audit(action_type, payload, outcome.decision, &outcome.reason, actor)?;
        debug!(
            action = action_type,
            decision = %outcome.decision,
            reason = %outcome.reason,
            "guarded action"
        );
        Ok(outcome)
    }

    fn evaluate(
        &self,
        action_type: &str,
        payload: &Value,
        actor: ActorRole,
    ) -> Result<GuardOutcome> {
        let allow = |payload: Value| GuardOutcome {
            decision: GuardDecision::Allow,
            reason: "within policy".to_string(),
            sanitized_payload: payload,
            pending_id: None,
        };
        let deny = |reason: String| GuardOutcome {
            decision: GuardDecision::Deny,
            reason,
            sanitized_payload: Value::Null,
            pending_id: None,
        };

        // Unknown tools escalate by default
        let Some(policy) = self.policy.get(action_type) else {
            let pending_id = self.enqueue_pending(action_type, payload, actor)?;
            return Ok(GuardOutcome {
                decision: GuardDecision::Escalate,
                reason: format!("unknown tool '{}'", action_type),
                sanitized_payload: Value::Null,
                pending_id: Some(pending_id),
            });
        };

        // Payload size cap
        let cap = policy.max_bytes.unwrap_or(DEFAULT_PAYLOAD_CAP);
        let payload_len = payload.to_string().len();
        if payload_len > cap {
            return Ok(deny(format!(
                "payload {} bytes exceeds cap {}",
                payload_len, cap
            )));
        }

        // Sandbox resolution for path-taking tools
        let mut sanitized = payload.clone();
        if policy.sandboxed {
            if let Some(path) = payload.get("path").and_then(|p| p.as_str()) {
                match self.sandbox.resolve(path) {
                    Ok(resolved) => {
                        sanitized["path"] = Value::String(resolved.to_string_lossy().into_owned());
                    }
                    Err(e) => return Ok(deny(e.to_string())),
                }
            }
        }

        // Domain allowlist for network tools
        if let (Some(domains), Some(url)) = (
            policy.allow_domains.as_ref(),
            payload.get("url").and_then(|u| u.as_str()),
        ) {
            let host = url
                .split("://")
                .nth(1)
                .and_then(|rest| rest.split('/').next())
                .unwrap_or_default();
            if !domains.iter().any(|d| host == d || host.ends_with(&format!(".{}", d))) {
                return Ok(deny(format!("host '{}' not in allow list", host)));
            }
        }

        // Tier vs actor
        let tier_ok = match actor {
            ActorRole::Operator => true,
            ActorRole::Worker => policy.tier <= CapabilityTier::Moderate,
            ActorRole::Planner => policy.tier == CapabilityTier::Safe,
        };
        if !tier_ok {
            if actor == ActorRole::Planner {
                return Ok(deny(format!(
                    "{} tier action forbidden in planner mode",
                    policy.tier
                )));
            }
            let pending_id = self.enqueue_pending(action_type, payload, actor)?;
            return Ok(GuardOutcome {
                decision: GuardDecision::Escalate,
                reason: format!("{} tier requires approval", policy.tier),
                sanitized_payload: Value::Null,
                pending_id: Some(pending_id),
            });
        }

        if policy.requires_approval && actor != ActorRole::Operator {
            let pending_id = self.enqueue_pending(action_type, payload, actor)?;
            return Ok(GuardOutcome {
                decision: GuardDecision::Escalate,
                reason: "approval required".to_string(),
                sanitized_payload: Value::Null,
                pending_id: Some(pending_id),
            });
        }

        // Execution budget: one step per action
        if let Err(e) = self
            .budget
            .lock()
            .map_err(|e| Error::Internal(format!("budget lock poisoned: {}", e)))?
            .consume_step()
        {
            return Ok(deny(e.to_string()));
        }

        Ok(allow(sanitized))
    }

    /// Record a failure inside an already-allowed tool as a deny row; the
    /// error does not propagate to the agent loop.
    pub fn record_tool_failure(
        &self,
        action_type: &str,
        payload: &Value,
        error: &Error,
        actor: ActorRole,
    ) -> Result<()> {
        warn!(action = action_type, error = %error, "guarded tool failed");
        self.record_audit(
            action_type,
            payload,
            GuardDecision::Deny,
            &format!("tool failure: {}", error),
            actor,
        )
    }

    // ==================== Approval queue ====================

    fn enqueue_pending(
        &self,
        action_type: &str,
        payload: &Value,
        actor: ActorRole,
    ) -> Result<i64> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_changes
                    (action_type, action_data, proposed_by, proposed_at, status)
                 VALUES (?1, ?2, ?3, ?4, 'pending')",
                params![
                    action_type,
                    payload.to_string(),
                    actor.to_string(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Fetch one pending change.
    pub fn get_pending(&self, pending_id: i64) -> Result<Option<PendingChange>> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT id, action_type, action_data, proposed_by, status
                 FROM pending_changes WHERE id = ?1",
                params![pending_id],
                |row| {
                    Ok(PendingChange {
                        id: row.get(0)?,
                        action_type: row.get(1)?,
                        action_data: serde_json::from_str(&row.get::<_, String>(2)?)
                            .unwrap_or(Value::Null),
                        proposed_by: row.get(3)?,
                        status: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    /// All pending changes with the given status.
    pub fn list_pending(&self, status: &str) -> Result<Vec<PendingChange>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, action_type, action_data, proposed_by, status
                 FROM pending_changes WHERE status = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![status], |row| {
                    Ok(PendingChange {
                        id: row.get(0)?,
                        action_type: row.get(1)?,
                        action_data: serde_json::from_str(&row.get::<_, String>(2)?)
                            .unwrap_or(Value::Null),
                        proposed_by: row.get(3)?,
                        status: row.get(4)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }

    /// Approve a pending change and replay it through the firewall with
    /// operator authority. Returns the replayed outcome.
    pub fn approve(&self, pending_id: i64, operator: &str) -> Result<GuardOutcome> {
        let pending = self
            .get_pending(pending_id)?
            .ok_or_else(|| Error::validation(format!("no pending change {}", pending_id)))?;
        if pending.status != "pending" {
            return Err(Error::validation(format!(
                "pending change {} is already {}",
                pending_id, pending.status
            )));
        }

        self.resolve_pending(pending_id, "approved", operator)?;
        self.guard_action(&pending.action_type, &pending.action_data, ActorRole::Operator)
    }

    /// Reject a pending change.
    pub fn reject(&self, pending_id: i64, operator: &str) -> Result<()> {
        let pending = self
            .get_pending(pending_id)?
            .ok_or_else(|| Error::validation(format!("no pending change {}", pending_id)))?;
        if pending.status != "pending" {
            return Err(Error::validation(format!(
                "pending change {} is already {}",
                pending_id, pending.status
            )));
        }
        self.resolve_pending(pending_id, "rejected", operator)
    }

    fn resolve_pending(&self, pending_id: i64, status: &str, operator: &str) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE pending_changes
                 SET status = ?2, resolved_at = ?3, resolved_by = ?4
                 WHERE id = ?1",
                params![pending_id, status, Utc::now().to_rfc3339(), operator],
            )
        })?;
        Ok(())
    }

    // ==================== Audit log ====================

    fn record_audit(
        &self,
        action_type: &str,
        payload: &Value,
        decision: GuardDecision,
        reason: &str,
        actor: ActorRole,
    ) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log
                    (timestamp, action_type, action_data, decision, reason, actor)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Utc::now().to_rfc3339(),
                    action_type,
                    payload.to_string(),
                    decision.to_string(),
                    reason,
                    actor.to_string()
                ],
            )
        })?;
        Ok(())
    }

    /// Most recent audit rows, newest first.
    pub fn audit_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, action_type, action_data, decision, reason, actor
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(AuditEntry {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        action_type: row.get(2)?,
                        action_data: serde_json::from_str(&row.get::<_, String>(3)?)
                            .unwrap_or(Value::Null),
                        decision: row.get(4)?,
                        reason: row.get(5)?,
                        actor: row.get(6)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
    }
}
