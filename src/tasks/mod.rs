//! Task lifecycle and claim protocol.
//!
//! A task is a `todo`/`goal` glyph chain sharing one external `task_id`,
//! plus its linked provenance (attempts, results, lessons, phases). Status
//! changes append a new task glyph and supersede the prior one, so the
//! latest active glyph is always authoritative. Claims are serialized by an
//! exclusive store transaction: exactly one concurrent claimer wins.

mod signature;

pub use signature::{error_signature, is_doom_loop, DOOM_LOOP_THRESHOLD};

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_CLAIM_TTL_MINUTES;
use crate::error::{Error, Result};
use crate::retrieval::{Caller, GlyphQuery};
use crate::store::{
    row_to_glyph, validate_task_id, Glyph, GlyphStore, GlyphType, Importance, TaskStatus,
    GLYPH_COLUMNS,
};

/// Who is asking for a transition. Workers may never re-open tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Worker,
    Elevated,
}

/// A materialized task: the authoritative glyph plus parsed claim state.
#[derive(Debug, Clone)]
pub struct Task {
    pub glyph_id: i64,
    pub task_id: String,
    pub glyph_type: GlyphType,
    pub topic: Option<String>,
    pub text: String,
    pub status: TaskStatus,
    pub importance: Option<Importance>,
    pub owner: Option<String>,
    pub role: Option<String>,
    pub chat_id: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    fn from_glyph(glyph: &Glyph) -> Option<Self> {
        let task_id = glyph.task_id.clone().or_else(|| {
            glyph
                .links
                .as_ref()
                .and_then(|l| l.get("id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })?;
        let status = glyph.task_status()?;
        let links = glyph.links.as_ref();
        let link_str =
            |key: &str| links.and_then(|l| l.get(key)).and_then(|v| v.as_str()).map(String::from);

        Some(Self {
            glyph_id: glyph.id,
            task_id,
            glyph_type: glyph.glyph_type,
            topic: glyph.topic.clone(),
            text: glyph.text.clone(),
            status,
            importance: glyph.importance,
            owner: link_str("owner"),
            role: link_str("role"),
            chat_id: link_str("chat_id"),
            claim_expires_at: link_str("claim_expires_at")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            updated_at: glyph.timestamp,
        })
    }

    /// Whether the current claim (if any) has lapsed.
    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        match self.claim_expires_at {
            Some(expiry) => expiry <= now,
            None => true,
        }
    }
}

/// Registry over the shared glyph store.
pub struct TaskRegistry {
    store: Arc<GlyphStore>,
    claim_ttl_minutes: i64,
}

/// SQL selecting the authoritative (latest active) task glyph per task_id.
const AUTHORITATIVE_TASKS: &str = "SELECT {cols} FROM glyphs g
     WHERE g.status = 'active'
       AND g.glyph_type IN ('todo', 'goal')
       AND g.task_id IS NOT NULL
       AND g.id = (
           SELECT g2.id FROM glyphs g2
           WHERE g2.task_id = g.task_id
             AND g2.status = 'active'
             AND g2.glyph_type IN ('todo', 'goal')
           ORDER BY g2.timestamp DESC, g2.id DESC
           LIMIT 1)";

impl TaskRegistry {
    pub fn new(store: Arc<GlyphStore>) -> Self {
        Self {
            store,
            claim_ttl_minutes: DEFAULT_CLAIM_TTL_MINUTES,
        }
    }

    pub fn with_claim_ttl_minutes(mut self, minutes: i64) -> Self {
        self.claim_ttl_minutes = minutes;
        self
    }

    fn authoritative_sql(extra: &str) -> String {
        let base = AUTHORITATIVE_TASKS.replace(
            "{cols}",
            &GLYPH_COLUMNS
                .split(", ")
                .map(|c| format!("g.{}", c))
                .collect::<Vec<_>>()
                .join(", "),
        );
        format!("{}{}", base, extra)
    }

    /// Create a new `todo` or `goal` with `choice=OPEN`. Fails if an active
    /// non-terminal task already carries the same task_id.
    pub fn add_task(
        &self,
        task_id: &str,
        glyph_type: GlyphType,
        topic: Option<&str>,
        text: &str,
        importance: Option<Importance>,
    ) -> Result<i64> {
        validate_task_id(task_id)?;
        if !matches!(glyph_type, GlyphType::Todo | GlyphType::Goal) {
            return Err(Error::validation(format!(
                "tasks must be todo or goal, not {}",
                glyph_type
            )));
        }

        if let Some(existing) = self.get(task_id)? {
            if !existing.status.is_terminal() {
                return Err(Error::validation(format!(
                    "task '{}' already exists with status {}",
                    task_id, existing.status
                )));
            }
        }

        let mut glyph = Glyph::new(glyph_type, text)
            .with_task_id(task_id)
            .with_choice(TaskStatus::Open.as_str())
            .with_links(json!({ "id": task_id }));
        glyph.topic = topic.map(String::from);
        glyph.importance = importance;

        let id = self.store.append(&glyph)?;
        info!(task_id, glyph_id = id, "task created");
        Ok(id)
    }

    /// The authoritative task for a task_id, if any.
    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let sql = Self::authoritative_sql(" AND g.task_id = ?1");
        let glyph = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(params![task_id], row_to_glyph)?
                .filter_map(|r| r.ok());
            Ok(rows.next())
        })?;
        Ok(glyph.as_ref().and_then(Task::from_glyph))
    }

    /// List tasks ordered by status band (BLOCKED < IN_PROGRESS < OPEN <
    /// DONE), then importance (H < M < L, untagged last), then newest.
    pub fn list(
        &self,
        topic: Option<&str>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = Self::authoritative_sql("");
        let glyphs: Vec<Glyph> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], row_to_glyph)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut tasks: Vec<Task> = glyphs
            .iter()
            .filter_map(Task::from_glyph)
            .filter(|t| topic.map_or(true, |want| t.topic.as_deref() == Some(want)))
            .filter(|t| status.map_or(true, |want| t.status == want))
            .collect();

        tasks.sort_by(|a, b| {
            a.status
                .band()
                .cmp(&b.status.band())
                .then_with(|| {
                    let rank = |t: &Task| t.importance.map(|i| i.rank()).unwrap_or(3);
                    rank(a).cmp(&rank(b))
                })
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| b.glyph_id.cmp(&a.glyph_id))
        });
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Transition a task. Emits a new task glyph with the new `choice` and
    /// supersedes the prior one.
    ///
    /// Permitted transitions:
    /// - `OPEN -> IN_PROGRESS`
    /// - `IN_PROGRESS -> DONE | BLOCKED`, `IN_PROGRESS -> OPEN` (elevated)
    /// - `BLOCKED -> OPEN` (elevated only; workers never re-open)
    /// - any `-> DONE` additionally requires a linked success result
    pub fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        actor: Actor,
    ) -> Result<i64> {
        let current = self
            .get(task_id)?
            .ok_or_else(|| Error::validation(format!("no task with id '{}'", task_id)))?;

        check_transition(current.status, new_status, actor)?;

        if new_status == TaskStatus::Done && !self.has_success_result(task_id)? {
            return Err(Error::validation(format!(
                "task '{}' cannot move to DONE without a success result",
                task_id
            )));
        }

        self.transition(&current, new_status, None)
    }

    /// Atomically claim the oldest claimable task: OPEN, or IN_PROGRESS
    /// with an expired claim. Exactly one concurrent claimer receives the
    /// task; a repeated claim by the same owner within TTL returns the same
    /// task.
    pub fn claim_next_open(
        &self,
        owner: &str,
        role: Option<&str>,
        chat_id: Option<&str>,
        topic: Option<&str>,
    ) -> Result<Option<Task>> {
        let now = Utc::now();
        let ttl = Duration::minutes(self.claim_ttl_minutes);
        let sql = Self::authoritative_sql(" ORDER BY g.timestamp ASC, g.id ASC");

        self.store.with_immediate_tx(|tx| {
            let glyphs: Vec<Glyph> = {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_glyph)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            };
            let tasks: Vec<Task> = glyphs
                .iter()
                .filter_map(Task::from_glyph)
                .filter(|t| topic.map_or(true, |want| t.topic.as_deref() == Some(want)))
                .collect();

            // Idempotent re-claim: same owner, live claim
            if let Some(held) = tasks.iter().find(|t| {
                t.status == TaskStatus::InProgress
                    && t.owner.as_deref() == Some(owner)
                    && !t.claim_expired(now)
            }) {
                debug!(task_id = %held.task_id, owner, "returning held claim");
                return Ok(Some(held.clone()));
            }

            let candidate = tasks.iter().find(|t| match t.status {
                TaskStatus::Open => true,
                TaskStatus::InProgress => t.claim_expired(now),
                _ => false,
            });

            let Some(task) = candidate else {
                return Ok(None);
            };

            let expires = now + ttl;
            let mut links = json!({
                "id": task.task_id,
                "owner": owner,
                "claim_expires_at": expires.to_rfc3339(),
            });
            if let Some(role) = role {
                links["role"] = json!(role);
            }
            if let Some(chat_id) = chat_id {
                links["chat_id"] = json!(chat_id);
            }

            let mut claimed = Glyph::new(task.glyph_type, task.text.clone())
                .with_task_id(&task.task_id)
                .with_choice(TaskStatus::InProgress.as_str())
                .with_links(links);
            claimed.topic = task.topic.clone();
            claimed.importance = task.importance;

            let new_id = self.store.append_in_tx(tx, &claimed)?;
            tx.execute(
                "UPDATE glyphs SET status = 'superseded', superseded_by = ?2,
                    superseded_at = ?3
                 WHERE id = ?1 AND status = 'active'",
                params![task.glyph_id, new_id, now.to_rfc3339()],
            )?;

            info!(task_id = %task.task_id, owner, glyph_id = new_id, "task claimed");

            let claimed_glyph: Glyph = tx.query_row(
                &format!("SELECT {} FROM glyphs WHERE id = ?1", GLYPH_COLUMNS),
                params![new_id],
                row_to_glyph,
            )?;
            Ok(Task::from_glyph(&claimed_glyph))
        })
    }

    /// Record an attempt against a task.
    pub fn log_attempt(&self, task_id: &str, text: &str, source: Option<&str>) -> Result<i64> {
        self.check_task_reference(task_id)?;
        let mut glyph = Glyph::new(GlyphType::Attempt, text).with_task_id(task_id);
        glyph.source = source.map(String::from);
        self.store.append(&glyph)
    }

    /// Record a result. Failures feed doom-loop detection: the threshold-th
    /// consecutive identical failure auto-blocks the task and emits the
    /// blocked result, a lesson, and (in orchestration context) a phase
    /// glyph.
    pub fn log_result(
        &self,
        task_id: &str,
        success: bool,
        text: &str,
        metric: Option<&str>,
        source: Option<&str>,
    ) -> Result<i64> {
        self.check_task_reference(task_id)?;
        let mut glyph = Glyph::new(GlyphType::Result, text)
            .with_task_id(task_id)
            .with_choice(if success { "success" } else { "failure" });
        glyph.metric = metric.map(String::from);
        glyph.source = source.map(String::from);
        let id = self.store.append(&glyph)?;

        if !success {
            self.detect_doom_loop(task_id)?;
        }
        Ok(id)
    }

    /// Record a lesson, optionally linked to a task.
    pub fn log_lesson(
        &self,
        task_id: Option<&str>,
        topic: Option<&str>,
        text: &str,
        source: Option<&str>,
    ) -> Result<i64> {
        if let Some(task_id) = task_id {
            self.check_task_reference(task_id)?;
        }
        let mut glyph = Glyph::new(GlyphType::Lesson, text);
        glyph.task_id = task_id.map(String::from);
        glyph.topic = topic.map(String::from);
        glyph.source = source.map(String::from);
        self.store.append(&glyph)
    }

    /// Chronological provenance chain for a task.
    pub fn history(&self, task_id: &str) -> Result<Vec<Glyph>> {
        let glyphs = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM glyphs
                 WHERE task_id = ?1
                   AND glyph_type IN ('attempt', 'result', 'lesson', 'phase')
                 ORDER BY timestamp ASC, id ASC",
                GLYPH_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![task_id], row_to_glyph)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;
        Ok(glyphs)
    }

    // ==================== Internals ====================

    /// Invariant 4: provenance glyphs must reference a task that has
    /// existed. A missing reference is a data error: non-fatal but logged.
    fn check_task_reference(&self, task_id: &str) -> Result<()> {
        let known: bool = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM glyphs
                 WHERE task_id = ?1 AND glyph_type IN ('todo', 'goal') LIMIT 1",
                params![task_id],
                |_| Ok(true),
            )
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })
        })?;
        if !known {
            self.store.log_integrity_warning(
                "orphan_task_reference",
                &format!("glyph references unknown task '{}'", task_id),
            )?;
        }
        Ok(())
    }

    fn has_success_result(&self, task_id: &str) -> Result<bool> {
        let results = self.store.query(
            &GlyphQuery::new()
                .glyph_type(GlyphType::Result)
                .task_id(task_id)
                .choice("success")
                .limit(1),
            &Caller::operator(),
        )?;
        Ok(!results.is_empty())
    }

    /// Append the transition glyph and supersede the prior one.
    fn transition(
        &self,
        current: &Task,
        new_status: TaskStatus,
        extra_links: Option<serde_json::Value>,
    ) -> Result<i64> {
        let links = extra_links.unwrap_or_else(|| json!({ "id": current.task_id }));
        let mut glyph = Glyph::new(current.glyph_type, current.text.clone())
            .with_task_id(&current.task_id)
            .with_choice(new_status.as_str())
            .with_links(links);
        glyph.topic = current.topic.clone();
        glyph.importance = current.importance;

        let new_id = self.store.append(&glyph)?;
        self.store
            .supersede(current.glyph_id, new_id, "status transition")?;
        info!(
            task_id = %current.task_id,
            from = %current.status,
            to = %new_status,
            "task transitioned"
        );
        Ok(new_id)
    }

    /// Check the recent failure window and auto-block on repetition.
    fn detect_doom_loop(&self, task_id: &str) -> Result<()> {
        let current = match self.get(task_id)? {
            Some(t) if t.status != TaskStatus::Blocked => t,
            _ => return Ok(()),
        };

        let recent = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT choice, text FROM glyphs
                 WHERE task_id = ?1 AND glyph_type = 'result'
                 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )?;
            let rows: Vec<(Option<String>, String)> = stmt
                .query_map(params![task_id, DOOM_LOOP_THRESHOLD as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        if recent.len() < DOOM_LOOP_THRESHOLD
            || recent.iter().any(|(choice, _)| choice.as_deref() != Some("failure"))
        {
            return Ok(());
        }

        // Newest-first from SQL; signature check wants newest-last
        let failures: Vec<String> = recent.iter().rev().map(|(_, text)| text.clone()).collect();
        let Some(sig) = is_doom_loop(&failures, DOOM_LOOP_THRESHOLD) else {
            return Ok(());
        };

        warn!(task_id, signature = %sig, "doom loop detected; auto-blocking task");

        // Blocked marker result
        let blocked_result = Glyph::new(
            GlyphType::Result,
            format!("repeated failure signature {}; auto-blocking", sig),
        )
        .with_task_id(task_id)
        .with_choice("failure")
        .with_metric(format!("blocked_reason=repeated_error_signature:{}", sig));
        self.store.append(&blocked_result)?;

        // Lesson explaining the stuck condition
        let mut lesson = Glyph::new(
            GlyphType::Lesson,
            format!(
                "task stalled: {} consecutive failures with signature {}; needs a different approach or operator help",
                DOOM_LOOP_THRESHOLD, sig
            ),
        )
        .with_task_id(task_id);
        lesson.topic = current.topic.clone();
        self.store.append(&lesson)?;

        // Phase marker when orchestration context exists
        let orch_topic: Option<String> = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT topic FROM glyphs
                 WHERE task_id = ?1 AND glyph_type = 'phase' AND topic IS NOT NULL
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![task_id],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        if let Some(topic) = orch_topic {
            let phase = Glyph::new(GlyphType::Phase, "audit blocked by repeated failures")
                .with_task_id(task_id)
                .with_topic(topic)
                .with_choice("AUDIT->BLOCKED")
                .with_links(json!({ "from": "AUDIT", "to": "BLOCKED", "error": sig }));
            self.store.append(&phase)?;
        }

        self.transition(&current, TaskStatus::Blocked, None)?;
        Ok(())
    }
}

/// Transition table from §4.3.
fn check_transition(from: TaskStatus, to: TaskStatus, actor: Actor) -> Result<()> {
    use TaskStatus::*;
    let allowed = match (from, to) {
        (Open, InProgress) => true,
        (InProgress, Done) | (InProgress, Blocked) => true,
        (InProgress, Open) | (Blocked, Open) => actor == Actor::Elevated,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "transition {} -> {} not permitted for {:?}",
            from, to, actor
        )))
    }
}
