//! SQLite-backed glyph store with an append-only mirror log.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::mirror;
use crate::store::schema::{initialize_schema, is_initialized, migrate};
use crate::store::types::{Glyph, GlyphStatus, GlyphType, Importance, Scope, Visibility};

/// Freshness buckets reported by `status()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreshnessBuckets {
    pub under_1h: u64,
    pub under_24h: u64,
    pub under_7d: u64,
}

/// Health classification derived from sync lag and write recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    Healthy,
    Degraded,
    Stale,
}

impl std::fmt::Display for StoreHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub total_glyphs: u64,
    pub active_glyphs: u64,
    pub counts_by_type: HashMap<GlyphType, u64>,
    pub embedded_count: u64,
    /// Fraction of active glyphs carrying an embedding.
    pub embedding_coverage: f64,
    /// Mirror lines not yet ingested by the indexed store.
    pub sync_lag: u64,
    pub top_topics: Vec<(String, u64)>,
    pub freshness: FreshnessBuckets,
    pub health: StoreHealth,
}

/// Report from a `sync()` replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub replayed: u64,
    pub deduplicated: u64,
    pub total_lines: u64,
}

/// Durable glyph store: indexed SQLite plus an append-only mirror log.
///
/// Writes take the connection lock; WAL mode keeps concurrent readers in
/// other processes non-blocking. A write that reaches the indexed store but
/// fails the mirror append is rolled back; a mirror line with no indexed
/// counterpart is healed by the next `sync`.
#[derive(Debug)]
pub struct GlyphStore {
    conn: Arc<Mutex<Connection>>,
    mirror_path: Option<PathBuf>,
    /// Per-writer timestamp floor enforcing invariant 6.
    last_ts: Mutex<DateTime<Utc>>,
}

impl GlyphStore {
    /// Create a brand-new store. Fails if a store already exists at `path`
    /// (use `open` + `migrate` for existing stores).
    pub fn init(path: impl AsRef<Path>, mirror_path: impl Into<PathBuf>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        if is_initialized(&conn) {
            return Err(Error::validation(format!(
                "store already initialized at '{}'",
                path.as_ref().display()
            )));
        }
        initialize_schema(&conn)?;
        Ok(Self::from_conn(conn, Some(mirror_path.into())))
    }

    /// Open an existing store (initializing an empty file), running the
    /// additive migration to pick up any schema evolution.
    pub fn open(path: impl AsRef<Path>, mirror_path: impl Into<PathBuf>) -> Result<Self> {
        let mut conn = Connection::open(path.as_ref())?;
        if !is_initialized(&conn) {
            initialize_schema(&conn)?;
        } else {
            migrate(&mut conn)?;
        }
        Ok(Self::from_conn(conn, Some(mirror_path.into())))
    }

    /// In-memory store with mirroring disabled (for tests and scratch use).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self::from_conn(conn, None))
    }

    fn from_conn(conn: Connection, mirror_path: Option<PathBuf>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            mirror_path,
            last_ts: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Run a closure against the connection.
    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("connection lock poisoned: {}", e)))?;
        f(&conn).map_err(Error::from)
    }

    /// Run a closure inside an exclusive (`BEGIN IMMEDIATE`) transaction.
    pub(crate) fn with_immediate_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("connection lock poisoned: {}", e)))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// The mirror-log source name used in `sync_state` for this store.
    fn mirror_source(&self) -> Option<String> {
        self.mirror_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
    }

    // ==================== Writes ====================

    /// Atomically append a glyph: indexed insert, mirror append, sync-state
    /// bump. Returns the assigned id. A mirror failure rolls the insert
    /// back.
    pub fn append(&self, glyph: &Glyph) -> Result<i64> {
        self.with_immediate_tx(|tx| self.append_in_tx(tx, glyph))
    }

    /// Append within a caller-held transaction. Used by operations (task
    /// claims) that must select and write under one exclusive lock.
    pub(crate) fn append_in_tx(
        &self,
        tx: &rusqlite::Transaction,
        glyph: &Glyph,
    ) -> Result<i64> {
        let mut glyph = glyph.clone();

        // Writer-monotonic timestamps: never emit a timestamp at or before
        // the previous one from this process.
        {
            let mut last = self
                .last_ts
                .lock()
                .map_err(|e| Error::Internal(format!("timestamp lock poisoned: {}", e)))?;
            if glyph.timestamp <= *last {
                glyph.timestamp = *last + Duration::microseconds(1);
            }
            *last = glyph.timestamp;
        }

        if let (Some(vec), Some(dim)) = (&glyph.embedding, glyph.embedding_dim) {
            if vec.len() != dim {
                return Err(Error::validation(format!(
                    "embedding_dim {} does not match vector length {}",
                    dim,
                    vec.len()
                )));
            }
        }

        let hash = mirror::dedup_hash(&glyph.timestamp, glyph.glyph_type, &glyph.text);
        let id = insert_glyph(tx, &glyph, &hash)?;

        if let Some(path) = &self.mirror_path {
            // Mirror failure aborts the transaction: the indexed store
            // must never run ahead of the mirror.
            mirror::append_line(path, &mirror::encode_line(&glyph))?;
            let source = self.mirror_source().unwrap_or_default();
            tx.execute(
                "INSERT INTO sync_state (source, last_line, last_sync)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(source) DO UPDATE SET
                    last_line = last_line + 1, last_sync = ?2",
                params![source, Utc::now().to_rfc3339()],
            )?;
        }

        debug!(id, glyph_type = %glyph.glyph_type, "appended glyph");
        Ok(id)
    }

    /// Fetch one glyph by id.
    pub fn get(&self, id: i64) -> Result<Option<Glyph>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM glyphs WHERE id = ?1", GLYPH_COLUMNS),
                params![id],
                row_to_glyph,
            )
            .optional()
        })
    }

    /// Mark `old_id` superseded by `new_id`. Idempotent: reapplying with
    /// the same pair changes nothing; status only ever moves away from
    /// `active`.
    pub fn supersede(&self, old_id: i64, new_id: i64, reason: &str) -> Result<()> {
        let old = self
            .get(old_id)?
            .ok_or_else(|| Error::validation(format!("no glyph with id {}", old_id)))?;
        if self.get(new_id)?.is_none() {
            return Err(Error::validation(format!("no glyph with id {}", new_id)));
        }

        match (old.status, old.superseded_by) {
            (GlyphStatus::Active, _) => {
                self.with_conn(|conn| {
                    conn.execute(
                        "UPDATE glyphs SET status = 'superseded', superseded_by = ?2,
                            superseded_at = ?3
                         WHERE id = ?1 AND status = 'active'",
                        params![old_id, new_id, Utc::now().to_rfc3339()],
                    )
                })?;
                info!(old_id, new_id, reason, "superseded glyph");
                Ok(())
            }
            (GlyphStatus::Superseded, Some(existing)) if existing == new_id => Ok(()),
            (status, _) => Err(Error::validation(format!(
                "glyph {} is already {} and cannot be superseded by {}",
                old_id, status, new_id
            ))),
        }
    }

    /// Flip a glyph to `deprecated` or `duplicate` without a replacement.
    pub fn set_status(&self, id: i64, status: GlyphStatus) -> Result<()> {
        if status == GlyphStatus::Active {
            return Err(Error::validation(
                "glyph status is monotonic; cannot reactivate".to_string(),
            ));
        }
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE glyphs SET status = ?2, superseded_at = ?3
                 WHERE id = ?1 AND status = 'active'",
                params![id, status.as_str(), Utc::now().to_rfc3339()],
            )
        })?;
        if updated == 0 {
            debug!(id, "set_status was a no-op (missing or already non-active)");
        }
        Ok(())
    }

    /// Populate an embedding on an existing glyph (the only other legal
    /// in-place mutation).
    pub fn set_embedding(&self, id: i64, vector: &[f32], model: &str) -> Result<()> {
        let blob: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE glyphs SET embedding = ?2, embedding_model = ?3, embedding_dim = ?4
                 WHERE id = ?1",
                params![id, blob, model, vector.len() as i64],
            )
        })?;
        if updated == 0 {
            return Err(Error::validation(format!("no glyph with id {}", id)));
        }
        Ok(())
    }

    // ==================== Sync ====================

    /// Replay mirror-log entries past the recorded high-water mark,
    /// inserting missing records idempotently. Safe to re-run at any time.
    pub fn sync(&self, source: impl AsRef<Path>) -> Result<SyncReport> {
        let source = source.as_ref();
        let source_key = source.to_string_lossy().into_owned();

        let last_line: u64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT last_line FROM sync_state WHERE source = ?1",
                params![source_key],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.unwrap_or(0) as u64)
        })?;

        let (entries, total_lines) = mirror::read_from(source, last_line)?;
        let mut report = SyncReport {
            total_lines,
            ..Default::default()
        };

        self.with_immediate_tx(|tx| {
            for (_, glyph) in &entries {
                let hash = mirror::dedup_hash(&glyph.timestamp, glyph.glyph_type, &glyph.text);
                let exists: bool = tx
                    .query_row(
                        "SELECT 1 FROM glyphs WHERE dedup_hash = ?1 LIMIT 1",
                        params![hash],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false);

                if exists {
                    report.deduplicated += 1;
                } else {
                    insert_glyph(tx, glyph, &hash)?;
                    report.replayed += 1;
                }
            }

            tx.execute(
                "INSERT INTO sync_state (source, last_line, last_sync)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source) DO UPDATE SET last_line = ?2, last_sync = ?3",
                params![source_key, total_lines as i64, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;

        if report.replayed > 0 {
            info!(
                source = %source.display(),
                replayed = report.replayed,
                deduplicated = report.deduplicated,
                "mirror sync complete"
            );
        }
        Ok(report)
    }

    // ==================== Prune ====================

    /// Delete glyphs with non-active status whose `superseded_at` is older
    /// than the horizon. Refuses to run while integrity warnings exist in
    /// the last 24 hours. Dry runs report without deleting.
    pub fn prune(&self, horizon_days: i64, dry_run: bool) -> Result<Vec<i64>> {
        let recent_warnings = self.recent_integrity_warnings(24)?;
        if recent_warnings > 0 {
            return Err(Error::validation(format!(
                "refusing to prune: {} integrity warning(s) in the last 24h",
                recent_warnings
            )));
        }

        let cutoff = (Utc::now() - Duration::days(horizon_days)).to_rfc3339();
        let ids: Vec<i64> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM glyphs
                 WHERE status != 'active' AND superseded_at IS NOT NULL
                   AND superseded_at < ?1
                 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(ids)
        })?;

        if dry_run || ids.is_empty() {
            return Ok(ids);
        }

        self.with_immediate_tx(|tx| {
            for id in &ids {
                tx.execute("DELETE FROM glyphs WHERE id = ?1", params![id])?;
            }
            Ok(())
        })?;
        info!(count = ids.len(), horizon_days, "pruned non-active glyphs");
        Ok(ids)
    }

    // ==================== Integrity ====================

    /// Record a data-integrity warning (orphan task reference, embedding
    /// dim mismatch). Processing continues; the pruner checks this log.
    pub fn log_integrity_warning(&self, category: &str, detail: &str) -> Result<()> {
        warn!(category, detail, "integrity warning");
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO integrity_log (timestamp, category, detail)
                 VALUES (?1, ?2, ?3)",
                params![Utc::now().to_rfc3339(), category, detail],
            )
        })?;
        Ok(())
    }

    /// Count integrity warnings recorded within the last `window_hours`.
    pub fn recent_integrity_warnings(&self, window_hours: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::hours(window_hours)).to_rfc3339();
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM integrity_log WHERE timestamp >= ?1",
                params![cutoff],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
    }

    // ==================== Status ====================

    /// Health snapshot: counts, embedding coverage, sync lag, top topics,
    /// freshness buckets.
    pub fn status(&self) -> Result<StoreStatus> {
        let now = Utc::now();
        let mirror_total = match &self.mirror_path {
            Some(path) => mirror::read_from(path, u64::MAX)?.1,
            None => 0,
        };

        self.with_conn(|conn| {
            let total_glyphs: i64 =
                conn.query_row("SELECT COUNT(*) FROM glyphs", [], |row| row.get(0))?;
            let active_glyphs: i64 = conn.query_row(
                "SELECT COUNT(*) FROM glyphs WHERE status = 'active'",
                [],
                |row| row.get(0),
            )?;
            let embedded_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM glyphs WHERE status = 'active' AND embedding IS NOT NULL",
                [],
                |row| row.get(0),
            )?;

            let counts_by_type: HashMap<GlyphType, u64> = {
                let mut stmt =
                    conn.prepare("SELECT glyph_type, COUNT(*) FROM glyphs GROUP BY glyph_type")?;
                let rows = stmt.query_map([], |row| {
                    let ty: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((ty, count))
                })?;
                rows.filter_map(|r| r.ok())
                    .filter_map(|(ty, count)| ty.parse().ok().map(|t| (t, count as u64)))
                    .collect()
            };

            let top_topics: Vec<(String, u64)> = {
                let mut stmt = conn.prepare(
                    "SELECT topic, COUNT(*) AS n FROM glyphs
                     WHERE topic IS NOT NULL AND status = 'active'
                     GROUP BY topic ORDER BY n DESC LIMIT 10",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?;
                rows.filter_map(|r| r.ok())
                    .collect()
            };

            let bucket = |hours: i64| -> rusqlite::Result<i64> {
                conn.query_row(
                    "SELECT COUNT(*) FROM glyphs WHERE timestamp >= ?1",
                    params![(now - Duration::hours(hours)).to_rfc3339()],
                    |row| row.get(0),
                )
            };
            let freshness = FreshnessBuckets {
                under_1h: bucket(1)? as u64,
                under_24h: bucket(24)? as u64,
                under_7d: bucket(24 * 7)? as u64,
            };

            let synced: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(last_line), 0) FROM sync_state",
                    [],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            let sync_lag = mirror_total.saturating_sub(synced as u64);

            let health = if sync_lag > 100 {
                StoreHealth::Stale
            } else if sync_lag > 0 {
                StoreHealth::Degraded
            } else {
                StoreHealth::Healthy
            };

            let coverage = if active_glyphs > 0 {
                embedded_count as f64 / active_glyphs as f64
            } else {
                0.0
            };

            Ok(StoreStatus {
                total_glyphs: total_glyphs as u64,
                active_glyphs: active_glyphs as u64,
                counts_by_type,
                embedded_count: embedded_count as u64,
                embedding_coverage: coverage,
                sync_lag,
                top_topics,
                freshness,
                health,
            })
        })
    }

    /// Re-emit the canonical mirror-log stream for every glyph, ordered by
    /// `(timestamp, id)`. Round-trips byte-identically with the on-disk
    /// mirror for glyph sets written through this store.
    pub fn export_mirror(&self) -> Result<String> {
        let glyphs = self.all_glyphs()?;
        let mut out = String::new();
        for glyph in &glyphs {
            out.push_str(&mirror::encode_line(glyph));
            out.push('\n');
        }
        Ok(out)
    }

    /// All glyphs ordered by `(timestamp, id)`, regardless of status.
    pub fn all_glyphs(&self) -> Result<Vec<Glyph>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM glyphs ORDER BY timestamp ASC, id ASC",
                GLYPH_COLUMNS
            ))?;
            let glyphs = stmt
                .query_map([], row_to_glyph)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(glyphs)
        })
    }
}

/// Column list shared by every SELECT that maps to a full glyph.
pub(crate) const GLYPH_COLUMNS: &str = "id, glyph_type, topic, text, choice, rationale, \
     timestamp, scope, chat_id, agent_role, visibility, project, importance, due, links, \
     task_id, metric, session, source, status, superseded_by, superseded_at, embedding, \
     embedding_model, embedding_dim";

/// Insert a glyph row; shared by `append` and `sync` replay.
pub(crate) fn insert_glyph(
    conn: &Connection,
    glyph: &Glyph,
    dedup_hash: &str,
) -> rusqlite::Result<i64> {
    let embedding_blob: Option<Vec<u8>> = glyph
        .embedding
        .as_ref()
        .map(|v| v.iter().flat_map(|f| f.to_le_bytes()).collect());
    let links = glyph.links.as_ref().map(|v| v.to_string());

    conn.execute(
        "INSERT INTO glyphs (
            glyph_type, topic, text, choice, rationale, timestamp, scope, chat_id,
            agent_role, visibility, project, importance, due, links, task_id, metric,
            session, source, status, superseded_by, superseded_at, embedding,
            embedding_model, embedding_dim, dedup_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                  ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
        params![
            glyph.glyph_type.as_str(),
            glyph.topic,
            glyph.text,
            glyph.choice,
            glyph.rationale,
            glyph
                .timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            glyph.scope.as_str(),
            glyph.chat_id,
            glyph.agent_role,
            glyph.visibility.as_str(),
            glyph.project,
            glyph.importance.map(|i| i.as_str()),
            glyph.due,
            links,
            glyph.task_id,
            glyph.metric,
            glyph.session,
            glyph.source,
            glyph.status.as_str(),
            glyph.superseded_by,
            glyph.superseded_at.map(|t| t.to_rfc3339()),
            embedding_blob,
            glyph.embedding_model,
            glyph.embedding_dim.map(|d| d as i64),
            dedup_hash,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Map a full-column row back to a glyph.
pub(crate) fn row_to_glyph(row: &rusqlite::Row) -> rusqlite::Result<Glyph> {
    let glyph_type: GlyphType = row
        .get::<_, String>(1)?
        .parse()
        .unwrap_or(GlyphType::Note);
    let scope: Scope = row.get::<_, String>(7)?.parse().unwrap_or_default();
    let visibility: Visibility = row.get::<_, String>(10)?.parse().unwrap_or_default();
    let status: GlyphStatus = row.get::<_, String>(19)?.parse().unwrap_or_default();
    let importance: Option<Importance> = row
        .get::<_, Option<String>>(12)?
        .and_then(|s| s.parse().ok());
    let links = row
        .get::<_, Option<String>>(14)?
        .and_then(|s| serde_json::from_str(&s).ok());
    let embedding: Option<Vec<f32>> = row.get::<_, Option<Vec<u8>>>(22)?.map(|bytes| {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap_or([0; 4])))
            .collect()
    });

    Ok(Glyph {
        id: row.get(0)?,
        glyph_type,
        topic: row.get(2)?,
        text: row.get(3)?,
        choice: row.get(4)?,
        rationale: row.get(5)?,
        timestamp: parse_datetime(row.get::<_, String>(6)?),
        scope,
        chat_id: row.get(8)?,
        agent_role: row.get(9)?,
        visibility,
        project: row.get(11)?,
        importance,
        due: row.get(13)?,
        links,
        task_id: row.get(15)?,
        metric: row.get(16)?,
        session: row.get(17)?,
        source: row.get(18)?,
        status,
        superseded_by: row.get(20)?,
        superseded_at: row
            .get::<_, Option<String>>(21)?
            .map(|s| parse_datetime(s)),
        embedding,
        embedding_model: row.get(23)?,
        embedding_dim: row.get::<_, Option<i64>>(24)?.map(|d| d as usize),
    })
}

pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn disk_store(dir: &tempfile::TempDir) -> GlyphStore {
        GlyphStore::open(dir.path().join("memory.db"), dir.path().join("anchors.jsonl")).unwrap()
    }

    #[test]
    fn test_append_and_get() {
        let store = GlyphStore::in_memory().unwrap();
        let glyph = Glyph::new(GlyphType::Decision, "Use bearer tokens")
            .with_topic("auth")
            .with_choice("bearer")
            .with_rationale("session storage overhead");

        let id = store.append(&glyph).unwrap();
        assert!(id > 0);

        let fetched = store.get(id).unwrap().unwrap();
        assert_eq!(fetched.text, "Use bearer tokens");
        assert_eq!(fetched.topic.as_deref(), Some("auth"));
        assert_eq!(fetched.choice.as_deref(), Some("bearer"));
        assert_eq!(fetched.status, GlyphStatus::Active);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let store = GlyphStore::in_memory().unwrap();
        let a = store.append(&Glyph::new(GlyphType::Fact, "a")).unwrap();
        let b = store.append(&Glyph::new(GlyphType::Fact, "b")).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_writer_monotonic_timestamps() {
        let store = GlyphStore::in_memory().unwrap();
        let ts = Utc::now();
        let a = store
            .append(&Glyph::new(GlyphType::Fact, "a").with_timestamp(ts))
            .unwrap();
        let b = store
            .append(&Glyph::new(GlyphType::Fact, "b").with_timestamp(ts))
            .unwrap();

        let ga = store.get(a).unwrap().unwrap();
        let gb = store.get(b).unwrap().unwrap();
        assert!(gb.timestamp > ga.timestamp);
    }

    #[test]
    fn test_init_fails_on_existing_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("memory.db");
        let mirror = dir.path().join("anchors.jsonl");

        GlyphStore::init(&db, &mirror).unwrap();
        let err = GlyphStore::init(&db, &mirror).unwrap_err();
        assert!(err.to_string().contains("already initialized"));

        // open works fine
        GlyphStore::open(&db, &mirror).unwrap();
    }

    #[test]
    fn test_append_mirrors_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(&dir);

        store
            .append(&Glyph::new(GlyphType::Decision, "Use bearer tokens").with_topic("auth"))
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("anchors.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[\"decision\""));
    }

    #[test]
    fn test_supersede_idempotent() {
        let store = GlyphStore::in_memory().unwrap();
        let old = store.append(&Glyph::new(GlyphType::Fact, "v1")).unwrap();
        let new = store.append(&Glyph::new(GlyphType::Fact, "v2")).unwrap();

        store.supersede(old, new, "corrected").unwrap();
        let first = store.get(old).unwrap().unwrap();
        assert_eq!(first.status, GlyphStatus::Superseded);
        assert_eq!(first.superseded_by, Some(new));
        let first_at = first.superseded_at;

        // Same pair again: no-op, not an error
        store.supersede(old, new, "corrected").unwrap();
        let second = store.get(old).unwrap().unwrap();
        assert_eq!(second.superseded_at, first_at);

        // Different replacement is refused
        let third = store.append(&Glyph::new(GlyphType::Fact, "v3")).unwrap();
        assert!(store.supersede(old, third, "again").is_err());
    }

    #[test]
    fn test_status_is_monotonic() {
        let store = GlyphStore::in_memory().unwrap();
        let id = store.append(&Glyph::new(GlyphType::Fact, "x")).unwrap();
        assert!(store.set_status(id, GlyphStatus::Active).is_err());
        store.set_status(id, GlyphStatus::Deprecated).unwrap();
        assert_eq!(
            store.get(id).unwrap().unwrap().status,
            GlyphStatus::Deprecated
        );
    }

    #[test]
    fn test_sync_replays_external_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(&dir);
        let mirror_path = dir.path().join("anchors.jsonl");

        store.append(&Glyph::new(GlyphType::Fact, "ours")).unwrap();

        // An external writer appends directly to the mirror
        let external = Glyph::new(GlyphType::Fact, "external");
        mirror::append_line(&mirror_path, &mirror::encode_line(&external)).unwrap();

        let report = store.sync(&mirror_path).unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.total_lines, 2);

        // Replay is idempotent
        let report = store.sync(&mirror_path).unwrap();
        assert_eq!(report.replayed, 0);
    }

    #[test]
    fn test_sync_dedups_replayed_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(&dir);
        let mirror_path = dir.path().join("anchors.jsonl");

        let id = store.append(&Glyph::new(GlyphType::Fact, "once")).unwrap();
        let stored = store.get(id).unwrap().unwrap();

        // Duplicate the existing line as an external writer might
        mirror::append_line(&mirror_path, &mirror::encode_line(&stored)).unwrap();

        let report = store.sync(&mirror_path).unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.deduplicated, 1);
        assert_eq!(store.status().unwrap().total_glyphs, 1);
    }

    #[test]
    fn test_prune_dry_run_matches_real_run() {
        let store = GlyphStore::in_memory().unwrap();
        let old = store.append(&Glyph::new(GlyphType::Fact, "old")).unwrap();
        let new = store.append(&Glyph::new(GlyphType::Fact, "new")).unwrap();
        store.supersede(old, new, "replaced").unwrap();

        // Backdate the supersession past the horizon
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE glyphs SET superseded_at = ?2 WHERE id = ?1",
                    params![old, (Utc::now() - Duration::days(60)).to_rfc3339()],
                )
            })
            .unwrap();

        let planned = store.prune(30, true).unwrap();
        assert_eq!(planned, vec![old]);
        assert!(store.get(old).unwrap().is_some());

        let deleted = store.prune(30, false).unwrap();
        assert_eq!(deleted, planned);
        assert!(store.get(old).unwrap().is_none());
        assert!(store.get(new).unwrap().is_some());
    }

    #[test]
    fn test_prune_refuses_on_recent_integrity_warnings() {
        let store = GlyphStore::in_memory().unwrap();
        store
            .log_integrity_warning("orphan_task", "result references missing task")
            .unwrap();
        let err = store.prune(30, false).unwrap_err();
        assert!(err.to_string().contains("integrity warning"));
    }

    #[test]
    fn test_status_counts_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(&dir);

        store
            .append(&Glyph::new(GlyphType::Fact, "f1").with_topic("auth"))
            .unwrap();
        store
            .append(&Glyph::new(GlyphType::Fact, "f2").with_topic("auth"))
            .unwrap();
        store
            .append(&Glyph::new(GlyphType::Decision, "d1").with_topic("db"))
            .unwrap();

        let status = store.status().unwrap();
        assert_eq!(status.total_glyphs, 3);
        assert_eq!(status.counts_by_type.get(&GlyphType::Fact), Some(&2));
        assert_eq!(status.top_topics[0].0, "auth");
        assert_eq!(status.freshness.under_1h, 3);
        assert_eq!(status.sync_lag, 0);
        assert_eq!(status.health, StoreHealth::Healthy);
        assert_eq!(status.embedded_count, 0);
    }

    #[test]
    fn test_status_reports_sync_lag() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(&dir);
        let mirror_path = dir.path().join("anchors.jsonl");

        store.append(&Glyph::new(GlyphType::Fact, "ours")).unwrap();
        mirror::append_line(
            &mirror_path,
            &mirror::encode_line(&Glyph::new(GlyphType::Fact, "behind")),
        )
        .unwrap();

        let status = store.status().unwrap();
        assert_eq!(status.sync_lag, 1);
        assert_eq!(status.health, StoreHealth::Degraded);
    }

    #[test]
    fn test_export_mirror_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = disk_store(&dir);

        store
            .append(&Glyph::new(GlyphType::Decision, "one").with_topic("t"))
            .unwrap();
        store
            .append(&Glyph::new(GlyphType::Fact, "two").with_importance(Importance::M))
            .unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join("anchors.jsonl")).unwrap();
        let exported = store.export_mirror().unwrap();
        assert_eq!(on_disk, exported);
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let store = GlyphStore::in_memory().unwrap();
        let id = store.append(&Glyph::new(GlyphType::Fact, "vec")).unwrap();
        store.set_embedding(id, &[0.25, -1.5, 3.0], "test-model").unwrap();

        let glyph = store.get(id).unwrap().unwrap();
        assert_eq!(glyph.embedding.as_deref(), Some(&[0.25, -1.5, 3.0][..]));
        assert_eq!(glyph.embedding_dim, Some(3));
        assert_eq!(glyph.embedding_model.as_deref(), Some("test-model"));
        assert!(glyph.embedding_consistent());
    }

    #[test]
    fn test_append_rejects_dim_mismatch() {
        let store = GlyphStore::in_memory().unwrap();
        let mut glyph = Glyph::new(GlyphType::Fact, "bad").with_embedding(vec![1.0], "m");
        glyph.embedding_dim = Some(4);
        assert!(store.append(&glyph).is_err());
    }
}
