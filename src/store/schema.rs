//! SQLite schema and additive migrations for the glyph store.

use rusqlite::{Connection, Result as SqliteResult};
use tracing::info;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Expected columns of the glyphs table, in declaration order.
///
/// `migrate` diffs this list against `PRAGMA table_info` and adds whatever
/// is missing. Columns are never dropped or renamed.
const GLYPH_COLUMNS: &[(&str, &str)] = &[
    ("id", "INTEGER PRIMARY KEY AUTOINCREMENT"),
    ("glyph_type", "TEXT NOT NULL"),
    ("topic", "TEXT"),
    ("text", "TEXT NOT NULL"),
    ("choice", "TEXT"),
    ("rationale", "TEXT"),
    ("timestamp", "TEXT NOT NULL"),
    ("scope", "TEXT NOT NULL DEFAULT 'shared'"),
    ("chat_id", "TEXT"),
    ("agent_role", "TEXT"),
    ("visibility", "TEXT NOT NULL DEFAULT 'public'"),
    ("project", "TEXT"),
    ("importance", "TEXT"),
    ("due", "TEXT"),
    ("links", "TEXT"),
    ("task_id", "TEXT"),
    ("metric", "TEXT"),
    ("session", "TEXT"),
    ("source", "TEXT"),
    ("status", "TEXT NOT NULL DEFAULT 'active'"),
    ("superseded_by", "INTEGER"),
    ("superseded_at", "TEXT"),
    ("embedding", "BLOB"),
    ("embedding_model", "TEXT"),
    ("embedding_dim", "INTEGER"),
    ("dedup_hash", "TEXT"),
];

/// Indexes over the glyphs table.
const GLYPH_INDEXES: &[(&str, &str)] = &[
    ("idx_glyphs_type", "glyphs(glyph_type)"),
    ("idx_glyphs_topic", "glyphs(topic)"),
    ("idx_glyphs_task_id", "glyphs(task_id)"),
    ("idx_glyphs_timestamp", "glyphs(timestamp)"),
    ("idx_glyphs_status", "glyphs(status)"),
    ("idx_glyphs_session", "glyphs(session)"),
    ("idx_glyphs_chat_id", "glyphs(chat_id)"),
    ("idx_glyphs_dedup", "glyphs(dedup_hash)"),
];

/// Initialize the full schema on a fresh database.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL keeps readers non-blocking while one writer holds the lock
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    let column_defs: Vec<String> = GLYPH_COLUMNS
        .iter()
        .map(|(name, ty)| format!("{} {}", name, ty))
        .collect();

    conn.execute(
        &format!("CREATE TABLE IF NOT EXISTS glyphs ({})", column_defs.join(", ")),
        [],
    )?;

    for (name, target) in GLYPH_INDEXES {
        conn.execute(
            &format!("CREATE INDEX IF NOT EXISTS {} ON {}", name, target),
            [],
        )?;
    }

    // Topic index: one row per topic with the mean embedding of its
    // active glyphs. Rebuilt, never incrementally patched.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS topic_index (
            topic TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            embedding_dim INTEGER NOT NULL,
            glyph_count INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Per mirror-log source: the last line ingested.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_state (
            source TEXT PRIMARY KEY,
            last_line INTEGER NOT NULL DEFAULT 0,
            last_sync TEXT NOT NULL
        )",
        [],
    )?;

    // Escalated actions awaiting operator approval.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pending_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action_type TEXT NOT NULL,
            action_data TEXT NOT NULL,
            proposed_by TEXT NOT NULL,
            proposed_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            resolved_at TEXT,
            resolved_by TEXT
        )",
        [],
    )?;

    // Immutable record of every firewall decision.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            action_type TEXT NOT NULL,
            action_data TEXT NOT NULL,
            decision TEXT NOT NULL,
            reason TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // Data-integrity warnings (orphan task refs, dim mismatches). The
    // pruner refuses to run while recent rows exist here.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS integrity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            category TEXT NOT NULL,
            detail TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Additive-only schema evolution.
///
/// Compares the expected column list against `PRAGMA table_info(glyphs)`,
/// then adds missing columns, indexes, and auxiliary tables in one
/// transaction. Returns the names of added columns.
pub fn migrate(conn: &mut Connection) -> SqliteResult<Vec<String>> {
    let existing: Vec<String> = {
        let mut stmt = conn.prepare("PRAGMA table_info(glyphs)")?;
        let cols = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        cols
    };

    let tx = conn.transaction()?;

    let mut added = Vec::new();
    for (name, ty) in GLYPH_COLUMNS {
        if !existing.iter().any(|c| c == name) {
            // ALTER TABLE cannot add PRIMARY KEY columns; id always exists
            // on any initialized store.
            tx.execute(&format!("ALTER TABLE glyphs ADD COLUMN {} {}", name, ty), [])?;
            added.push(name.to_string());
        }
    }

    for (name, target) in GLYPH_INDEXES {
        tx.execute(
            &format!("CREATE INDEX IF NOT EXISTS {} ON {}", name, target),
            [],
        )?;
    }

    // Auxiliary tables added after v1 appear here as CREATE IF NOT EXISTS,
    // so migrate also heals stores initialized by older builds.
    apply_v1_aux_tables(&tx)?;

    tx.commit()?;

    if !added.is_empty() {
        info!(columns = ?added, "schema migration added columns");
    }

    Ok(added)
}

fn apply_v1_aux_tables(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS topic_index (
            topic TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            embedding_dim INTEGER NOT NULL,
            glyph_count INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_state (
            source TEXT PRIMARY KEY,
            last_line INTEGER NOT NULL DEFAULT 0,
            last_sync TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pending_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action_type TEXT NOT NULL,
            action_data TEXT NOT NULL,
            proposed_by TEXT NOT NULL,
            proposed_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            resolved_at TEXT,
            resolved_by TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            action_type TEXT NOT NULL,
            action_data TEXT NOT NULL,
            decision TEXT NOT NULL,
            reason TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS integrity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            category TEXT NOT NULL,
            detail TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='glyphs'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
