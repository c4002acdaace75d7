//! Durable typed record log.
//!
//! The store persists glyphs — append-only typed records — in an indexed
//! SQLite database mirrored line-for-line into an append-only JSONL file.
//! The mirror survives crashes mid-write; `sync` reconciles the indexed
//! store against it idempotently.
//!
//! ## Example
//!
//! ```rust,ignore
//! use glyphos::store::{Glyph, GlyphStore, GlyphType};
//!
//! let store = GlyphStore::open("memory.db", "anchors.jsonl")?;
//! let id = store.append(
//!     &Glyph::new(GlyphType::Decision, "Use bearer tokens")
//!         .with_topic("auth")
//!         .with_choice("bearer"),
//! )?;
//! store.status()?;
//! ```

pub mod mirror;
mod schema;
mod store;
mod types;

pub use schema::{get_schema_version, initialize_schema, is_initialized, migrate, SCHEMA_VERSION};
pub use store::{FreshnessBuckets, GlyphStore, StoreHealth, StoreStatus, SyncReport};
pub use types::{
    validate_task_id, Glyph, GlyphStatus, GlyphType, Importance, Scope, TaskStatus, Visibility,
};

pub(crate) use store::{row_to_glyph, GLYPH_COLUMNS};
