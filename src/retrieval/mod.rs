//! Retrieval engine: filtered queries, hybrid semantic ranking, topic
//! aggregation, consolidation.
//!
//! Recall combines structured filters, full-text substring match, and
//! cosine similarity over stored embeddings, weighted by temporal decay and
//! importance. Scope and visibility rules are applied uniformly at query
//! time for every caller.

mod consolidate;
mod embedder;
mod query;
mod semantic;
mod topics;

pub use consolidate::{
    consolidate, content_hash, ConsolidationReport, Summarizer, DUPLICATE_COSINE,
};
pub use embedder::{embed_glyphs, l2_normalize, EmbedReport, Embedder, HashEmbedder};
pub use query::{relative_age, render_glyph, Caller, GlyphQuery, RecentWindow};
pub use semantic::{cosine, keyword_overlap, semantic_search, ScoredGlyph, SemanticParams};
pub use topics::{
    hierarchical_search, rank_topics, topic_entries, topic_index_build, TopicEntry,
    TopicIndexReport,
};
