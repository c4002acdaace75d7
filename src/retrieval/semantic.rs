//! Hybrid semantic ranking with temporal decay.
//!
//! Candidates are scored as
//! `cos_sim * exp(-age_days / tau) * (1 + beta * keyword_overlap)
//!  * importance_boost * (1 - alpha * deprecation_penalty)`
//! over active glyphs only. With no embedded glyphs at all the search
//! degrades to substring-keyword ranking over the same filter set.

use chrono::Utc;
use std::collections::HashSet;
use tracing::debug;

use crate::error::Result;
use crate::retrieval::embedder::Embedder;
use crate::retrieval::query::{Caller, GlyphQuery};
use crate::store::{Glyph, GlyphStatus, GlyphStore, Importance};

/// Tuning knobs for hybrid ranking.
#[derive(Debug, Clone)]
pub struct SemanticParams {
    /// Temporal decay constant, in days.
    pub tau_days: f64,
    /// Keyword-overlap boost weight.
    pub beta: f64,
    /// Deprecation penalty weight (only matters when non-active rows are
    /// explicitly included by the caller's filter set).
    pub alpha: f64,
}

impl Default for SemanticParams {
    fn default() -> Self {
        Self {
            tau_days: 7.0,
            beta: 0.3,
            alpha: 0.5,
        }
    }
}

/// One scored search hit.
#[derive(Debug, Clone)]
pub struct ScoredGlyph {
    pub glyph: Glyph,
    pub score: f64,
}

/// Cosine similarity of two equal-dimension vectors. Mismatched dimensions
/// score zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Count of distinct lowercase words shared by query and text.
pub fn keyword_overlap(query: &str, text: &str) -> usize {
    let tokenize = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect()
    };
    tokenize(query).intersection(&tokenize(text)).count()
}

/// Hybrid semantic search over glyphs matching `filters`.
///
/// Glyphs with an inconsistent `embedding_dim` are excluded and raise an
/// integrity warning. When no candidate carries an embedding, falls back to
/// substring-keyword ranking.
pub async fn semantic_search(
    store: &GlyphStore,
    embedder: &dyn Embedder,
    query_text: &str,
    filters: &GlyphQuery,
    caller: &Caller,
    params: &SemanticParams,
    limit: usize,
) -> Result<Vec<ScoredGlyph>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut wide = filters.clone();
    wide.limit = 1_000_000;
    let candidates = store.query(&wide, caller)?;

    let mut embedded = Vec::new();
    for glyph in &candidates {
        if glyph.embedding.is_none() {
            continue;
        }
        if !glyph.embedding_consistent() {
            store.log_integrity_warning(
                "embedding_dim_mismatch",
                &format!(
                    "glyph {} embedding_dim {:?} does not match vector length",
                    glyph.id, glyph.embedding_dim
                ),
            )?;
            continue;
        }
        embedded.push(glyph);
    }

    if embedded.is_empty() {
        debug!("no embedded candidates; degrading to keyword ranking");
        return Ok(keyword_search(&candidates, query_text, limit));
    }

    let query_emb = embedder
        .embed(&[query_text.to_string()])
        .await?
        .into_iter()
        .next()
        .unwrap_or_default();

    let now = Utc::now();
    let mut scored: Vec<ScoredGlyph> = embedded
        .into_iter()
        .map(|glyph| {
            let cos_sim = cosine(&query_emb, glyph.embedding.as_deref().unwrap_or_default());
            let age_days =
                (now - glyph.timestamp).num_seconds().max(0) as f64 / 86_400.0;
            let decay = (-age_days / params.tau_days).exp();
            let kw_boost =
                1.0 + params.beta * keyword_overlap(query_text, &glyph.text) as f64;
            let importance_boost = glyph
                .importance
                .map(|i| i.boost())
                .unwrap_or(Importance::NONE_BOOST);
            let deprecation_penalty = if glyph.status == GlyphStatus::Active {
                0.0
            } else {
                1.0
            };
            let score = cos_sim
                * decay
                * kw_boost
                * importance_boost
                * (1.0 - params.alpha * deprecation_penalty);
            ScoredGlyph {
                glyph: glyph.clone(),
                score,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.glyph.timestamp.cmp(&a.glyph.timestamp))
            .then_with(|| b.glyph.id.cmp(&a.glyph.id))
    });
    scored.truncate(limit);
    Ok(scored)
}

/// Substring-keyword fallback ranking: overlap count, then recency.
fn keyword_search(candidates: &[Glyph], query_text: &str, limit: usize) -> Vec<ScoredGlyph> {
    let mut scored: Vec<ScoredGlyph> = candidates
        .iter()
        .map(|glyph| ScoredGlyph {
            score: keyword_overlap(query_text, &glyph.text) as f64,
            glyph: glyph.clone(),
        })
        .filter(|s| s.score > 0.0)
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.glyph.timestamp.cmp(&a.glyph.timestamp))
            .then_with(|| b.glyph.id.cmp(&a.glyph.id))
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::embedder::HashEmbedder;
    use crate::store::GlyphType;
    use chrono::Duration;

    #[test]
    fn test_cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
    }

    #[test]
    fn test_keyword_overlap_counts_distinct_words() {
        assert_eq!(keyword_overlap("bearer token", "Use bearer tokens"), 1);
        assert_eq!(
            keyword_overlap("bearer token auth", "bearer token auth flow"),
            3
        );
        assert_eq!(keyword_overlap("x", "no match"), 0);
    }

    #[test]
    fn test_decay_ranks_newer_over_older() {
        // Identical similarity 0.80, tau=7: 1-day-old scores ~0.691,
        // 30-day-old scores ~0.011.
        let params = SemanticParams::default();
        let fresh = 0.80 * (-1.0 / params.tau_days).exp();
        let stale = 0.80 * (-30.0 / params.tau_days).exp();
        assert!((fresh - 0.691).abs() < 0.01);
        assert!((stale - 0.011).abs() < 0.01);
        assert!(fresh > stale);
    }

    #[tokio::test]
    async fn test_semantic_search_with_decay() {
        let store = GlyphStore::in_memory().unwrap();
        let embedder = HashEmbedder::default();
        let now = Utc::now();

        let fresh = store
            .append(
                &Glyph::new(GlyphType::Fact, "bearer token authentication")
                    .with_timestamp(now - Duration::days(1)),
            )
            .unwrap();
        let stale = store
            .append(
                &Glyph::new(GlyphType::Fact, "bearer token authentication")
                    .with_timestamp(now - Duration::days(30)),
            )
            .unwrap();

        crate::retrieval::embedder::embed_glyphs(&store, &embedder, None, false, false)
            .await
            .unwrap();

        let results = semantic_search(
            &store,
            &embedder,
            "bearer token",
            &GlyphQuery::new(),
            &Caller::operator(),
            &SemanticParams::default(),
            10,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].glyph.id, fresh);
        assert_eq!(results[1].glyph.id, stale);
        assert!(results[0].score > results[1].score * 10.0);
    }

    #[tokio::test]
    async fn test_importance_boost_applies() {
        let store = GlyphStore::in_memory().unwrap();
        let embedder = HashEmbedder::default();
        let now = Utc::now();

        let high = store
            .append(
                &Glyph::new(GlyphType::Fact, "token refresh flow")
                    .with_importance(Importance::H)
                    .with_timestamp(now),
            )
            .unwrap();
        let plain = store
            .append(&Glyph::new(GlyphType::Fact, "token refresh flow").with_timestamp(now))
            .unwrap();

        crate::retrieval::embedder::embed_glyphs(&store, &embedder, None, false, false)
            .await
            .unwrap();

        let results = semantic_search(
            &store,
            &embedder,
            "token refresh",
            &GlyphQuery::new(),
            &Caller::operator(),
            &SemanticParams::default(),
            10,
        )
        .await
        .unwrap();

        assert_eq!(results[0].glyph.id, high);
        assert_eq!(results[1].glyph.id, plain);
    }

    #[tokio::test]
    async fn test_degrades_to_keyword_ranking() {
        let store = GlyphStore::in_memory().unwrap();
        let embedder = HashEmbedder::default();

        store
            .append(&Glyph::new(GlyphType::Fact, "bearer token authentication"))
            .unwrap();
        store
            .append(&Glyph::new(GlyphType::Fact, "database pooling"))
            .unwrap();

        // Nothing embedded: substring-keyword ranking applies
        let results = semantic_search(
            &store,
            &embedder,
            "bearer token",
            &GlyphQuery::new(),
            &Caller::operator(),
            &SemanticParams::default(),
            10,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].glyph.text, "bearer token authentication");
    }

    #[tokio::test]
    async fn test_dim_mismatch_excluded_with_warning() {
        let store = GlyphStore::in_memory().unwrap();
        let embedder = HashEmbedder::default();

        let id = store
            .append(&Glyph::new(GlyphType::Fact, "bearer token"))
            .unwrap();
        store.set_embedding(id, &[1.0, 0.0], "bad").unwrap();
        // Corrupt the recorded dimension
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE glyphs SET embedding_dim = 5 WHERE id = ?1",
                    rusqlite::params![id],
                )
            })
            .unwrap();

        let results = semantic_search(
            &store,
            &embedder,
            "bearer",
            &GlyphQuery::new(),
            &Caller::operator(),
            &SemanticParams::default(),
            10,
        )
        .await
        .unwrap();

        // The corrupt glyph is excluded from the embedded set; with no other
        // embeddings the fallback keyword ranking still surfaces it as text.
        assert_eq!(results.len(), 1);
        assert!(store.recent_integrity_warnings(1).unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_limit_zero_empty() {
        let store = GlyphStore::in_memory().unwrap();
        let embedder = HashEmbedder::default();
        let results = semantic_search(
            &store,
            &embedder,
            "anything",
            &GlyphQuery::new(),
            &Caller::operator(),
            &SemanticParams::default(),
            0,
        )
        .await
        .unwrap();
        assert!(results.is_empty());
    }
}
