//! Hierarchical topic index.
//!
//! One row per topic holding the L2-normalized mean embedding of that
//! topic's active glyphs. Retrieval first ranks topics against the query
//! vector, then searches within the top-K topics' glyphs.

use chrono::Utc;
use rusqlite::params;
use tracing::{debug, info};

use crate::error::Result;
use crate::retrieval::embedder::{l2_normalize, Embedder};
use crate::retrieval::query::{Caller, GlyphQuery};
use crate::retrieval::semantic::{cosine, semantic_search, ScoredGlyph, SemanticParams};
use crate::store::GlyphStore;

/// One topic-index row.
#[derive(Debug, Clone)]
pub struct TopicEntry {
    pub topic: String,
    pub embedding: Vec<f32>,
    pub glyph_count: u64,
}

/// Report from a topic-index rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicIndexReport {
    pub topics_indexed: u64,
    pub glyphs_covered: u64,
}

/// Rebuild the topic index from active, embedded glyphs.
///
/// Groups embeddings by topic, computes the mean vector per topic,
/// normalizes it, and upserts. Dry runs report without writing.
pub fn topic_index_build(store: &GlyphStore, dry_run: bool) -> Result<TopicIndexReport> {
    let glyphs = store.query(&GlyphQuery::new().limit(1_000_000), &Caller::operator())?;

    let mut groups: std::collections::HashMap<String, (Vec<f64>, u64, usize)> =
        std::collections::HashMap::new();
    for glyph in &glyphs {
        let (Some(topic), Some(embedding)) = (&glyph.topic, &glyph.embedding) else {
            continue;
        };
        if !glyph.embedding_consistent() {
            continue;
        }
        let entry = groups
            .entry(topic.clone())
            .or_insert_with(|| (vec![0.0; embedding.len()], 0, embedding.len()));
        if entry.2 != embedding.len() {
            // Mixed embedding models within one topic; skip the outlier.
            continue;
        }
        for (acc, v) in entry.0.iter_mut().zip(embedding) {
            *acc += *v as f64;
        }
        entry.1 += 1;
    }

    let mut report = TopicIndexReport::default();
    for (topic, (sums, count, _)) in &groups {
        report.topics_indexed += 1;
        report.glyphs_covered += count;

        if dry_run {
            continue;
        }

        let mut mean: Vec<f32> = sums.iter().map(|s| (*s / *count as f64) as f32).collect();
        l2_normalize(&mut mean);
        let blob: Vec<u8> = mean.iter().flat_map(|f| f.to_le_bytes()).collect();

        store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO topic_index (topic, embedding, embedding_dim, glyph_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(topic) DO UPDATE SET
                    embedding = ?2, embedding_dim = ?3, glyph_count = ?4, updated_at = ?5",
                params![
                    topic,
                    blob,
                    mean.len() as i64,
                    *count as i64,
                    Utc::now().to_rfc3339()
                ],
            )
        })?;
    }

    if !dry_run {
        info!(topics = report.topics_indexed, "topic index rebuilt");
    }
    Ok(report)
}

/// Load every topic-index row.
pub fn topic_entries(store: &GlyphStore) -> Result<Vec<TopicEntry>> {
    store.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT topic, embedding, glyph_count FROM topic_index ORDER BY topic")?;
        let entries = stmt
            .query_map([], |row| {
                let blob: Vec<u8> = row.get(1)?;
                let embedding = blob
                    .chunks_exact(4)
                    .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap_or([0; 4])))
                    .collect();
                Ok(TopicEntry {
                    topic: row.get(0)?,
                    embedding,
                    glyph_count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    })
}

/// Rank topics by cosine against the query vector.
pub fn rank_topics(entries: &[TopicEntry], query_emb: &[f32], top_k: usize) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = entries
        .iter()
        .map(|e| (e.topic.clone(), cosine(query_emb, &e.embedding)))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(top_k);
    ranked
}

/// Hierarchical retrieval: rank topics first, then run hybrid search within
/// the top-K topics' glyphs. Falls back to a flat search when the topic
/// index is empty.
pub async fn hierarchical_search(
    store: &GlyphStore,
    embedder: &dyn Embedder,
    query_text: &str,
    caller: &Caller,
    params: &SemanticParams,
    top_k_topics: usize,
    limit: usize,
) -> Result<Vec<ScoredGlyph>> {
    let entries = topic_entries(store)?;
    if entries.is_empty() {
        return semantic_search(
            store,
            embedder,
            query_text,
            &GlyphQuery::new(),
            caller,
            params,
            limit,
        )
        .await;
    }

    let query_emb = embedder
        .embed(&[query_text.to_string()])
        .await?
        .into_iter()
        .next()
        .unwrap_or_default();
    let topics = rank_topics(&entries, &query_emb, top_k_topics);
    debug!(?topics, "hierarchical search topic ranking");

    let mut results = Vec::new();
    for (topic, _) in &topics {
        let filters = GlyphQuery::new().topic(topic.clone());
        let mut hits =
            semantic_search(store, embedder, query_text, &filters, caller, params, limit).await?;
        results.append(&mut hits);
    }

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::embedder::{embed_glyphs, HashEmbedder};
    use crate::store::{Glyph, GlyphType};

    async fn seeded_store() -> (GlyphStore, HashEmbedder) {
        let store = GlyphStore::in_memory().unwrap();
        let embedder = HashEmbedder::default();

        for text in ["bearer tokens rotate hourly", "token refresh uses the auth server"] {
            store
                .append(&Glyph::new(GlyphType::Fact, text).with_topic("auth"))
                .unwrap();
        }
        for text in ["connection pool capped at 32", "postgres holds the task queue"] {
            store
                .append(&Glyph::new(GlyphType::Fact, text).with_topic("db"))
                .unwrap();
        }

        embed_glyphs(&store, &embedder, None, false, false)
            .await
            .unwrap();
        (store, embedder)
    }

    #[tokio::test]
    async fn test_build_and_load_topic_index() {
        let (store, _) = seeded_store().await;

        let report = topic_index_build(&store, false).unwrap();
        assert_eq!(report.topics_indexed, 2);
        assert_eq!(report.glyphs_covered, 4);

        let entries = topic_entries(&store).unwrap();
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            let norm: f32 = entry.embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "topic mean must be normalized");
        }
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (store, _) = seeded_store().await;
        let report = topic_index_build(&store, true).unwrap();
        assert_eq!(report.topics_indexed, 2);
        assert!(topic_entries(&store).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_upserts() {
        let (store, embedder) = seeded_store().await;
        topic_index_build(&store, false).unwrap();

        store
            .append(&Glyph::new(GlyphType::Fact, "tokens signed with ed25519").with_topic("auth"))
            .unwrap();
        embed_glyphs(&store, &embedder, None, false, false)
            .await
            .unwrap();
        topic_index_build(&store, false).unwrap();

        let entries = topic_entries(&store).unwrap();
        let auth = entries.iter().find(|e| e.topic == "auth").unwrap();
        assert_eq!(auth.glyph_count, 3);
    }

    #[tokio::test]
    async fn test_hierarchical_search_prefers_matching_topic() {
        let (store, embedder) = seeded_store().await;
        topic_index_build(&store, false).unwrap();

        let results = hierarchical_search(
            &store,
            &embedder,
            "bearer token refresh",
            &Caller::operator(),
            &SemanticParams::default(),
            1,
            10,
        )
        .await
        .unwrap();

        assert!(!results.is_empty());
        for hit in &results {
            assert_eq!(hit.glyph.topic.as_deref(), Some("auth"));
        }
    }
}
