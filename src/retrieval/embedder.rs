//! Embedding generation for glyphs.
//!
//! The embedding model itself is an external collaborator: anything that
//! can turn a batch of texts into fixed-dimension vectors sits behind the
//! `Embedder` trait. The store keeps vectors byte-packed with an explicit
//! dimension so a model swap is detectable.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;
use crate::retrieval::query::{Caller, GlyphQuery};
use crate::store::{GlyphStore, Scope};

/// Batch embedding contract.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Identifier recorded as `embedding_model` provenance.
    fn model_id(&self) -> &str;

    /// Output dimension.
    fn dim(&self) -> usize;
}

/// Deterministic local embedder: hashed bag-of-words projected into a
/// fixed-dimension space, L2-normalized. No model binary required, stable
/// across runs, good enough for offline setups and tests where only
/// relative similarity matters.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dim;
            // Sign bit from another digest byte spreads tokens across both
            // directions of each axis.
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model_id(&self) -> &str {
        "hash-bow-256"
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Normalize a vector to unit length in place; zero vectors are left as-is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Report from an embedding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub embedded: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Generate vectors for active glyphs lacking one (or all, with `force`).
///
/// A failure on one glyph does not block the batch; the glyph simply stays
/// without a vector. Dry runs report the candidate count without writing.
pub async fn embed_glyphs(
    store: &GlyphStore,
    embedder: &dyn Embedder,
    scope: Option<Scope>,
    force: bool,
    dry_run: bool,
) -> Result<EmbedReport> {
    let mut query = GlyphQuery::new().limit(1_000_000);
    if let Some(scope) = scope {
        query = query.scope(scope);
    }

    let candidates: Vec<_> = store
        .query(&query, &Caller::operator())?
        .into_iter()
        .filter(|g| force || g.embedding.is_none())
        .collect();

    let mut report = EmbedReport::default();
    if dry_run {
        report.skipped = candidates.len() as u64;
        return Ok(report);
    }

    for glyph in candidates {
        let texts = vec![glyph.text.clone()];
        match embedder.embed(&texts).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                let vector = vectors.remove(0);
                store.set_embedding(glyph.id, &vector, embedder.model_id())?;
                report.embedded += 1;
            }
            Ok(_) => {
                warn!(id = glyph.id, "embedder returned no vector");
                report.failed += 1;
            }
            Err(e) => {
                warn!(id = glyph.id, error = %e, "embedding failed; glyph left unembedded");
                report.failed += 1;
            }
        }
    }

    debug!(
        embedded = report.embedded,
        failed = report.failed,
        "embedding pass complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Glyph, GlyphType};

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::default();
        let texts = vec!["the authentication system".to_string()];
        let a = embedder.embed(&texts).await.unwrap();
        let b = embedder.embed(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 256);
    }

    #[tokio::test]
    async fn test_hash_embedder_unit_norm() {
        let embedder = HashEmbedder::default();
        let vectors = embedder
            .embed(&["some words here".to_string()])
            .await
            .unwrap();
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_similar_texts_closer_than_dissimilar() {
        let embedder = HashEmbedder::default();
        let vectors = embedder
            .embed(&[
                "bearer token authentication flow".to_string(),
                "token authentication with bearer headers".to_string(),
                "database connection pooling".to_string(),
            ])
            .await
            .unwrap();

        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&vectors[0], &vectors[1]) > dot(&vectors[0], &vectors[2]));
    }

    #[tokio::test]
    async fn test_embed_glyphs_idempotent_without_force() {
        let store = GlyphStore::in_memory().unwrap();
        store.append(&Glyph::new(GlyphType::Fact, "alpha")).unwrap();
        store.append(&Glyph::new(GlyphType::Fact, "beta")).unwrap();

        let embedder = HashEmbedder::default();
        let first = embed_glyphs(&store, &embedder, None, false, false)
            .await
            .unwrap();
        assert_eq!(first.embedded, 2);

        let second = embed_glyphs(&store, &embedder, None, false, false)
            .await
            .unwrap();
        assert_eq!(second.embedded, 0);
    }

    #[tokio::test]
    async fn test_embed_dry_run_writes_nothing() {
        let store = GlyphStore::in_memory().unwrap();
        store.append(&Glyph::new(GlyphType::Fact, "alpha")).unwrap();

        let embedder = HashEmbedder::default();
        let report = embed_glyphs(&store, &embedder, None, false, true)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(store.status().unwrap().embedded_count, 0);
    }
}
