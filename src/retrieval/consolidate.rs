//! Near-duplicate consolidation.
//!
//! Clusters of near-duplicate active glyphs (cosine >= 0.95 or identical
//! topic + content hash) are replaced by a single synthesized summary glyph
//! marked `source=consolidation`; the cluster members are superseded. The
//! summary text can come from an LLM (moderate tier) or, with no summarizer
//! wired, from a deterministic merge so the operation works offline.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::Result;
use crate::retrieval::query::{Caller, GlyphQuery};
use crate::retrieval::semantic::cosine;
use crate::store::{Glyph, GlyphStore, Scope};

/// Cosine threshold above which two embedded glyphs are near-duplicates.
pub const DUPLICATE_COSINE: f64 = 0.95;

/// Text synthesis seam; the LLM router implements this at moderate tier.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, texts: &[String]) -> Result<String>;
}

/// Report from a consolidation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub clusters: u64,
    pub superseded: u64,
    pub created: Vec<i64>,
}

/// Content hash over normalized text, used for exact-duplicate clustering.
pub fn content_hash(text: &str) -> String {
    let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(normalized.to_lowercase().as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Run one consolidation pass over active glyphs in `scope` (or all).
///
/// Dry runs report cluster counts without mutating anything.
pub async fn consolidate(
    store: &GlyphStore,
    summarizer: Option<&dyn Summarizer>,
    scope: Option<Scope>,
    dry_run: bool,
) -> Result<ConsolidationReport> {
    let mut query = GlyphQuery::new().limit(1_000_000);
    if let Some(scope) = scope {
        query = query.scope(scope);
    }
    let glyphs = store.query(&query, &Caller::operator())?;

    let clusters = find_clusters(&glyphs);
    let mut report = ConsolidationReport {
        clusters: clusters.len() as u64,
        ..Default::default()
    };

    if dry_run {
        report.superseded = clusters.iter().map(|c| c.len() as u64).sum();
        return Ok(report);
    }

    for cluster in clusters {
        let texts: Vec<String> = cluster.iter().map(|g| g.text.clone()).collect();
        let summary = match summarizer {
            Some(s) => s.summarize(&texts).await?,
            None => merge_texts(&cluster),
        };

        // The newest member donates its attributes to the replacement.
        let newest = cluster
            .iter()
            .max_by_key(|g| (g.timestamp, g.id))
            .expect("cluster is non-empty");

        let mut replacement = Glyph::new(newest.glyph_type, summary).with_source("consolidation");
        replacement.topic = newest.topic.clone();
        replacement.scope = newest.scope;
        replacement.visibility = newest.visibility;
        replacement.chat_id = newest.chat_id.clone();
        replacement.agent_role = newest.agent_role.clone();
        replacement.project = newest.project.clone();
        replacement.importance = cluster.iter().filter_map(|g| g.importance).min_by_key(|i| i.rank());

        let new_id = store.append(&replacement)?;
        report.created.push(new_id);

        for member in &cluster {
            store.supersede(member.id, new_id, "consolidated")?;
            report.superseded += 1;
        }
        debug!(new_id, members = cluster.len(), "consolidated cluster");
    }

    if !report.created.is_empty() {
        info!(
            clusters = report.clusters,
            superseded = report.superseded,
            "consolidation pass complete"
        );
    }
    Ok(report)
}

/// Group near-duplicates: same (topic, content hash), or cosine at or above
/// the duplicate threshold within a topic. Single-member groups are not
/// clusters.
fn find_clusters(glyphs: &[Glyph]) -> Vec<Vec<Glyph>> {
    let mut assigned = vec![false; glyphs.len()];
    let mut clusters = Vec::new();

    for i in 0..glyphs.len() {
        if assigned[i] {
            continue;
        }
        let mut cluster = vec![glyphs[i].clone()];
        assigned[i] = true;

        for j in (i + 1)..glyphs.len() {
            if assigned[j] {
                continue;
            }
            if is_near_duplicate(&glyphs[i], &glyphs[j]) {
                cluster.push(glyphs[j].clone());
                assigned[j] = true;
            }
        }

        if cluster.len() > 1 {
            clusters.push(cluster);
        }
    }

    clusters
}

fn is_near_duplicate(a: &Glyph, b: &Glyph) -> bool {
    if a.glyph_type != b.glyph_type {
        return false;
    }
    if a.topic == b.topic && content_hash(&a.text) == content_hash(&b.text) {
        return true;
    }
    match (&a.embedding, &b.embedding) {
        (Some(va), Some(vb)) if a.embedding_consistent() && b.embedding_consistent() => {
            cosine(va, vb) >= DUPLICATE_COSINE
        }
        _ => false,
    }
}

/// Deterministic fallback synthesis: newest text plus a provenance note.
fn merge_texts(cluster: &[Glyph]) -> String {
    let newest = cluster
        .iter()
        .max_by_key(|g| (g.timestamp, g.id))
        .expect("cluster is non-empty");
    format!("{} (consolidated from {} records)", newest.text, cluster.len())
}
