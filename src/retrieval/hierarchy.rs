//! Per-source candidate selection
//!
//! Keeps a single prolific document from crowding every other source out of
//! the rerank pool.

use crate::config::RetrievalConfig;
use crate::retrieval::{normalize_source, sort_by_distance, Hit};

/// Source selection knobs
#[derive(Debug, Clone, Copy)]
pub struct HierarchyParams {
    /// Minimum number of sources kept
    pub source_k: usize,
    /// Hits taken from each kept source
    pub chunks_per_source: usize,
    /// Weight of the `ln(group_size + 1)` coverage bonus
    pub source_bonus: f32,
}

impl From<&RetrievalConfig> for HierarchyParams {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            source_k: config.hierarchy_source_k,
            chunks_per_source: config.hierarchy_chunks_per_source,
            source_bonus: config.hierarchy_source_bonus,
        }
    }
}

/// Hits sharing one normalized source, closest first
#[derive(Debug, Clone)]
pub struct SourceGroup {
    pub source: String,
    pub hits: Vec<Hit>,
}

impl SourceGroup {
    pub fn best_distance(&self) -> f32 {
        self.hits.first().map(|h| h.distance).unwrap_or(f32::MAX)
    }

    /// Lower ranks first. Mixes a distance with a log count, so the bonus
    /// weight has to be tuned per embedding model.
    pub fn rank_score(&self, bonus: f32) -> f32 {
        self.best_distance() - bonus * ((self.hits.len() + 1) as f32).ln()
    }
}

/// What the selector did with the candidates
#[derive(Debug, Clone)]
pub enum Selection {
    /// Several sources, best ones picked
    Hierarchical(Vec<Hit>),
    /// Only one source was present; its hits pass through
    SingleSource(Vec<Hit>),
    /// Nothing could be selected; the input is returned unchanged
    Starved(Vec<Hit>),
}

impl Selection {
    pub fn hits(&self) -> &[Hit] {
        match self {
            Self::Hierarchical(hits) | Self::SingleSource(hits) | Self::Starved(hits) => hits,
        }
    }

    pub fn into_hits(self) -> Vec<Hit> {
        match self {
            Self::Hierarchical(hits) | Self::SingleSource(hits) | Self::Starved(hits) => hits,
        }
    }
}

/// Bucket hits by normalized source in order of first appearance
pub fn group_by_source(hits: &[Hit]) -> Vec<SourceGroup> {
    let mut groups: Vec<SourceGroup> = Vec::new();

    for hit in hits {
        let source = normalize_source(&hit.source);
        match groups.iter_mut().find(|g| g.source == source) {
            Some(group) => group.hits.push(hit.clone()),
            None => groups.push(SourceGroup {
                source: source.to_string(),
                hits: vec![hit.clone()],
            }),
        }
    }

    for group in &mut groups {
        sort_by_distance(&mut group.hits);
    }
    groups
}

/// Select up to `chunks_per_source` hits from the best-ranked sources
///
/// `max(source_k, min(source_count, top_k))` sources are kept. If that yields
/// fewer than `top_k` hits, the remaining sources backfill in rank order. The
/// result is sorted ascending by distance.
pub fn select_hierarchical(hits: Vec<Hit>, top_k: usize, params: &HierarchyParams) -> Selection {
    let mut groups = group_by_source(&hits);

    if groups.len() == 1 {
        let mut single = groups.remove(0).hits;
        sort_by_distance(&mut single);
        return Selection::SingleSource(single);
    }

    groups.sort_by(|a, b| {
        a.rank_score(params.source_bonus)
            .total_cmp(&b.rank_score(params.source_bonus))
    });

    let max_sources = params.source_k.max(groups.len().min(top_k));
    let per_source = params.chunks_per_source.max(1);
    let split = max_sources.min(groups.len());
    let (kept, rest) = groups.split_at(split);

    let mut candidates: Vec<Hit> = kept
        .iter()
        .flat_map(|g| g.hits.iter().take(per_source).cloned())
        .collect();

    if candidates.len() < top_k {
        let missing = top_k - candidates.len();
        candidates.extend(rest.iter().flat_map(|g| g.hits.iter().cloned()).take(missing));
    }

    if candidates.is_empty() {
        tracing::warn!("Hierarchical selection produced no candidates, keeping input order");
        return Selection::Starved(hits);
    }

    sort_by_distance(&mut candidates);
    Selection::Hierarchical(candidates)
}
