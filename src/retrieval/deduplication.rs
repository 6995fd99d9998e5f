//! Hit deduplication by (content, source)

use crate::retrieval::Hit;
use ahash::AHashSet;

/// Drop repeated (content, source) pairs, keeping the first occurrence
///
/// Order is preserved, so callers that sorted by distance keep the closest
/// copy. Applying this twice is the same as applying it once.
pub fn deduplicate_hits(hits: Vec<Hit>) -> Vec<Hit> {
    let mut seen: AHashSet<(String, String)> = AHashSet::with_capacity(hits.len());

    hits.into_iter()
        .filter(|hit| seen.insert((hit.content.clone(), hit.source.clone())))
        .collect()
}
