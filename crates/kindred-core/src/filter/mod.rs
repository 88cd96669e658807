//! Inverted-index candidate filter.
//!
//! Running the full cascade over every pair in a bucket is quadratic in the
//! bucket size. The filter builds a global inverted index from fingerprint
//! hash to the attempts producing it, then only surfaces pairs whose
//! distinct-hash overlap clears a difficulty-keyed floor. Everything below
//! the floor is discarded before any kernel runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::model::{Artifact, Difficulty};

/// Inverted index: fingerprint hash to the attempt ids producing it.
///
/// Hashes produced by fewer than two attempts are dropped during
/// construction; they can never contribute a pair.
pub type InvertedIndex = HashMap<String, Vec<String>>;

/// A candidate pair surfaced by the filter.
#[derive(Debug, Clone)]
pub struct Pair {
    /// First artifact of the pair.
    pub a: Arc<Artifact>,
    /// Second artifact of the pair.
    pub b: Arc<Artifact>,
}

/// Returns the minimum distinct-hash overlap for a difficulty.
///
/// Hard questions produce more diverse solutions, so even a small overlap is
/// worth a deep look; easy questions need a higher floor to keep the noise
/// of convergent solutions out.
#[must_use]
pub const fn overlap_threshold(difficulty: Difficulty) -> f64 {
    match difficulty {
        Difficulty::Easy => 0.15,
        Difficulty::Medium => 0.10,
        Difficulty::Hard => 0.05,
    }
}

/// Builds the inverted index over a bucket of artifacts.
#[must_use]
pub fn build_index(artifacts: &[Arc<Artifact>]) -> InvertedIndex {
    let mut index: InvertedIndex = HashMap::new();

    for artifact in artifacts {
        let Some(fingerprints) = artifact.fingerprints.as_ref() else {
            continue;
        };
        for entry in &fingerprints.hashes {
            index
                .entry(entry.hash.clone())
                .or_default()
                .push(artifact.attempt_id.clone());
        }
    }

    index.retain(|_, attempts| attempts.len() >= 2);
    index
}

/// Surfaces the pairs worth running through the cascade.
///
/// For every hash with two or more producers, all `C(n, 2)` pairs of the
/// producing artifacts are considered; a pair is emitted when its overlap
/// (`shared distinct hashes / min(|A|, |B|)`) reaches the difficulty
/// threshold. Pairs are de-duplicated by the order-independent
/// [`pair_key`], so the result does not depend on hash iteration order.
#[must_use]
pub fn worthy_pairs(
    index: &InvertedIndex,
    artifacts: &[Arc<Artifact>],
    difficulty: Difficulty,
) -> Vec<Pair> {
    let by_attempt: HashMap<&str, &Arc<Artifact>> = artifacts
        .iter()
        .map(|artifact| (artifact.attempt_id.as_str(), artifact))
        .collect();

    let threshold = overlap_threshold(difficulty);
    let mut pairs: HashMap<String, Pair> = HashMap::new();

    for attempt_ids in index.values() {
        let hash_artifacts: Vec<&Arc<Artifact>> = attempt_ids
            .iter()
            .filter_map(|id| by_attempt.get(id.as_str()).copied())
            .collect();

        for (i, &a) in hash_artifacts.iter().enumerate() {
            for &b in &hash_artifacts[i + 1..] {
                let key = pair_key(&a.attempt_id, &b.attempt_id);
                if pairs.contains_key(&key) {
                    continue;
                }
                if overlap(a, b) >= threshold {
                    pairs.insert(
                        key,
                        Pair {
                            a: Arc::clone(a),
                            b: Arc::clone(b),
                        },
                    );
                }
            }
        }
    }

    pairs.into_values().collect()
}

/// Distinct-hash overlap of two artifacts: `shared / min(|A|, |B|)`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn overlap(a: &Artifact, b: &Artifact) -> f64 {
    let (Some(fp_a), Some(fp_b)) = (a.fingerprints.as_ref(), b.fingerprints.as_ref()) else {
        return 0.0;
    };

    let hashes_a: HashSet<&str> = fp_a.hashes.iter().map(|h| h.hash.as_str()).collect();
    let hashes_b: HashSet<&str> = fp_b.hashes.iter().map(|h| h.hash.as_str()).collect();

    if hashes_a.is_empty() || hashes_b.is_empty() {
        return 0.0;
    }

    let shared = hashes_a.intersection(&hashes_b).count();
    let min_total = hashes_a.len().min(hashes_b.len());

    shared as f64 / min_total as f64
}

/// Order-independent key for a pair of attempt ids.
#[must_use]
pub fn pair_key(id_a: &str, id_b: &str) -> String {
    if id_a < id_b {
        format!("{id_a}:{id_b}")
    } else {
        format!("{id_b}:{id_a}")
    }
}
