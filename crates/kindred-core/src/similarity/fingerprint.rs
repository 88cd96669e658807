//! Fingerprint-overlap similarity.

use std::collections::HashSet;

use crate::model::Artifact;

use super::clamp_score;

/// Scores two artifacts by winnowed-fingerprint overlap.
///
/// The score is `shared / min(|A|, |B|)` over the distinct-hash sets of both
/// sides. Using the smaller set as the denominator keeps the score high when
/// one submission embeds the other, which is the common plagiarism shape.
/// Missing fingerprints or an empty hash set on either side score `0.0`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn fingerprint_similarity(a: &Artifact, b: &Artifact) -> f64 {
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

    clamp_score(shared as f64 / min_total as f64)
}

#[cfg(test)]
mod tests {
    use crate::testutil;

    use super::*;

    fn artifact_with_hashes(attempt_id: &str, hashes: &[&str]) -> Artifact {
        testutil::artifact_with_hashes(attempt_id, &format!("{attempt_id}@example.com"), hashes)
    }

    #[test]
    fn identical_sets_score_one() {
        let a = artifact_with_hashes("a", &["h1", "h2", "h3"]);
        let b = artifact_with_hashes("b", &["h1", "h2", "h3"]);
        assert!((fingerprint_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn disjoint_sets_score_zero() {
        let a = artifact_with_hashes("a", &["h1", "h2"]);
        let b = artifact_with_hashes("b", &["h3", "h4"]);
        assert!(fingerprint_similarity(&a, &b).abs() < f64::EPSILON);
    }

    #[test]
    fn containment_scores_against_smaller_side() {
        let a = artifact_with_hashes("a", &["h1", "h2"]);
        let b = artifact_with_hashes("b", &["h1", "h2", "h3", "h4"]);
        assert!((fingerprint_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn symmetric() {
        let a = artifact_with_hashes("a", &["h1", "h2", "h3"]);
        let b = artifact_with_hashes("b", &["h2", "h3", "h4", "h5"]);
        assert!(
            (fingerprint_similarity(&a, &b) - fingerprint_similarity(&b, &a)).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn missing_fingerprints_score_zero() {
        let mut a = artifact_with_hashes("a", &["h1"]);
        let b = artifact_with_hashes("b", &["h1"]);
        a.fingerprints = None;
        assert!(fingerprint_similarity(&a, &b).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_hash_set_scores_zero() {
        let a = artifact_with_hashes("a", &[]);
        let b = artifact_with_hashes("b", &["h1"]);
        assert!(fingerprint_similarity(&a, &b).abs() < f64::EPSILON);
    }

    #[test]
    fn duplicate_hashes_count_once() {
        let a = artifact_with_hashes("a", &["h1", "h1", "h2"]);
        let b = artifact_with_hashes("b", &["h1", "h3"]);
        // Distinct sets are {h1, h2} and {h1, h3}: 1 shared over min 2.
        assert!((fingerprint_similarity(&a, &b) - 0.5).abs() < f64::EPSILON);
    }
}
