//! Score reduction: pair similarities to candidate and drive verdicts.

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::{Artifact, CandidateRisk, Difficulty, DriveRisk};

/// Pairs at or above this final score count as significant.
pub const SIGNIFICANT_THRESHOLD: f64 = 0.55;

/// Pairs at or above this final score count as algorithmic similarity.
pub const ALGORITHMIC_THRESHOLD: f64 = 0.70;

/// How many of a candidate's best pairs feed the average.
const TOP_K: usize = 3;

/// Similarity outcome for one analysed pair.
#[derive(Debug, Clone)]
pub struct PairSimilarity {
    /// First artifact of the pair.
    pub a: Arc<Artifact>,
    /// Second artifact of the pair.
    pub b: Arc<Artifact>,
    /// Weighted cascade score.
    pub final_score: f64,
    /// Question the pair belongs to.
    pub q_id: String,
    /// Difficulty of that question.
    pub difficulty: Difficulty,
}

impl PairSimilarity {
    /// Whether the pair clears the significance floor.
    #[must_use]
    pub fn is_significant(&self) -> bool {
        self.final_score >= SIGNIFICANT_THRESHOLD
    }

    /// The email of the pair endpoint that is not `email`.
    ///
    /// Falls back to the `b` side when `email` matches neither endpoint;
    /// callers only invoke this for pairs indexed under `email`.
    #[must_use]
    pub fn peer_email(&self, email: &str) -> &str {
        if self.a.email == email {
            &self.b.email
        } else {
            &self.a.email
        }
    }

    /// The attempt id of the pair endpoint that is not `email`.
    #[must_use]
    pub fn peer_attempt_id(&self, email: &str) -> &str {
        if self.a.email == email {
            &self.b.attempt_id
        } else {
            &self.a.attempt_id
        }
    }
}

/// Computes a candidate's risk score from their significant pairs.
///
/// Top-K with a peer boost: average the candidate's best
/// `min(3, count)` significant scores, then add `min(0.15, 0.05 * (M - 1))`
/// where `M` is the number of distinct peer emails across the candidate's
/// significant pairs. The boost rewards breadth: matching three different
/// peers is stronger evidence than matching one peer three times. Clamped
/// to `[0, 1]`; no significant pairs scores `0.0`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn candidate_score(email: &str, pairs: &[PairSimilarity]) -> f64 {
    let mut significant: Vec<&PairSimilarity> =
        pairs.iter().filter(|p| p.is_significant()).collect();

    if significant.is_empty() {
        return 0.0;
    }

    significant.sort_by(|x, y| {
        y.final_score
            .partial_cmp(&x.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let k = TOP_K.min(significant.len());
    let top_sum: f64 = significant[..k].iter().map(|p| p.final_score).sum();
    let mut score = top_sum / k as f64;

    let distinct_peers: HashSet<&str> = significant
        .iter()
        .map(|p| p.peer_email(email))
        .collect();
    let m = distinct_peers.len();
    if m > 0 {
        score += f64::min(0.15, 0.05 * (m as f64 - 1.0));
    }

    score.clamp(0.0, 1.0)
}

/// Maps a candidate score to a risk verdict.
#[must_use]
pub fn candidate_risk(score: f64) -> CandidateRisk {
    if score < 0.3 {
        CandidateRisk::Clean
    } else if score < 0.6 {
        CandidateRisk::Suspicious
    } else if score < 0.85 {
        CandidateRisk::HighlySuspicious
    } else {
        CandidateRisk::NearCopy
    }
}

/// Drive-level risk computation output.
#[derive(Debug, Clone, Copy)]
pub struct DriveRiskAssessment {
    /// The raw risk value `0.7 * S + 0.3 * (R / Q)`.
    pub risk: f64,

    /// The banded verdict.
    pub level: DriveRisk,

    /// Adaptive threshold `clamp(0.70 * Q^(-1/2) * (0.5 + D), 0.35, 0.85)`.
    ///
    /// Reserved for a future per-drive significance policy; computed and
    /// surfaced for observability but deliberately not used to classify.
    pub reserved_threshold: f64,
}

/// Computes the drive-level risk.
///
/// `total_questions` is the number of distinct questions in the drive,
/// `avg_difficulty` the mean difficulty factor over all artifacts,
/// `avg_similarity` the mean final score over all significant pairs, and
/// `flagged_questions` the number of distinct flagged questions.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn drive_risk(
    total_questions: usize,
    avg_difficulty: f64,
    avg_similarity: f64,
    flagged_questions: usize,
) -> DriveRiskAssessment {
    let q = total_questions as f64;

    let reserved_threshold = (0.70 * q.sqrt().recip() * (0.5 + avg_difficulty)).clamp(0.35, 0.85);

    let risk = 0.7 * avg_similarity + 0.3 * (flagged_questions as f64 / q);

    let level = if risk < 0.40 {
        DriveRisk::Safe
    } else if risk < 0.60 {
        DriveRisk::Moderate
    } else if risk < 0.80 {
        DriveRisk::High
    } else {
        DriveRisk::Critical
    };

    DriveRiskAssessment {
        risk,
        level,
        reserved_threshold,
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::bare_artifact;

    use super::*;

    fn pair(email_a: &str, email_b: &str, score: f64) -> PairSimilarity {
        let a = bare_artifact(&format!("attempt-{email_a}"), email_a);
        let b = bare_artifact(&format!("attempt-{email_b}"), email_b);
        PairSimilarity {
            a: Arc::new(a),
            b: Arc::new(b),
            final_score: score,
            q_id: "1".to_string(),
            difficulty: Difficulty::Medium,
        }
    }

    #[test]
    fn no_pairs_scores_zero() {
        assert!(candidate_score("e1", &[]).abs() < f64::EPSILON);
    }

    #[test]
    fn insignificant_pairs_score_zero() {
        let pairs = vec![pair("e1", "e2", 0.54), pair("e1", "e3", 0.10)];
        assert!(candidate_score("e1", &pairs).abs() < f64::EPSILON);
    }

    #[test]
    fn top_three_average_with_full_boost() {
        // Scores [0.90, 0.80, 0.70, 0.60] across four distinct peers:
        // top-3 average 0.80, boost min(0.15, 0.05 * 3) = 0.15.
        let pairs = vec![
            pair("e1", "p1", 0.90),
            pair("e1", "p2", 0.80),
            pair("e1", "p3", 0.70),
            pair("e1", "p4", 0.60),
        ];
        let score = candidate_score("e1", &pairs);
        assert!((score - 0.95).abs() < 1e-12);
        assert_eq!(candidate_risk(score), CandidateRisk::NearCopy);
    }

    #[test]
    fn single_peer_gets_no_boost() {
        let pairs = vec![pair("e1", "p1", 0.60)];
        let score = candidate_score("e1", &pairs);
        assert!((score - 0.60).abs() < 1e-12);
    }

    #[test]
    fn repeat_peer_does_not_stack_boost() {
        // Three pairs, all against the same peer: M = 1, boost 0.
        let pairs = vec![
            pair("e1", "p1", 0.90),
            pair("p1", "e1", 0.80),
            pair("e1", "p1", 0.70),
        ];
        let score = candidate_score("e1", &pairs);
        assert!((score - 0.80).abs() < 1e-12);
    }

    #[test]
    fn boost_counts_peers_regardless_of_pair_orientation() {
        // The candidate appears as either endpoint; both orientations must
        // contribute the same peer set.
        let pairs = vec![pair("e1", "p1", 0.70), pair("p2", "e1", 0.70)];
        let score = candidate_score("e1", &pairs);
        // Average 0.70, two distinct peers: boost 0.05.
        assert!((score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn score_is_clamped() {
        let pairs = vec![
            pair("e1", "p1", 1.0),
            pair("e1", "p2", 1.0),
            pair("e1", "p3", 1.0),
            pair("e1", "p4", 1.0),
        ];
        assert!((candidate_score("e1", &pairs) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn increasing_a_top_score_never_decreases_the_total() {
        let base = vec![
            pair("e1", "p1", 0.90),
            pair("e1", "p2", 0.80),
            pair("e1", "p3", 0.70),
        ];
        let bumped = vec![
            pair("e1", "p1", 0.95),
            pair("e1", "p2", 0.80),
            pair("e1", "p3", 0.70),
        ];
        assert!(candidate_score("e1", &bumped) >= candidate_score("e1", &base));
    }

    #[test]
    fn risk_bands() {
        assert_eq!(candidate_risk(0.0), CandidateRisk::Clean);
        assert_eq!(candidate_risk(0.29), CandidateRisk::Clean);
        assert_eq!(candidate_risk(0.3), CandidateRisk::Suspicious);
        assert_eq!(candidate_risk(0.59), CandidateRisk::Suspicious);
        assert_eq!(candidate_risk(0.6), CandidateRisk::HighlySuspicious);
        assert_eq!(candidate_risk(0.84), CandidateRisk::HighlySuspicious);
        assert_eq!(candidate_risk(0.85), CandidateRisk::NearCopy);
        assert_eq!(candidate_risk(1.0), CandidateRisk::NearCopy);
    }

    #[test]
    fn drive_risk_bands() {
        assert_eq!(drive_risk(4, 0.5, 0.3, 1).level, DriveRisk::Safe);
        assert_eq!(drive_risk(4, 0.5, 0.6, 2).level, DriveRisk::Moderate);
        assert_eq!(drive_risk(4, 0.5, 0.8, 3).level, DriveRisk::High);
        assert_eq!(drive_risk(4, 0.5, 0.95, 4).level, DriveRisk::Critical);
    }

    #[test]
    fn reserved_threshold_is_clamped_and_unused_by_banding() {
        // Many easy questions push the raw threshold below the clamp floor.
        let assessment = drive_risk(100, 0.33, 0.0, 0);
        assert!((assessment.reserved_threshold - 0.35).abs() < 1e-12);

        // A single hard question pushes it above the ceiling.
        let assessment = drive_risk(1, 1.0, 0.0, 0);
        assert!((assessment.reserved_threshold - 0.85).abs() < 1e-12);

        // Either way the band only reflects the risk formula.
        assert_eq!(assessment.level, DriveRisk::Safe);
    }

    #[test]
    fn difficulty_factors() {
        assert!((Difficulty::Easy.as_factor() - 0.33).abs() < f64::EPSILON);
        assert!((Difficulty::Medium.as_factor() - 0.66).abs() < f64::EPSILON);
        assert!((Difficulty::Hard.as_factor() - 1.0).abs() < f64::EPSILON);
    }
}
