//! Greedy-string-tiling similarity over normalised token streams.

use crate::model::Artifact;

use super::clamp_score;

/// Minimum tile length considered a match. Shorter runs are noise: most
/// languages share short keyword sequences between unrelated programs.
const MIN_MATCH_LENGTH: usize = 5;

/// Scores two artifacts by greedy string tiling over their normalised
/// tokens.
///
/// Repeatedly finds the longest common substring of still-unmatched
/// positions (ties resolved to the earliest index in `a`, then the earliest
/// in `b`), locks both occurrences, and stops once no match of length >=
/// [`MIN_MATCH_LENGTH`] remains. The score is
/// `2 * matched / (|A| + |B|)`. Empty token streams on either side score
/// `0.0`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn token_similarity(a: &Artifact, b: &Artifact) -> f64 {
    let tokens_a = &a.normalized_tokens;
    let tokens_b = &b.normalized_tokens;

    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let matched = greedy_string_tiling(tokens_a, tokens_b, MIN_MATCH_LENGTH);
    let total = tokens_a.len() + tokens_b.len();

    clamp_score(2.0 * matched as f64 / total as f64)
}

/// Runs greedy string tiling and returns the number of matched tokens.
///
/// Positions are locked pairwise: once part of a tile, a position can never
/// participate in another match, so tiles never cross.
fn greedy_string_tiling(tokens_a: &[String], tokens_b: &[String], min_length: usize) -> usize {
    let mut matched_a = vec![false; tokens_a.len()];
    let mut matched_b = vec![false; tokens_b.len()];
    let mut total_matched = 0;

    loop {
        let mut max_len = 0;
        let mut max_start_a = 0;
        let mut max_start_b = 0;

        for i in 0..tokens_a.len() {
            if matched_a[i] {
                continue;
            }
            for j in 0..tokens_b.len() {
                if matched_b[j] {
                    continue;
                }

                let mut len = 0;
                while i + len < tokens_a.len()
                    && j + len < tokens_b.len()
                    && !matched_a[i + len]
                    && !matched_b[j + len]
                    && tokens_a[i + len] == tokens_b[j + len]
                {
                    len += 1;
                }

                // Strict comparison keeps the earliest (i, j) on ties.
                if len >= min_length && len > max_len {
                    max_len = len;
                    max_start_a = i;
                    max_start_b = j;
                }
            }
        }

        if max_len == 0 {
            break;
        }

        for k in 0..max_len {
            matched_a[max_start_a + k] = true;
            matched_b[max_start_b + k] = true;
        }
        total_matched += max_len;
    }

    total_matched
}

#[cfg(test)]
mod tests {
    use crate::testutil::artifact_with_tokens;

    use super::*;

    const PROGRAM: &[&str] = &[
        "def", "f", "(", "n", ")", ":", "return", "n", "*", "n",
    ];

    #[test]
    fn identical_streams_score_one() {
        let a = artifact_with_tokens("a", "a@x.com", PROGRAM);
        let b = artifact_with_tokens("b", "b@x.com", PROGRAM);
        assert!((token_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unrelated_streams_score_zero() {
        let a = artifact_with_tokens("a", "a@x.com", &["x", "y", "z", "w", "v", "u"]);
        let b = artifact_with_tokens("b", "b@x.com", &["p", "q", "r", "s", "t", "o"]);
        assert!(token_similarity(&a, &b).abs() < f64::EPSILON);
    }

    #[test]
    fn short_common_runs_are_ignored() {
        // Four shared tokens is below the minimum tile length.
        let a = artifact_with_tokens("a", "a@x.com", &["a", "b", "c", "d", "x", "x"]);
        let b = artifact_with_tokens("b", "b@x.com", &["a", "b", "c", "d", "y", "y"]);
        assert!(token_similarity(&a, &b).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_stream_scores_zero() {
        let a = artifact_with_tokens("a", "a@x.com", &[]);
        let b = artifact_with_tokens("b", "b@x.com", PROGRAM);
        assert!(token_similarity(&a, &b).abs() < f64::EPSILON);
    }

    #[test]
    fn symmetric() {
        let a = artifact_with_tokens(
            "a",
            "a@x.com",
            &["a", "b", "c", "d", "e", "f", "g", "h", "q", "r"],
        );
        let b = artifact_with_tokens(
            "b",
            "b@x.com",
            &["z", "a", "b", "c", "d", "e", "f", "g", "h", "w"],
        );
        let ab = token_similarity(&a, &b);
        let ba = token_similarity(&b, &a);
        assert!((ab - ba).abs() < 1e-12);
        assert!(ab > 0.0);
    }

    #[test]
    fn locked_positions_never_rematch() {
        // The shared prefix can only be consumed once even though it appears
        // twice in b.
        let a = artifact_with_tokens("a", "a@x.com", &["m", "n", "o", "p", "q"]);
        let b = artifact_with_tokens(
            "b",
            "b@x.com",
            &["m", "n", "o", "p", "q", "m", "n", "o", "p", "q"],
        );
        // 5 matched tokens on each side: 2 * 5 / (5 + 10).
        let expected = 10.0 / 15.0;
        assert!((token_similarity(&a, &b) - expected).abs() < 1e-12);
    }

    #[test]
    fn bounds_hold() {
        let a = artifact_with_tokens("a", "a@x.com", PROGRAM);
        let b = artifact_with_tokens("b", "b@x.com", &["def", "f", "(", "n", ")", ":", "pass"]);
        let score = token_similarity(&a, &b);
        assert!((0.0..=1.0).contains(&score));
    }
}
