//! Progressive short-circuit cascade over the similarity kernels.
//!
//! Kernels run coarse-to-fine: fingerprint, token, AST, CFG. Each stage
//! contributes its score weighted by a difficulty-keyed factor; after each
//! stage, if even perfect scores from the remaining stages could not lift
//! the weighted sum over the stage threshold, the pair is abandoned early.

use crate::model::{Artifact, Difficulty};
use crate::similarity::{
    ast_similarity, cfg_similarity, fingerprint_similarity, token_similarity,
};

/// A cascade stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Fingerprint-overlap kernel (coarsest, cheapest).
    Fingerprint,
    /// Greedy-string-tiling kernel.
    Token,
    /// Merkle subtree kernel.
    Ast,
    /// CFG feature-distance kernel (finest).
    Cfg,
}

/// Kernel weights for one difficulty. The four weights sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    /// Fingerprint kernel weight.
    pub fingerprint: f64,
    /// Token kernel weight.
    pub token: f64,
    /// AST kernel weight.
    pub ast: f64,
    /// CFG kernel weight.
    pub cfg: f64,
}

/// Returns the kernel weights for a difficulty.
///
/// Easier questions converge on near-identical solutions, so the coarse
/// fingerprint layer dominates; hard questions shift weight toward the
/// structural layers.
#[must_use]
pub const fn weights(difficulty: Difficulty) -> Weights {
    match difficulty {
        Difficulty::Easy => Weights {
            fingerprint: 0.50,
            token: 0.30,
            ast: 0.15,
            cfg: 0.05,
        },
        Difficulty::Medium => Weights {
            fingerprint: 0.40,
            token: 0.30,
            ast: 0.20,
            cfg: 0.10,
        },
        Difficulty::Hard => Weights {
            fingerprint: 0.30,
            token: 0.25,
            ast: 0.30,
            cfg: 0.15,
        },
    }
}

/// Returns the short-circuit threshold for a stage at a difficulty.
#[must_use]
pub const fn stage_threshold(difficulty: Difficulty, stage: Stage) -> f64 {
    match difficulty {
        Difficulty::Easy => match stage {
            Stage::Fingerprint => 0.65,
            Stage::Token => 0.60,
            Stage::Ast => 0.58,
            Stage::Cfg => 0.55,
        },
        Difficulty::Medium => match stage {
            Stage::Fingerprint => 0.58,
            Stage::Token => 0.55,
            Stage::Ast => 0.52,
            Stage::Cfg => 0.50,
        },
        Difficulty::Hard => match stage {
            Stage::Fingerprint => 0.52,
            Stage::Token => 0.50,
            Stage::Ast => 0.48,
            Stage::Cfg => 0.45,
        },
    }
}

/// Raw per-stage scores of a cascade run. `None` marks a stage the cascade
/// never reached.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageScores {
    /// Fingerprint kernel score.
    pub fingerprint: Option<f64>,
    /// Token kernel score.
    pub token: Option<f64>,
    /// AST kernel score.
    pub ast: Option<f64>,
    /// CFG kernel score.
    pub cfg: Option<f64>,
}

/// Result of running the cascade over one artifact pair.
#[derive(Debug, Clone, Copy)]
pub struct CascadeResult {
    /// Raw kernel scores for the stages that ran.
    pub scores: StageScores,

    /// Whether the cascade abandoned the pair early.
    pub short_circuited: bool,

    /// Weighted final score. For a short-circuited pair this is the
    /// weighted partial sum accumulated so far.
    pub final_score: f64,
}

/// Runs the cascade over a pair of artifacts.
///
/// Maintains `current` (the weighted partial sum) and `remaining_max` (the
/// total weight of kernels not yet run, recomputed explicitly after every
/// stage). After each stage, if `current + remaining_max` cannot reach that
/// stage's threshold the cascade stops: no outcome of the remaining kernels
/// could make the pair significant.
#[must_use]
pub fn run_cascade(a: &Artifact, b: &Artifact, difficulty: Difficulty) -> CascadeResult {
    let weights = weights(difficulty);
    let mut scores = StageScores::default();

    let mut current = 0.0;
    let mut remaining_max = weights.fingerprint + weights.token + weights.ast + weights.cfg;

    // Stage 1: fingerprint.
    let fingerprint = fingerprint_similarity(a, b);
    scores.fingerprint = Some(fingerprint);
    current += fingerprint * weights.fingerprint;
    remaining_max -= weights.fingerprint;
    if should_short_circuit(
        current,
        remaining_max,
        stage_threshold(difficulty, Stage::Fingerprint),
    ) {
        return CascadeResult {
            scores,
            short_circuited: true,
            final_score: current,
        };
    }

    // Stage 2: token tiling.
    let token = token_similarity(a, b);
    scores.token = Some(token);
    current += token * weights.token;
    remaining_max -= weights.token;
    if should_short_circuit(
        current,
        remaining_max,
        stage_threshold(difficulty, Stage::Token),
    ) {
        return CascadeResult {
            scores,
            short_circuited: true,
            final_score: current,
        };
    }

    // Stage 3: AST.
    let ast = ast_similarity(a, b);
    scores.ast = Some(ast);
    current += ast * weights.ast;
    remaining_max -= weights.ast;
    if should_short_circuit(
        current,
        remaining_max,
        stage_threshold(difficulty, Stage::Ast),
    ) {
        return CascadeResult {
            scores,
            short_circuited: true,
            final_score: current,
        };
    }

    // Stage 4: CFG.
    let cfg = cfg_similarity(a, b);
    scores.cfg = Some(cfg);
    current += cfg * weights.cfg;

    CascadeResult {
        scores,
        short_circuited: false,
        final_score: current,
    }
}

fn should_short_circuit(current: f64, remaining_max: f64, threshold: f64) -> bool {
    current + remaining_max < threshold
}

#[cfg(test)]
mod tests {
    use crate::model::AstNode;
    use crate::testutil::{bare_artifact, cfg, fingerprints};

    use super::*;

    /// A pair of artifacts that score 1.0 on every kernel.
    fn identical_pair() -> (Artifact, Artifact) {
        let build = |attempt_id: &str, email: &str| {
            let mut artifact = bare_artifact(attempt_id, email);
            artifact.fingerprints = Some(fingerprints(&["h1", "h2", "h3"]));
            artifact.normalized_tokens = ["def", "f", "(", "n", ")", ":", "return", "n"]
                .iter()
                .map(ToString::to_string)
                .collect();
            artifact.ast = Some(AstNode::branch(
                "Module",
                vec![AstNode::leaf("FunctionDeclaration")],
            ));
            artifact.cfg = Some(cfg(
                &[("e", "ENTRY"), ("x", "EXIT")],
                &[("e", "x", "SEQUENTIAL")],
            ));
            artifact
        };
        (build("a", "a@x.com"), build("b", "b@x.com"))
    }

    #[test]
    fn weights_sum_to_one() {
        for difficulty in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
            let w = weights(difficulty);
            let sum = w.fingerprint + w.token + w.ast + w.cfg;
            assert!((sum - 1.0).abs() < 1e-12, "{difficulty}: {sum}");
        }
    }

    #[test]
    fn identical_artifacts_score_one_at_every_difficulty() {
        let (a, b) = identical_pair();
        for difficulty in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
            let result = run_cascade(&a, &b, difficulty);
            assert!(!result.short_circuited);
            assert!(
                (result.final_score - 1.0).abs() < 1e-12,
                "{difficulty}: {}",
                result.final_score
            );
        }
    }

    #[test]
    fn low_fingerprint_short_circuits_easy() {
        // Fingerprint overlap 1/10 = 0.10 with easy weights: current = 0.05,
        // remaining = 0.50, threshold 0.65. 0.55 < 0.65, so the cascade must
        // stop after the first stage with the partial sum as final score.
        let mut a = bare_artifact("a", "a@x.com");
        let mut b = bare_artifact("b", "b@x.com");
        a.fingerprints = Some(fingerprints(&[
            "h0", "h1", "h2", "h3", "h4", "h5", "h6", "h7", "h8", "h9",
        ]));
        b.fingerprints = Some(fingerprints(&[
            "h0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9",
        ]));

        let result = run_cascade(&a, &b, Difficulty::Easy);
        assert!(result.short_circuited);
        assert!((result.final_score - 0.05).abs() < 1e-12);
        assert!(result.scores.fingerprint.is_some());
        assert!(result.scores.token.is_none());
        assert!(result.scores.ast.is_none());
        assert!(result.scores.cfg.is_none());
    }

    #[test]
    fn short_circuit_is_sound() {
        // Whenever the cascade short-circuits, even perfect remaining scores
        // could not have reached the threshold of the stage that stopped it.
        let mut a = bare_artifact("a", "a@x.com");
        let mut b = bare_artifact("b", "b@x.com");
        a.fingerprints = Some(fingerprints(&["h0", "h1", "h2", "h3"]));
        b.fingerprints = Some(fingerprints(&["h0", "h1", "x2", "x3"]));

        for difficulty in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
            let result = run_cascade(&a, &b, difficulty);
            if !result.short_circuited {
                continue;
            }

            let w = weights(difficulty);
            // Reconstruct the stopping stage from which scores ran.
            let (threshold, optimistic) = match (
                result.scores.token,
                result.scores.ast,
                result.scores.cfg,
            ) {
                (None, _, _) => (
                    stage_threshold(difficulty, Stage::Fingerprint),
                    result.final_score + w.token + w.ast + w.cfg,
                ),
                (Some(_), None, _) => (
                    stage_threshold(difficulty, Stage::Token),
                    result.final_score + w.ast + w.cfg,
                ),
                (Some(_), Some(_), None) => (
                    stage_threshold(difficulty, Stage::Ast),
                    result.final_score + w.cfg,
                ),
                (Some(_), Some(_), Some(_)) => unreachable!("short-circuit ran all stages"),
            };

            assert!(result.final_score < threshold);
            assert!(optimistic < threshold);
        }
    }

    #[test]
    fn final_score_stays_in_bounds() {
        let (a, b) = identical_pair();
        let mut c = bare_artifact("c", "c@x.com");
        c.fingerprints = Some(fingerprints(&["z1"]));

        for difficulty in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
            for (x, y) in [(&a, &b), (&a, &c), (&c, &a)] {
                let score = run_cascade(x, y, difficulty).final_score;
                assert!((0.0..=1.0).contains(&score));
            }
        }
    }

    #[test]
    fn cascade_is_symmetric() {
        let (a, _) = identical_pair();
        let mut c = bare_artifact("c", "c@x.com");
        c.fingerprints = Some(fingerprints(&["h1", "h2", "q1", "q2"]));
        c.normalized_tokens = ["def", "f", "(", "n", ")", ":", "pass"]
            .iter()
            .map(ToString::to_string)
            .collect();

        for difficulty in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
            let forward = run_cascade(&a, &c, difficulty);
            let backward = run_cascade(&c, &a, difficulty);
            assert!((forward.final_score - backward.final_score).abs() < 1e-12);
            assert_eq!(forward.short_circuited, backward.short_circuited);
        }
    }
}
