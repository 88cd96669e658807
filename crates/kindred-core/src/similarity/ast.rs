//! Merkle subtree-overlap similarity over abstract syntax trees.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::model::{Artifact, AstNode};

use super::clamp_score;

/// Scores two artifacts by Merkle subtree overlap.
///
/// Every node is hashed post-order as
/// `SHA256(node_type || sort(child_hashes))`; the hash set of one tree is
/// then compared against the other. Sorting child hashes makes a node's
/// hash commutative over its siblings, so reorderings of independent
/// statements still match. The score is `|SA ∩ SB| / min(|SA|, |SB|)`; a
/// missing AST on either side scores `0.0`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ast_similarity(a: &Artifact, b: &Artifact) -> f64 {
    let (Some(ast_a), Some(ast_b)) = (a.ast.as_ref(), b.ast.as_ref()) else {
        return 0.0;
    };

    let subtrees_a = subtree_hashes(ast_a);
    let subtrees_b = subtree_hashes(ast_b);

    if subtrees_a.is_empty() || subtrees_b.is_empty() {
        return 0.0;
    }

    let common = subtrees_a.intersection(&subtrees_b).count();
    let min_total = subtrees_a.len().min(subtrees_b.len());

    clamp_score(common as f64 / min_total as f64)
}

/// One in-progress node on the traversal stack.
struct Frame<'a> {
    node: &'a AstNode,
    next_child: usize,
    child_hashes: Vec<String>,
}

impl<'a> Frame<'a> {
    fn new(node: &'a AstNode) -> Self {
        Self {
            node,
            next_child: 0,
            child_hashes: Vec::with_capacity(node.children.len()),
        }
    }
}

/// Collects the Merkle hash of every subtree rooted in `root`.
///
/// Iterative post-order with an explicit stack: tree depth comes from the
/// preprocessor and is untrusted, so recursion depth must not track it.
fn subtree_hashes(root: &AstNode) -> HashSet<String> {
    let mut hashes = HashSet::new();
    let mut stack = vec![Frame::new(root)];

    while let Some(frame) = stack.last_mut() {
        if frame.next_child < frame.node.children.len() {
            let child = &frame.node.children[frame.next_child];
            frame.next_child += 1;
            stack.push(Frame::new(child));
            continue;
        }

        let mut child_hashes = std::mem::take(&mut frame.child_hashes);
        child_hashes.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(frame.node.node_type.as_bytes());
        for child_hash in &child_hashes {
            hasher.update(child_hash.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());

        stack.pop();
        if let Some(parent) = stack.last_mut() {
            parent.child_hashes.push(digest.clone());
        }
        hashes.insert(digest);
    }

    hashes
}

#[cfg(test)]
mod tests {
    use crate::model::AstNode;
    use crate::testutil::artifact_with_ast;

    use super::*;

    fn function_tree() -> AstNode {
        AstNode::branch(
            "Module",
            vec![AstNode::branch(
                "FunctionDeclaration",
                vec![
                    AstNode::leaf("Parameter"),
                    AstNode::branch("Return", vec![AstNode::leaf("BinaryExpression")]),
                ],
            )],
        )
    }

    #[test]
    fn identical_trees_score_one() {
        let a = artifact_with_ast("a", "a@x.com", function_tree());
        let b = artifact_with_ast("b", "b@x.com", function_tree());
        assert!((ast_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sibling_order_is_ignored() {
        let forward = AstNode::branch(
            "Block",
            vec![
                AstNode::leaf("Assignment"),
                AstNode::branch("If", vec![AstNode::leaf("Condition")]),
            ],
        );
        let reversed = AstNode::branch(
            "Block",
            vec![
                AstNode::branch("If", vec![AstNode::leaf("Condition")]),
                AstNode::leaf("Assignment"),
            ],
        );

        let a = artifact_with_ast("a", "a@x.com", forward);
        let b = artifact_with_ast("b", "b@x.com", reversed);
        assert!((ast_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unrelated_trees_score_zero() {
        let a = artifact_with_ast("a", "a@x.com", AstNode::leaf("Module"));
        let b = artifact_with_ast("b", "b@x.com", AstNode::leaf("Class"));
        assert!(ast_similarity(&a, &b).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_ast_scores_zero() {
        let a = artifact_with_ast("a", "a@x.com", function_tree());
        let mut b = artifact_with_ast("b", "b@x.com", function_tree());
        b.ast = None;
        assert!(ast_similarity(&a, &b).abs() < f64::EPSILON);
    }

    #[test]
    fn shared_subtrees_score_partially() {
        let a = artifact_with_ast("a", "a@x.com", function_tree());
        let b = artifact_with_ast(
            "b",
            "b@x.com",
            AstNode::branch(
                "Class",
                vec![AstNode::branch(
                    "Return",
                    vec![AstNode::leaf("BinaryExpression")],
                )],
            ),
        );

        let score = ast_similarity(&a, &b);
        // The Return subtree and the BinaryExpression leaf are shared; the
        // roots are not.
        assert!(score > 0.0 && score < 1.0);
    }

    #[test]
    fn symmetric() {
        let a = artifact_with_ast("a", "a@x.com", function_tree());
        let b = artifact_with_ast(
            "b",
            "b@x.com",
            AstNode::branch("Module", vec![AstNode::leaf("Import")]),
        );
        assert!((ast_similarity(&a, &b) - ast_similarity(&b, &a)).abs() < 1e-12);
    }

    #[test]
    fn deep_tree_does_not_overflow_the_stack() {
        fn chain(depth: usize) -> AstNode {
            let mut node = AstNode::leaf("Expr");
            for _ in 0..depth {
                node = AstNode::branch("Wrap", vec![node]);
            }
            node
        }

        // Construction and drop recurse through the derive impls, so give the
        // whole test a roomy stack; the traversal under test stays iterative
        // regardless.
        std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(|| {
                let a = artifact_with_ast("a", "a@x.com", chain(100_000));
                let b = artifact_with_ast("b", "b@x.com", chain(100_000));
                assert!((ast_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
            })
            .unwrap()
            .join()
            .unwrap();
    }
}
