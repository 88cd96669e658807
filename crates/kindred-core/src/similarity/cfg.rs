//! Feature-vector similarity over control flow graphs.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{Artifact, Cfg};

use super::clamp_score;

/// Number of structural features extracted per graph.
const FEATURE_COUNT: usize = 6;

/// Scores two artifacts by normalised distance between CFG feature vectors.
///
/// The features are `[nodes, edges, branches, loops, max_depth,
/// cyclomatic]`. With `d` the Euclidean distance between the vectors and
/// `m` the sum of their magnitudes, the score is `clamp(1 - d/m, 0, 1)`;
/// two zero vectors score `1.0`. A missing CFG on either side scores `0.0`.
#[must_use]
pub fn cfg_similarity(a: &Artifact, b: &Artifact) -> f64 {
    let (Some(cfg_a), Some(cfg_b)) = (a.cfg.as_ref(), b.cfg.as_ref()) else {
        return 0.0;
    };

    let features_a = extract_features(cfg_a);
    let features_b = extract_features(cfg_b);

    let distance = euclidean_distance(&features_a, &features_b);
    let magnitude = norm(&features_a) + norm(&features_b);

    if magnitude == 0.0 {
        return 1.0;
    }

    clamp_score(1.0 - distance / magnitude)
}

/// Extracts the structural feature vector of a graph.
#[allow(clippy::cast_precision_loss)]
fn extract_features(cfg: &Cfg) -> [f64; FEATURE_COUNT] {
    let adjacency = build_adjacency(cfg);
    let entries: Vec<&str> = cfg
        .nodes
        .iter()
        .filter(|n| n.node_type == "ENTRY")
        .map(|n| n.id.as_str())
        .collect();

    let nodes = cfg.nodes.len() as f64;
    let edges = cfg.edges.len() as f64;
    let branches = cfg
        .edges
        .iter()
        .filter(|e| e.edge_type == "BRANCH" || e.edge_type == "CONDITIONAL")
        .count() as f64;
    let loops = count_back_edges(&adjacency, &entries) as f64;
    let max_depth = max_depth(&adjacency, &entries) as f64;
    // Cyclomatic complexity E - N + 2P with one connected component assumed.
    let cyclomatic = edges - nodes + 2.0;

    [nodes, edges, branches, loops, max_depth, cyclomatic]
}

fn build_adjacency(cfg: &Cfg) -> HashMap<&str, Vec<&str>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &cfg.edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }
    adjacency
}

/// Counts back edges reachable from the entry nodes.
///
/// Iterative DFS with an explicit stack and a gray set; an edge into a node
/// currently on the DFS path is a back edge. Graph depth is untrusted input,
/// so recursion must not track it.
fn count_back_edges(adjacency: &HashMap<&str, Vec<&str>>, entries: &[&str]) -> usize {
    const EMPTY: &[&str] = &[];

    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_path: HashSet<&str> = HashSet::new();
    let mut back_edges = 0;

    for &entry in entries {
        if visited.contains(entry) {
            continue;
        }

        visited.insert(entry);
        on_path.insert(entry);
        let mut stack: Vec<(&str, usize)> = vec![(entry, 0)];

        while let Some((node, next)) = stack.last_mut() {
            let neighbors = adjacency
                .get(*node)
                .map_or(EMPTY, |targets| targets.as_slice());

            if *next < neighbors.len() {
                let neighbor = neighbors[*next];
                *next += 1;

                if !visited.contains(neighbor) {
                    visited.insert(neighbor);
                    on_path.insert(neighbor);
                    stack.push((neighbor, 0));
                } else if on_path.contains(neighbor) {
                    back_edges += 1;
                }
            } else {
                on_path.remove(*node);
                stack.pop();
            }
        }
    }

    back_edges
}

/// Longest BFS level reachable from any entry node.
fn max_depth(adjacency: &HashMap<&str, Vec<&str>>, entries: &[&str]) -> usize {
    let mut deepest = 0;

    for &entry in entries {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        visited.insert(entry);
        queue.push_back((entry, 0));

        while let Some((node, depth)) = queue.pop_front() {
            deepest = deepest.max(depth);

            if let Some(neighbors) = adjacency.get(node) {
                for &neighbor in neighbors {
                    if visited.insert(neighbor) {
                        queue.push_back((neighbor, depth + 1));
                    }
                }
            }
        }
    }

    deepest
}

fn euclidean_distance(a: &[f64; FEATURE_COUNT], b: &[f64; FEATURE_COUNT]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

fn norm(v: &[f64; FEATURE_COUNT]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use crate::testutil::{artifact_with_cfg, cfg};

    use super::*;

    fn straight_line() -> Cfg {
        cfg(
            &[("e", "ENTRY"), ("s1", "STATEMENT"), ("x", "EXIT")],
            &[("e", "s1", "SEQUENTIAL"), ("s1", "x", "SEQUENTIAL")],
        )
    }

    fn looped() -> Cfg {
        cfg(
            &[
                ("e", "ENTRY"),
                ("c", "CONDITIONAL"),
                ("b", "STATEMENT"),
                ("x", "EXIT"),
            ],
            &[
                ("e", "c", "SEQUENTIAL"),
                ("c", "b", "BRANCH"),
                ("b", "c", "SEQUENTIAL"),
                ("c", "x", "BRANCH"),
            ],
        )
    }

    #[test]
    fn identical_graphs_score_one() {
        let a = artifact_with_cfg("a", "a@x.com", straight_line());
        let b = artifact_with_cfg("b", "b@x.com", straight_line());
        assert!((cfg_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_cfg_scores_zero() {
        let a = artifact_with_cfg("a", "a@x.com", straight_line());
        let mut b = artifact_with_cfg("b", "b@x.com", straight_line());
        b.cfg = None;
        assert!(cfg_similarity(&a, &b).abs() < f64::EPSILON);
    }

    #[test]
    fn features_capture_structure() {
        let features = extract_features(&looped());
        assert!((features[0] - 4.0).abs() < f64::EPSILON); // nodes
        assert!((features[1] - 4.0).abs() < f64::EPSILON); // edges
        assert!((features[2] - 2.0).abs() < f64::EPSILON); // branches
        assert!((features[3] - 1.0).abs() < f64::EPSILON); // loops
        assert!((features[4] - 2.0).abs() < f64::EPSILON); // max depth
        assert!((features[5] - 2.0).abs() < f64::EPSILON); // cyclomatic
    }

    #[test]
    fn straight_line_has_no_loops() {
        let features = extract_features(&straight_line());
        assert!(features[3].abs() < f64::EPSILON);
    }

    #[test]
    fn different_graphs_score_below_one() {
        let a = artifact_with_cfg("a", "a@x.com", straight_line());
        let b = artifact_with_cfg("b", "b@x.com", looped());
        let score = cfg_similarity(&a, &b);
        assert!(score < 1.0);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn symmetric() {
        let a = artifact_with_cfg("a", "a@x.com", straight_line());
        let b = artifact_with_cfg("b", "b@x.com", looped());
        assert!((cfg_similarity(&a, &b) - cfg_similarity(&b, &a)).abs() < 1e-12);
    }

    #[test]
    fn empty_graphs_are_identical() {
        // An empty graph still has cyclomatic complexity 2, so the vectors
        // are equal and non-zero.
        let a = artifact_with_cfg("a", "a@x.com", cfg(&[], &[]));
        let b = artifact_with_cfg("b", "b@x.com", cfg(&[], &[]));
        assert!((cfg_similarity(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cycle_without_entry_is_not_counted() {
        // Loop detection starts from ENTRY nodes only.
        let orphan_cycle = cfg(
            &[("a", "STATEMENT"), ("b", "STATEMENT")],
            &[("a", "b", "SEQUENTIAL"), ("b", "a", "SEQUENTIAL")],
        );
        let features = extract_features(&orphan_cycle);
        assert!(features[3].abs() < f64::EPSILON);
    }
}
