//! Shared fixtures for unit tests.

use chrono::Utc;

use crate::model::{
    Artifact, AstNode, Cfg, CfgEdge, CfgNode, Difficulty, Fingerprints, HashEntry,
};

/// Builds a bare artifact with the given identity and no preprocessing
/// payloads. Tests fill in the pieces they exercise.
#[must_use]
pub fn bare_artifact(attempt_id: &str, email: &str) -> Artifact {
    Artifact {
        email: email.to_string(),
        attempt_id: attempt_id.to_string(),
        test_id: "t-1".to_string(),
        drive_id: "d-1".to_string(),
        difficulty: Difficulty::Medium,
        source_code: String::new(),
        q_id: 1,
        language: "python".to_string(),
        lang_code: "py".to_string(),
        tokens: Vec::new(),
        normalized_tokens: Vec::new(),
        ast: None,
        cfg: None,
        fingerprints: None,
        created_at: Utc::now(),
    }
}

/// Builds fingerprints from plain hash strings, positions assigned in order.
#[must_use]
pub fn fingerprints(hashes: &[&str]) -> Fingerprints {
    Fingerprints {
        method: "winnowing".to_string(),
        k_gram_size: 5,
        window_size: 4,
        hashes: hashes
            .iter()
            .enumerate()
            .map(|(i, h)| HashEntry {
                hash: (*h).to_string(),
                position: u32::try_from(i).unwrap_or(u32::MAX),
            })
            .collect(),
    }
}

/// Builds an artifact with fingerprint hashes only.
#[must_use]
pub fn artifact_with_hashes(attempt_id: &str, email: &str, hashes: &[&str]) -> Artifact {
    let mut artifact = bare_artifact(attempt_id, email);
    artifact.fingerprints = Some(fingerprints(hashes));
    artifact
}

/// Builds an artifact with normalised tokens only.
#[must_use]
pub fn artifact_with_tokens(attempt_id: &str, email: &str, tokens: &[&str]) -> Artifact {
    let mut artifact = bare_artifact(attempt_id, email);
    artifact.normalized_tokens = tokens.iter().map(|t| (*t).to_string()).collect();
    artifact
}

/// Builds an artifact with an AST only.
#[must_use]
pub fn artifact_with_ast(attempt_id: &str, email: &str, ast: AstNode) -> Artifact {
    let mut artifact = bare_artifact(attempt_id, email);
    artifact.ast = Some(ast);
    artifact
}

/// Builds an artifact with a CFG only.
#[must_use]
pub fn artifact_with_cfg(attempt_id: &str, email: &str, cfg: Cfg) -> Artifact {
    let mut artifact = bare_artifact(attempt_id, email);
    artifact.cfg = Some(cfg);
    artifact
}

/// Builds a CFG from node `(id, type)` pairs and edge `(from, to, type)`
/// triples.
#[must_use]
pub fn cfg(nodes: &[(&str, &str)], edges: &[(&str, &str, &str)]) -> Cfg {
    Cfg {
        nodes: nodes
            .iter()
            .map(|(id, node_type)| CfgNode {
                id: (*id).to_string(),
                node_type: (*node_type).to_string(),
                label: String::new(),
                line: None,
            })
            .collect(),
        edges: edges
            .iter()
            .map(|(from, to, edge_type)| CfgEdge {
                from: (*from).to_string(),
                to: (*to).to_string(),
                edge_type: (*edge_type).to_string(),
            })
            .collect(),
    }
}
