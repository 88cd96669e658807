//! Data model for submissions, artifacts, and analysis results.
//!
//! These types mirror the wire and storage formats used across the pipeline:
//! submissions arrive on the ingestion stream as string field maps, artifacts
//! are the preprocessed persistent form, and candidate results / drive
//! reports are the analysis outputs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Question difficulty. Uniform for all artifacts in one `(drive, question)`
/// bucket; established upstream before ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// Easy question.
    Easy,
    /// Medium question.
    Medium,
    /// Hard question.
    Hard,
}

impl Difficulty {
    /// Numeric difficulty used by the drive-level risk formula.
    #[must_use]
    pub const fn as_factor(self) -> f64 {
        match self {
            Self::Easy => 0.33,
            Self::Medium => 0.66,
            Self::Hard => 1.0,
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Medium => write!(f, "medium"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

impl FromStr for Difficulty {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            other => Err(ParseFieldError::InvalidDifficulty(other.to_string())),
        }
    }
}

/// Pipeline step recorded in the status ledger for a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// No computation in flight.
    Idle,
    /// Computation accepted.
    Initiated,
    /// Artifacts loaded, analysis starting.
    Started,
    /// Submissions being preprocessed by the consumer.
    Preprocessing,
    /// Candidate-pair filtering in progress.
    Filtering,
    /// Pairwise cascade analysis in progress.
    DeepAnalysis,
    /// Results persisted.
    Completed,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initiated => "initiated",
            Self::Started => "started",
            Self::Preprocessing => "preprocessing",
            Self::Filtering => "filtering",
            Self::DeepAnalysis => "deep_analysis",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Step {
    type Err = ParseFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "initiated" => Ok(Self::Initiated),
            "started" => Ok(Self::Started),
            "preprocessing" => Ok(Self::Preprocessing),
            "filtering" => Ok(Self::Filtering),
            "deep_analysis" => Ok(Self::DeepAnalysis),
            "completed" => Ok(Self::Completed),
            other => Err(ParseFieldError::InvalidStep(other.to_string())),
        }
    }
}

/// Error raised when a stream message field cannot be interpreted.
#[derive(Debug, thiserror::Error)]
pub enum ParseFieldError {
    /// A required field was absent from the message.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The question id was not an integer.
    #[error("invalid qId: {0}")]
    InvalidQuestionId(String),

    /// The difficulty string was not one of easy/medium/hard.
    #[error("invalid difficulty: {0}")]
    InvalidDifficulty(String),

    /// The step string was not a known pipeline step.
    #[error("invalid step: {0}")]
    InvalidStep(String),
}

/// A submission as carried on the ingestion stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Globally unique attempt identifier.
    #[serde(rename = "attemptID")]
    pub attempt_id: String,

    /// Drive this submission belongs to.
    #[serde(rename = "driveId")]
    pub drive_id: String,

    /// Test identifier within the drive.
    #[serde(rename = "testId")]
    pub test_id: String,

    /// Candidate email.
    pub email: String,

    /// Question identifier.
    #[serde(rename = "qId")]
    pub q_id: i64,

    /// Programming language name.
    pub language: String,

    /// Language code used by the preprocessor.
    #[serde(rename = "langCode")]
    pub lang_code: String,

    /// Question difficulty.
    pub difficulty: Difficulty,

    /// Raw source code.
    #[serde(rename = "sourceCode")]
    pub source_code: String,
}

impl Submission {
    /// Parses a submission from the string field map of a stream message.
    ///
    /// # Errors
    ///
    /// Returns [`ParseFieldError`] if a required field is missing or
    /// malformed. Such messages are poison pills: the consumer acknowledges
    /// and drops them.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, ParseFieldError> {
        fn required<'a>(
            fields: &'a BTreeMap<String, String>,
            key: &'static str,
        ) -> Result<&'a str, ParseFieldError> {
            fields
                .get(key)
                .map(String::as_str)
                .ok_or(ParseFieldError::MissingField(key))
        }

        let q_id = required(fields, "qId")?;
        let q_id: i64 = q_id
            .parse()
            .map_err(|_| ParseFieldError::InvalidQuestionId(q_id.to_string()))?;
        let difficulty: Difficulty = required(fields, "difficulty")?.parse()?;

        Ok(Self {
            attempt_id: required(fields, "attemptID")?.to_string(),
            drive_id: required(fields, "driveId")?.to_string(),
            test_id: required(fields, "testId")?.to_string(),
            email: required(fields, "email")?.to_string(),
            q_id,
            language: required(fields, "language")?.to_string(),
            lang_code: required(fields, "langCode")?.to_string(),
            difficulty,
            source_code: required(fields, "sourceCode")?.to_string(),
        })
    }
}

/// A node of the abstract syntax tree returned by the preprocessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstNode {
    /// Node kind, e.g. `FunctionDeclaration`.
    #[serde(rename = "type")]
    pub node_type: String,

    /// Declared name, when the node kind carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Declared return type, when the node kind carries one.
    #[serde(rename = "returnType", skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,

    /// Child nodes, in source order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AstNode>,
}

impl AstNode {
    /// Creates a leaf node of the given kind.
    #[must_use]
    pub fn leaf(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            name: None,
            return_type: None,
            children: Vec::new(),
        }
    }

    /// Creates a node of the given kind with children.
    #[must_use]
    pub fn branch(node_type: impl Into<String>, children: Vec<AstNode>) -> Self {
        Self {
            node_type: node_type.into(),
            name: None,
            return_type: None,
            children,
        }
    }
}

/// A control-flow-graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgNode {
    /// Node identifier, unique within the graph.
    pub id: String,

    /// Node kind: `ENTRY`, `EXIT`, `BRANCH`, `CONDITIONAL`, ...
    #[serde(rename = "type")]
    pub node_type: String,

    /// Human-readable label.
    #[serde(default)]
    pub label: String,

    /// Source line, when known.
    #[serde(rename = "lineNumber", default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// A control-flow-graph edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgEdge {
    /// Source node id.
    pub from: String,

    /// Target node id.
    pub to: String,

    /// Edge kind: `BRANCH`, `CONDITIONAL`, `SEQUENTIAL`, ...
    #[serde(rename = "type")]
    pub edge_type: String,
}

/// A control flow graph returned by the preprocessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cfg {
    /// Graph nodes.
    pub nodes: Vec<CfgNode>,

    /// Graph edges.
    pub edges: Vec<CfgEdge>,
}

/// A single winnowed fingerprint hash with its token position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    /// Hash value, hex-encoded.
    pub hash: String,

    /// Position of the originating k-gram in the token stream.
    pub position: u32,
}

/// Locality-preserving fingerprints of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprints {
    /// Fingerprinting method, e.g. `winnowing`.
    pub method: String,

    /// k-gram size used.
    #[serde(rename = "kGramSize")]
    pub k_gram_size: u32,

    /// Winnowing window size used.
    #[serde(rename = "windowSize")]
    pub window_size: u32,

    /// Selected hashes.
    pub hashes: Vec<HashEntry>,
}

/// The preprocessed, persistent representation of one submission.
///
/// Created exactly once by the stream consumer after successful
/// preprocessing; never mutated afterwards. Keyed by
/// `(drive_id, attempt_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Candidate email.
    pub email: String,

    /// Globally unique attempt identifier.
    #[serde(rename = "attemptID")]
    pub attempt_id: String,

    /// Test identifier within the drive.
    #[serde(rename = "testId")]
    pub test_id: String,

    /// Drive this artifact belongs to.
    #[serde(rename = "driveId")]
    pub drive_id: String,

    /// Question difficulty.
    pub difficulty: Difficulty,

    /// Raw source code as submitted.
    #[serde(rename = "sourceCode")]
    pub source_code: String,

    /// Question identifier.
    #[serde(rename = "qId")]
    pub q_id: i64,

    /// Programming language name.
    pub language: String,

    /// Language code used by the preprocessor.
    #[serde(rename = "langCode")]
    pub lang_code: String,

    /// Lexical token stream.
    pub tokens: Vec<String>,

    /// Identifier-normalised token stream.
    #[serde(rename = "normalizedTokens")]
    pub normalized_tokens: Vec<String>,

    /// Abstract syntax tree, when the preprocessor produced one.
    pub ast: Option<AstNode>,

    /// Control flow graph, when the preprocessor produced one.
    pub cfg: Option<Cfg>,

    /// Winnowed fingerprints, when the preprocessor produced them.
    pub fingerprints: Option<Fingerprints>,

    /// Creation time.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Per-candidate risk verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateRisk {
    /// No meaningful similarity found.
    Clean,
    /// Some significant similarity.
    Suspicious,
    /// Strong similarity across one or more pairs.
    HighlySuspicious,
    /// Near-identical to at least one peer.
    NearCopy,
}

impl fmt::Display for CandidateRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Clean => "clean",
            Self::Suspicious => "suspicious",
            Self::HighlySuspicious => "highly_suspicious",
            Self::NearCopy => "near_copy",
        };
        write!(f, "{s}")
    }
}

/// Drive-level risk band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveRisk {
    /// Little or no plagiarism signal.
    Safe,
    /// Localised similarity.
    Moderate,
    /// Widespread similarity.
    High,
    /// Pervasive, high-confidence similarity.
    Critical,
}

impl fmt::Display for DriveRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Safe => "safe",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a candidate result or drive report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    /// Computation accepted, not yet finished.
    Pending,
    /// Computation finished and persisted.
    Completed,
    /// Computation aborted on an infrastructure fault.
    Failed,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Analysis outcome for one candidate within a drive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    /// Candidate email.
    pub email: String,

    /// A representative attempt id for the candidate.
    #[serde(rename = "attemptID")]
    pub attempt_id: String,

    /// Drive the result belongs to.
    #[serde(rename = "driveId")]
    pub drive_id: String,

    /// Risk verdict.
    pub risk: CandidateRisk,

    /// Questions with at least one significant pair for this candidate.
    #[serde(rename = "flagged_qns")]
    pub flagged_questions: Vec<String>,

    /// Question id to the set of peer attempt ids sharing a significant
    /// pair with this candidate.
    #[serde(rename = "plagiarism_peers")]
    pub plagiarism_peers: BTreeMap<String, Vec<String>>,

    /// Count of this candidate's significant pairs (final score >= 0.55).
    #[serde(rename = "code_similarity")]
    pub code_similarity: u64,

    /// Count of this candidate's pairs with final score >= 0.70.
    #[serde(rename = "algo_similarity")]
    pub algo_similarity: u64,

    /// Result lifecycle status.
    #[serde(rename = "plagiarism_status")]
    pub status: AnalysisStatus,

    /// Creation time.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl CandidateResult {
    /// Builds a completed clean result for a candidate with no significant
    /// pairs.
    #[must_use]
    pub fn clean(email: &str, attempt_id: &str, drive_id: &str) -> Self {
        Self {
            email: email.to_string(),
            attempt_id: attempt_id.to_string(),
            drive_id: drive_id.to_string(),
            risk: CandidateRisk::Clean,
            flagged_questions: Vec::new(),
            plagiarism_peers: BTreeMap::new(),
            code_similarity: 0,
            algo_similarity: 0,
            status: AnalysisStatus::Completed,
            created_at: Utc::now(),
        }
    }
}

/// Drive-level plagiarism report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    /// Drive the report belongs to.
    #[serde(rename = "driveId")]
    pub drive_id: String,

    /// Risk band; `None` while the report is pending.
    pub risk: Option<DriveRisk>,

    /// Report lifecycle status.
    pub status: AnalysisStatus,

    /// Questions flagged by at least one candidate pair.
    #[serde(rename = "flagged_qns")]
    pub flagged_questions: Vec<String>,

    /// Number of candidates with a non-clean verdict.
    #[serde(rename = "flagged_candidates")]
    pub flagged_candidates: u64,

    /// Number of candidates analysed.
    #[serde(rename = "total_analyzed")]
    pub total_analyzed: u64,

    /// Creation time.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl TestReport {
    /// Builds a pending report for a freshly accepted computation.
    #[must_use]
    pub fn pending(drive_id: &str) -> Self {
        Self {
            drive_id: drive_id.to_string(),
            risk: None,
            status: AnalysisStatus::Pending,
            flagged_questions: Vec::new(),
            flagged_candidates: 0,
            total_analyzed: 0,
            created_at: Utc::now(),
        }
    }

    /// Builds a completed safe report with no flagged questions.
    #[must_use]
    pub fn safe(drive_id: &str, total_analyzed: u64) -> Self {
        Self {
            drive_id: drive_id.to_string(),
            risk: Some(DriveRisk::Safe),
            status: AnalysisStatus::Completed,
            flagged_questions: Vec::new(),
            flagged_candidates: 0,
            total_analyzed,
            created_at: Utc::now(),
        }
    }
}

/// Payload produced by the external preprocessor for one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingData {
    /// Lexical token stream.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Identifier-normalised token stream.
    #[serde(rename = "normalizedTokens", default)]
    pub normalized_tokens: Vec<String>,

    /// Abstract syntax tree.
    pub ast: Option<AstNode>,

    /// Control flow graph.
    pub cfg: Option<Cfg>,

    /// Winnowed fingerprints.
    pub fingerprints: Option<Fingerprints>,
}

/// Successful response body of the preprocessor API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingResponse {
    /// Candidate email, echoed back.
    pub email: String,

    /// Attempt id, echoed back.
    #[serde(rename = "attemptId")]
    pub attempt_id: String,

    /// Test id, echoed back.
    #[serde(rename = "testId")]
    pub test_id: String,

    /// Language the preprocessor parsed the source as.
    pub language: String,

    /// The structured artifacts.
    pub preprocessing: PreprocessingData,
}

/// Error response body of the preprocessor API for invalid-input statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingError {
    /// Machine-readable error code.
    pub error: String,

    /// Human-readable message.
    pub message: String,
}
