//! Persistence adapter: artifacts, candidate results, and drive reports.
//!
//! The pipeline consumes storage through the [`ArtifactStore`] and
//! [`ResultStore`] traits; [`SqliteStore`] is the bundled implementation,
//! keeping all three collections in one transactional database.

mod storage;

pub use storage::SqliteStore;

use crate::model::{Artifact, CandidateResult, TestReport};
use crate::BoxFuture;

/// Errors raised by store operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from the backing store.
    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored payload could not be (de)serialized.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An artifact with the same `(drive_id, attempt_id)` already exists.
    #[error("duplicate artifact: drive {drive_id}, attempt {attempt_id}")]
    DuplicateArtifact {
        /// Drive id of the rejected artifact.
        drive_id: String,
        /// Attempt id of the rejected artifact.
        attempt_id: String,
    },
}

/// Store of preprocessed submission artifacts.
pub trait ArtifactStore: Send + Sync {
    /// Persists a new artifact.
    ///
    /// Artifacts are write-once; re-inserting the same
    /// `(drive_id, attempt_id)` is an error.
    fn insert_artifact<'a>(
        &'a self,
        artifact: &'a Artifact,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Loads every artifact of a drive.
    fn artifacts_by_drive<'a>(
        &'a self,
        drive_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Artifact>, StoreError>>;

    /// Counts the artifacts of a drive.
    fn count_by_drive<'a>(&'a self, drive_id: &'a str) -> BoxFuture<'a, Result<u64, StoreError>>;
}

/// Store of per-candidate results and drive reports.
pub trait ResultStore: Send + Sync {
    /// Persists a candidate result.
    fn insert_candidate_result<'a>(
        &'a self,
        result: &'a CandidateResult,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Loads every candidate result of a drive, newest first.
    fn candidate_results_by_drive<'a>(
        &'a self,
        drive_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<CandidateResult>, StoreError>>;

    /// Inserts or replaces the drive report. Reports are keyed by drive, so
    /// a pending report transitions in place to completed or failed.
    fn upsert_report<'a>(
        &'a self,
        report: &'a TestReport,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Loads the drive report, if any.
    fn report_by_drive<'a>(
        &'a self,
        drive_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<TestReport>, StoreError>>;
}
