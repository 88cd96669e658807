//! SQLite-backed store for artifacts, results, and reports.
//!
//! Rows carry identity columns for indexing plus the full record as a JSON
//! payload, so the schema stays stable as the record types grow.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{Artifact, CandidateResult, TestReport};
use crate::BoxFuture;

use super::{ArtifactStore, ResultStore, StoreError};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// The bundled persistence adapter.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates the analysis database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn insert_artifact_sync(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let payload = serde_json::to_string(artifact)?;
        let conn = self.lock();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO plagiarism_artifacts
                 (drive_id, attempt_id, q_id, email, language, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                artifact.drive_id,
                artifact.attempt_id,
                artifact.q_id,
                artifact.email,
                artifact.language,
                payload,
                artifact.created_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            return Err(StoreError::DuplicateArtifact {
                drive_id: artifact.drive_id.clone(),
                attempt_id: artifact.attempt_id.clone(),
            });
        }
        Ok(())
    }

    fn artifacts_by_drive_sync(&self, drive_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT payload FROM plagiarism_artifacts
             WHERE drive_id = ?1
             ORDER BY attempt_id ASC",
        )?;
        let payloads = stmt
            .query_map(params![drive_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(StoreError::from))
            .collect()
    }

    fn count_by_drive_sync(&self, drive_id: &str) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM plagiarism_artifacts WHERE drive_id = ?1",
            params![drive_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn insert_candidate_result_sync(&self, result: &CandidateResult) -> Result<(), StoreError> {
        let payload = serde_json::to_string(result)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO results (drive_id, email, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                result.drive_id,
                result.email,
                payload,
                result.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn candidate_results_by_drive_sync(
        &self,
        drive_id: &str,
    ) -> Result<Vec<CandidateResult>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT payload FROM results
             WHERE drive_id = ?1
             ORDER BY created_at DESC, id DESC",
        )?;
        let payloads = stmt
            .query_map(params![drive_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(StoreError::from))
            .collect()
    }

    fn upsert_report_sync(&self, report: &TestReport) -> Result<(), StoreError> {
        let payload = serde_json::to_string(report)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO plagiarism_reports (drive_id, payload, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (drive_id) DO UPDATE SET payload = excluded.payload",
            params![report.drive_id, payload, report.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn report_by_drive_sync(&self, drive_id: &str) -> Result<Option<TestReport>, StoreError> {
        let conn = self.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM plagiarism_reports WHERE drive_id = ?1",
                params![drive_id],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|payload| serde_json::from_str(&payload).map_err(StoreError::from))
            .transpose()
    }
}

impl ArtifactStore for SqliteStore {
    fn insert_artifact<'a>(
        &'a self,
        artifact: &'a Artifact,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { self.insert_artifact_sync(artifact) })
    }

    fn artifacts_by_drive<'a>(
        &'a self,
        drive_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Artifact>, StoreError>> {
        Box::pin(async move { self.artifacts_by_drive_sync(drive_id) })
    }

    fn count_by_drive<'a>(&'a self, drive_id: &'a str) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move { self.count_by_drive_sync(drive_id) })
    }
}

impl ResultStore for SqliteStore {
    fn insert_candidate_result<'a>(
        &'a self,
        result: &'a CandidateResult,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { self.insert_candidate_result_sync(result) })
    }

    fn candidate_results_by_drive<'a>(
        &'a self,
        drive_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<CandidateResult>, StoreError>> {
        Box::pin(async move { self.candidate_results_by_drive_sync(drive_id) })
    }

    fn upsert_report<'a>(
        &'a self,
        report: &'a TestReport,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { self.upsert_report_sync(report) })
    }

    fn report_by_drive<'a>(
        &'a self,
        drive_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<TestReport>, StoreError>> {
        Box::pin(async move { self.report_by_drive_sync(drive_id) })
    }
}
