//! Preprocessor client and submission-to-artifact service.
//!
//! The external preprocessor turns raw source into the structured payloads
//! the similarity engine consumes (tokens, AST, CFG, fingerprints). The
//! client deliberately sets no request timeout: bounding and abandoning the
//! call is the retry engine's job.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::model::{
    Artifact, PreprocessingError, PreprocessingResponse, Submission,
};
use crate::store::{ArtifactStore, StoreError};
use crate::BoxFuture;

/// Request body sent to the preprocessor.
#[derive(Debug, Clone, Serialize)]
pub struct PreprocessRequest {
    /// Candidate email.
    pub email: String,

    /// Attempt id.
    #[serde(rename = "attemptId")]
    pub attempt_id: String,

    /// Drive id.
    #[serde(rename = "driveId")]
    pub drive_id: String,

    /// Test id.
    #[serde(rename = "testId")]
    pub test_id: String,

    /// Raw source code.
    #[serde(rename = "sourceCode")]
    pub source_code: String,

    /// Programming language name.
    pub language: String,
}

impl PreprocessRequest {
    /// Builds the request for a submission.
    #[must_use]
    pub fn from_submission(submission: &Submission) -> Self {
        Self {
            email: submission.email.clone(),
            attempt_id: submission.attempt_id.clone(),
            drive_id: submission.drive_id.clone(),
            test_id: submission.test_id.clone(),
            source_code: submission.source_code.clone(),
            language: submission.language.clone(),
        }
    }
}

/// Errors raised while preprocessing a submission.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PreprocessError {
    /// The preprocessor rejected the input (HTTP 400, 415, or 422).
    ///
    /// Permanent for this message: retrying cannot fix the input. The retry
    /// engine still exhausts its attempts before dead-lettering, which is
    /// acceptable.
    #[error("preprocessor rejected input ({status}): {error} - {message}")]
    InvalidInput {
        /// HTTP status returned.
        status: u16,
        /// Machine-readable error code from the response body.
        error: String,
        /// Human-readable message from the response body.
        message: String,
    },

    /// The preprocessor returned an unexpected status. Transient.
    #[error("preprocessor returned status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status returned.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The request could not be executed. Transient.
    #[error("preprocessor transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A 200 response body did not match the expected shape.
    #[error("preprocessor response decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The produced artifact could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PreprocessError {
    /// Whether retrying this message can ever succeed.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidInput { .. })
    }
}

/// The preprocessor call the ingestion pipeline depends on.
pub trait Preprocessor: Send + Sync {
    /// Preprocesses one submission into structured payloads.
    fn preprocess<'a>(
        &'a self,
        request: &'a PreprocessRequest,
    ) -> BoxFuture<'a, Result<PreprocessingResponse, PreprocessError>>;
}

/// HTTP client for the remote preprocessing service.
pub struct HttpPreprocessor {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpPreprocessor {
    /// Creates a client against `base_url`, authenticating with `api_key`.
    ///
    /// No client-side timeout is configured; the retry engine and process
    /// cancellation bound the call.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Preprocessor for HttpPreprocessor {
    fn preprocess<'a>(
        &'a self,
        request: &'a PreprocessRequest,
    ) -> BoxFuture<'a, Result<PreprocessingResponse, PreprocessError>> {
        Box::pin(async move {
            let url = format!("{}/api/v1/preprocess", self.base_url);

            let mut builder = self.client.post(&url).json(request);
            if !self.api_key.is_empty() {
                builder = builder.header("x-api-key", &self.api_key);
            }

            let response = builder.send().await?;
            let status = response.status();
            let body = response.text().await?;

            match status.as_u16() {
                200 => serde_json::from_str(&body).map_err(PreprocessError::Decode),
                code @ (400 | 415 | 422) => {
                    let detail: PreprocessingError =
                        serde_json::from_str(&body).unwrap_or(PreprocessingError {
                            error: "unparseable_error".to_string(),
                            message: body,
                        });
                    Err(PreprocessError::InvalidInput {
                        status: code,
                        error: detail.error,
                        message: detail.message,
                    })
                },
                code => Err(PreprocessError::UnexpectedStatus { status: code, body }),
            }
        })
    }
}

/// Turns submissions into persisted artifacts.
pub struct PreprocessService {
    client: Arc<dyn Preprocessor>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl PreprocessService {
    /// Creates the service over a preprocessor client and an artifact store.
    #[must_use]
    pub fn new(client: Arc<dyn Preprocessor>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { client, artifacts }
    }

    /// Preprocesses one submission and persists the resulting artifact.
    ///
    /// The preprocessing payload is copied verbatim; submission identity
    /// fields fill the rest of the artifact.
    ///
    /// # Errors
    ///
    /// Returns a [`PreprocessError`] when the remote call or the store
    /// write fails; the caller routes it through the retry engine.
    pub async fn process(&self, submission: &Submission) -> Result<(), PreprocessError> {
        let request = PreprocessRequest::from_submission(submission);
        let response = self.client.preprocess(&request).await?;

        let artifact = Artifact {
            email: response.email,
            attempt_id: response.attempt_id,
            test_id: submission.test_id.clone(),
            drive_id: submission.drive_id.clone(),
            difficulty: submission.difficulty,
            source_code: submission.source_code.clone(),
            q_id: submission.q_id,
            language: response.language,
            lang_code: submission.lang_code.clone(),
            tokens: response.preprocessing.tokens,
            normalized_tokens: response.preprocessing.normalized_tokens,
            ast: response.preprocessing.ast,
            cfg: response.preprocessing.cfg,
            fingerprints: response.preprocessing.fingerprints,
            created_at: Utc::now(),
        };

        self.artifacts.insert_artifact(&artifact).await?;

        tracing::debug!(
            attempt_id = artifact.attempt_id,
            drive_id = artifact.drive_id,
            tokens = artifact.tokens.len(),
            "artifact stored"
        );

        Ok(())
    }
}

/// Test double: a preprocessor producing deterministic payloads locally.
///
/// Mirrors the shape of the real service closely enough for pipeline tests:
/// tokens are whitespace-split source, normalised tokens lowercase them,
/// and fingerprints hash consecutive token k-grams.
pub struct StubPreprocessor;

impl Preprocessor for StubPreprocessor {
    fn preprocess<'a>(
        &'a self,
        request: &'a PreprocessRequest,
    ) -> BoxFuture<'a, Result<PreprocessingResponse, PreprocessError>> {
        use sha2::{Digest, Sha256};

        Box::pin(async move {
            let tokens: Vec<String> = request
                .source_code
                .split_whitespace()
                .map(ToString::to_string)
                .collect();
            let normalized: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();

            let hashes = normalized
                .windows(3)
                .enumerate()
                .map(|(position, gram)| crate::model::HashEntry {
                    hash: hex::encode(Sha256::digest(gram.join(" ").as_bytes())),
                    position: u32::try_from(position).unwrap_or(u32::MAX),
                })
                .collect();

            Ok(PreprocessingResponse {
                email: request.email.clone(),
                attempt_id: request.attempt_id.clone(),
                test_id: request.test_id.clone(),
                language: request.language.clone(),
                preprocessing: crate::model::PreprocessingData {
                    tokens,
                    normalized_tokens: normalized,
                    ast: None,
                    cfg: None,
                    fingerprints: Some(crate::model::Fingerprints {
                        method: "winnowing".to_string(),
                        k_gram_size: 3,
                        window_size: 1,
                        hashes,
                    }),
                },
            })
        })
    }
}

/// A map form of the submission fields, for dead-letter envelopes.
#[must_use]
pub fn submission_envelope(submission: &Submission) -> BTreeMap<String, String> {
    [
        ("attemptID", submission.attempt_id.clone()),
        ("driveId", submission.drive_id.clone()),
        ("testId", submission.test_id.clone()),
        ("email", submission.email.clone()),
        ("qId", submission.q_id.to_string()),
        ("language", submission.language.clone()),
        ("langCode", submission.lang_code.clone()),
        ("difficulty", submission.difficulty.to_string()),
        ("sourceCode", submission.source_code.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
