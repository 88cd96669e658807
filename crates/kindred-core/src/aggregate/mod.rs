//! Drive-level computation: filter, cascade, and verdict reduction.
//!
//! `compute` loads every artifact of a drive, buckets them by question and
//! language, surfaces candidate pairs through the inverted-index filter,
//! fans the cascade out over the worker pool, and reduces the surviving
//! pair similarities into per-candidate results and a drive report.


use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::cascade::run_cascade;
use crate::filter::{build_index, pair_key, worthy_pairs, Pair};
use crate::model::{
    AnalysisStatus, Artifact, CandidateResult, CandidateRisk, Step, TestReport,
};
use crate::pool::{PoolError, WorkerPool};
use crate::scoring::{
    candidate_risk, candidate_score, drive_risk, PairSimilarity, ALGORITHMIC_THRESHOLD,
    SIGNIFICANT_THRESHOLD,
};
use crate::status::StatusLedger;
use crate::store::{ArtifactStore, ResultStore, StoreError};

/// Errors raised by a drive computation.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// The drive has no artifacts.
    #[error("no artifacts found for drive {drive_id}")]
    NoArtifacts {
        /// The empty drive.
        drive_id: String,
    },

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The worker pool rejected a job.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The computation was cancelled before completion. Nothing was
    /// persisted; the drive's report stays pending for a re-trigger.
    #[error("computation cancelled for drive {drive_id}")]
    Cancelled {
        /// The interrupted drive.
        drive_id: String,
    },
}

/// Drive-level analysis orchestrator.
pub struct Aggregator {
    artifacts: Arc<dyn ArtifactStore>,
    results: Arc<dyn ResultStore>,
    status: Arc<dyn StatusLedger>,
    pool: Arc<WorkerPool>,
    /// Threaded through from configuration; pairs are currently submitted
    /// one-by-one regardless.
    batch_size: usize,
}

impl Aggregator {
    /// Creates an aggregator over the injected collaborators.
    #[must_use]
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        results: Arc<dyn ResultStore>,
        status: Arc<dyn StatusLedger>,
        pool: Arc<WorkerPool>,
        batch_size: usize,
    ) -> Self {
        Self {
            artifacts,
            results,
            status,
            pool,
            batch_size,
        }
    }

    /// Computes the plagiarism verdicts for a drive.
    ///
    /// Persists one [`CandidateResult`] per candidate and transitions the
    /// drive's report to completed. On cancellation nothing is persisted
    /// and the pending report is left for the caller to re-trigger; on
    /// store failure the caller marks the report failed.
    ///
    /// # Errors
    ///
    /// See [`ComputeError`].
    pub async fn compute(
        &self,
        drive_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ComputeError> {
        self.update_status(drive_id, Step::Started).await;

        let artifacts: Vec<Arc<Artifact>> = self
            .artifacts
            .artifacts_by_drive(drive_id)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        if artifacts.is_empty() {
            return Err(ComputeError::NoArtifacts {
                drive_id: drive_id.to_string(),
            });
        }

        let candidates = unique_candidates(&artifacts);
        if candidates.len() == 1 {
            tracing::debug!(drive_id, "single candidate, nothing to compare");
            let artifact = &artifacts[0];
            self.results
                .insert_candidate_result(&CandidateResult::clean(
                    &artifact.email,
                    &artifact.attempt_id,
                    drive_id,
                ))
                .await?;
            self.results
                .upsert_report(&TestReport::safe(drive_id, 1))
                .await?;
            self.update_status(drive_id, Step::Completed).await;
            return Ok(());
        }

        self.update_status(drive_id, Step::Filtering).await;
        let buckets = group_by_question_and_language(&artifacts);

        self.update_status(drive_id, Step::DeepAnalysis).await;
        let significant = self.analyse_buckets(drive_id, &buckets, cancel).await?;

        if significant.is_empty() {
            tracing::info!(drive_id, "no significant pairs in drive");
            return self.persist_all_clean(drive_id, &candidates).await;
        }

        self.persist_verdicts(drive_id, &artifacts, &candidates, &significant)
            .await?;
        self.update_status(drive_id, Step::Completed).await;
        Ok(())
    }

    /// Runs filter and cascade over every bucket, returning the significant
    /// pairs of the whole drive.
    async fn analyse_buckets(
        &self,
        drive_id: &str,
        buckets: &BTreeMap<(i64, String), Vec<Arc<Artifact>>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PairSimilarity>, ComputeError> {
        let mut significant = Vec::new();

        for ((q_id, language), bucket) in buckets {
            if bucket.len() < 2 {
                continue;
            }

            let index = build_index(bucket);
            if index.is_empty() {
                tracing::info!(drive_id, q_id, language, "no shared hashes in bucket");
                continue;
            }

            let difficulty = bucket[0].difficulty;
            let pairs = worthy_pairs(&index, bucket, difficulty);
            if pairs.is_empty() {
                tracing::info!(drive_id, q_id, language, "no pairs above overlap threshold");
                continue;
            }

            tracing::debug!(
                drive_id,
                q_id,
                language,
                pairs = pairs.len(),
                batch_size = self.batch_size,
                "running cascade over bucket"
            );
            let similarities = self
                .process_pairs(drive_id, *q_id, difficulty, pairs, cancel)
                .await?;

            significant.extend(similarities.into_iter().filter(PairSimilarity::is_significant));
        }

        Ok(significant)
    }

    /// Fans the cascade out over the pool and collects every pair's result.
    async fn process_pairs(
        &self,
        drive_id: &str,
        q_id: i64,
        difficulty: crate::model::Difficulty,
        pairs: Vec<Pair>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PairSimilarity>, ComputeError> {
        let expected = pairs.len();
        let (result_tx, mut result_rx) = tokio::sync::mpsc::unbounded_channel();

        for pair in pairs {
            let result_tx = result_tx.clone();
            let q_id = q_id.to_string();
            self.pool
                .submit(Box::new(move |job_cancel| {
                    if job_cancel.is_cancelled() {
                        return;
                    }
                    let outcome = run_cascade(&pair.a, &pair.b, difficulty);
                    let _ = result_tx.send(PairSimilarity {
                        a: pair.a,
                        b: pair.b,
                        final_score: outcome.final_score,
                        q_id,
                        difficulty,
                    });
                }))
                .await?;
        }
        drop(result_tx);

        // Completion order is arbitrary; de-duplicate by the sorted pair
        // key and stop once every submitted pair reported (or the channel
        // closed because jobs were skipped under cancellation).
        let mut collected: HashMap<String, PairSimilarity> = HashMap::new();
        while collected.len() < expected {
            let received = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(ComputeError::Cancelled {
                        drive_id: drive_id.to_string(),
                    });
                }
                received = result_rx.recv() => received,
            };
            match received {
                Some(similarity) => {
                    let key = pair_key(&similarity.a.attempt_id, &similarity.b.attempt_id);
                    collected.insert(key, similarity);
                },
                None => break,
            }
        }

        if cancel.is_cancelled() {
            return Err(ComputeError::Cancelled {
                drive_id: drive_id.to_string(),
            });
        }

        Ok(collected.into_values().collect())
    }

    /// Writes clean results for every candidate and a safe drive report.
    async fn persist_all_clean(
        &self,
        drive_id: &str,
        candidates: &BTreeMap<String, Arc<Artifact>>,
    ) -> Result<(), ComputeError> {
        for artifact in candidates.values() {
            self.results
                .insert_candidate_result(&CandidateResult::clean(
                    &artifact.email,
                    &artifact.attempt_id,
                    drive_id,
                ))
                .await?;
        }
        self.results
            .upsert_report(&TestReport::safe(drive_id, candidates.len() as u64))
            .await?;
        self.update_status(drive_id, Step::Completed).await;
        Ok(())
    }

    /// Reduces significant pairs into candidate results and a drive report.
    async fn persist_verdicts(
        &self,
        drive_id: &str,
        artifacts: &[Arc<Artifact>],
        candidates: &BTreeMap<String, Arc<Artifact>>,
        significant: &[PairSimilarity],
    ) -> Result<(), ComputeError> {
        // Index significant pairs by both endpoint emails.
        let mut pairs_by_email: HashMap<&str, Vec<&PairSimilarity>> = HashMap::new();
        for pair in significant {
            pairs_by_email.entry(&pair.a.email).or_default().push(pair);
            pairs_by_email.entry(&pair.b.email).or_default().push(pair);
        }

        let mut drive_flagged: BTreeSet<String> = BTreeSet::new();
        let mut flagged_candidates = 0_u64;

        for (email, artifact) in candidates {
            let Some(pairs) = pairs_by_email.get(email.as_str()) else {
                self.results
                    .insert_candidate_result(&CandidateResult::clean(
                        email,
                        &artifact.attempt_id,
                        drive_id,
                    ))
                    .await?;
                continue;
            };

            let owned: Vec<PairSimilarity> = pairs.iter().map(|p| (*p).clone()).collect();
            let score = candidate_score(email, &owned);
            let risk = candidate_risk(score);

            let mut flagged: BTreeSet<String> = BTreeSet::new();
            let mut peers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            let mut code_similarity = 0_u64;
            let mut algo_similarity = 0_u64;

            for pair in &owned {
                flagged.insert(pair.q_id.clone());
                drive_flagged.insert(pair.q_id.clone());
                peers
                    .entry(pair.q_id.clone())
                    .or_default()
                    .insert(pair.peer_attempt_id(email).to_string());

                if pair.final_score >= SIGNIFICANT_THRESHOLD {
                    code_similarity += 1;
                }
                if pair.final_score >= ALGORITHMIC_THRESHOLD {
                    algo_similarity += 1;
                }
            }

            if risk != CandidateRisk::Clean {
                flagged_candidates += 1;
            }

            let result = CandidateResult {
                email: email.clone(),
                attempt_id: artifact.attempt_id.clone(),
                drive_id: drive_id.to_string(),
                risk,
                flagged_questions: flagged.into_iter().collect(),
                plagiarism_peers: peers
                    .into_iter()
                    .map(|(q_id, attempt_ids)| (q_id, attempt_ids.into_iter().collect()))
                    .collect(),
                code_similarity,
                algo_similarity,
                status: AnalysisStatus::Completed,
                created_at: Utc::now(),
            };
            self.results.insert_candidate_result(&result).await?;
        }

        // Drive report.
        let total_questions = artifacts
            .iter()
            .map(|artifact| artifact.q_id)
            .collect::<BTreeSet<_>>()
            .len();
        #[allow(clippy::cast_precision_loss)]
        let avg_difficulty = artifacts
            .iter()
            .map(|artifact| artifact.difficulty.as_factor())
            .sum::<f64>()
            / artifacts.len() as f64;
        #[allow(clippy::cast_precision_loss)]
        let avg_similarity = significant
            .iter()
            .map(|pair| pair.final_score)
            .sum::<f64>()
            / significant.len() as f64;

        let assessment = drive_risk(
            total_questions,
            avg_difficulty,
            avg_similarity,
            drive_flagged.len(),
        );
        tracing::info!(
            drive_id,
            risk = assessment.risk,
            level = %assessment.level,
            reserved_threshold = assessment.reserved_threshold,
            flagged_candidates,
            "drive analysis complete"
        );

        let report = TestReport {
            drive_id: drive_id.to_string(),
            risk: Some(assessment.level),
            status: AnalysisStatus::Completed,
            flagged_questions: drive_flagged.into_iter().collect(),
            flagged_candidates,
            total_analyzed: candidates.len() as u64,
            created_at: Utc::now(),
        };
        self.results.upsert_report(&report).await?;

        Ok(())
    }

    /// Status writes are best-effort; failures never fail the computation.
    async fn update_status(&self, drive_id: &str, step: Step) {
        if let Err(error) = self.status.update(drive_id, step).await {
            tracing::warn!(drive_id, %step, %error, "status update failed");
        }
    }
}

/// One representative artifact per candidate email, in stable order.
fn unique_candidates(artifacts: &[Arc<Artifact>]) -> BTreeMap<String, Arc<Artifact>> {
    let mut candidates = BTreeMap::new();
    for artifact in artifacts {
        candidates
            .entry(artifact.email.clone())
            .or_insert_with(|| Arc::clone(artifact));
    }
    candidates
}

/// Buckets artifacts by `(question, language)`.
fn group_by_question_and_language(
    artifacts: &[Arc<Artifact>],
) -> BTreeMap<(i64, String), Vec<Arc<Artifact>>> {
    let mut buckets: BTreeMap<(i64, String), Vec<Arc<Artifact>>> = BTreeMap::new();
    for artifact in artifacts {
        buckets
            .entry((artifact.q_id, artifact.language.clone()))
            .or_default()
            .push(Arc::clone(artifact));
    }
    buckets
}
