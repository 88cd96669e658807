//! Consumer-group ingestion protocol.
//!
//! One long-running loop per process: read new messages, hand each
//! submission to the preprocessor through the retry engine, acknowledge on
//! success. Crash recovery rides on the pending-entry list: entries that
//! sit unacknowledged past an idle threshold are claimed and replayed, so
//! every message is processed at least once across consumer deaths.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::model::{Step, Submission};
use crate::preprocess::PreprocessService;
use crate::retry::{RetryEngine, RetryError};
use crate::status::StatusLedger;

use super::{MessageId, StreamBackend, StreamError, StreamMessage};

/// Hooks for counting consumer events; implemented by the daemon's metrics.
///
/// All methods default to no-ops so observers only implement what they
/// track.
pub trait ConsumerObserver: Send + Sync {
    /// A message was delivered to this consumer.
    fn message_received(&self) {}
    /// A message was acknowledged after successful preprocessing.
    fn message_acked(&self) {}
    /// A message exhausted its retries and was dead-lettered.
    fn message_dead_lettered(&self) {}
    /// A message failed to parse and was dropped (poison pill).
    fn parse_failure(&self) {}
    /// Idle pending entries were claimed from another consumer.
    fn entries_claimed(&self, count: usize) {
        let _ = count;
    }
}

/// Observer that counts nothing.
pub struct NoopObserver;

impl ConsumerObserver for NoopObserver {}

/// Consumer tuning. The defaults implement the ingestion protocol
/// contract; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream name, for logs.
    pub stream: String,

    /// Consumer group name.
    pub group: String,

    /// This consumer's unique name within the group.
    pub consumer: String,

    /// Maximum messages per group read.
    pub read_count: usize,

    /// Block timeout of a group read on a drained stream.
    pub block: Duration,

    /// How often the pending-entry list is checked for stuck messages.
    pub pel_recovery_interval: Duration,

    /// Minimum idle time before a pending entry may be claimed. Keeps
    /// consumers from stealing in-flight work from healthy peers.
    pub pel_min_idle: Duration,

    /// Maximum pending entries fetched per recovery pass.
    pub pel_batch: usize,

    /// How often the retention trimmer runs.
    pub cleanup_interval: Duration,

    /// How long messages are retained before trimming.
    pub retention: Duration,
}

impl ConsumerConfig {
    /// Builds a config with the standard protocol timings.
    #[must_use]
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        retention: Duration,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            read_count: 10,
            block: Duration::from_secs(1),
            pel_recovery_interval: Duration::from_secs(30),
            pel_min_idle: Duration::from_secs(60),
            pel_batch: 100,
            cleanup_interval: Duration::from_secs(60 * 60),
            retention,
        }
    }
}

/// Returns a unique consumer name: `consumer-<hostname>-<pid>-<uuid8>`.
#[must_use]
pub fn default_consumer_name() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "consumer-{hostname}-{}-{}",
        std::process::id(),
        &uuid[..8]
    )
}

/// The durable stream consumer.
pub struct Consumer {
    backend: Arc<dyn StreamBackend>,
    service: Arc<PreprocessService>,
    retry: RetryEngine,
    status: Arc<dyn StatusLedger>,
    observer: Arc<dyn ConsumerObserver>,
    config: ConsumerConfig,
    last_pel_check: Instant,
}

impl Consumer {
    /// Creates a consumer over the given backend and collaborators.
    #[must_use]
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        service: Arc<PreprocessService>,
        retry: RetryEngine,
        status: Arc<dyn StatusLedger>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            backend,
            service,
            retry,
            status,
            observer: Arc::new(NoopObserver),
            config,
            last_pel_check: Instant::now(),
        }
    }

    /// Attaches an observer for event counting.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ConsumerObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Runs the consume loop until `cancel` fires.
    ///
    /// On start: ensures the consumer group exists (an already-existing
    /// group is fine), recovers the pending-entry list once, and spawns the
    /// retention trimmer. Each loop iteration re-checks the pending list on
    /// its interval, then block-reads new messages.
    ///
    /// # Errors
    ///
    /// Transient stream errors are absorbed with a one-second pause; this
    /// only returns an error if the loop cannot continue at all.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), StreamError> {
        match self.backend.create_group(&self.config.group).await {
            Ok(()) => tracing::info!(
                stream = self.config.stream,
                group = self.config.group,
                "created consumer group (new messages only)"
            ),
            Err(StreamError::GroupExists { .. }) => {
                tracing::debug!(group = self.config.group, "consumer group already exists");
            },
            Err(error) => {
                tracing::warn!(%error, "failed to create consumer group");
            },
        }

        tracing::info!(consumer = self.config.consumer, "recovering pending entries on startup");
        if let Err(error) = self.recover_pel(&cancel).await {
            tracing::warn!(%error, "startup pending-entry recovery failed");
        }
        self.last_pel_check = Instant::now();

        let trimmer = tokio::spawn(run_retention_trimmer(
            Arc::clone(&self.backend),
            self.config.retention,
            self.config.cleanup_interval,
            cancel.clone(),
        ));
        tracing::info!(
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "retention trimmer started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.last_pel_check.elapsed() >= self.config.pel_recovery_interval {
                if let Err(error) = self.recover_pel(&cancel).await {
                    tracing::warn!(%error, "pending-entry recovery failed");
                }
                self.last_pel_check = Instant::now();
            }

            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = self.backend.read_group(
                    &self.config.group,
                    &self.config.consumer,
                    self.config.read_count,
                    self.config.block,
                ) => read,
            };

            match read {
                Ok(messages) => {
                    for message in messages {
                        self.process_message(&message, &cancel).await;
                        // Stop after the in-flight message on cancel; the
                        // rest ages into the pending list for recovery.
                        if cancel.is_cancelled() {
                            break;
                        }
                    }
                },
                Err(error) => {
                    tracing::error!(%error, "error reading from stream");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                },
            }
        }

        tracing::info!(consumer = self.config.consumer, "consumer stopping");
        let _ = trimmer.await;
        Ok(())
    }

    /// Recovers stuck messages from the pending-entry list.
    ///
    /// Fetches a batch of pending entries, claims the ones idle past the
    /// threshold, and replays them through the normal processing path.
    /// Claiming is idempotent per message id, so racing consumers cannot
    /// double-claim.
    async fn recover_pel(&self, cancel: &CancellationToken) -> Result<(), StreamError> {
        let pending = self
            .backend
            .pending(&self.config.group, self.config.pel_batch)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = pending.len(), "found pending entries");

        let claimable: Vec<MessageId> = pending
            .iter()
            .filter(|entry| entry.idle >= self.config.pel_min_idle)
            .map(|entry| entry.id)
            .collect();
        if claimable.is_empty() {
            return Ok(());
        }
        tracing::info!(claimable = claimable.len(), "claiming idle pending entries");

        let claimed = self
            .backend
            .claim(
                &self.config.group,
                &self.config.consumer,
                self.config.pel_min_idle,
                &claimable,
            )
            .await?;
        if claimed.is_empty() {
            return Ok(());
        }

        tracing::info!(claimed = claimed.len(), "processing claimed entries");
        self.observer.entries_claimed(claimed.len());

        for message in claimed {
            if cancel.is_cancelled() {
                break;
            }
            self.process_message(&message, cancel).await;
        }

        Ok(())
    }

    /// Processes one delivered message end to end.
    ///
    /// Parse failures are poison pills: acknowledged and dropped so they
    /// cannot wedge the stream. Preprocessing runs through the retry
    /// engine; the message is acknowledged after success, or after its
    /// envelope has been durably dead-lettered. A failed dead-letter write
    /// leaves the message pending for the next recovery pass.
    async fn process_message(&self, message: &StreamMessage, cancel: &CancellationToken) {
        self.observer.message_received();

        let submission = match Submission::from_fields(&message.fields) {
            Ok(submission) => submission,
            Err(error) => {
                tracing::warn!(
                    message_id = %message.id,
                    %error,
                    "failed to parse submission, acknowledging poison pill"
                );
                self.observer.parse_failure();
                self.ack(message.id).await;
                return;
            },
        };

        if let Err(error) = self
            .status
            .update(&submission.drive_id, Step::Preprocessing)
            .await
        {
            tracing::warn!(%error, drive_id = submission.drive_id, "status update failed");
        }

        let message_id = message.id.to_string();
        let outcome = self
            .retry
            .retry_with_backoff(
                || self.service.process(&submission),
                &message_id,
                &message.fields,
                cancel,
            )
            .await;

        match outcome {
            Ok(()) => {
                self.ack(message.id).await;
                self.observer.message_acked();
            },
            Err(RetryError::Cancelled) => {
                tracing::debug!(
                    message_id = %message.id,
                    "processing cancelled; message stays pending"
                );
            },
            Err(RetryError::Exhausted { .. }) => {
                // The envelope is durably dead-lettered; acknowledge so the
                // pending list stops re-delivering it.
                self.ack(message.id).await;
                self.observer.message_dead_lettered();
            },
            Err(RetryError::DeadLetterFailed(error)) => {
                tracing::error!(
                    message_id = %message.id,
                    %error,
                    "dead-letter write failed; leaving message pending"
                );
            },
        }
    }

    async fn ack(&self, id: MessageId) {
        if let Err(error) = self.backend.ack(&self.config.group, id).await {
            tracing::error!(message_id = %id, %error, "failed to acknowledge message");
        } else {
            tracing::debug!(message_id = %id, "message acknowledged");
        }
    }
}

/// Periodically trims messages older than the retention window.
async fn run_retention_trimmer(
    backend: Arc<dyn StreamBackend>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    trim_once(backend.as_ref(), retention).await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("retention trimmer stopping");
                return;
            }
            () = tokio::time::sleep(interval) => {
                trim_once(backend.as_ref(), retention).await;
            }
        }
    }
}

async fn trim_once(backend: &dyn StreamBackend, retention: Duration) {
    let retention =
        chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));
    let cutoff_ms = (Utc::now() - retention).timestamp_millis().max(0);

    #[allow(clippy::cast_sign_loss)] // clamped non-negative above
    match backend.trim_before(MessageId::at_ms(cutoff_ms as u64)).await {
        Ok(0) => {},
        Ok(trimmed) => tracing::debug!(trimmed, "trimmed messages past retention"),
        Err(error) => tracing::error!(%error, "failed to trim stream"),
    }
}
