//! Status ledger: the externally visible pipeline step per drive.
//!
//! Each drive's current step is written at phase boundaries so operators
//! and upstream services can poll progress. Entries expire 12 hours after
//! the last write. Ledger failures are never allowed to fail the pipeline;
//! callers log and move on.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::model::Step;
use crate::BoxFuture;

/// Key prefix for ledger entries.
pub const KEY_PREFIX: &str = "plagiarism_report_status:";

/// How long a status entry lives after its last write.
pub const STATUS_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Errors raised by status-ledger operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StatusError {
    /// The backing store rejected the write.
    #[error("status ledger backend error: {0}")]
    Backend(String),
}

/// Keyed store of per-drive pipeline steps with expiry.
///
/// Injected wherever phase boundaries are recorded; implementations must be
/// safe to call concurrently.
pub trait StatusLedger: Send + Sync {
    /// Records `step` for `drive_id`, refreshing the entry's expiry.
    fn update<'a>(
        &'a self,
        drive_id: &'a str,
        step: Step,
    ) -> BoxFuture<'a, Result<(), StatusError>>;

    /// Returns the current, unexpired step for `drive_id`.
    fn current<'a>(&'a self, drive_id: &'a str)
        -> BoxFuture<'a, Result<Option<Step>, StatusError>>;
}

/// In-memory status ledger: a swept map behind a reader-writer lock.
///
/// Expired entries are dropped lazily on read and in bulk by [`sweep`],
/// which the daemon drives from a single periodic task.
///
/// [`sweep`]: MemoryStatusLedger::sweep
pub struct MemoryStatusLedger {
    entries: RwLock<HashMap<String, (Step, Instant)>>,
    ttl: Duration,
}

impl MemoryStatusLedger {
    /// Creates a ledger with the standard 12-hour expiry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(STATUS_TTL)
    }

    /// Creates a ledger with a custom expiry.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, (_, written_at)| now.duration_since(*written_at) < self.ttl);
        before - entries.len()
    }

    /// Number of live entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the ledger holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStatusLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusLedger for MemoryStatusLedger {
    fn update<'a>(
        &'a self,
        drive_id: &'a str,
        step: Step,
    ) -> BoxFuture<'a, Result<(), StatusError>> {
        Box::pin(async move {
            let key = format!("{KEY_PREFIX}{drive_id}");
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            entries.insert(key, (step, Instant::now()));
            tracing::trace!(drive_id, %step, "status updated");
            Ok(())
        })
    }

    fn current<'a>(
        &'a self,
        drive_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Step>, StatusError>> {
        Box::pin(async move {
            let key = format!("{KEY_PREFIX}{drive_id}");
            let entries = self
                .entries
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let step = entries.get(&key).and_then(|(step, written_at)| {
                (written_at.elapsed() < self.ttl).then_some(*step)
            });
            Ok(step)
        })
    }
}
