//! Durable submission stream: consumer-group semantics over an append-only
//! message log.
//!
//! The [`StreamBackend`] trait captures the primitives the ingestion
//! pipeline needs from a consumer-group stream: append, group creation with
//! a new-messages-only starting position, group reads, the pending-entry
//! list, claiming idle entries, acknowledgement, and retention trimming by
//! minimum id. [`SqliteStreamBackend`] is the bundled durable
//! implementation; the consumer protocol in [`consumer`] is written purely
//! against the trait.
//!
//! Message ids keep the `<ms>-<seq>` shape: milliseconds since the Unix
//! epoch plus a per-millisecond sequence, monotonic across appends.

mod consumer;
mod storage;


pub use consumer::{
    default_consumer_name, Consumer, ConsumerConfig, ConsumerObserver, NoopObserver,
};
pub use storage::SqliteStreamBackend;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BoxFuture;

/// Errors raised by stream operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StreamError {
    /// Database error from the backing store.
    #[error("stream database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A message payload could not be (de)serialized.
    #[error("stream serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The consumer group already exists on this stream.
    #[error("consumer group already exists: {group}")]
    GroupExists {
        /// The existing group name.
        group: String,
    },

    /// The consumer group does not exist on this stream.
    #[error("unknown consumer group: {group}")]
    UnknownGroup {
        /// The missing group name.
        group: String,
    },

    /// A message id string did not match `<ms>-<seq>`.
    #[error("malformed message id: {0}")]
    MalformedId(String),
}

/// Stream-assigned message identifier: `<ms>-<seq>`.
///
/// Ordered by milliseconds, then sequence, matching append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    /// Milliseconds since the Unix epoch at append time.
    pub ms: u64,
    /// Sequence number within the millisecond.
    pub seq: u64,
}

impl MessageId {
    /// The smallest possible id.
    pub const ZERO: Self = Self { ms: 0, seq: 0 };

    /// Builds an id marking the start of a millisecond, for trim cutoffs.
    #[must_use]
    pub const fn at_ms(ms: u64) -> Self {
        Self { ms, seq: 0 }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| StreamError::MalformedId(s.to_string()))?;
        let ms = ms
            .parse()
            .map_err(|_| StreamError::MalformedId(s.to_string()))?;
        let seq = seq
            .parse()
            .map_err(|_| StreamError::MalformedId(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

/// A message delivered from the stream.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    /// Stream-assigned id.
    pub id: MessageId,
    /// String-valued field map.
    pub fields: BTreeMap<String, String>,
}

/// A delivered-but-unacknowledged entry in a group's pending-entry list.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Message id.
    pub id: MessageId,
    /// Consumer the message is currently assigned to.
    pub consumer: String,
    /// Time since the last delivery to that consumer.
    pub idle: Duration,
    /// Number of deliveries so far.
    pub delivery_count: u64,
}

/// An envelope parked on the dead-letter list after retry exhaustion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Id of the failed message.
    #[serde(rename = "messageID")]
    pub message_id: String,

    /// The raw field map of the failed message.
    pub envelope: BTreeMap<String, String>,

    /// Rendered final error.
    #[serde(rename = "lastError")]
    pub last_error: String,

    /// When the envelope was parked.
    pub timestamp: DateTime<Utc>,
}

/// Sink for envelopes that exhausted their retries.
pub trait DeadLetterSink: Send + Sync {
    /// Durably records a dead letter.
    ///
    /// # Errors
    ///
    /// Returns an error if the letter cannot be recorded; the caller must
    /// then leave the originating message unacknowledged.
    fn push<'a>(&'a self, letter: &'a DeadLetter) -> BoxFuture<'a, Result<(), StreamError>>;
}

/// The consumer-group stream primitives the ingestion pipeline consumes.
///
/// Object-safe; all methods return [`BoxFuture`] so implementations can be
/// injected as `Arc<dyn StreamBackend>`.
pub trait StreamBackend: Send + Sync {
    /// Appends a message, returning its assigned id. Ids are strictly
    /// increasing across appends.
    fn append<'a>(
        &'a self,
        fields: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<MessageId, StreamError>>;

    /// Creates a consumer group positioned after the current tail, so only
    /// messages appended later are delivered to it.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::GroupExists`] if the group is already present;
    /// callers treat that as success.
    fn create_group<'a>(&'a self, group: &'a str) -> BoxFuture<'a, Result<(), StreamError>>;

    /// Reads up to `count` new messages for `consumer`, blocking up to
    /// `block` when the stream is drained. Delivered messages enter the
    /// group's pending-entry list until acknowledged.
    fn read_group<'a>(
        &'a self,
        group: &'a str,
        consumer: &'a str,
        count: usize,
        block: Duration,
    ) -> BoxFuture<'a, Result<Vec<StreamMessage>, StreamError>>;

    /// Lists up to `count` pending entries of the group, oldest first.
    fn pending<'a>(
        &'a self,
        group: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<PendingEntry>, StreamError>>;

    /// Claims the given pending entries for `consumer`, provided they have
    /// been idle at least `min_idle`. Returns the claimed messages; entries
    /// whose message has been trimmed are dropped from the pending list and
    /// skipped. Claiming is idempotent per message id.
    fn claim<'a>(
        &'a self,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        ids: &'a [MessageId],
    ) -> BoxFuture<'a, Result<Vec<StreamMessage>, StreamError>>;

    /// Acknowledges a message for the group, removing it from the pending
    /// list. Acknowledging an unknown id is a no-op.
    fn ack<'a>(&'a self, group: &'a str, id: MessageId)
        -> BoxFuture<'a, Result<(), StreamError>>;

    /// Removes all messages with ids strictly below `min_id`, returning how
    /// many were removed.
    fn trim_before<'a>(&'a self, min_id: MessageId) -> BoxFuture<'a, Result<u64, StreamError>>;
}
