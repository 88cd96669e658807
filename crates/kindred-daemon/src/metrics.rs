//! Prometheus metrics for ingestion and computation health.
//!
//! Exposed in text format at `GET /metrics`:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `kindred_messages_received_total` | counter | Stream messages delivered |
//! | `kindred_messages_acked_total` | counter | Messages acknowledged after preprocessing |
//! | `kindred_messages_dead_lettered_total` | counter | Envelopes parked after retry exhaustion |
//! | `kindred_parse_failures_total` | counter | Poison-pill messages dropped |
//! | `kindred_entries_claimed_total` | counter | Pending entries claimed from dead consumers |
//! | `kindred_computations_total` | counter vec | Drive computations by outcome |
//! | `kindred_computations_active` | gauge | Drive computations in flight |

use std::sync::Arc;

use kindred_core::stream::ConsumerObserver;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Errors raised during metrics registration or encoding.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// A collector could not be registered or rendered.
    #[error("metrics error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// All daemon metrics plus their registry.
pub struct Metrics {
    registry: Registry,

    messages_received: IntCounter,
    messages_acked: IntCounter,
    messages_dead_lettered: IntCounter,
    parse_failures: IntCounter,
    entries_claimed: IntCounter,

    computations: IntCounterVec,
    computations_active: IntGauge,
}

/// Shared handle to the daemon metrics.
pub type SharedMetrics = Arc<Metrics>;

impl Metrics {
    /// Creates and registers all metric families.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector cannot be registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let messages_received = IntCounter::with_opts(Opts::new(
            "kindred_messages_received_total",
            "Stream messages delivered to this consumer",
        ))?;
        let messages_acked = IntCounter::with_opts(Opts::new(
            "kindred_messages_acked_total",
            "Messages acknowledged after successful preprocessing",
        ))?;
        let messages_dead_lettered = IntCounter::with_opts(Opts::new(
            "kindred_messages_dead_lettered_total",
            "Envelopes parked on the dead-letter list",
        ))?;
        let parse_failures = IntCounter::with_opts(Opts::new(
            "kindred_parse_failures_total",
            "Malformed messages acknowledged and dropped",
        ))?;
        let entries_claimed = IntCounter::with_opts(Opts::new(
            "kindred_entries_claimed_total",
            "Pending entries claimed from idle consumers",
        ))?;
        let computations = IntCounterVec::new(
            Opts::new(
                "kindred_computations_total",
                "Drive computations by outcome",
            ),
            &["outcome"],
        )?;
        let computations_active = IntGauge::with_opts(Opts::new(
            "kindred_computations_active",
            "Drive computations currently in flight",
        ))?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_acked.clone()))?;
        registry.register(Box::new(messages_dead_lettered.clone()))?;
        registry.register(Box::new(parse_failures.clone()))?;
        registry.register(Box::new(entries_claimed.clone()))?;
        registry.register(Box::new(computations.clone()))?;
        registry.register(Box::new(computations_active.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            messages_acked,
            messages_dead_lettered,
            parse_failures,
            entries_claimed,
            computations,
            computations_active,
        })
    }

    /// Renders all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Records a computation entering flight.
    pub fn computation_started(&self) {
        self.computations_active.inc();
    }

    /// Records a computation leaving flight with an outcome label.
    pub fn computation_finished(&self, outcome: &str) {
        self.computations_active.dec();
        self.computations.with_label_values(&[outcome]).inc();
    }
}

impl ConsumerObserver for Metrics {
    fn message_received(&self) {
        self.messages_received.inc();
    }

    fn message_acked(&self) {
        self.messages_acked.inc();
    }

    fn message_dead_lettered(&self) {
        self.messages_dead_lettered.inc();
    }

    fn parse_failure(&self) {
        self.parse_failures.inc();
    }

    fn entries_claimed(&self, count: usize) {
        self.entries_claimed.inc_by(count as u64);
    }
}
