//! # kindred-core
//!
//! Core library for kindred, a plagiarism-analysis service for assessment
//! drives. Submissions are ingested from a durable consumer-group stream,
//! preprocessed into structured artifacts (token streams, AST, CFG, and
//! winnowed fingerprints) by a remote service, and analysed pairwise on
//! demand into per-candidate risk verdicts and a drive-level report.
//!
//! ## Architecture
//!
//! - **Ingestion**: [`stream`] (consumer-group protocol with pending-entry
//!   recovery and retention trimming), [`retry`] (exponential backoff with
//!   dead-letter escalation), [`preprocess`] (remote preprocessor client).
//! - **Analysis**: [`filter`] (inverted-index candidate filter),
//!   [`similarity`] (the four kernels), [`cascade`] (weighted
//!   short-circuit pipeline), [`scoring`] and [`aggregate`] (verdict
//!   reduction) over a [`pool`] of workers.
//! - **State**: [`store`] (artifacts, results, reports) and [`status`]
//!   (pipeline-step ledger), both behind injectable traits with bundled
//!   SQLite implementations.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::future::Future;
use std::pin::Pin;

pub mod aggregate;
pub mod cascade;
pub mod filter;
pub mod model;
pub mod pool;
pub mod preprocess;
pub mod retry;
pub mod scoring;
pub mod similarity;
pub mod status;
pub mod store;
pub mod stream;

#[cfg(test)]
pub mod testutil;

/// A boxed future for async trait methods.
///
/// Backend traits return boxed futures so implementations stay
/// object-safe and can be injected as trait objects.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use aggregate::Aggregator;
pub use pool::WorkerPool;
pub use stream::Consumer;
