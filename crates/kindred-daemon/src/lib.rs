//! # kindred-daemon
//!
//! Service binary wiring for kindred: configuration, HTTP surface,
//! metrics, and process lifecycle around the core ingestion and analysis
//! pipeline.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod http;
pub mod metrics;
