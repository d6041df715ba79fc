//! galrip core library
//!
//! This library provides the core pipeline for bulk-downloading images from
//! a paginated remote gallery: resilient fetching with bounded retry and
//! per-host rate limiting, a durable deduplication ledger for resumable
//! runs, and a fixed-size worker pool with crash-safe file placement.
//!
//! # Architecture
//!
//! - [`listing`] - Lazy, restartable enumeration of downloadable items
//! - [`ledger`] - Durable record of already-fetched identifiers
//! - [`fetch`] - HTTP client, retry governor, rate limiter, worker pool
//! - [`report`] - Outcome aggregation and run summary
//! - [`run`] - Pipeline orchestration
//!
//! Command-line parsing, credential loading, and logging setup are owned by
//! callers; the library consumes plain configuration values via
//! [`RunConfig`].

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod fetch;
pub mod ledger;
pub mod listing;
pub mod report;
pub mod run;

// Re-export commonly used types
pub use config::RunConfig;
pub use fetch::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, FailureType, FetchError, FetchPool, HttpClient,
    PoolError, RateLimiter, RetryDecision, RetryPolicy, classify_error,
};
pub use ledger::{Ledger, LedgerEntry, LedgerError, LedgerStatus};
pub use listing::{
    HttpGallerySource, ItemDescriptor, ItemSource, Lister, ListingError, ListingPage,
};
pub use report::{FetchOutcome, OutcomeStatus, RunSummary};
pub use run::{RunError, run, run_with_cancel};
