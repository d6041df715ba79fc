//! Run configuration consumed as plain values from the caller.
//!
//! galrip has no CLI or config-file layer of its own; whatever front-end
//! drives it supplies these values directly.

use std::path::PathBuf;
use std::time::Duration;

use crate::fetch::{DEFAULT_CONCURRENCY, RetryPolicy};

/// Default minimum spacing between requests to the same host.
pub const DEFAULT_RATE_LIMIT: Duration = Duration::from_millis(500);

/// Default bound on retries of a single listing-page fetch.
pub const DEFAULT_PAGE_RETRY_LIMIT: u32 = 3;

/// Configuration for one pipeline run.
///
/// Constructed with [`RunConfig::new`] and adjusted field-by-field; all
/// fields are public plain values.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Directory all downloaded files (and the ledger) are written under.
    /// No filesystem writes occur outside it.
    pub output_dir: PathBuf,

    /// Number of fetch workers. Validated by the pool (1-64).
    pub concurrency: usize,

    /// Retry/backoff policy applied to each item fetch.
    pub retry_policy: RetryPolicy,

    /// Minimum spacing between requests to the same host.
    /// `Duration::ZERO` disables rate limiting.
    pub rate_limit: Duration,

    /// When set, identifiers already recorded as fetched are downloaded
    /// again instead of skipped.
    pub force_refetch: bool,

    /// How many times a single failed listing-page fetch is retried before
    /// the run is aborted with a listing error.
    pub page_retry_limit: u32,
}

impl RunConfig {
    /// Creates a configuration with defaults for everything but the output
    /// directory.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            concurrency: DEFAULT_CONCURRENCY,
            retry_policy: RetryPolicy::default(),
            rate_limit: DEFAULT_RATE_LIMIT,
            force_refetch: false,
            page_retry_limit: DEFAULT_PAGE_RETRY_LIMIT,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::new("/tmp/out");
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.rate_limit, DEFAULT_RATE_LIMIT);
        assert!(!config.force_refetch);
        assert_eq!(config.page_retry_limit, DEFAULT_PAGE_RETRY_LIMIT);
    }
}
