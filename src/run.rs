//! Pipeline orchestration: wire the lister, worker pool, and aggregator
//! together for one run against one source.
//!
//! Listing and fetching run concurrently; the aggregator alone writes the
//! ledger. A listing failure aborts enumeration but already-queued items
//! still drain through the pool, so partial progress is kept.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::RunConfig;
use crate::fetch::{FetchPool, HttpClient, PART_SUFFIX, PoolError, RateLimiter};
use crate::ledger::{Ledger, LedgerError};
use crate::listing::{ItemSource, Lister, ListingError};
use crate::report::{self, RunSummary};

/// Errors that abort a run.
///
/// Individual item failures never surface here; they are counted in the
/// [`RunSummary`].
#[derive(Debug, Error)]
pub enum RunError {
    /// Enumeration failed past its retry bound.
    #[error("listing failed: {0}")]
    Listing(#[from] ListingError),

    /// The ledger could not be opened, read, or written.
    #[error("ledger failure: {0}")]
    Storage(#[from] LedgerError),

    /// The pool configuration was rejected.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The aggregator task died.
    #[error("aggregator task failed: {0}")]
    Internal(#[from] tokio::task::JoinError),
}

/// Runs the full pipeline for `source` with a fresh cancellation token.
///
/// # Errors
///
/// See [`RunError`]. A completed run with failed items still returns
/// `Ok`; check [`RunSummary::is_success`].
pub async fn run(source: &dyn ItemSource, config: &RunConfig) -> Result<RunSummary, RunError> {
    run_with_cancel(source, config, CancellationToken::new()).await
}

/// Runs the full pipeline, stopping early when `cancel` fires.
///
/// On cancellation the listing stops, queued items are abandoned, and
/// in-flight fetches finish their current attempt without being recorded.
/// The summary covers everything resolved before the stop.
///
/// # Errors
///
/// See [`RunError`].
#[instrument(skip_all, fields(source_id = source.source_id(), output_dir = %config.output_dir.display()))]
pub async fn run_with_cancel(
    source: &dyn ItemSource,
    config: &RunConfig,
    cancel: CancellationToken,
) -> Result<RunSummary, RunError> {
    let ledger = Ledger::open(&config.output_dir).await?;
    remove_stale_parts(&config.output_dir).await;

    let pool = FetchPool::new(
        config.concurrency,
        config.retry_policy.clone(),
        Arc::new(RateLimiter::new(config.rate_limit)),
        config.force_refetch,
    )?;
    let client = HttpClient::new();
    let lister = Lister::new(config.page_retry_limit);

    // Small channel: the listing stays only a little ahead of the workers
    let (item_tx, item_rx) = mpsc::channel(config.concurrency.max(1) * 2);
    let (outcome_tx, outcome_rx) = mpsc::channel(config.concurrency.max(1) * 2);

    let listed = Arc::new(AtomicU64::new(0));
    let aggregator = tokio::spawn(report::aggregate(
        outcome_rx,
        ledger.clone(),
        Arc::clone(&listed),
    ));

    // Listing and fetching borrow from this scope, so they run joined
    // here rather than spawned; only the aggregator owns its state.
    let (listing_result, pool_result) = tokio::join!(
        lister.stream_into(source, None, item_tx, &cancel, &listed),
        pool.process(
            &client,
            &ledger,
            &config.output_dir,
            item_rx,
            outcome_tx,
            cancel.clone(),
        ),
    );

    let aggregated = aggregator.await;
    ledger.close().await;

    pool_result?;
    let summary = aggregated??;

    match listing_result {
        Ok(produced) => {
            info!(
                listed = produced,
                resolved = summary.total(),
                "run finished"
            );
            Ok(summary)
        }
        // Queued items drained above; the listing failure still aborts
        Err(e) => Err(RunError::Listing(e)),
    }
}

/// Best-effort cleanup of temporaries left by a previous crash. Files
/// under their final names are never touched.
async fn remove_stale_parts(output_dir: &Path) {
    let mut entries = match tokio::fs::read_dir(output_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %output_dir.display(), error = %e, "cannot scan for stale temporaries");
            return;
        }
    };

    let mut removed: u64 = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let is_part = name.to_str().is_some_and(|n| n.ends_with(PART_SUFFIX));
        if !is_part {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                removed += 1;
                debug!(path = %entry.path().display(), "removed stale temporary");
            }
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot remove stale temporary");
            }
        }
    }

    if removed > 0 {
        info!(removed, "cleaned up stale temporaries from a previous run");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::listing::ListingPage;

    struct EmptySource;

    #[async_trait]
    impl ItemSource for EmptySource {
        fn source_id(&self) -> &str {
            "empty"
        }

        async fn next_page(&self, _cursor: Option<&str>) -> Result<ListingPage, ListingError> {
            Ok(ListingPage::default())
        }
    }

    #[tokio::test]
    async fn test_run_over_empty_source() {
        let temp_dir = TempDir::new().unwrap();
        let config = RunConfig::new(temp_dir.path());

        let summary = run(&EmptySource, &config).await.unwrap();

        assert_eq!(summary, RunSummary::default());
        assert!(summary.is_success());
        assert!(temp_dir.path().join(crate::ledger::LEDGER_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_invalid_concurrency_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = RunConfig::new(temp_dir.path());
        config.concurrency = 0;

        let result = run(&EmptySource, &config).await;
        assert!(matches!(result, Err(RunError::Pool(_))));
    }

    #[tokio::test]
    async fn test_stale_parts_removed_final_files_kept() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("half.jpg.part"), b"partial").unwrap();
        std::fs::write(temp_dir.path().join("whole.jpg"), b"complete").unwrap();

        remove_stale_parts(temp_dir.path()).await;

        assert!(!temp_dir.path().join("half.jpg.part").exists());
        assert!(temp_dir.path().join("whole.jpg").exists());
    }
}
