//! Outcome aggregation and run summary.
//!
//! Workers send one [`FetchOutcome`] per resolved item; the aggregator is
//! the only place ledger writes happen, keeping the single-connection pool
//! uncontended and the ledger consistent with what was reported.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::ledger::{Ledger, LedgerError, LedgerStatus};

/// How often (in resolved items) a progress line is logged.
const PROGRESS_LOG_INTERVAL: u64 = 25;

/// Terminal status of one item in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Fetched and placed under its final name.
    Downloaded,

    /// Skipped because the ledger already records a success.
    SkippedDuplicate,

    /// All attempts failed.
    Failed,
}

/// Resolution of one item, produced by a fetch worker.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Stable item identifier from the listing.
    pub identifier: String,
    /// How the item resolved.
    pub status: OutcomeStatus,
    /// Bytes written for downloads; zero otherwise.
    pub bytes_written: u64,
    /// Final error text for failures.
    pub error: Option<String>,
}

/// Counts for a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Items fetched this run.
    pub downloaded: u64,
    /// Items skipped as already-fetched.
    pub skipped: u64,
    /// Items that exhausted their attempts.
    pub failed: u64,
}

impl RunSummary {
    /// Total items resolved this run.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.downloaded + self.skipped + self.failed
    }

    /// Whether every resolved item either downloaded or was a known
    /// duplicate.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Drains worker outcomes into the ledger and a [`RunSummary`].
///
/// Runs until every outcome sender is dropped. `listed` is the live count
/// of items the lister has emitted so far, used for progress lines.
pub(crate) async fn aggregate(
    mut outcomes: mpsc::Receiver<FetchOutcome>,
    ledger: Ledger,
    listed: Arc<AtomicU64>,
) -> Result<RunSummary, LedgerError> {
    let mut summary = RunSummary::default();

    while let Some(outcome) = outcomes.recv().await {
        match outcome.status {
            OutcomeStatus::Downloaded => {
                summary.downloaded += 1;
                ledger.record(&outcome.identifier, LedgerStatus::Success).await?;
            }
            OutcomeStatus::SkippedDuplicate => {
                summary.skipped += 1;
            }
            OutcomeStatus::Failed => {
                summary.failed += 1;
                warn!(
                    identifier = %outcome.identifier,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "item failed"
                );
                ledger.record(&outcome.identifier, LedgerStatus::Failed).await?;
            }
        }

        let resolved = summary.total();
        if resolved % PROGRESS_LOG_INTERVAL == 0 {
            info!(
                resolved,
                listed = listed.load(Ordering::Relaxed),
                downloaded = summary.downloaded,
                skipped = summary.skipped,
                failed = summary.failed,
                "progress"
            );
        }
    }

    info!(
        downloaded = summary.downloaded,
        skipped = summary.skipped,
        failed = summary.failed,
        "run complete"
    );

    Ok(summary)
}
