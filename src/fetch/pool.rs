//! Fixed-size fetch worker pool.
//!
//! Spawns a configured number of workers that pull item descriptors from a
//! shared channel, consult the ledger, and drive each fetch through the
//! retry policy and rate limiter. Workers only read the ledger; all writes
//! happen in the aggregator, keyed off the outcomes the workers emit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::client::{FetchedFile, HttpClient};
use super::error::FetchError;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{RetryDecision, RetryPolicy, classify_error};
use crate::ledger::{Ledger, LedgerError};
use crate::listing::ItemDescriptor;
use crate::report::{FetchOutcome, OutcomeStatus};

/// Default worker count.
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Lower bound on worker count.
const MIN_CONCURRENCY: usize = 1;

/// Upper bound on worker count; beyond this the bottleneck is the remote
/// host, not local parallelism.
const MAX_CONCURRENCY: usize = 64;

/// Pool configuration errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Worker count outside the accepted range.
    #[error("concurrency must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}, got {value}")]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },
}

/// How one fetch (with retries) resolved.
enum FetchResolution {
    Done(FetchedFile),
    Failed { error: String, attempts: u32 },
    Cancelled,
}

/// Fixed-size pool of fetch workers.
#[derive(Debug)]
pub struct FetchPool {
    concurrency: usize,
    retry_policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    force_refetch: bool,
}

impl FetchPool {
    /// Creates a pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConcurrency`] if `concurrency` is
    /// outside `1..=64`.
    pub fn new(
        concurrency: usize,
        retry_policy: RetryPolicy,
        rate_limiter: Arc<RateLimiter>,
        force_refetch: bool,
    ) -> Result<Self, PoolError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(PoolError::InvalidConcurrency { value: concurrency });
        }

        Ok(Self {
            concurrency,
            retry_policy,
            rate_limiter,
            force_refetch,
        })
    }

    /// Returns the configured worker count.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Drains `items` to completion, emitting one outcome per resolved
    /// item on `outcomes`.
    ///
    /// Returns when the item channel closes and every in-flight fetch has
    /// resolved, or early once `cancel` fires (in-flight items finish
    /// their current attempt but emit no outcome).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if a ledger read fails; the token is
    /// cancelled first so remaining workers wind down.
    #[instrument(skip_all, fields(concurrency = self.concurrency))]
    pub async fn process(
        &self,
        client: &HttpClient,
        ledger: &Ledger,
        output_dir: &Path,
        items: mpsc::Receiver<ItemDescriptor>,
        outcomes: mpsc::Sender<FetchOutcome>,
        cancel: CancellationToken,
    ) -> Result<(), LedgerError> {
        let items = Arc::new(Mutex::new(items));
        let mut handles = Vec::with_capacity(self.concurrency);

        for worker_id in 0..self.concurrency {
            let worker = Worker {
                id: worker_id,
                client: client.clone(),
                ledger: ledger.clone(),
                output_dir: output_dir.to_path_buf(),
                retry_policy: self.retry_policy.clone(),
                rate_limiter: Arc::clone(&self.rate_limiter),
                force_refetch: self.force_refetch,
                items: Arc::clone(&items),
                outcomes: outcomes.clone(),
                cancel: cancel.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(outcomes);

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => warn!(error = %e, "fetch worker panicked"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// State owned by one spawned worker.
struct Worker {
    id: usize,
    client: HttpClient,
    ledger: Ledger,
    output_dir: PathBuf,
    retry_policy: RetryPolicy,
    rate_limiter: Arc<RateLimiter>,
    force_refetch: bool,
    items: Arc<Mutex<mpsc::Receiver<ItemDescriptor>>>,
    outcomes: mpsc::Sender<FetchOutcome>,
    cancel: CancellationToken,
}

impl Worker {
    #[instrument(skip(self), fields(worker_id = self.id))]
    async fn run(self) -> Result<(), LedgerError> {
        loop {
            if self.cancel.is_cancelled() {
                debug!("worker stopping on cancellation");
                return Ok(());
            }

            let item = {
                let mut items = self.items.lock().await;
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        debug!("worker stopping on cancellation");
                        return Ok(());
                    }
                    item = items.recv() => match item {
                        Some(item) => item,
                        None => {
                            debug!("item channel closed, worker done");
                            return Ok(());
                        }
                    },
                }
            };

            let already_fetched = if self.force_refetch {
                false
            } else {
                match self.ledger.has(&item.identifier).await {
                    Ok(found) => found,
                    Err(e) => {
                        // A broken ledger would silently lose dedup state;
                        // stop the whole run instead
                        self.cancel.cancel();
                        return Err(e);
                    }
                }
            };

            let outcome = if already_fetched {
                debug!(identifier = %item.identifier, "skipping already-fetched item");
                FetchOutcome {
                    identifier: item.identifier,
                    status: OutcomeStatus::SkippedDuplicate,
                    bytes_written: 0,
                    error: None,
                }
            } else {
                match self.fetch_with_retry(&item).await {
                    FetchResolution::Done(fetched) => FetchOutcome {
                        identifier: item.identifier,
                        status: OutcomeStatus::Downloaded,
                        bytes_written: fetched.bytes_written,
                        error: None,
                    },
                    FetchResolution::Failed { error, attempts } => {
                        warn!(
                            identifier = %item.identifier,
                            attempts,
                            error = %error,
                            "item exhausted its attempts"
                        );
                        FetchOutcome {
                            identifier: item.identifier,
                            status: OutcomeStatus::Failed,
                            bytes_written: 0,
                            error: Some(error),
                        }
                    }
                    FetchResolution::Cancelled => return Ok(()),
                }
            };

            if self.outcomes.send(outcome).await.is_err() {
                // Aggregator is gone; nothing left to report to
                return Ok(());
            }
        }
    }

    async fn fetch_with_retry(&self, item: &ItemDescriptor) -> FetchResolution {
        let mut attempt: u32 = 1;

        loop {
            self.rate_limiter.acquire(&item.remote_url).await;

            let error = match self.client.fetch_item(item, &self.output_dir).await {
                Ok(fetched) => return FetchResolution::Done(fetched),
                Err(e) => e,
            };

            let failure_type = classify_error(&error);

            // A server-supplied Retry-After overrides computed backoff
            let server_delay = match &error {
                FetchError::HttpStatus {
                    retry_after: Some(value),
                    ..
                } => parse_retry_after(value),
                _ => None,
            };

            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::DoNotRetry { reason } => {
                    debug!(
                        identifier = %item.identifier,
                        attempt,
                        reason = %reason,
                        "not retrying"
                    );
                    return FetchResolution::Failed {
                        error: error.to_string(),
                        attempts: attempt,
                    };
                }
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    let delay = match server_delay {
                        Some(mandated) => {
                            self.rate_limiter.record_retry_after(&item.remote_url, mandated);
                            mandated
                        }
                        None => delay,
                    };

                    warn!(
                        identifier = %item.identifier,
                        attempt,
                        next_attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "fetch failed, retrying"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => return FetchResolution::Cancelled,
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = next_attempt;
                }
            }
        }
    }
}
