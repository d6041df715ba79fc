//! Item enumeration: lazy, restartable pagination over a remote source.
//!
//! A source exposes one narrow capability: given a cursor, produce the
//! next page of item descriptors and the cursor after it. [`Lister`]
//! drives that capability into a bounded channel, retrying individual
//! failed page fetches without restarting the whole listing.

mod gallery;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use gallery::HttpGallerySource;

/// One downloadable item, immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    /// Identifier unique within the source; keys the dedup ledger and
    /// names the output file.
    pub identifier: String,
    /// Where the item's bytes live.
    pub remote_url: String,
    /// Expected size in bytes, when the listing reports one.
    pub expected_size: Option<u64>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    /// Items on this page, in listing order.
    pub items: Vec<ItemDescriptor>,
    /// Cursor for the page after this one; `None` means the listing is
    /// complete.
    pub next_cursor: Option<String>,
}

/// Errors raised while enumerating a source.
///
/// Any of these surfacing out of [`Lister::stream_into`] aborts the run
/// for that source.
#[derive(Debug, Error)]
pub enum ListingError {
    /// Network-level failure fetching a listing page.
    #[error("network error listing {url}: {source}")]
    Network {
        /// The listing-page URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// A listing-page request timed out.
    #[error("timeout listing {url}")]
    Timeout {
        /// The listing-page URL that timed out.
        url: String,
    },

    /// The listing endpoint returned an error status.
    #[error("HTTP {status} listing {url}")]
    HttpStatus {
        /// The listing-page URL.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The listing page body could not be decoded.
    #[error("cannot decode listing page {url}: {source}")]
    Decode {
        /// The listing-page URL.
        url: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The source identifier cannot form a valid listing URL.
    #[error("invalid source identifier: {source_id}")]
    InvalidSource {
        /// The offending source identifier.
        source_id: String,
    },
}

impl ListingError {
    /// Whether retrying the same page fetch could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Decode { .. } | Self::InvalidSource { .. } => false,
        }
    }
}

/// Capability for enumerating a remote collection page by page.
///
/// Restartable: `next_page(Some(cursor))` resumes from wherever a prior
/// listing left off, independent of any concurrency model.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Identifier of the collection being listed, for logging.
    fn source_id(&self) -> &str;

    /// Fetches the page at `cursor` (`None` = first page).
    async fn next_page(&self, cursor: Option<&str>) -> Result<ListingPage, ListingError>;
}

/// Base delay between retries of a single listing-page fetch.
const PAGE_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Drives an [`ItemSource`] through its pages, feeding descriptors into a
/// channel.
///
/// A transiently failing page fetch is retried in place up to the
/// configured bound; the listing never restarts from the beginning.
#[derive(Debug)]
pub struct Lister {
    page_retry_limit: u32,
}

impl Lister {
    /// Creates a lister with the given per-page retry bound.
    #[must_use]
    pub fn new(page_retry_limit: u32) -> Self {
        Self { page_retry_limit }
    }

    /// Streams every item from `start_cursor` onward into `tx`, bumping
    /// `listed` as items are produced (for progress reporting).
    ///
    /// Stops early, without error, when `cancel` fires or the receiving
    /// side of `tx` is dropped. Returns the number of items produced.
    ///
    /// # Errors
    ///
    /// Returns [`ListingError`] once a page fetch fails permanently or
    /// exhausts its retries.
    #[instrument(skip_all, fields(source_id = source.source_id()))]
    pub async fn stream_into(
        &self,
        source: &dyn ItemSource,
        start_cursor: Option<String>,
        tx: mpsc::Sender<ItemDescriptor>,
        cancel: &CancellationToken,
        listed: &AtomicU64,
    ) -> Result<u64, ListingError> {
        let mut cursor = start_cursor;
        let mut produced: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                info!(produced, "listing cancelled");
                return Ok(produced);
            }

            let page = self
                .fetch_page_with_retry(source, cursor.as_deref(), cancel)
                .await?;
            debug!(
                items = page.items.len(),
                has_next = page.next_cursor.is_some(),
                "listing page fetched"
            );

            for item in page.items {
                listed.fetch_add(1, Ordering::Relaxed);
                produced += 1;
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(produced, "listing cancelled");
                        return Ok(produced);
                    }
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            // All workers gone; nothing left to feed.
                            debug!(produced, "item channel closed, stopping listing");
                            return Ok(produced);
                        }
                    }
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    info!(produced, "listing complete");
                    return Ok(produced);
                }
            }
        }
    }

    /// Fetches one page, retrying transient failures with doubling delay.
    async fn fetch_page_with_retry(
        &self,
        source: &dyn ItemSource,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ListingPage, ListingError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match source.next_page(cursor).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt <= self.page_retry_limit => {
                    let delay = PAGE_RETRY_BASE_DELAY * 2_u32.saturating_pow(attempt - 1);
                    warn!(
                        cursor = cursor.unwrap_or("<start>"),
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "listing page fetch failed, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(e),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(
                        cursor = cursor.unwrap_or("<start>"),
                        attempt,
                        error = %e,
                        "listing page fetch failed permanently"
                    );
                    return Err(e);
                }
            }
        }
    }
}
