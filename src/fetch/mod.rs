//! Fetch layer: HTTP transfers, retry governance, rate limiting, and the
//! worker pool that drives them.
//!
//! [`FetchPool`] pulls items from the listing channel and runs each through
//! [`HttpClient::fetch_item`] under a [`RetryPolicy`], spacing requests per
//! host with a [`RateLimiter`]. Outcomes flow to the aggregator; this
//! module never touches the ledger's write path.

mod client;
mod error;
mod filename;
mod pool;
mod rate_limiter;
mod retry;

pub(crate) use client::default_user_agent;
pub use client::{FetchedFile, HttpClient};
pub use error::FetchError;
pub(crate) use filename::PART_SUFFIX;
pub use filename::filename_for;
pub use pool::{DEFAULT_CONCURRENCY, FetchPool, PoolError};
pub use rate_limiter::{RateLimiter, extract_host, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
};
