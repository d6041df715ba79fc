//! HTTP client for streaming item downloads.
//!
//! Every transfer lands in a `*.part` temporary next to its final path and
//! is renamed into place only after the byte count checks out, so a
//! partial file is never visible under a final name no matter how the
//! process dies.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, RETRY_AFTER};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};
use url::Url;

use super::error::FetchError;
use super::filename::{PART_SUFFIX, filename_for};
use crate::listing::ItemDescriptor;

/// Default HTTP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (covers large images on slow hosts).
const READ_TIMEOUT_SECS: u64 = 300;

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/galrip/galrip";

/// Default User-Agent identifying the tool.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("galrip/{version} (bulk-gallery-fetcher; +{PROJECT_UA_URL})")
}

/// A completed transfer.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    /// Final path of the downloaded file.
    pub path: PathBuf,
    /// Bytes written to it.
    pub bytes_written: u64,
}

/// HTTP client for item transfers. Create once, clone freely; clones share
/// the underlying connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration, which should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeout values (seconds).
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the supplied
    /// configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(default_user_agent())
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Fetches one item into `output_dir`.
    ///
    /// Streams the body to `<name>.part`, verifies the size against the
    /// descriptor's `expected_size` (or the response Content-Length), then
    /// atomically renames to the final name. The temporary is removed on
    /// any failure.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for invalid URLs, network/timeout failures,
    /// non-success HTTP statuses, filesystem errors, or size mismatches.
    #[instrument(skip(self, item, output_dir), fields(identifier = %item.identifier, url = %item.remote_url))]
    pub async fn fetch_item(
        &self,
        item: &ItemDescriptor,
        output_dir: &Path,
    ) -> Result<FetchedFile, FetchError> {
        debug!("starting fetch");

        // Validate before touching the network
        Url::parse(&item.remote_url)
            .map_err(|_| FetchError::invalid_url(item.remote_url.clone()))?;

        let final_path = output_dir.join(filename_for(item));
        let part_path = part_path_for(&final_path);

        let response = self.send_get(&item.remote_url).await?;
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let bytes_written =
            match stream_to_part(response, &item.remote_url, &part_path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    remove_quietly(&part_path).await;
                    return Err(e);
                }
            };

        // The listing's size hint wins; fall back to what the server claimed
        if let Some(expected) = item.expected_size.or(content_length)
            && expected != bytes_written
        {
            remove_quietly(&part_path).await;
            return Err(FetchError::integrity(part_path, expected, bytes_written));
        }

        if let Err(e) = tokio::fs::rename(&part_path, &final_path).await {
            remove_quietly(&part_path).await;
            return Err(FetchError::io(final_path, e));
        }

        info!(
            path = %final_path.display(),
            bytes = bytes_written,
            "fetch complete"
        );

        Ok(FetchedFile {
            path: final_path,
            bytes_written,
        })
    }

    async fn send_get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(url)
            } else {
                FetchError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(FetchError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

/// Temporary-file path for a final output path.
fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Streams the response body into the part file, returning bytes written.
/// The file is flushed and synced before returning so the subsequent
/// rename publishes complete data.
async fn stream_to_part(
    response: reqwest::Response,
    url: &str,
    part_path: &Path,
) -> Result<u64, FetchError> {
    let file = File::create(part_path)
        .await
        .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(url)
            } else {
                FetchError::network(url, e)
            }
        })?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| FetchError::io(part_path.to_path_buf(), e))?;

    Ok(bytes_written)
}

/// Best-effort removal of a temporary file.
async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "could not remove temporary file");
    }
}
