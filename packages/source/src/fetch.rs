//! Downloading source files into local staging.
//!
//! The [`Fetch`] trait is the seam the run coordinator talks to;
//! [`HttpFetcher`] is the real implementation. Each attempt streams the
//! response body straight to the staging path, truncating whatever a
//! previous failed attempt left behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use energy_usage_config::FetchSettings;
use energy_usage_models::SourceFile;
use tokio::io::AsyncWriteExt as _;

use crate::{FetchError, retry};

/// A file downloaded to local staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    /// Where the body was written.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes: u64,
}

/// Retrieves one remote file into a local path.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Downloads `file` to `dest`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] once the failure is permanent or the retry
    /// budget is spent.
    async fn fetch(&self, file: &SourceFile, dest: &Path) -> Result<FetchedFile, FetchError>;
}

/// Downloads over HTTP(S) with retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    settings: FetchSettings,
}

impl HttpFetcher {
    /// Creates a fetcher with the given retry and timeout settings.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Http`] if the HTTP client cannot be built.
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    /// One GET, streamed to `dest`. Returns the number of bytes written.
    async fn attempt(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_owned(),
            });
        }

        let mut out = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;

        Ok(written)
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, file: &SourceFile, dest: &Path) -> Result<FetchedFile, FetchError> {
        let url = file.url();
        if reqwest::Url::parse(&url).is_err() {
            return Err(FetchError::InvalidUrl { url });
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.attempt(&url, dest).await {
                Ok(bytes) => {
                    log::info!("Fetched {url} ({bytes} bytes) to {}", dest.display());
                    return Ok(FetchedFile {
                        path: dest.to_path_buf(),
                        bytes,
                    });
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = retry::backoff_delay(self.settings.backoff_base, attempt);
                    log::warn!(
                        "Fetch of {url} failed (attempt {attempt}/{max_attempts}): {e}, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("Fetch of {url} failed after {attempt} attempt(s): {e}");
                    return Err(e);
                }
            }
        }
    }
}
