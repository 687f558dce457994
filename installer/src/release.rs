// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release listing and asset download
//!
//! Talks to the GitHub REST API. Only two endpoints are used: the release
//! descriptor (latest or by tag) and the asset's browser download URL.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::NamedArtifact;
use crate::config::{FetchConfig, SourceConfig};
use crate::error::{InstallError, Result};

/// A downloadable file attached to a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    /// File name as published
    pub name: String,

    /// Direct download URL
    #[serde(rename = "browser_download_url")]
    pub download_url: String,

    /// Size in bytes, when the API reports it
    #[serde(default)]
    pub size: u64,
}

impl ReleaseAsset {
    pub fn new(name: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            download_url: download_url.into(),
            size: 0,
        }
    }
}

impl NamedArtifact for ReleaseAsset {
    fn artifact_name(&self) -> &str {
        &self.name
    }
}

/// A release descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,

    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,

    #[serde(default)]
    pub html_url: Option<String>,
}

/// Something that publishes releases
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch the release for `tag`, or the latest one
    async fn release(&self, tag: Option<&str>) -> Result<Release>;

    /// Download `asset` to `dest`
    async fn download(&self, asset: &ReleaseAsset, dest: &Path) -> Result<()>;

    /// Human-readable origin for messages
    fn describe(&self) -> String;
}

/// Retry policy for transient fetch failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first failure
    pub retries: u32,
    /// Delay before the first retry; doubles afterwards
    pub backoff: Duration,
}

/// A single failed attempt
#[derive(Debug)]
pub struct FetchFailure {
    pub message: String,
    /// Whether another attempt might succeed
    pub transient: bool,
}

impl FetchFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl From<reqwest::Error> for FetchFailure {
    fn from(error: reqwest::Error) -> Self {
        let transient = match error.status() {
            Some(status) => {
                status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            None => error.is_timeout() || error.is_connect() || error.is_request() || error.is_body(),
        };
        Self {
            message: error.to_string(),
            transient,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            retries: config.retries,
            backoff: config.backoff(),
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out
    pub async fn run<T, F, Fut>(&self, url: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, FetchFailure>>,
    {
        let mut delay = self.backoff;
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(failure) if failure.transient && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        url = %url,
                        attempt = attempt,
                        retries = self.retries,
                        error = %failure.message,
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(failure) => {
                    let message = if attempt > 0 {
                        format!("{} (after {} retries)", failure.message, attempt)
                    } else {
                        failure.message
                    };
                    return Err(InstallError::FetchError {
                        url: url.to_string(),
                        message,
                    });
                }
            }
        }
    }
}

/// GitHub release client
pub struct GithubReleases {
    client: reqwest::Client,
    api_base: String,
    repository: String,
    retry: RetryPolicy,
}

impl GithubReleases {
    /// Build a client for the configured repository
    pub fn new(source: &SourceConfig, fetch: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("kc-radius/", env!("CARGO_PKG_VERSION")))
            .timeout(fetch.timeout())
            .build()
            .map_err(|e| InstallError::FetchError {
                url: source.api_base.clone(),
                message: format!("cannot build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_base: source.api_base.trim_end_matches('/').to_string(),
            repository: source.repository.clone(),
            retry: RetryPolicy::from_config(fetch),
        })
    }

    /// API URL of the release descriptor
    pub fn release_url(&self, tag: Option<&str>) -> String {
        release_api_url(&self.api_base, &self.repository, tag)
    }
}

/// Write the response body to `dest` chunk by chunk, truncating it first
async fn stream_to_file(
    mut response: reqwest::Response,
    dest: &Path,
) -> std::result::Result<u64, FetchFailure> {
    let local = |e: std::io::Error| FetchFailure::permanent(format!("{}: {}", dest.display(), e));

    let mut file = tokio::fs::File::create(dest).await.map_err(local)?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await.map_err(local)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(local)?;
    Ok(written)
}

/// API URL of a release descriptor, latest when `tag` is `None`
pub fn release_api_url(api_base: &str, repository: &str, tag: Option<&str>) -> String {
    let api_base = api_base.trim_end_matches('/');
    match tag {
        Some(tag) => format!("{api_base}/repos/{repository}/releases/tags/{tag}"),
        None => format!("{api_base}/repos/{repository}/releases/latest"),
    }
}

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn release(&self, tag: Option<&str>) -> Result<Release> {
        let url = self.release_url(tag);
        info!(url = %url, "Fetching release descriptor");

        let client = &self.client;
        let target = url.as_str();
        let release = self
            .retry
            .run(&url, move || async move {
                let response = client
                    .get(target)
                    .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                    .send()
                    .await?;

                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Err(FetchFailure::permanent("release not found (HTTP 404)"));
                }

                let release = response.error_for_status()?.json::<Release>().await?;
                Ok(release)
            })
            .await?;

        debug!(tag = %release.tag_name, assets = release.assets.len(), "Release resolved");
        Ok(release)
    }

    async fn download(&self, asset: &ReleaseAsset, dest: &Path) -> Result<()> {
        info!(asset = %asset.name, url = %asset.download_url, "Downloading asset");

        let client = &self.client;
        let target = asset.download_url.as_str();
        let written = self
            .retry
            .run(target, move || async move {
                let response = client
                    .get(target)
                    .header(reqwest::header::ACCEPT, "application/octet-stream")
                    .send()
                    .await?
                    .error_for_status()?;
                stream_to_file(response, dest).await
            })
            .await?;

        debug!(path = %dest.display(), bytes = written, "Asset downloaded");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}/repos/{}/releases", self.api_base, self.repository)
    }
}
