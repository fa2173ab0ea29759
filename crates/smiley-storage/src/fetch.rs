use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, Instrument};

/// Where the feed payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    Url(String),
    Path(PathBuf),
}

impl FeedSource {
    /// `http://` and `https://` are remote; everything else (with or without `file://`) is a local path.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.starts_with("http://") || input.starts_with("https://") {
            Self::Url(input.to_string())
        } else {
            Self::Path(PathBuf::from(input.strip_prefix("file://").unwrap_or(input)))
        }
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    /// Final URL after redirects, or the local path.
    pub origin: String,
    pub text: String,
    pub sha256: String,
}

impl FetchedFeed {
    pub fn byte_size(&self) -> usize {
        self.text.len()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {timeout:?} fetching {target}")]
    Timeout { target: String, timeout: Duration },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("payload from {target} is not valid utf-8")]
    Encoding { target: String },
}

impl FetchError {
    /// Whether the next scheduled attempt has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Request { source, .. } => source.is_timeout() || source.is_connect(),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                .unwrap_or(false),
            Self::Io { .. } | Self::Encoding { .. } => false,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Single-attempt feed retrieval. Retrying is left to the scheduler.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl FeedFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    pub async fn fetch(&self, source: &FeedSource) -> Result<FetchedFeed, FetchError> {
        let span = info_span!("feed_fetch", source = %source);
        match source {
            FeedSource::Url(url) => self.fetch_url(url).instrument(span).await,
            FeedSource::Path(path) => self.read_path(path).instrument(span).await,
        }
    }

    async fn fetch_url(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        let request_error = |source: reqwest::Error| {
            if source.is_timeout() {
                FetchError::Timeout {
                    target: url.to_string(),
                    timeout: self.timeout,
                }
            } else {
                FetchError::Request {
                    url: url.to_string(),
                    source,
                }
            }
        };

        let resp = self.client.get(url).send().await.map_err(request_error)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await.map_err(request_error)?.to_vec();
        into_feed(final_url, body)
    }

    async fn read_path(&self, path: &Path) -> Result<FetchedFeed, FetchError> {
        let bytes = tokio::time::timeout(self.timeout, fs::read(path))
            .await
            .map_err(|_| FetchError::Timeout {
                target: path.display().to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| FetchError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        into_feed(path.display().to_string(), bytes)
    }
}

fn into_feed(origin: String, bytes: Vec<u8>) -> Result<FetchedFeed, FetchError> {
    let sha256 = sha256_hex(&bytes);
    let text = String::from_utf8(bytes).map_err(|_| FetchError::Encoding {
        target: origin.clone(),
    })?;
    Ok(FetchedFeed {
        origin,
        text,
        sha256,
    })
}
