//! Model artifact download.
//!
//! Fetchers stream the artifact body into a caller-supplied writer chunk by
//! chunk, so decoding can happen while bytes are still arriving.

use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;

const FILE_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to download model: HTTP {status} {reason}")]
    Status { status: u16, reason: String },
    #[error("response body is missing")]
    EmptyBody,
    #[error("cannot reach {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The writer rejected a chunk (e.g. a corrupt gzip stream).
    #[error("failed to consume body: {0}")]
    Sink(#[source] std::io::Error),
}

/// Where the compressed model artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Http(String),
    File(PathBuf),
}

impl ModelSource {
    /// `http(s)://` URLs are downloaded; `file://` URLs and bare paths
    /// (relative to the working directory) are read from disk.
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            ModelSource::Http(location.to_string())
        } else if let Some(path) = location.strip_prefix("file://") {
            ModelSource::File(PathBuf::from(path))
        } else {
            ModelSource::File(PathBuf::from(location))
        }
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelSource::Http(url) => f.write_str(url),
            ModelSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Streams one artifact.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Write the whole body into `sink`, returning the number of bytes received.
    async fn fetch(&self, sink: &mut (dyn Write + Send)) -> Result<u64, FetchError>;
}

/// Pick a fetcher for `source`.
pub fn fetcher_for(source: &ModelSource) -> Result<Arc<dyn ArtifactFetcher>, FetchError> {
    Ok(match source {
        ModelSource::Http(url) => Arc::new(HttpFetcher::new(url)?),
        ModelSource::File(path) => Arc::new(FileFetcher::new(path.clone())),
    })
}

/// GET over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpFetcher {
    pub fn new(url: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("agesense/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, sink: &mut (dyn Write + Send)) -> Result<u64, FetchError> {
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: self.url.clone(),
            source: e,
        };

        let mut resp = self.client.get(&self.url).send().await.map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        tracing::debug!(url = %self.url, content_length = ?resp.content_length(), "download started");

        let mut received = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(transport)? {
            sink.write_all(&chunk).map_err(FetchError::Sink)?;
            received += chunk.len() as u64;
        }

        if received == 0 {
            return Err(FetchError::EmptyBody);
        }
        Ok(received)
    }
}

/// Reads the artifact from the local filesystem.
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ArtifactFetcher for FileFetcher {
    async fn fetch(&self, sink: &mut (dyn Write + Send)) -> Result<u64, FetchError> {
        let io_err = |e: std::io::Error| FetchError::Io {
            path: self.path.display().to_string(),
            source: e,
        };

        let mut file = tokio::fs::File::open(&self.path).await.map_err(io_err)?;
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        let mut received = 0u64;

        loop {
            let n = file.read(&mut buf).await.map_err(io_err)?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).map_err(FetchError::Sink)?;
            received += n as u64;
        }

        if received == 0 {
            return Err(FetchError::EmptyBody);
        }
        Ok(received)
    }
}
