//! Model provisioning: cache lookup, else download + decode + cache write.

use crate::cache::{CacheError, CachedModel, ModelCache};
use crate::fetch::{ArtifactFetcher, FetchError, ModelSource};
use flate2::write::GzDecoder;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("required capability missing: {0}")]
    CapabilityMissing(#[source] CacheError),
    #[error("decompression not supported for encoding '{0}'")]
    DecompressionUnsupported(String),
    #[error("cache error: {0}")]
    Storage(#[from] CacheError),
    #[error("download failed: {0}")]
    Download(#[from] FetchError),
    #[error("failed to decompress model: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Content encoding of the downloaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactEncoding {
    Gzip,
    Identity,
}

impl FromStr for ArtifactEncoding {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(ArtifactEncoding::Gzip),
            "identity" | "none" => Ok(ArtifactEncoding::Identity),
            other => Err(ProvisionError::DecompressionUnsupported(other.to_string())),
        }
    }
}

/// Which model to provision and where to get it.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Cache key.
    pub key: String,
    /// Required cache record version; anything else is a miss.
    pub version: i64,
    pub source: ModelSource,
    /// Encoding name as configured (`gzip`, `identity`).
    pub encoding: String,
}

/// Proof that the startup capability check passed.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    encoding: ArtifactEncoding,
}

impl Capabilities {
    pub fn encoding(&self) -> ArtifactEncoding {
        self.encoding
    }
}

/// Provisioning progress, in the order phases are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionPhase {
    CheckingCache,
    LoadingFromCache,
    Downloading,
    Decompressing,
    SavingToCache,
}

impl ProvisionPhase {
    pub fn message(&self) -> &'static str {
        match self {
            ProvisionPhase::CheckingCache => "Checking model cache...",
            ProvisionPhase::LoadingFromCache => "Loading model from cache...",
            ProvisionPhase::Downloading => "Downloading model...",
            ProvisionPhase::Decompressing => "Decompressing model...",
            ProvisionPhase::SavingToCache => "Saving model to cache...",
        }
    }
}

/// Where the provisioned bytes came from. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelOrigin {
    Cache,
    Network,
}

/// Ready-to-load model bytes.
#[derive(Debug, Clone)]
pub struct ProvisionedModel {
    pub bytes: Vec<u8>,
    pub origin: ModelOrigin,
    /// Wall-clock duration of the whole provisioning call.
    pub elapsed: Duration,
}

/// Resolves a [`ModelSpec`] to model bytes.
pub struct Provisioner {
    spec: ModelSpec,
    cache: Arc<dyn ModelCache>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl Provisioner {
    pub fn new(spec: ModelSpec, cache: Arc<dyn ModelCache>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            spec,
            cache,
            fetcher,
        }
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn cache(&self) -> &Arc<dyn ModelCache> {
        &self.cache
    }

    /// Check the persistent cache and the artifact decoder are usable.
    ///
    /// Touches neither the network nor the cache contents.
    pub async fn check_capabilities(&self) -> Result<Capabilities, ProvisionError> {
        let encoding: ArtifactEncoding = self.spec.encoding.parse()?;
        self.cache
            .check_available()
            .await
            .map_err(ProvisionError::CapabilityMissing)?;
        Ok(Capabilities { encoding })
    }

    /// Return the model bytes, from cache when a record with the required
    /// version and a valid payload exists, otherwise from the network
    /// (written back to the cache before returning).
    pub async fn provision(
        &self,
        caps: &Capabilities,
        on_phase: &(dyn Fn(ProvisionPhase) + Send + Sync),
    ) -> Result<ProvisionedModel, ProvisionError> {
        let start = Instant::now();
        let required = self.spec.version;

        on_phase(ProvisionPhase::CheckingCache);
        match self.cache.get(&self.spec.key).await? {
            Some(CachedModel {
                version,
                data: Some(bytes),
                ..
            }) if version == required => {
                on_phase(ProvisionPhase::LoadingFromCache);
                tracing::info!(key = %self.spec.key, version, bytes = bytes.len(), "found valid cached model");
                return Ok(ProvisionedModel {
                    bytes,
                    origin: ModelOrigin::Cache,
                    elapsed: start.elapsed(),
                });
            }
            Some(record) => {
                tracing::info!(
                    key = %self.spec.key,
                    cached_version = record.version,
                    required_version = required,
                    payload_valid = record.data.is_some(),
                    "cached model version mismatch or data invalid; redownloading"
                );
            }
            None => {
                tracing::info!(key = %self.spec.key, "no cached model found; downloading");
            }
        }

        let bytes = self.download(caps.encoding, on_phase).await?;

        on_phase(ProvisionPhase::SavingToCache);
        let save_start = Instant::now();
        self.cache.put(&self.spec.key, required, &bytes).await?;
        tracing::info!(
            version = required,
            save_ms = save_start.elapsed().as_millis() as u64,
            "model saved to cache"
        );

        Ok(ProvisionedModel {
            bytes,
            origin: ModelOrigin::Network,
            elapsed: start.elapsed(),
        })
    }

    /// Fetch the artifact, decoding it as the body streams in.
    async fn download(
        &self,
        encoding: ArtifactEncoding,
        on_phase: &(dyn Fn(ProvisionPhase) + Send + Sync),
    ) -> Result<Vec<u8>, ProvisionError> {
        on_phase(ProvisionPhase::Downloading);
        let start = Instant::now();

        let (received, bytes) = match encoding {
            ArtifactEncoding::Gzip => {
                let mut decoder = GzDecoder::new(Vec::new());
                let received = self.fetcher.fetch(&mut decoder).await.map_err(fetch_error)?;
                on_phase(ProvisionPhase::Decompressing);
                let bytes = decoder.finish().map_err(ProvisionError::Decompress)?;
                (received, bytes)
            }
            ArtifactEncoding::Identity => {
                let mut bytes = Vec::new();
                let received = self.fetcher.fetch(&mut bytes).await.map_err(fetch_error)?;
                (received, bytes)
            }
        };

        if bytes.is_empty() {
            return Err(ProvisionError::Download(FetchError::EmptyBody));
        }

        tracing::info!(
            source = %self.spec.source,
            compressed_bytes = received,
            mb = format!("{:.2}", bytes.len() as f64 / (1024.0 * 1024.0)),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model downloaded and decompressed"
        );

        Ok(bytes)
    }
}

/// Decoder write failures surface as decompression errors, the rest as
/// download errors.
fn fetch_error(e: FetchError) -> ProvisionError {
    match e {
        FetchError::Sink(io) => ProvisionError::Decompress(io),
        other => ProvisionError::Download(other),
    }
}
