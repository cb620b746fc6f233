//! agesense-models — Model artifact provisioning.
//!
//! Resolves the age/gender ONNX model to raw bytes: a versioned SQLite
//! cache first, otherwise a download (HTTP or local file), streaming gzip
//! decode and a cache write-back.

pub mod cache;
pub mod fetch;
pub mod provision;

pub use cache::{CacheError, CachedModel, ModelCache, SqliteModelCache};
pub use fetch::{fetcher_for, ArtifactFetcher, FetchError, FileFetcher, HttpFetcher, ModelSource};
pub use provision::{
    ArtifactEncoding, Capabilities, ModelOrigin, ModelSpec, ProvisionError, ProvisionPhase,
    ProvisionedModel, Provisioner,
};
