//! Versioned model blob cache backed by SQLite.
//!
//! One row per model key. The connection is opened on first use and kept
//! for the life of the cache handle.

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS models (
        key     TEXT PRIMARY KEY,
        version INTEGER NOT NULL,
        data    BLOB,
        digest  BLOB
    );
";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache location {path} is unusable: {reason}")]
    Unavailable { path: String, reason: String },
    #[error("failed to open cache {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_rusqlite::Error,
    },
    #[error("cache query failed: {0}")]
    Query(#[from] tokio_rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A row read back from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedModel {
    pub key: String,
    pub version: i64,
    /// Model bytes, or `None` when the stored payload is not a non-empty
    /// blob matching its recorded digest.
    pub data: Option<Vec<u8>>,
}

/// Key-value store for model blobs.
#[async_trait]
pub trait ModelCache: Send + Sync {
    /// Verify the backing store can be used, without reading from it.
    async fn check_available(&self) -> Result<(), CacheError>;

    /// Look up the record for `key`.
    async fn get(&self, key: &str) -> Result<Option<CachedModel>, CacheError>;

    /// Store `data` under `key`, replacing any previous record.
    async fn put(&self, key: &str, version: i64, data: &[u8]) -> Result<(), CacheError>;
}

/// SQLite-file implementation of [`ModelCache`].
pub struct SqliteModelCache {
    path: PathBuf,
    conn: OnceCell<Connection>,
}

impl SqliteModelCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the database and create the schema on first call.
    ///
    /// Concurrent first calls share a single open; every caller gets the
    /// same connection.
    async fn connection(&self) -> Result<&Connection, CacheError> {
        self.conn
            .get_or_try_init(|| async {
                if let Some(parent) = self.parent_dir() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                let conn = Connection::open(&self.path).await.map_err(|e| CacheError::Open {
                    path: self.path.display().to_string(),
                    source: e,
                })?;

                conn.call(|conn| {
                    conn.execute_batch(SCHEMA)?;
                    Ok(())
                })
                .await?;

                tracing::info!(path = %self.path.display(), "model cache opened");
                Ok::<_, CacheError>(conn)
            })
            .await
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

#[async_trait]
impl ModelCache for SqliteModelCache {
    async fn check_available(&self) -> Result<(), CacheError> {
        let unavailable = |reason: String| CacheError::Unavailable {
            path: self.path.display().to_string(),
            reason,
        };

        let dir = self.parent_dir().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| unavailable(format!("cannot create {}: {e}", dir.display())))?;

        let meta = tokio::fs::metadata(dir)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if meta.permissions().readonly() {
            return Err(unavailable(format!("{} is read-only", dir.display())));
        }

        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            if meta.is_dir() {
                return Err(unavailable("path is a directory".into()));
            }
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CachedModel>, CacheError> {
        let conn = self.connection().await?;
        let key = key.to_string();

        let row = conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT key, version, data, digest FROM models WHERE key = ?1")?;
                let mut rows = stmt.query([&key])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };

                let key: String = row.get(0)?;
                let version: i64 = row.get(1)?;
                let data = match row.get_ref(2)? {
                    ValueRef::Blob(b) => Some(b.to_vec()),
                    _ => None,
                };
                let digest = match row.get_ref(3)? {
                    ValueRef::Blob(b) => Some(b.to_vec()),
                    _ => None,
                };
                Ok(Some((key, version, data, digest)))
            })
            .await?;

        Ok(row.map(|(key, version, data, digest)| {
            let data = match (data, digest) {
                (Some(data), Some(digest)) if !data.is_empty() && sha256(&data) == digest => Some(data),
                _ => {
                    tracing::warn!(key = %key, version, "cached model payload is malformed");
                    None
                }
            };
            CachedModel { key, version, data }
        }))
    }

    async fn put(&self, key: &str, version: i64, data: &[u8]) -> Result<(), CacheError> {
        let conn = self.connection().await?;
        let key = key.to_string();
        let digest = sha256(data);
        let data = data.to_vec();
        let len = data.len();

        conn.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO models (key, version, data, digest) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![key, version, data, digest],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(version, bytes = len, "model cached");
        Ok(())
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> (tempfile::TempDir, SqliteModelCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqliteModelCache::new(dir.path().join("nested/models.db"));
        (dir, cache)
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let (_dir, cache) = temp_cache();
        assert_eq!(cache.get("ag_modelQ").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_dir, cache) = temp_cache();
        cache.put("ag_modelQ", 1, b"onnx-bytes").await.unwrap();

        let record = cache.get("ag_modelQ").await.unwrap().unwrap();
        assert_eq!(record.key, "ag_modelQ");
        assert_eq!(record.version, 1);
        assert_eq!(record.data.as_deref(), Some(&b"onnx-bytes"[..]));
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (_dir, cache) = temp_cache();
        cache.put("ag_modelQ", 1, b"old").await.unwrap();
        cache.put("ag_modelQ", 2, b"new").await.unwrap();
        cache.put("ag_modelQ", 2, b"new").await.unwrap();

        let record = cache.get("ag_modelQ").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.data.as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_text_payload_is_malformed() {
        let (_dir, cache) = temp_cache();
        let conn = cache.connection().await.unwrap();
        conn.call(|conn| {
            conn.execute(
                "INSERT INTO models (key, version, data, digest) VALUES ('ag_modelQ', 1, 'not a blob', NULL)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let record = cache.get("ag_modelQ").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.data, None);
    }

    #[tokio::test]
    async fn test_digest_mismatch_is_malformed() {
        let (_dir, cache) = temp_cache();
        cache.put("ag_modelQ", 1, b"onnx-bytes").await.unwrap();
        let conn = cache.connection().await.unwrap();
        conn.call(|conn| {
            conn.execute("UPDATE models SET data = x'00ff' WHERE key = 'ag_modelQ'", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let record = cache.get("ag_modelQ").await.unwrap().unwrap();
        assert_eq!(record.data, None);
    }

    #[tokio::test]
    async fn test_connection_opened_once() {
        let (_dir, cache) = temp_cache();
        let (a, b) = tokio::join!(cache.connection(), cache.connection());
        assert!(std::ptr::eq(a.unwrap(), b.unwrap()));
    }

    #[tokio::test]
    async fn test_check_available_creates_directory() {
        let (dir, cache) = temp_cache();
        cache.check_available().await.unwrap();
        assert!(dir.path().join("nested").is_dir());
    }

    #[tokio::test]
    async fn test_check_available_rejects_file_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let cache = SqliteModelCache::new(blocker.join("models.db"));
        assert!(matches!(
            cache.check_available().await,
            Err(CacheError::Unavailable { .. })
        ));
    }
}
