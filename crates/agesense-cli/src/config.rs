use agesense_models::{ModelSource, ModelSpec};
use std::path::PathBuf;

/// Cache key of the age/gender model record.
pub const MODEL_KEY: &str = "ag_modelQ";
/// Required cache record version. Bump when the artifact changes.
pub const MODEL_VERSION: i64 = 1;

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Preferred capture width; the driver may pick another.
    pub camera_width: u32,
    /// Preferred capture height.
    pub camera_height: u32,
    /// Location of the compressed model artifact (URL or path).
    pub model_url: String,
    /// Content encoding of the artifact.
    pub model_encoding: String,
    /// Path to the SQLite model cache.
    pub cache_path: PathBuf,
    /// Flip the input horizontally before inference.
    pub mirror: bool,
    /// ONNX Runtime intra-op threads.
    pub intra_threads: usize,
}

impl Config {
    /// Load configuration from `AGESENSE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let cache_path = std::env::var("AGESENSE_CACHE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                default_cache_path(
                    std::env::var("XDG_CACHE_HOME").ok(),
                    std::env::var("HOME").ok(),
                )
            });

        Self {
            camera_device: std::env::var("AGESENSE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_width: env_u32("AGESENSE_CAMERA_WIDTH", 640),
            camera_height: env_u32("AGESENSE_CAMERA_HEIGHT", 480),
            model_url: std::env::var("AGESENSE_MODEL_URL")
                .unwrap_or_else(|_| "./ag_modelQ.onnx.gz".to_string()),
            model_encoding: std::env::var("AGESENSE_MODEL_ENCODING")
                .unwrap_or_else(|_| "gzip".to_string()),
            cache_path,
            mirror: std::env::var("AGESENSE_MIRROR")
                .map(|v| v != "0")
                .unwrap_or(false),
            intra_threads: env_usize("AGESENSE_INTRA_THREADS", 2),
        }
    }

    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            key: MODEL_KEY.to_string(),
            version: MODEL_VERSION,
            source: ModelSource::parse(&self.model_url),
            encoding: self.model_encoding.clone(),
        }
    }
}

/// `$XDG_CACHE_HOME/agesense/models.db`, else `$HOME/.cache/...`, else `/tmp`.
fn default_cache_path(xdg_cache_home: Option<String>, home: Option<String>) -> PathBuf {
    xdg_cache_home
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = home.unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".cache")
        })
        .join("agesense")
        .join("models.db")
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_path_prefers_xdg() {
        assert_eq!(
            default_cache_path(Some("/var/cache/u".into()), Some("/home/u".into())),
            PathBuf::from("/var/cache/u/agesense/models.db")
        );
    }

    #[test]
    fn test_cache_path_falls_back_to_home() {
        assert_eq!(
            default_cache_path(None, Some("/home/u".into())),
            PathBuf::from("/home/u/.cache/agesense/models.db")
        );
        assert_eq!(
            default_cache_path(Some(String::new()), None),
            PathBuf::from("/tmp/.cache/agesense/models.db")
        );
    }

    #[test]
    fn test_model_spec_uses_constants() {
        let config = Config {
            camera_device: "/dev/video0".into(),
            camera_width: 640,
            camera_height: 480,
            model_url: "https://example.com/ag_modelQ.onnx.gz".into(),
            model_encoding: "gzip".into(),
            cache_path: PathBuf::from("/tmp/models.db"),
            mirror: false,
            intra_threads: 2,
        };
        let spec = config.model_spec();
        assert_eq!(spec.key, "ag_modelQ");
        assert_eq!(spec.version, 1);
        assert_eq!(
            spec.source,
            ModelSource::Http("https://example.com/ag_modelQ.onnx.gz".into())
        );
    }
}
