//! Local layer cache: one flat file per layer under a configured directory.
//!
//! Presence of the file is the only source of truth for "do I have this
//! cached"; there is no manifest or index. The file is owned by whichever
//! in-flight fetch created it, while relay requests read it concurrently
//! through the partial-file reader.

pub mod partial_reader;

use crate::error::{PullError, Result};
use std::path::PathBuf;
use tokio::fs;

pub struct LayerCache {
    base_dir: PathBuf,
}

impl LayerCache {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Filesystem path backing `digest` (the request path of the layer).
    /// Rejects empty paths and traversal segments.
    pub fn layer_path(&self, digest: &str) -> Result<PathBuf> {
        let trimmed = digest.trim_matches('/');
        if trimmed.is_empty() {
            return Err(PullError::InvalidRequest(
                "layer path cannot be empty".to_string(),
            ));
        }

        let mut path = self.base_dir.clone();
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(PullError::InvalidRequest(format!(
                    "invalid layer path '{}'",
                    digest
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }

    /// Creates (truncating) the cache file for `digest`, including any
    /// missing parent directories.
    pub async fn create(&self, digest: &str) -> Result<fs::File> {
        let path = self.layer_path(digest)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(fs::File::create(&path).await?)
    }

    pub async fn open(&self, digest: &str) -> Result<fs::File> {
        let path = self.layer_path(digest)?;
        Ok(fs::File::open(&path).await?)
    }

    /// Best-effort removal of a (typically partial) cache file.
    pub async fn remove(&self, digest: &str) {
        let path = match self.layer_path(digest) {
            Ok(path) => path,
            Err(error) => {
                tracing::warn!(digest = %digest, error = %error, "cannot resolve layer file for removal");
                return;
            }
        };
        if let Err(error) = fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %error, "failed to remove layer file");
        }
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.layer_path(digest)
            .map(|path| path.exists())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_create_open_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path().to_path_buf()).unwrap();

        let digest = "/v2/library/app/blobs/sha256:abc";
        let mut file = cache.create(digest).await.unwrap();
        file.write_all(b"layer-bytes").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        assert!(cache.contains(digest));
        let contents = fs::read(cache.layer_path(digest).unwrap()).await.unwrap();
        assert_eq!(contents, b"layer-bytes");

        cache.remove(digest).await;
        assert!(!cache.contains(digest));
    }

    #[tokio::test]
    async fn test_layer_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path().to_path_buf()).unwrap();

        assert!(cache.layer_path("/").is_err());
        assert!(cache.layer_path("/../etc/passwd").is_err());
        assert!(cache.layer_path("/a//b").is_err());
        assert!(cache.layer_path("/a/./b").is_err());
    }
}
