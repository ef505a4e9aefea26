use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, WordPqError};

/// Thin wrapper around `object_store` giving the index a key/blob view of a
/// local directory or an in-memory store.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl BlobStore {
    /// Create a new store from configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.backend {
            StorageBackend::Local => {
                if !config.root.exists() {
                    std::fs::create_dir_all(&config.root)?;
                }
                Arc::new(
                    object_store::local::LocalFileSystem::new_with_prefix(&config.root).map_err(
                        |e| WordPqError::Config(format!("failed to build local store: {e}")),
                    )?,
                )
            }
            StorageBackend::Memory => Arc::new(object_store::memory::InMemory::new()),
        };

        Ok(Self { inner: store })
    }

    /// Create a store directly from an ObjectStore instance (for testing).
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { inner: store }
    }

    /// Put an object at the given key.
    #[instrument(skip(self, data), fields(key = key, size = data.len()))]
    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        self.inner.put(&path, PutPayload::from(data)).await?;
        debug!(elapsed_ms = start.elapsed().as_millis(), "blob put");
        Ok(())
    }

    /// Get an object by key. Returns NotFound if it doesn't exist.
    #[instrument(skip(self), fields(key = key))]
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let start = std::time::Instant::now();
        let path = Path::parse(key)?;
        let result = self.inner.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { path, .. } => WordPqError::NotFound { key: path },
            other => WordPqError::Storage(other),
        })?;
        let bytes = result.bytes().await?;
        debug!(
            elapsed_ms = start.elapsed().as_millis(),
            size = bytes.len(),
            "blob get"
        );
        Ok(bytes)
    }

    /// List object keys under a prefix, sorted.
    #[instrument(skip(self), fields(prefix = prefix))]
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        use futures::TryStreamExt;
        let start = std::time::Instant::now();
        let path = Path::parse(prefix)?;
        let objects: Vec<_> = self.inner.list(Some(&path)).try_collect().await?;
        let mut keys: Vec<String> = objects.iter().map(|o| o.location.to_string()).collect();
        keys.sort();
        debug!(
            elapsed_ms = start.elapsed().as_millis(),
            count = keys.len(),
            "blob list_prefix"
        );
        Ok(keys)
    }

    /// Check if an object exists.
    #[instrument(skip(self), fields(key = key))]
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let path = Path::parse(key)?;
        match self.inner.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(WordPqError::Storage(e)),
        }
    }

    /// Delete all objects under a prefix.
    #[instrument(skip(self), fields(prefix = prefix))]
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let start = std::time::Instant::now();
        let keys = self.list_prefix(prefix).await?;
        let count = keys.len();
        let inner = &self.inner;
        let deletes = keys.iter().map(|key| async move {
            let path = Path::parse(key)?;
            inner.delete(&path).await?;
            Ok::<_, WordPqError>(())
        });
        futures::future::try_join_all(deletes).await?;
        debug!(elapsed_ms = start.elapsed().as_millis(), count, "blob delete_prefix");
        Ok(count)
    }
}
