//! Durable on-disk model cache
//!
//! Layout mirrors the persisted-store contract: a root named
//! `supersplat-sam2-models` holding a `models` directory with one file per
//! key, plus a `VERSION` marker. A version mismatch clears the store, which
//! is the upgrade path for schema changes.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use super::types::StoreError;

pub const STORE_NAME: &str = "supersplat-sam2-models";
pub const OBJECT_STORE: &str = "models";
pub const SCHEMA_VERSION: u32 = 1;

/// Key/value cache of model artifact bytes
pub struct ModelCache {
    root: PathBuf,
}

impl ModelCache {
    /// Open (creating if needed) the cache under `cache_dir`.
    pub async fn open(cache_dir: &Path) -> Result<Self, StoreError> {
        let store_dir = cache_dir.join(STORE_NAME);
        let root = store_dir.join(OBJECT_STORE);
        fs::create_dir_all(&root).await?;

        let version_file = store_dir.join("VERSION");
        let on_disk = match fs::read_to_string(&version_file).await {
            Ok(v) => v.trim().parse::<u32>().ok(),
            Err(_) => None,
        };
        if on_disk != Some(SCHEMA_VERSION) {
            if on_disk.is_some() {
                info!(
                    "model cache schema {:?} != {}, clearing",
                    on_disk, SCHEMA_VERSION
                );
                let _ = fs::remove_dir_all(&root).await;
                fs::create_dir_all(&root).await?;
            }
            fs::write(&version_file, SCHEMA_VERSION.to_string()).await?;
        }

        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Read cached bytes for a key, if present.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => {
                debug!("cache hit for {} ({} bytes)", key, bytes.len());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Size of a cached entry without reading it.
    pub async fn size(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write bytes for a key. A temp-file rename keeps readers from ever
    /// observing a partial entry.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.root.join(format!(".{key}.partial"));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, self.path_for(key)).await?;
        debug!("cached {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop every cached entry.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Err(e) = fs::remove_file(entry.path()).await {
                warn!("failed to remove cache entry {:?}: {}", entry.path(), e);
            }
        }
        Ok(())
    }
}
