use crate::error::CacheError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tonic::async_trait;

/// Entries expire once `now - created >= ttl`.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn put(&self, key: &str, payload: Arc<[u8]>, ttl: Duration) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>, CacheError>;
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Arc<[u8]>,
    pub created: SystemTime,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(key: &str, payload: Arc<[u8]>, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            payload,
            created: SystemTime::now(),
            ttl,
        }
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        is_fresh(self.created, self.ttl, now)
    }
}

// A clock that went backwards yields a zero age, keeping the entry.
fn is_fresh(created: SystemTime, ttl: Duration, now: SystemTime) -> bool {
    now.duration_since(created).unwrap_or_default() < ttl
}

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn put(&self, key: &str, payload: Arc<[u8]>, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .lock()
            .insert(key.to_string(), CacheEntry::new(key, payload, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>, CacheError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_valid_at(SystemTime::now()) => Ok(Some(entry.payload.clone())),
            Some(_) => {
                tracing::debug!(key, "purging expired cache entry");
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMetadata {
    key: String,
    created_ms: u64,
    ttl_ms: u64,
}

impl EntryMetadata {
    fn created(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.created_ms)
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Durable store: `<name>.bin` holds the payload, `<name>.meta.json` the
/// key, creation time and ttl.
pub struct DiskCacheStore {
    dir: PathBuf,
}

impl DiskCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", Self::file_stem(key)))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", Self::file_stem(key)))
    }

    async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_metadata(&self, key: &str) -> Option<EntryMetadata> {
        let raw = tokio::fs::read(self.metadata_path(key)).await.ok()?;
        match serde_json::from_slice::<EntryMetadata>(&raw) {
            Ok(meta) if meta.key == key => Some(meta),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding unreadable cache metadata");
                None
            }
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn put(&self, key: &str, payload: Arc<[u8]>, ttl: Duration) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let created_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let metadata = EntryMetadata {
            key: key.to_string(),
            created_ms,
            ttl_ms: ttl.as_millis() as u64,
        };

        // Payload first, so metadata never points at a half-written blob.
        Self::write_atomic(&self.payload_path(key), &payload).await?;
        Self::write_atomic(&self.metadata_path(key), &serde_json::to_vec(&metadata)?).await?;

        tracing::debug!(key, bytes = payload.len(), "cache entry written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>, CacheError> {
        let Some(metadata) = self.read_metadata(key).await else {
            return Ok(None);
        };

        if !is_fresh(metadata.created(), metadata.ttl(), SystemTime::now()) {
            tracing::debug!(key, "purging expired cache entry");
            self.remove(key).await?;
            return Ok(None);
        }

        match tokio::fs::read(self.payload_path(key)).await {
            Ok(payload) => Ok(Some(payload.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.remove(key).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        remove_if_exists(&self.metadata_path(key)).await?;
        remove_if_exists(&self.payload_path(key)).await
    }
}
