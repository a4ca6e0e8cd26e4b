//! On-disk artifact store
//!
//! Cache layout:
//! ```text
//! {cache_dir}/
//! ├── {workspace}/{model}/            one directory per model id
//! │   ├── adapter_config.json
//! │   ├── adapter_model.safetensors
//! │   └── chat_template.json
//! ├── lora-bases/{vendor}/{family}/{revision}/
//! │   ├── config.json
//! │   └── model-00001-of-00004.safetensors
//! └── huggingface/                    hf-hub cache for hub-sourced bases
//! ```

use crate::error::{LmmError, LmmResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Byte cache keyed by (filename, cache key)
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `content` as `filename` under the cache key's directory
    async fn persist_bytes(&self, content: &[u8], filename: &str, cache_key: &str)
    -> LmmResult<PathBuf>;

    /// Directory holding every entry of a cache key
    fn cache_directory_for(&self, cache_key: &str) -> PathBuf;

    /// Path a filename would occupy under a cache key
    fn cache_file_path(&self, filename: &str, cache_key: &str) -> PathBuf {
        self.cache_directory_for(cache_key).join(filename)
    }
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Distinguishes temp files of concurrent writers within one process
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem store rooted at the configured cache directory
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn persist_bytes(
        &self,
        content: &[u8],
        filename: &str,
        cache_key: &str,
    ) -> LmmResult<PathBuf> {
        let dir = self.cache_directory_for(cache_key);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| LmmError::io(&dir, e))?;

        let path = dir.join(filename);
        // Atomic write: write to a temp file private to this call, then rename
        let temp_file = dir.join(format!(
            ".{}.{}.{}.part",
            filename,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(e) = write_file(&temp_file, content).await {
            let _ = fs::remove_file(&temp_file).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_file, &path).await {
            let _ = fs::remove_file(&temp_file).await;
            return Err(LmmError::io(&path, e));
        }

        tracing::debug!(path = ?path, bytes = content.len(), "Persisted artifact");
        Ok(path)
    }

    fn cache_directory_for(&self, cache_key: &str) -> PathBuf {
        self.root.join(cache_key)
    }
}

async fn write_file(path: &Path, content: &[u8]) -> LmmResult<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| LmmError::io(path, e))?;
    file.write_all(content)
        .await
        .map_err(|e| LmmError::io(path, e))?;
    file.sync_all().await.map_err(|e| LmmError::io(path, e))
}

/// Recursively calculate directory size
pub fn dir_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                size += dir_size(&path);
            } else if let Ok(metadata) = std::fs::metadata(&path) {
                size += metadata.len();
            }
        }
    }

    size
}
