//! Artifact cache manager
//!
//! Makes sure every file a model family needs is present in the model's
//! cache directory, downloading through the API collaborator when it is
//! not. File existence is the only consistency signal; nothing is
//! checksummed.

use super::api::ModelApi;
use super::archive::{extract_archive, is_archive};
use super::manifest::{EndpointKind, FileManifest, SignedManifest, filename_from_url};
use super::store::ArtifactStore;
use crate::config::RuntimeConfig;
use crate::descriptor::ModelDescriptor;
use crate::error::{LmmError, LmmResult};
use crate::metrics;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Extension of side-channel metadata files that are never downloaded
const SKIPPED_EXTENSION: &str = ".npz";

/// Cache directory prefix for vendor-hosted LoRA bases
pub const LORA_BASES_DIR: &str = "lora-bases";

/// Suffix of the directory a vendor base is assembled in before it is
/// renamed into place
const STAGING_SUFFIX: &str = ".partial";

/// Outcome of one manifest download pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Filenames fetched and persisted, in download order
    pub downloaded: Vec<String>,
    /// Filenames skipped because they were cached or side-channel metadata
    pub skipped: Vec<String>,
    /// How many times the signed manifest was re-resolved
    pub manifest_refreshes: u32,
}

/// Resolves, downloads and extracts model artifacts into the cache
pub struct ArtifactCacheManager {
    api: Arc<dyn ModelApi>,
    store: Arc<dyn ArtifactStore>,
    device_id: String,
    slow_download_threshold: Duration,
}

impl ArtifactCacheManager {
    pub fn new(
        api: Arc<dyn ModelApi>,
        store: Arc<dyn ArtifactStore>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            api,
            store,
            device_id: config.device_id.clone(),
            slow_download_threshold: config.slow_download_threshold(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Stable cache directory of a model
    pub fn model_dir(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.store.cache_directory_for(descriptor.cache_key())
    }

    /// Endpoint serving this descriptor's signed manifest
    pub fn endpoint_for(descriptor: &ModelDescriptor) -> EndpointKind {
        if descriptor.is_core_model() {
            EndpointKind::CoreModel
        } else if descriptor.version().is_some() {
            EndpointKind::Versioned
        } else {
            EndpointKind::Instant
        }
    }

    /// Return the model's cache directory once every required file is in it.
    ///
    /// A complete cache never touches the network.
    pub async fn ensure_model_artifacts(
        &self,
        descriptor: &ModelDescriptor,
        manifest: &FileManifest,
    ) -> LmmResult<PathBuf> {
        let dir = self.model_dir(descriptor);

        if manifest.is_complete_in(&dir) {
            tracing::info!(model_id = %descriptor.model_id(), dir = ?dir, "Model artifacts already cached");
            return Ok(dir);
        }

        tracing::info!(model_id = %descriptor.model_id(), dir = ?dir, "Downloading model artifacts");
        let report = self.download_model_artifacts(descriptor).await?;
        tracing::info!(
            model_id = %descriptor.model_id(),
            downloaded = report.downloaded.len(),
            skipped = report.skipped.len(),
            manifest_refreshes = report.manifest_refreshes,
            "Model artifacts downloaded"
        );

        let missing = manifest.missing_in(&dir);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|m| m.to_string()).collect();
            return Err(LmmError::artifact(format!(
                "Required files missing from {:?} after download: {}",
                dir,
                names.join(", ")
            )));
        }

        Ok(dir)
    }

    async fn resolve_manifest(
        &self,
        descriptor: &ModelDescriptor,
        endpoint: EndpointKind,
    ) -> LmmResult<SignedManifest> {
        let response = self
            .api
            .resolve_model_manifest(descriptor.model_id(), endpoint, &self.device_id)
            .await?;
        endpoint.extract_manifest(&response)
    }

    /// Download every manifest file that is not cached yet.
    ///
    /// When handling a single file exceeds the slow-download threshold the
    /// signed URLs are assumed to be expiring: the manifest is re-resolved
    /// and the remaining files are taken from the fresh one.
    pub async fn download_model_artifacts(
        &self,
        descriptor: &ModelDescriptor,
    ) -> LmmResult<DownloadReport> {
        let endpoint = Self::endpoint_for(descriptor);
        let cache_key = descriptor.cache_key();
        let dir = self.model_dir(descriptor);

        let mut manifest = self.resolve_manifest(descriptor, endpoint).await?;
        let mut report = DownloadReport::default();

        for key in manifest.keys() {
            let url = manifest
                .url_for(&key)
                .ok_or_else(|| {
                    LmmError::artifact(format!(
                        "`{}` missing from refreshed manifest of {}",
                        key,
                        descriptor.model_id()
                    ))
                })?
                .to_string();
            let filename = checked_filename(&url)?;

            if filename.ends_with(SKIPPED_EXTENSION) {
                report.skipped.push(filename);
                continue;
            }
            if self.store.cache_file_path(&filename, cache_key).exists() {
                tracing::debug!(file = %filename, "Already cached, skipping");
                report.skipped.push(filename);
                continue;
            }

            let started = Instant::now();

            tracing::debug!(model_id = %descriptor.model_id(), file = %filename, "Downloading file");
            let content = self.api.fetch(&url).await?;
            let path = self
                .store
                .persist_bytes(&content, &filename, cache_key)
                .await?;
            metrics::record_artifact_downloaded(descriptor.model_id(), content.len());

            if is_archive(&filename) {
                if let Err(e) = extract_archive(path.clone(), dir.clone()).await {
                    // A kept archive would count as cached on the next attempt
                    if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(path = ?path, error = %cleanup, "Failed to remove corrupt archive");
                    }
                    return Err(e);
                }
            }

            report.downloaded.push(filename);

            if started.elapsed() > self.slow_download_threshold {
                tracing::debug!(
                    model_id = %descriptor.model_id(),
                    threshold_secs = self.slow_download_threshold.as_secs(),
                    "Weights download exceeded threshold, refreshing signed manifest"
                );
                manifest = self.resolve_manifest(descriptor, endpoint).await?;
                report.manifest_refreshes += 1;
                metrics::record_manifest_refresh(descriptor.model_id());
            }
        }

        Ok(report)
    }

    /// Cache key of a vendor-hosted base: `lora-bases/<repo>/<revision>`
    pub fn vendor_base_key(repo: &str, revision: &str) -> LmmResult<String> {
        let traversal = |s: &str| s.split('/').any(|seg| seg.is_empty() || seg == "..");
        if traversal(repo) || traversal(revision) {
            return Err(LmmError::configuration(format!(
                "Invalid LoRA base reference {}@{}",
                repo, revision
            )));
        }
        Ok(format!("{}/{}/{}", LORA_BASES_DIR, repo, revision))
    }

    /// Materialize a vendor-hosted LoRA base once; later adapters sharing
    /// the same base reuse the directory.
    pub async fn ensure_vendor_base(&self, repo: &str, revision: &str) -> LmmResult<PathBuf> {
        let cache_key = Self::vendor_base_key(repo, revision)?;
        let dir = self.store.cache_directory_for(&cache_key);

        if dir.exists() {
            tracing::debug!(repo = %repo, revision = %revision, dir = ?dir, "LoRA base already cached");
            return Ok(dir);
        }

        tracing::info!(repo = %repo, revision = %revision, "Downloading LoRA base weights");

        let response = self
            .api
            .resolve_adapter_base_manifest(repo, revision, &self.device_id)
            .await?;
        let weights = response.get("weights").ok_or_else(|| {
            LmmError::artifact(
                "`weights` key not available in API response while downloading LoRA base weights",
            )
        })?;
        let url = weights.get("model").and_then(|v| v.as_str()).ok_or_else(|| {
            LmmError::artifact(
                "`model` key not available in API response while downloading LoRA base weights",
            )
        })?;

        let filename = checked_filename(url)?;
        if !is_archive(&filename) {
            return Err(LmmError::artifact(format!(
                "LoRA base weights must be a tar.gz archive, got {}",
                filename
            )));
        }

        // Fetch and extract into a staging sibling; only a complete base is
        // renamed into place
        let staging_key = format!("{}{}", cache_key, STAGING_SUFFIX);
        let staging_dir = self.store.cache_directory_for(&staging_key);
        remove_dir_if_present(&staging_dir).await;

        if let Err(e) = self
            .stage_vendor_base(repo, url, &filename, &staging_key, &staging_dir)
            .await
        {
            remove_dir_if_present(&staging_dir).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&staging_dir, &dir).await {
            remove_dir_if_present(&staging_dir).await;
            // Another writer finished the same base first
            if dir.exists() {
                return Ok(dir);
            }
            return Err(LmmError::io(&dir, e));
        }

        tracing::info!(repo = %repo, revision = %revision, dir = ?dir, "LoRA base cached");
        Ok(dir)
    }

    async fn stage_vendor_base(
        &self,
        repo: &str,
        url: &str,
        filename: &str,
        staging_key: &str,
        staging_dir: &Path,
    ) -> LmmResult<()> {
        let content = self.api.fetch(url).await?;
        let archive_path = self
            .store
            .persist_bytes(&content, filename, staging_key)
            .await?;
        metrics::record_artifact_downloaded(repo, content.len());

        extract_archive(archive_path, staging_dir.to_path_buf()).await
    }
}

/// Remove a staging directory, logging instead of failing
async fn remove_dir_if_present(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = ?dir, error = %e, "Failed to remove partial LoRA base"),
    }
}

/// Filename from a signed URL, refusing names that escape the cache dir
fn checked_filename(url: &str) -> LmmResult<String> {
    let filename = filename_from_url(url);
    if filename.is_empty() || filename == "." || filename == ".." || filename.contains('\\') {
        return Err(LmmError::artifact(format!(
            "Cannot derive a filename from download URL {}",
            url.split('?').next().unwrap_or(url)
        )));
    }
    Ok(filename.to_string())
}
