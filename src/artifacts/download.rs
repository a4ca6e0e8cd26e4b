//! Hub-sourced base model download using hf-hub
//!
//! Families that take their base parameters straight from the adapter's
//! declared base repository materialize a snapshot in the local hf-hub
//! cache, so the compute runtime only ever loads from disk.

use crate::error::{LmmError, LmmResult};
use async_trait::async_trait;
use hf_hub::api::tokio::{ApiBuilder, ApiError, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::PathBuf;

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
const SAFETENSORS_SINGLE: &str = "model.safetensors";

/// Source of gated base-model snapshots
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Download (or reuse) a repository snapshot and return its directory
    async fn snapshot(&self, repo: &str, revision: &str, token: &str) -> LmmResult<PathBuf>;
}

/// hf-hub implementation writing into the standard HuggingFace cache layout
pub struct HfHubClient {
    cache_dir: PathBuf,
    endpoint: Option<String>,
}

impl HfHubClient {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            endpoint: None,
        }
    }

    /// Use a hub mirror instead of huggingface.co
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

#[async_trait]
impl HubClient for HfHubClient {
    async fn snapshot(&self, repo_id: &str, revision: &str, token: &str) -> LmmResult<PathBuf> {
        tracing::info!(
            repo = %repo_id,
            revision = %revision,
            cache_dir = ?self.cache_dir,
            "Starting base model download via hf-hub"
        );

        let mut builder = ApiBuilder::new()
            .with_cache_dir(self.cache_dir.clone())
            .with_token(Some(token.to_string()))
            .with_progress(false);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        let api = builder
            .build()
            .map_err(|e| LmmError::Api(format!("Failed to create HF API client: {}", e)))?;

        let repo = api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        // Minimum files needed to load the base and its tokenizer
        let essential_files = ["config.json", "tokenizer.json"];

        let mut config_path: Option<PathBuf> = None;
        for file in &essential_files {
            tracing::debug!(repo = %repo_id, file = %file, "Downloading file");
            let path = repo.get(file).await.map_err(|e| {
                LmmError::artifact(format!("Failed to download {} from {}: {}", file, repo_id, e))
            })?;

            if *file == "config.json" {
                config_path = Some(path);
            }
        }

        // Sharded checkpoints are the norm for multimodal bases; single-file
        // safetensors is the fallback
        match repo.get(SAFETENSORS_INDEX).await {
            Ok(index_path) => download_sharded_weights(&repo, repo_id, index_path).await?,
            Err(e) if is_not_found(&e) => {
                repo.get(SAFETENSORS_SINGLE).await.map_err(|e| {
                    if is_not_found(&e) {
                        LmmError::artifact(format!(
                            "No safetensors weights found in {}@{}",
                            repo_id, revision
                        ))
                    } else {
                        LmmError::artifact(format!(
                            "Failed to download {} from {}: {}",
                            SAFETENSORS_SINGLE, repo_id, e
                        ))
                    }
                })?;
            }
            Err(e) => {
                return Err(LmmError::artifact(format!(
                    "Failed to download {} from {}: {}",
                    SAFETENSORS_INDEX, repo_id, e
                )));
            }
        }

        let optional_files = [
            "preprocessor_config.json",
            "tokenizer_config.json",
            "special_tokens_map.json",
            "generation_config.json",
            "chat_template.json",
        ];

        for file in &optional_files {
            if repo.get(file).await.is_ok() {
                tracing::debug!(repo = %repo_id, file = %file, "Downloaded optional file");
            }
        }

        // The snapshot directory is the parent of config.json
        config_path
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .ok_or_else(|| {
                LmmError::artifact(format!(
                    "Base model downloaded but snapshot path not found for {}",
                    repo_id
                ))
            })
    }
}

/// Whether the hub answered 404 for the requested file
fn is_not_found(err: &ApiError) -> bool {
    matches!(err, ApiError::RequestError(e) if e.status().map(|s| s.as_u16()) == Some(404))
}

/// Download every shard referenced by a safetensors index file
async fn download_sharded_weights(
    repo: &ApiRepo,
    repo_id: &str,
    index_path: PathBuf,
) -> LmmResult<()> {
    let index_content = tokio::fs::read_to_string(&index_path)
        .await
        .map_err(|e| LmmError::io(&index_path, e))?;

    let index: serde_json::Value = serde_json::from_str(&index_content)?;

    let weight_map = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| {
            LmmError::artifact(format!("`weight_map` key not available in index of {}", repo_id))
        })?;

    let shards: std::collections::BTreeSet<&str> =
        weight_map.values().filter_map(|v| v.as_str()).collect();

    tracing::info!(repo = %repo_id, shard_count = shards.len(), "Downloading sharded weights");

    for shard in shards {
        tracing::debug!(repo = %repo_id, shard = %shard, "Downloading shard");
        repo.get(shard).await.map_err(|e| {
            LmmError::artifact(format!("Failed to download shard {}: {}", shard, e))
        })?;
    }

    Ok(())
}
