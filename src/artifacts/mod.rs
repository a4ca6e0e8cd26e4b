//! Model artifact management
//!
//! Provides functionality for:
//! - Resolving signed download manifests from the model API
//! - Persisting and extracting artifacts in the per-model cache
//! - Refreshing expiring manifests on slow transfers
//! - Fetching vendor-hosted and hub-hosted LoRA bases

pub mod api;
pub mod archive;
pub mod cache;
pub mod download;
pub mod manifest;
pub mod store;

pub use api::{HttpModelApi, ModelApi};
pub use cache::{ArtifactCacheManager, DownloadReport};
pub use download::{HfHubClient, HubClient};
pub use manifest::{EndpointKind, FileManifest, RequiredFile, SignedManifest};
pub use store::{ArtifactStore, FsArtifactStore};
