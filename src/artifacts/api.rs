//! Model metadata API client
//!
//! The API hands out signed, time-limited download URLs for model files and
//! for vendor-hosted LoRA base weights. Only the narrow surface the cache
//! manager needs is modelled here.

use super::manifest::EndpointKind;
use crate::config::RuntimeConfig;
use crate::error::{LmmError, LmmResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Remote collaborator resolving signed manifests and fetching bytes
#[async_trait]
pub trait ModelApi: Send + Sync {
    /// Raw manifest response for a model; its shape depends on `endpoint`
    async fn resolve_model_manifest(
        &self,
        model_id: &str,
        endpoint: EndpointKind,
        device_id: &str,
    ) -> LmmResult<Value>;

    /// Raw manifest response for a vendor-hosted LoRA base
    /// (`{"weights": {"model": url}}`)
    async fn resolve_adapter_base_manifest(
        &self,
        base_repo: &str,
        revision: &str,
        device_id: &str,
    ) -> LmmResult<Value>;

    /// Download the body behind a signed URL
    async fn fetch(&self, url: &str) -> LmmResult<Vec<u8>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// HTTP implementation backed by reqwest
pub struct HttpModelApi {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl HttpModelApi {
    pub fn new(config: &RuntimeConfig) -> LmmResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| LmmError::Api(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn model_manifest_url(&self, model_id: &str, endpoint: EndpointKind, device_id: &str) -> String {
        let device = urlencoding::encode(device_id);
        match endpoint {
            EndpointKind::CoreModel | EndpointKind::Versioned => format!(
                "{}/{}/{}?nocache=true&dynamic=true&device={}{}",
                self.api_url,
                endpoint.as_str(),
                model_id,
                device,
                self.key_param()
            ),
            EndpointKind::Instant => format!(
                "{}/getWeights?model={}&device={}{}",
                self.api_url,
                urlencoding::encode(model_id),
                device,
                self.key_param()
            ),
        }
    }

    fn base_manifest_url(&self, base_repo: &str, revision: &str, device_id: &str) -> String {
        format!(
            "{}/lora_bases/{}?revision={}&device={}{}",
            self.api_url,
            base_repo,
            urlencoding::encode(revision),
            urlencoding::encode(device_id),
            self.key_param()
        )
    }

    fn key_param(&self) -> String {
        match &self.api_key {
            Some(key) => format!("&api_key={}", urlencoding::encode(key)),
            None => String::new(),
        }
    }

    async fn get_json(&self, url: &str) -> LmmResult<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LmmError::Api(redact(&e.to_string())))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| LmmError::Api(format!("Malformed manifest response: {}", redact(&e.to_string()))))
    }
}

/// Keep API keys out of error messages and logs
fn redact(message: &str) -> String {
    match message.find("api_key=") {
        Some(start) => {
            let rest = &message[start + "api_key=".len()..];
            let end = rest
                .find(|c: char| c == '&' || c == ')' || c.is_whitespace())
                .unwrap_or(rest.len());
            format!("{}api_key=***{}", &message[..start], &rest[end..])
        }
        None => message.to_string(),
    }
}

#[async_trait]
impl ModelApi for HttpModelApi {
    async fn resolve_model_manifest(
        &self,
        model_id: &str,
        endpoint: EndpointKind,
        device_id: &str,
    ) -> LmmResult<Value> {
        tracing::debug!(model_id = %model_id, endpoint = %endpoint, "Resolving model manifest");
        let url = self.model_manifest_url(model_id, endpoint, device_id);
        self.get_json(&url).await
    }

    async fn resolve_adapter_base_manifest(
        &self,
        base_repo: &str,
        revision: &str,
        device_id: &str,
    ) -> LmmResult<Value> {
        tracing::debug!(base_repo = %base_repo, revision = %revision, "Resolving LoRA base manifest");
        let url = self.base_manifest_url(base_repo, revision, device_id);
        self.get_json(&url).await
    }

    async fn fetch(&self, url: &str) -> LmmResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LmmError::Api(format!("Download failed: {}", e.without_url())))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| LmmError::Api(format!("Download interrupted: {}", e.without_url())))?;

        Ok(bytes.to_vec())
    }
}
