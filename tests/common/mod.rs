//! Shared mocks and fixtures for integration tests
//!
//! Each test binary pulls in only part of this module.
#![allow(dead_code)]

use async_trait::async_trait;
use image::RgbImage;
use lmm_compose::artifacts::{EndpointKind, FsArtifactStore, HubClient, ModelApi};
use lmm_compose::compose::adapter::AdapterConfig;
use lmm_compose::compose::dtype::Dtype;
use lmm_compose::compose::runtime::{
    AdaptedModel, BaseLoadRequest, EncodedInputs, GenerationParams, INPUT_IDS, LanguageModel,
    ModelInputs, Processor, ProcessorLoadRequest, SpecialTokenIds, Tensor, TensorRuntime,
};
use lmm_compose::device::Device;
use lmm_compose::inference::{Collaborators, Conversation, DecodingImageLoader};
use lmm_compose::{LmmError, LmmResult, RuntimeConfig};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CDN: &str = "https://cdn.example.test";

// =============================================================================
// Model API
// =============================================================================

type ManifestFn = Box<dyn Fn(EndpointKind, u32) -> Value + Send + Sync>;

/// Scripted API: manifests are rebuilt on every resolve call, so each
/// generation hands out different signed URLs.
pub struct MockApi {
    manifest: ManifestFn,
    base_manifest: Option<Value>,
    files: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    resolve_calls: AtomicU32,
    base_calls: AtomicU32,
    endpoints: Mutex<Vec<EndpointKind>>,
    fetched: Mutex<Vec<String>>,
}

impl MockApi {
    /// API that must never be consulted
    pub fn offline() -> Self {
        Self::with_manifest(|_, _| json!({}))
    }

    pub fn with_manifest(f: impl Fn(EndpointKind, u32) -> Value + Send + Sync + 'static) -> Self {
        Self {
            manifest: Box::new(f),
            base_manifest: None,
            files: HashMap::new(),
            delays: HashMap::new(),
            resolve_calls: AtomicU32::new(0),
            base_calls: AtomicU32::new(0),
            endpoints: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Serve `files` through a manifest shaped for whichever endpoint is
    /// asked; URLs carry the resolve generation (`/g1/`, `/g2/`, ...)
    pub fn serving(files: Vec<(&str, Vec<u8>)>) -> Self {
        let names: Vec<String> = files.iter().map(|(n, _)| n.to_string()).collect();
        let mut api = Self::with_manifest(move |endpoint, generation| {
            let weights: serde_json::Map<String, Value> = names
                .iter()
                .map(|name| (name.clone(), json!(signed_url(generation, name))))
                .collect();
            shape_manifest(endpoint, Value::Object(weights))
        });
        for (name, content) in files {
            api.files.insert(name.to_string(), content);
        }
        api
    }

    pub fn with_delay(mut self, filename: &str, delay: Duration) -> Self {
        self.delays.insert(filename.to_string(), delay);
        self
    }

    pub fn with_base_archive(mut self, filename: &str, content: Vec<u8>) -> Self {
        self.base_manifest = Some(json!({
            "weights": {"model": format!("{}/bases/{}?sig=base", CDN, filename)}
        }));
        self.files.insert(filename.to_string(), content);
        self
    }

    pub fn with_base_manifest(mut self, manifest: Value) -> Self {
        self.base_manifest = Some(manifest);
        self
    }

    pub fn resolve_calls(&self) -> u32 {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn base_calls(&self) -> u32 {
        self.base_calls.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<EndpointKind> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

pub fn signed_url(generation: u32, filename: &str) -> String {
    format!("{}/g{}/{}?X-Signature=gen{}", CDN, generation, filename, generation)
}

pub fn shape_manifest(endpoint: EndpointKind, weights: Value) -> Value {
    match endpoint {
        EndpointKind::CoreModel => json!({"weights": weights}),
        EndpointKind::Versioned => json!({"ort": {"weights": weights}}),
        EndpointKind::Instant => json!({"modelFiles": {"transformers": weights}}),
    }
}

#[async_trait]
impl ModelApi for MockApi {
    async fn resolve_model_manifest(
        &self,
        _model_id: &str,
        endpoint: EndpointKind,
        _device_id: &str,
    ) -> LmmResult<Value> {
        let generation = self.resolve_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.endpoints.lock().unwrap().push(endpoint);
        Ok((self.manifest)(endpoint, generation))
    }

    async fn resolve_adapter_base_manifest(
        &self,
        _base_repo: &str,
        _revision: &str,
        _device_id: &str,
    ) -> LmmResult<Value> {
        self.base_calls.fetch_add(1, Ordering::SeqCst);
        self.base_manifest
            .clone()
            .ok_or_else(|| LmmError::Api("no base manifest scripted".to_string()))
    }

    async fn fetch(&self, url: &str) -> LmmResult<Vec<u8>> {
        self.fetched.lock().unwrap().push(url.to_string());
        let filename = url
            .split('?')
            .next()
            .and_then(|path| path.rsplit('/').next())
            .unwrap_or_default();

        if let Some(delay) = self.delays.get(filename) {
            tokio::time::sleep(*delay).await;
        }
        self.files
            .get(filename)
            .cloned()
            .ok_or_else(|| LmmError::Api(format!("404 Not Found: {}", filename)))
    }
}

// =============================================================================
// Hub
// =============================================================================

/// Hub client returning a pre-seeded snapshot directory
pub struct MockHub {
    snapshot_dir: PathBuf,
    calls: Mutex<Vec<(String, String, String)>>,
}

impl MockHub {
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// (repo, revision, token) per call
    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HubClient for MockHub {
    async fn snapshot(&self, repo: &str, revision: &str, token: &str) -> LmmResult<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .push((repo.to_string(), revision.to_string(), token.to_string()));
        Ok(self.snapshot_dir.clone())
    }
}

// =============================================================================
// Compute Runtime
// =============================================================================

/// Everything the mock runtime saw, in call order
#[derive(Debug, Default)]
pub struct RuntimeLog {
    pub events: Vec<String>,
    pub base_requests: Vec<BaseLoadRequest>,
    pub processor_requests: Vec<ProcessorLoadRequest>,
    pub conversations: Vec<Conversation>,
    pub encoded_texts: Vec<String>,
    pub generation_params: Vec<GenerationParams>,
    pub input_names: Vec<Vec<String>>,
    pub input_devices: Vec<Device>,
    pub decoded: Vec<(Vec<u32>, bool)>,
}

pub type SharedLog = Arc<Mutex<RuntimeLog>>;

/// Fake compute runtime.
///
/// Encoding yields `prompt_tokens` as input ids; generation echoes them
/// followed by `generated_tokens`; decoding renders `decode_prefix` plus the
/// token ids joined by spaces.
#[derive(Clone)]
pub struct MockRuntime {
    pub log: SharedLog,
    pub prompt_tokens: Vec<u32>,
    pub generated_tokens: Vec<u32>,
    pub decode_prefix: String,
    pub special_tokens: SpecialTokenIds,
    /// Device the runtime places models on instead of the requested one
    pub placement: Option<Device>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            log: SharedLog::default(),
            prompt_tokens: vec![100, 101, 102],
            generated_tokens: vec![7, 8],
            decode_prefix: String::new(),
            special_tokens: SpecialTokenIds {
                pad: Some(0),
                eos: Some(2),
                bos: Some(1),
            },
            placement: None,
        }
    }
}

impl MockRuntime {
    pub fn with_decode_prefix(mut self, prefix: &str) -> Self {
        self.decode_prefix = prefix.to_string();
        self
    }

    pub fn with_placement(mut self, device: Device) -> Self {
        self.placement = Some(device);
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().events.clone()
    }

    fn event(&self, event: impl Into<String>) {
        self.log.lock().unwrap().events.push(event.into());
    }

    fn model(&self, device: Device) -> MockModel {
        MockModel {
            runtime: self.clone(),
            device,
        }
    }
}

impl TensorRuntime for MockRuntime {
    fn load_base(&self, request: &BaseLoadRequest) -> anyhow::Result<Box<dyn LanguageModel>> {
        self.event("load_base");
        self.log.lock().unwrap().base_requests.push(request.clone());
        Ok(Box::new(self.model(self.placement.unwrap_or(request.device))))
    }

    fn load_processor(&self, request: &ProcessorLoadRequest) -> anyhow::Result<Box<dyn Processor>> {
        self.event("load_processor");
        self.log.lock().unwrap().processor_requests.push(request.clone());
        Ok(Box::new(MockProcessor {
            runtime: self.clone(),
        }))
    }
}

pub struct MockModel {
    runtime: MockRuntime,
    device: Device,
}

impl MockModel {
    fn run(&self, inputs: &ModelInputs, params: &GenerationParams) -> Vec<Vec<u32>> {
        let mut log = self.runtime.log.lock().unwrap();
        log.events.push("generate".to_string());
        log.generation_params.push(*params);
        log.input_names
            .push(inputs.names().map(String::from).collect());
        if let Some(ids) = inputs.get(INPUT_IDS) {
            log.input_devices.push(ids.device);
        }
        drop(log);

        let mut sequence = self.runtime.prompt_tokens.clone();
        sequence.extend(&self.runtime.generated_tokens);
        vec![sequence]
    }
}

impl LanguageModel for MockModel {
    fn device(&self) -> Device {
        self.device
    }

    fn set_eval(&mut self, dtype: Dtype) -> anyhow::Result<()> {
        self.runtime.event(format!("eval:{}", dtype));
        Ok(())
    }

    fn attach_adapter(
        self: Box<Self>,
        adapter_dir: &Path,
        _config: &AdapterConfig,
    ) -> anyhow::Result<Box<dyn AdaptedModel>> {
        anyhow::ensure!(
            adapter_dir.join("adapter_config.json").exists(),
            "adapter config missing from {:?}",
            adapter_dir
        );
        self.runtime.event("attach_adapter");
        Ok(Box::new(MockAdapted { base: *self }))
    }

    fn generate(
        &self,
        inputs: &ModelInputs,
        params: &GenerationParams,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        Ok(self.run(inputs, params))
    }
}

pub struct MockAdapted {
    base: MockModel,
}

impl AdaptedModel for MockAdapted {
    fn device(&self) -> Device {
        self.base.device
    }

    fn set_eval(&mut self, dtype: Dtype) -> anyhow::Result<()> {
        self.base.runtime.event(format!("adapted_eval:{}", dtype));
        Ok(())
    }

    fn merge_and_unload(self: Box<Self>) -> anyhow::Result<Box<dyn LanguageModel>> {
        self.base.runtime.event("merge_and_unload");
        Ok(Box::new(self.base))
    }

    fn generate(
        &self,
        inputs: &ModelInputs,
        params: &GenerationParams,
    ) -> anyhow::Result<Vec<Vec<u32>>> {
        Ok(self.base.run(inputs, params))
    }
}

pub struct MockProcessor {
    runtime: MockRuntime,
}

impl Processor for MockProcessor {
    fn apply_chat_template(&self, conversation: &Conversation) -> anyhow::Result<String> {
        self.runtime
            .log
            .lock()
            .unwrap()
            .conversations
            .push(conversation.clone());
        Ok(format!(
            "<system>{}</system><user><image/>{}</user>",
            conversation.system_prompt(),
            conversation.user_prompt()
        ))
    }

    fn encode(&self, text: &str, image: &RgbImage) -> anyhow::Result<EncodedInputs> {
        self.runtime
            .log
            .lock()
            .unwrap()
            .encoded_texts
            .push(text.to_string());
        let ids: Vec<i64> = self.runtime.prompt_tokens.iter().map(|&t| t as i64).collect();
        let pixels = (image.width() * image.height()) as usize;
        Ok(EncodedInputs::new()
            .with_tensor(INPUT_IDS, Tensor::int(vec![1, ids.len()], ids))
            .with_tensor("pixel_values", Tensor::float(vec![pixels, 3], vec![0.0; pixels * 3]))
            .with_value("image_grid_thw", json!([[1, image.height(), image.width()]])))
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        self.runtime
            .log
            .lock()
            .unwrap()
            .decoded
            .push((tokens.to_vec(), skip_special_tokens));
        let rendered: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        Ok(format!("{}{}", self.runtime.decode_prefix, rendered.join(" ")))
    }

    fn special_tokens(&self) -> SpecialTokenIds {
        self.runtime.special_tokens
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn runtime_config(cache_dir: &Path) -> RuntimeConfig {
    RuntimeConfig {
        cache_dir: cache_dir.to_path_buf(),
        api_key: Some("test-key".to_string()),
        device: Some("cpu".to_string()),
        ..Default::default()
    }
}

pub fn collaborators(
    api: Arc<MockApi>,
    cache_dir: &Path,
    hub: Arc<MockHub>,
    runtime: &MockRuntime,
) -> Collaborators {
    Collaborators {
        api,
        store: Arc::new(FsArtifactStore::new(cache_dir)),
        hub,
        runtime: Arc::new(runtime.clone()),
        image_loader: Arc::new(DecodingImageLoader),
    }
}

/// Write files into `dir`, creating it
pub fn seed_dir(dir: &Path, files: &[(&str, String)]) {
    std::fs::create_dir_all(dir).unwrap();
    for (name, content) in files {
        std::fs::write(dir.join(name), content).unwrap();
    }
}

pub fn adapter_config_json(base: &str, revision: Option<&str>) -> String {
    let mut value = json!({
        "base_model_name_or_path": base,
        "r": 8,
        "lora_alpha": 16,
        "target_modules": ["q_proj", "v_proj"],
        "eva_config": null,
        "lora_bias": false,
        "exclude_modules": null
    });
    if let Some(revision) = revision {
        value["revision"] = json!(revision);
    }
    serde_json::to_string_pretty(&value).unwrap()
}

pub fn preprocessor_json(processor_type: &str) -> String {
    serde_json::to_string_pretty(&json!({
        "do_resize": true,
        "image_processor_type": processor_type,
        "patch_size": 14,
        "merge_size": 2
    }))
    .unwrap()
}

pub fn chat_template_json() -> String {
    json!({"chat_template": "{% for message in messages %}{{ message.role }}{% endfor %}"}).to_string()
}

/// Cached files of a full-weight model
pub fn plain_model_files() -> Vec<(&'static str, String)> {
    vec![
        ("config.json", "{}".to_string()),
        ("tokenizer.json", "{}".to_string()),
        ("model-00001.safetensors", "weights".to_string()),
        ("preprocessor_config.json", preprocessor_json("SiglipImageProcessor")),
    ]
}

/// Cached files of a LoRA adapter
pub fn adapter_files(base: &str, revision: Option<&str>) -> Vec<(&'static str, String)> {
    vec![
        ("adapter_config.json", adapter_config_json(base, revision)),
        ("adapter_model.safetensors", "lora".to_string()),
        ("tokenizer.json", "{}".to_string()),
        ("preprocessor_config.json", preprocessor_json("Qwen2VLImageProcessor")),
        ("chat_template.json", chat_template_json()),
    ]
}

/// Pre-extracted vendor base under `lora-bases/<repo>/<revision>`
pub fn seed_vendor_base(cache_dir: &Path, repo: &str, revision: &str, processor_type: &str) -> PathBuf {
    let dir = cache_dir.join("lora-bases").join(repo).join(revision);
    seed_dir(
        &dir,
        &[
            ("config.json", "{}".to_string()),
            ("model.safetensors", "base".to_string()),
            ("preprocessor_config.json", preprocessor_json(processor_type)),
            ("weights.tar.gz", "stale archive".to_string()),
        ],
    );
    dir
}

/// Build a gzip-compressed tarball in memory
pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn test_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, image::Rgb([120, 64, 32]))
}
