//! Composition engine integration tests
//!
//! Run the full prepare + load pipeline per family against a seeded cache
//! and the mock compute runtime.

mod common;

use common::*;
use lmm_compose::artifacts::{ArtifactCacheManager, FsArtifactStore};
use lmm_compose::compose::family::{
    AdapterMode, LoraQwen25VlFamily, LoraTransformersFamily, ModelFamily, Qwen25VlFamily,
    TransformersFamily,
};
use lmm_compose::compose::runtime::PixelBounds;
use lmm_compose::compose::{
    AdapterState, Composer, CompositionStage, Dtype, FamilyPolicy, ModelHandle, QuantizationConfig,
};
use lmm_compose::device::Device;
use lmm_compose::{ModelDescriptor, RuntimeConfig};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const QWEN_BASE: &str = "qwen/qwen25vl-7b";

fn composer(config: RuntimeConfig, api: Arc<MockApi>, hub: Arc<MockHub>) -> Composer {
    let cache = ArtifactCacheManager::new(
        api,
        Arc::new(FsArtifactStore::new(&config.cache_dir)),
        &config,
    );
    Composer::new(Arc::new(config), Device::Cpu, cache, hub)
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_cached_plain_model_reaches_ready_offline() {
    let temp = TempDir::new().unwrap();
    let model_dir = temp.path().join("vehicles/3");
    seed_dir(&model_dir, &plain_model_files());

    let api = Arc::new(MockApi::offline());
    let hub = Arc::new(MockHub::new(temp.path().join("unused")));
    let runtime = MockRuntime::default();
    let composer = composer(runtime_config(temp.path()), api.clone(), hub.clone());
    let family = TransformersFamily::new().unwrap();

    let composed = composer
        .compose(&ModelDescriptor::new("vehicles/3"), &family, &runtime)
        .await
        .unwrap();

    assert_eq!(composed.stage(), CompositionStage::Ready);
    assert_eq!(
        composed.stages(),
        &[
            CompositionStage::Uninitialized,
            CompositionStage::ArtifactsCached,
            CompositionStage::ConfigPatched,
            CompositionStage::BaseLoaded,
            CompositionStage::ProcessorLoaded,
            CompositionStage::Ready,
        ]
    );
    assert_eq!(api.resolve_calls(), 0);
    assert!(api.fetched().is_empty());
    assert!(hub.calls().is_empty());
    assert_eq!(composed.adapter(), &AdapterState::None);
    assert_eq!(composed.dtype(), Dtype::Float16);

    let log = runtime.log.lock().unwrap();
    assert_eq!(log.base_requests[0].model_dir, model_dir);
    assert_eq!(log.base_requests[0].quantization, None);
    assert_eq!(log.processor_requests[0].chat_template, None);
    assert_eq!(log.events, vec!["load_base", "eval:float16", "load_processor"]);
}

#[tokio::test]
async fn test_lora_qwen_merge_is_one_way() {
    let temp = TempDir::new().unwrap();
    seed_dir(&temp.path().join("damage/2"), &adapter_files(QWEN_BASE, None));
    let base_dir = seed_vendor_base(temp.path(), QWEN_BASE, "main", "Qwen2_5_VLImageProcessor");

    let api = Arc::new(MockApi::offline());
    let runtime = MockRuntime::default();
    let composer = composer(
        runtime_config(temp.path()),
        api.clone(),
        Arc::new(MockHub::new(temp.path())),
    );

    let composed = composer
        .compose(&ModelDescriptor::new("damage/2"), &LoraQwen25VlFamily::new(), &runtime)
        .await
        .unwrap();

    assert_eq!(
        composed.adapter(),
        &AdapterState::Merged {
            base_model: QWEN_BASE.to_string()
        }
    );
    // Only the merged base is reachable
    assert!(matches!(composed.model(), ModelHandle::Base(_)));
    assert!(composed.stages().contains(&CompositionStage::AdapterMerged));
    assert!(!composed.stages().contains(&CompositionStage::AdapterAttached));
    assert_eq!(
        runtime.events(),
        vec![
            "load_base",
            "attach_adapter",
            "adapted_eval:bfloat16",
            "merge_and_unload",
            "load_processor"
        ]
    );

    // Vendor base reused, stale archive purged, processor type corrected
    assert_eq!(api.base_calls(), 0);
    assert!(!base_dir.join("weights.tar.gz").exists());
    let preprocessor = read_json(&base_dir.join("preprocessor_config.json"));
    assert_eq!(preprocessor["image_processor_type"], "Qwen2VLImageProcessor");
    assert_eq!(preprocessor["patch_size"], 14);

    // Adapter config normalized on disk
    let adapter = read_json(&temp.path().join("damage/2/adapter_config.json"));
    assert!(adapter.get("eva_config").is_none());
    assert!(adapter.get("lora_bias").is_none());
    assert!(adapter.get("exclude_modules").is_none());

    let log = runtime.log.lock().unwrap();
    assert_eq!(log.base_requests[0].model_dir, base_dir);
    assert_eq!(
        log.base_requests[0].quantization,
        Some(QuantizationConfig::nf4_double_quant())
    );
    let processor = &log.processor_requests[0];
    assert_eq!(processor.model_dir, base_dir);
    assert!(processor.chat_template.as_deref().unwrap().contains("message.role"));
    assert_eq!(
        processor.pixel_bounds,
        Some(PixelBounds {
            min_pixels: 256 * 28 * 28,
            max_pixels: 1280 * 28 * 28
        })
    );
}

#[tokio::test]
async fn test_vendor_base_downloaded_when_missing() {
    let temp = TempDir::new().unwrap();
    seed_dir(&temp.path().join("damage/4"), &adapter_files(QWEN_BASE, None));
    let archive = tar_gz(&[
        ("config.json", &b"{}"[..]),
        (
            "preprocessor_config.json",
            preprocessor_json("Qwen2_5_VLImageProcessor").as_bytes(),
        ),
    ]);
    let api = Arc::new(MockApi::offline().with_base_archive("weights.tar.gz", archive));
    let runtime = MockRuntime::default();
    let composer = composer(
        runtime_config(temp.path()),
        api.clone(),
        Arc::new(MockHub::new(temp.path())),
    );

    composer
        .compose(&ModelDescriptor::new("damage/4"), &LoraQwen25VlFamily::new(), &runtime)
        .await
        .unwrap();

    let base_dir = temp.path().join("lora-bases/qwen/qwen25vl-7b/main");
    assert_eq!(api.base_calls(), 1);
    assert!(base_dir.join("config.json").exists());
    assert!(!base_dir.join("weights.tar.gz").exists());
    assert_eq!(
        read_json(&base_dir.join("preprocessor_config.json"))["image_processor_type"],
        "Qwen2VLImageProcessor"
    );
}

#[tokio::test]
async fn test_missing_hub_token_fails_before_download() {
    let temp = TempDir::new().unwrap();
    let config = RuntimeConfig {
        huggingface_token: None,
        ..runtime_config(temp.path())
    };
    let api = Arc::new(MockApi::serving(vec![("adapter_config.json", b"{}".to_vec())]));
    let hub = Arc::new(MockHub::new(temp.path()));
    let runtime = MockRuntime::default();
    let composer = composer(config, api.clone(), hub.clone());

    let err = composer
        .compose(&ModelDescriptor::new("captions/1"), &LoraTransformersFamily::new(), &runtime)
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert!(err.to_string().contains("HUGGINGFACE_TOKEN"));
    assert_eq!(api.resolve_calls(), 0);
    assert!(hub.calls().is_empty());
    assert!(runtime.events().is_empty());
    assert!(!temp.path().join("captions/1").exists());
}

#[tokio::test]
async fn test_hub_base_uses_adapter_revision_and_token() {
    let temp = TempDir::new().unwrap();
    seed_dir(
        &temp.path().join("captions/1"),
        &adapter_files("google/paligemma-3b", Some("float32")),
    );
    let snapshot = temp.path().join("huggingface/snapshot");
    seed_dir(&snapshot, &plain_model_files());

    let config = RuntimeConfig {
        huggingface_token: Some("hf_secret".to_string()),
        ..runtime_config(temp.path())
    };
    let hub = Arc::new(MockHub::new(&snapshot));
    let runtime = MockRuntime::default();
    let composer = composer(config, Arc::new(MockApi::offline()), hub.clone());

    let descriptor = ModelDescriptor::new("captions/1").with_dtype(Dtype::Float16);
    let composed = composer
        .compose(&descriptor, &LoraTransformersFamily::new(), &runtime)
        .await
        .unwrap();

    assert_eq!(
        hub.calls(),
        vec![(
            "google/paligemma-3b".to_string(),
            "float32".to_string(),
            "hf_secret".to_string()
        )]
    );
    // A revision naming a precision beats the caller's dtype
    assert_eq!(composed.dtype(), Dtype::Float32);
    assert!(matches!(composed.adapter(), AdapterState::Merged { .. }));

    let log = runtime.log.lock().unwrap();
    assert_eq!(log.base_requests[0].model_dir, snapshot);
    assert_eq!(log.base_requests[0].dtype, Dtype::Float32);
    assert_eq!(log.processor_requests[0].model_dir, snapshot);
}

#[tokio::test]
async fn test_unrecognized_revision_keeps_caller_dtype() {
    let temp = TempDir::new().unwrap();
    let mut files = adapter_files(QWEN_BASE, Some("main"));
    files.retain(|(name, _)| *name != "adapter_model.safetensors");
    seed_dir(&temp.path().join("scenes/1"), &files);
    seed_vendor_base(temp.path(), QWEN_BASE, "main", "Qwen2VLImageProcessor");

    let runtime = MockRuntime::default();
    let composer = composer(
        runtime_config(temp.path()),
        Arc::new(MockApi::offline()),
        Arc::new(MockHub::new(temp.path())),
    );
    let descriptor = ModelDescriptor::new("scenes/1")
        .with_dtype(Dtype::Float32)
        .with_quantization(false);

    let composed = composer
        .compose(&descriptor, &Qwen25VlFamily::new(), &runtime)
        .await
        .unwrap();

    assert_eq!(composed.dtype(), Dtype::Float32);
    assert_eq!(composed.adapter(), &AdapterState::None);

    let log = runtime.log.lock().unwrap();
    assert_eq!(log.base_requests[0].quantization, None);
    // Plain Qwen2.5-VL keeps the stale archive
    assert!(
        temp.path()
            .join("lora-bases/qwen/qwen25vl-7b/main/weights.tar.gz")
            .exists()
    );
    assert_eq!(log.events, vec!["load_base", "eval:float32", "load_processor"]);
}

#[tokio::test]
async fn test_missing_processor_type_is_configuration_error() {
    let temp = TempDir::new().unwrap();
    seed_dir(&temp.path().join("damage/2"), &adapter_files(QWEN_BASE, None));
    let base_dir = seed_vendor_base(temp.path(), QWEN_BASE, "main", "unused");
    std::fs::write(base_dir.join("preprocessor_config.json"), r#"{"do_resize": true}"#).unwrap();

    let runtime = MockRuntime::default();
    let composer = composer(
        runtime_config(temp.path()),
        Arc::new(MockApi::offline()),
        Arc::new(MockHub::new(temp.path())),
    );

    let err = composer
        .compose(&ModelDescriptor::new("damage/2"), &LoraQwen25VlFamily::new(), &runtime)
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    // Nothing was loaded
    assert!(runtime.events().is_empty());
}

#[tokio::test]
async fn test_missing_chat_template_key_fails_before_ready() {
    let temp = TempDir::new().unwrap();
    let mut files = adapter_files(QWEN_BASE, None);
    for (name, content) in files.iter_mut() {
        if *name == "chat_template.json" {
            *content = r#"{"template": "x"}"#.to_string();
        }
    }
    seed_dir(&temp.path().join("damage/2"), &files);
    seed_vendor_base(temp.path(), QWEN_BASE, "main", "Qwen2VLImageProcessor");

    let runtime = MockRuntime::default();
    let composer = composer(
        runtime_config(temp.path()),
        Arc::new(MockApi::offline()),
        Arc::new(MockHub::new(temp.path())),
    );

    let err = composer
        .compose(&ModelDescriptor::new("damage/2"), &LoraQwen25VlFamily::new(), &runtime)
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert!(!runtime.events().contains(&"load_processor".to_string()));
}

#[tokio::test]
async fn test_prepare_downloads_missing_model_files() {
    let temp = TempDir::new().unwrap();
    let files: Vec<(&str, Vec<u8>)> = plain_model_files()
        .into_iter()
        .map(|(name, content)| (name, content.into_bytes()))
        .collect();
    let api = Arc::new(MockApi::serving(files));
    let composer = composer(
        runtime_config(temp.path()),
        api.clone(),
        Arc::new(MockHub::new(temp.path())),
    );

    let prepared = composer
        .prepare(&ModelDescriptor::new("vehicles/9"), &TransformersFamily::new().unwrap())
        .await
        .unwrap();

    assert_eq!(prepared.stage(), CompositionStage::ConfigPatched);
    assert_eq!(prepared.model_dir, temp.path().join("vehicles/9"));
    assert_eq!(prepared.base_dir, prepared.model_dir);
    assert_eq!(api.resolve_calls(), 1);
    assert_eq!(api.fetched().len(), 4);
}

/// Family keeping its adapter separate from the base
struct AttachOnlyFamily {
    policy: FamilyPolicy,
}

impl ModelFamily for AttachOnlyFamily {
    fn policy(&self) -> &FamilyPolicy {
        &self.policy
    }
}

#[tokio::test]
async fn test_attach_without_merge_keeps_adapter() {
    let temp = TempDir::new().unwrap();
    seed_dir(&temp.path().join("damage/7"), &adapter_files(QWEN_BASE, Some("float16")));
    seed_vendor_base(temp.path(), QWEN_BASE, "float16", "Qwen2VLImageProcessor");

    let mut policy = LoraQwen25VlFamily::new().policy().clone();
    policy.name = "attach-only";
    policy.adapter_mode = AdapterMode::Attach;
    let family = AttachOnlyFamily { policy };

    let runtime = MockRuntime::default();
    let composer = composer(
        runtime_config(temp.path()),
        Arc::new(MockApi::offline()),
        Arc::new(MockHub::new(temp.path())),
    );

    let composed = composer
        .compose(&ModelDescriptor::new("damage/7"), &family, &runtime)
        .await
        .unwrap();

    assert!(matches!(composed.model(), ModelHandle::Adapted(_)));
    assert!(matches!(composed.adapter(), AdapterState::Attached { .. }));
    assert!(composed.stages().contains(&CompositionStage::AdapterAttached));
    assert_eq!(composed.dtype(), Dtype::Float16);
    assert!(!runtime.events().contains(&"merge_and_unload".to_string()));
}
