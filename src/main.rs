//! lmm-compose - cache preparation CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lmm_compose::artifacts::{
    ArtifactCacheManager, FsArtifactStore, HfHubClient, HttpModelApi, manifest::list_files,
    store::dir_size,
};
use lmm_compose::{Composer, Dtype, FamilyKind, ModelDescriptor, RuntimeConfig, metrics};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "lmm-compose")]
#[command(about = "Multimodal model artifact cache and composition tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,

    /// Print collected Prometheus metrics before exiting
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download, patch and materialize everything a model needs on disk
    Prepare {
        #[command(flatten)]
        model: ModelArgs,

        /// Requested precision (float16, bfloat16, float32, ...)
        #[arg(long)]
        dtype: Option<String>,

        /// Force quantized (true) or full-precision (false) base loading
        #[arg(long)]
        quantize: Option<bool>,
    },
    /// Show a family's required files and whether they are cached
    Manifest {
        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ModelArgs {
    /// Model id (`dataset/version` or an instant model id)
    #[arg(long)]
    model_id: String,

    /// Model family (transformers, lora-transformers, qwen25vl, lora-qwen25vl)
    #[arg(long)]
    family: String,

    /// Model revision tag, recorded with the prepared artifacts
    #[arg(long)]
    revision: Option<String>,

    /// Resolve weights through the core-model endpoint
    #[arg(long)]
    core: bool,
}

impl ModelArgs {
    fn descriptor(&self) -> ModelDescriptor {
        let mut descriptor = ModelDescriptor::new(&self.model_id);
        if let Some(revision) = &self.revision {
            descriptor = descriptor.with_revision(revision);
        }
        if self.core {
            descriptor.as_core_model()
        } else {
            descriptor
        }
    }

    fn family(&self) -> Result<FamilyKind> {
        Ok(self.family.parse::<FamilyKind>()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    let config = RuntimeConfig::load(cli.config)?;
    config.validate()?;

    tracing::info!(
        cache_dir = ?config.cache_dir,
        api_url = %config.api_url,
        device_id = %config.device_id,
        "Configuration loaded"
    );

    let prometheus_handle = if cli.print_metrics {
        Some(metrics::setup_metrics()?)
    } else {
        None
    };

    match cli.command {
        Command::Prepare {
            model,
            dtype,
            quantize,
        } => {
            let mut descriptor = model.descriptor();
            if let Some(name) = dtype {
                let dtype = Dtype::from_name(&name)
                    .with_context(|| format!("Unknown dtype '{}'", name))?;
                descriptor = descriptor.with_dtype(dtype);
            }
            if let Some(quantize) = quantize {
                descriptor = descriptor.with_quantization(quantize);
            }
            prepare(Arc::new(config), descriptor, model.family()?).await?;
        }
        Command::Manifest { model } => {
            show_manifest(&config, &model.descriptor(), model.family()?)?;
        }
    }

    if let Some(handle) = prometheus_handle {
        println!("{}", handle.render());
    }

    Ok(())
}

async fn prepare(
    config: Arc<RuntimeConfig>,
    descriptor: ModelDescriptor,
    kind: FamilyKind,
) -> Result<()> {
    let family = kind.build()?;
    let device = config.resolve_device()?;

    let cache = ArtifactCacheManager::new(
        Arc::new(HttpModelApi::new(&config)?),
        Arc::new(FsArtifactStore::new(&config.cache_dir)),
        &config,
    );
    let hub = Arc::new(HfHubClient::new(config.hub_cache_dir()));
    let composer = Composer::new(config, device, cache, hub);

    let prepared = composer
        .prepare(&descriptor, family.as_ref())
        .await
        .with_context(|| format!("Failed to prepare {}", descriptor.model_id()))?;

    let summary = json!({
        "model_id": descriptor.model_id(),
        "revision": descriptor.revision(),
        "family": kind.as_str(),
        "model_dir": prepared.model_dir,
        "base_dir": prepared.base_dir,
        "dtype": prepared.dtype,
        "quantization": prepared.quantization,
        "device": device,
        "stage": prepared.stage(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn show_manifest(config: &RuntimeConfig, descriptor: &ModelDescriptor, kind: FamilyKind) -> Result<()> {
    descriptor.validate()?;
    let family = kind.build()?;
    let manifest = &family.policy().manifest;

    let dir = config.cache_dir.join(descriptor.cache_key());
    let present = list_files(&dir);

    let required: Vec<_> = manifest
        .required
        .iter()
        .map(|file| json!({"file": file.to_string(), "cached": file.is_satisfied_by(&present)}))
        .collect();
    let optional: Vec<_> = manifest
        .optional
        .iter()
        .map(|file| json!({"file": file, "cached": present.contains(file)}))
        .collect();

    let summary = json!({
        "model_id": descriptor.model_id(),
        "family": kind.as_str(),
        "cache_dir": dir,
        "complete": manifest.is_complete_in(&dir),
        "size_bytes": dir_size(&dir),
        "required": required,
        "optional": optional,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
