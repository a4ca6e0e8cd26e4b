//! In-place normalization of adapter and preprocessor configuration files
//!
//! Both patches are destructive and idempotent: the normalized form is
//! written back to the cache, and running a patch on an already patched
//! file leaves it byte-for-byte unchanged.

use crate::error::{LmmError, LmmResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

/// Adapter fields the local LoRA parser does not understand
pub const UNSUPPORTED_ADAPTER_FIELDS: [&str; 3] = ["eva_config", "lora_bias", "exclude_modules"];

/// Preprocessor field naming the image processor class
pub const PROCESSOR_TYPE_KEY: &str = "image_processor_type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Unchanged,
    Rewritten,
}

fn read_object(path: &Path, what: &str) -> LmmResult<Map<String, Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LmmError::artifact(format!("{} not found at {:?}", what, path)));
        }
        Err(e) => return Err(LmmError::io(path, e)),
    };

    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map),
        _ => Err(LmmError::configuration(format!(
            "{} at {:?} is not a JSON object",
            what, path
        ))),
    }
}

fn write_if_changed(path: &Path, rendered: &[u8]) -> LmmResult<PatchOutcome> {
    let current = std::fs::read(path).map_err(|e| LmmError::io(path, e))?;
    if current == rendered {
        return Ok(PatchOutcome::Unchanged);
    }
    std::fs::write(path, rendered).map_err(|e| LmmError::io(path, e))?;
    Ok(PatchOutcome::Rewritten)
}

/// Strip unsupported fields from an adapter config and persist the result
/// (2-space indented JSON). Absent fields are a no-op.
pub fn normalize_adapter_config(path: &Path) -> LmmResult<PatchOutcome> {
    let mut config = read_object(path, "Adapter config")?;

    for key in UNSUPPORTED_ADAPTER_FIELDS {
        if config.shift_remove(key).is_some() {
            tracing::debug!(path = ?path, field = key, "Removed unsupported adapter field");
        }
    }

    let rendered = serde_json::to_vec_pretty(&Value::Object(config))?;
    let outcome = write_if_changed(path, &rendered)?;
    if outcome == PatchOutcome::Rewritten {
        tracing::info!(path = ?path, "Normalized adapter config");
    }
    Ok(outcome)
}

/// Make the preprocessor config name the image processor the loader
/// expects.
///
/// A wrong value is corrected and only that field changes; a correct value
/// leaves the file untouched; an absent field is a configuration error
/// rather than a guess.
pub fn patch_processor_type(path: &Path, expected: &str) -> LmmResult<PatchOutcome> {
    let mut config = read_object(path, "Preprocessor config")?;

    match config.get(PROCESSOR_TYPE_KEY) {
        None => Err(LmmError::configuration(format!(
            "'{}' not found in {:?}",
            PROCESSOR_TYPE_KEY, path
        ))),
        Some(Value::String(current)) if current == expected => Ok(PatchOutcome::Unchanged),
        Some(current) => {
            tracing::info!(
                path = ?path,
                found = %current,
                expected = %expected,
                "Correcting image processor type"
            );
            config.insert(PROCESSOR_TYPE_KEY.to_string(), Value::String(expected.to_string()));
            let rendered = to_vec_indent4(&Value::Object(config))?;
            std::fs::write(path, rendered).map_err(|e| LmmError::io(path, e))?;
            Ok(PatchOutcome::Rewritten)
        }
    }
}

fn to_vec_indent4(value: &Value) -> LmmResult<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}
