//! Numeric precision and quantization settings

use serde::{Deserialize, Serialize};
use std::fmt;

/// Parameter precision requested from the compute runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float16,
    BFloat16,
    Float32,
    Float64,
}

impl Dtype {
    /// Parse a precision identifier as written in adapter revisions and
    /// runtime configuration ("bfloat16", "half", "float", ...)
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "float16" | "half" => Some(Self::Float16),
            "bfloat16" => Some(Self::BFloat16),
            "float32" | "float" => Some(Self::Float32),
            "float64" | "double" => Some(Self::Float64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the effective precision.
///
/// An adapter revision naming a known precision overrides the caller's
/// choice, which overrides the family default. Unrecognized revisions
/// (branch names, commit hashes) are ignored.
pub fn resolve_dtype(
    family_default: Dtype,
    requested: Option<Dtype>,
    adapter_revision: Option<&str>,
) -> Dtype {
    let base = requested.unwrap_or(family_default);
    match adapter_revision.and_then(Dtype::from_name) {
        Some(from_revision) => {
            tracing::debug!(
                revision = ?adapter_revision,
                dtype = %from_revision,
                "Adapter revision overrides dtype"
            );
            from_revision
        }
        None => base,
    }
}

/// Block quantization scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    Nf4,
    Fp4,
}

/// Quantized base-load settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub load_in_4bit: bool,
    pub double_quant: bool,
    pub quant_type: QuantType,
    pub storage_dtype: Dtype,
}

impl QuantizationConfig {
    /// 4-bit NF4 with double quantization and bfloat16 block storage
    pub const fn nf4_double_quant() -> Self {
        Self {
            load_in_4bit: true,
            double_quant: true,
            quant_type: QuantType::Nf4,
            storage_dtype: Dtype::BFloat16,
        }
    }
}
