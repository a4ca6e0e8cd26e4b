//! Compute device selection
//!
//! Placement is resolved once, when the runtime configuration is built: an
//! explicit `DEVICE` value wins, otherwise `nvidia-smi` is probed and the
//! first visible GPU is used, falling back to the CPU.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;
use std::str::FromStr;

/// Device the composed model is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Cuda(u32),
    Mps,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(index) => write!(f, "cuda:{}", index),
            Self::Mps => write!(f, "mps"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Self::Cpu),
            "mps" => Ok(Self::Mps),
            "cuda" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|idx| idx.parse::<u32>().ok())
                .map(Self::Cuda)
                .ok_or_else(|| format!("Unrecognized device '{}'", other)),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Detect visible GPUs using nvidia-smi
///
/// Returns the indices reported by the driver; an empty list when the tool
/// is missing or fails.
pub fn detect_gpus() -> Vec<u32> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let indices: Vec<u32> = stdout
                .lines()
                .filter_map(|line| line.trim().parse::<u32>().ok())
                .collect();

            tracing::info!(gpu_count = indices.len(), indices = ?indices, "Detected available GPUs");
            indices
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(stderr = %stderr, "nvidia-smi failed, assuming no GPUs available");
            Vec::new()
        }
        Err(e) => {
            tracing::debug!(error = %e, "nvidia-smi not available, assuming no GPUs");
            Vec::new()
        }
    }
}

/// Pick a device from an explicit setting or by autodetection
pub fn resolve_device(explicit: Option<&str>) -> Result<Device, String> {
    if let Some(value) = explicit {
        return value.parse();
    }
    Ok(autodetect(&detect_gpus()))
}

fn autodetect(gpus: &[u32]) -> Device {
    // CUDA renumbers visible devices from zero
    if gpus.is_empty() {
        Device::Cpu
    } else {
        Device::Cuda(0)
    }
}
