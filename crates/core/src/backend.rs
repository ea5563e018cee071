//! Compute-device selection and `ort::Session` construction shared by the
//! detection and lip-sync adapters.

use std::path::Path;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Inference device selection. `Cuda` registers the CUDA execution provider;
/// if it is unavailable at runtime, ORT falls back to CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    #[default]
    Cuda,
    Cpu,
}

impl ComputeDevice {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub device: ComputeDevice,
}

/// Build an `ort::Session` for the requested device.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match config.device {
        ComputeDevice::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available — inference will fall back to CPU");
            }

            debug!(
                device = "cuda",
                model = %config.model_path.display(),
                "Building session with CUDA EP"
            );

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        ComputeDevice::Cpu => {
            debug!(
                device = "cpu",
                model = %config.model_path.display(),
                "Building session without accelerator EPs"
            );

            builder
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
    };

    Ok(session)
}

/// Strip serialization-artifact prefixes that export tooling leaves on graph
/// tensor names (`module.` from DataParallel-wrapped checkpoints).
pub fn strip_export_prefix(name: &str) -> &str {
    name.strip_prefix("module.").unwrap_or(name)
}

/// Classify a runtime error message as device memory exhaustion, the one
/// failure the face locator retries at a smaller batch size.
pub fn is_memory_exhaustion(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("out of memory")
        || lower.contains("cudamalloc")
        || lower.contains("oom")
        || lower.contains("failed to allocate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_from_str_lossy() {
        assert_eq!(ComputeDevice::from_str_lossy("cpu"), ComputeDevice::Cpu);
        assert_eq!(ComputeDevice::from_str_lossy("CPU"), ComputeDevice::Cpu);
        assert_eq!(ComputeDevice::from_str_lossy("cuda"), ComputeDevice::Cuda);
        assert_eq!(ComputeDevice::from_str_lossy("unknown"), ComputeDevice::Cuda);
        assert_eq!(ComputeDevice::from_str_lossy(""), ComputeDevice::Cuda);
    }

    #[test]
    fn test_device_display_and_default() {
        assert_eq!(ComputeDevice::Cuda.to_string(), "cuda");
        assert_eq!(ComputeDevice::Cpu.to_string(), "cpu");
        assert_eq!(ComputeDevice::default(), ComputeDevice::Cuda);
    }

    #[test]
    fn test_strip_export_prefix() {
        assert_eq!(strip_export_prefix("module.audio_encoder"), "audio_encoder");
        assert_eq!(strip_export_prefix("face_sequences"), "face_sequences");
        assert_eq!(strip_export_prefix("module."), "");
    }

    #[test]
    fn test_memory_exhaustion_classification() {
        assert!(is_memory_exhaustion("CUDA error: out of memory"));
        assert!(is_memory_exhaustion("cudaMalloc failed"));
        assert!(is_memory_exhaustion("Failed to allocate 512MB on device 0"));
        assert!(!is_memory_exhaustion("invalid model file"));
        assert!(!is_memory_exhaustion("shape mismatch for input"));
    }
}
