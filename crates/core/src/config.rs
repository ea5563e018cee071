use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::assembler::{DEFAULT_BATCH_CAPACITY, DEFAULT_IMG_SIZE};
use crate::backend::ComputeDevice;
use crate::detect::DEFAULT_SCORE_THRESHOLD;
use crate::locator::{LocatorOptions, Padding, DEFAULT_DETECT_BATCH_SIZE};
use crate::mel::{DEFAULT_FEATURE_RATE, DEFAULT_WINDOW_WIDTH};
use crate::pipeline::{PipelineOptions, DEFAULT_FPS, DEFAULT_INFERENCE_TIMEOUT_SECS};
use crate::types::SourceMode;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SYNCLIP_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Lip-sync model file, relative to `models_dir` unless absolute.
    pub lipsync_model: PathBuf,
    /// Face-detection model file, relative to `models_dir` unless absolute.
    pub detector_model: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("output"),
            lipsync_model: PathBuf::from("lipsync.onnx"),
            detector_model: PathBuf::from("face_detect.onnx"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub fps: f64,
    pub feature_rate: f64,
    pub window_width: usize,
    pub img_size: usize,
    pub batch_capacity: usize,
    pub detect_batch_size: usize,
    pub pads: Padding,
    pub smooth: bool,
    pub source_mode: SourceMode,
    /// Fixed (x1, y1, x2, y2) box; set to skip face detection entirely.
    pub override_box: Option<[i64; 4]>,
    pub device: ComputeDevice,
    pub score_threshold: f32,
    pub inference_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            feature_rate: DEFAULT_FEATURE_RATE,
            window_width: DEFAULT_WINDOW_WIDTH,
            img_size: DEFAULT_IMG_SIZE,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            detect_batch_size: DEFAULT_DETECT_BATCH_SIZE,
            pads: Padding::default(),
            smooth: true,
            source_mode: SourceMode::Static,
            override_box: None,
            device: ComputeDevice::default(),
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            inference_timeout_secs: DEFAULT_INFERENCE_TIMEOUT_SECS,
        }
    }
}

impl PipelineConfig {
    /// Per-run options derived freshly from config, so retry state (the
    /// detection batch size in particular) never leaks across runs.
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            fps: self.fps,
            feature_rate: self.feature_rate,
            window_width: self.window_width,
            img_size: self.img_size,
            batch_capacity: self.batch_capacity,
            mode: self.source_mode,
            locator: LocatorOptions {
                batch_size: self.detect_batch_size,
                pads: self.pads,
                smooth: self.smooth,
                override_box: self.override_box,
            },
            inference_timeout: Duration::from_secs(self.inference_timeout_secs),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. SYNCLIP_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run: creates the
/// directory if missing and writes a default config.toml only if absent.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory. Returns the path as-is if
/// absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
