use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::{model_cache_dir, InferenceBackend};
use crate::compositor::SeamPolicy;
use crate::inference::Padding;
use crate::onnx::{OnnxLoader, ValueRange};
use crate::orchestrator::{ExecutionMode, ProcessorOptions, DEFAULT_EVENT_BUFFER};
use crate::tiling::DEFAULT_MAX_TILES;
use crate::types::{ProcessingType, TileSize, TilingConfig, DEFAULT_OVERLAP};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "UPPSCALE_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub processing: ProcessingConfig,
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingConfig {
    pub tile_size: TileSize,
    pub overlap: f64,
    /// Tiles in flight at once; `1` processes them one after another.
    pub parallelism: usize,
    pub tile_delay_ms: u64,
    /// `0` disables the limit.
    pub max_tiles: usize,
    pub seam: SeamPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    pub value_range: ValueRange,
    pub padding: Padding,
}

/// Model file per processing type, relative to `paths.models_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelsConfig {
    pub upscaling: PathBuf,
    pub light_enhancing: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            tile_size: TileSize::default(),
            overlap: DEFAULT_OVERLAP,
            parallelism: 1,
            tile_delay_ms: 0,
            max_tiles: DEFAULT_MAX_TILES,
            seam: SeamPolicy::default(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            upscaling: PathBuf::from(ProcessingType::Upscaling.default_model_file()),
            light_enhancing: PathBuf::from(ProcessingType::LightEnhancing.default_model_file()),
        }
    }
}

impl ModelsConfig {
    pub fn file_for(&self, processing_type: ProcessingType) -> &Path {
        match processing_type {
            ProcessingType::Upscaling => &self.upscaling,
            ProcessingType::LightEnhancing => &self.light_enhancing,
        }
    }
}

impl ProcessingConfig {
    pub fn tiling(&self) -> Result<TilingConfig> {
        TilingConfig::new(self.tile_size, self.overlap).context("invalid [processing] settings")
    }

    pub fn tile_delay(&self) -> Option<Duration> {
        (self.tile_delay_ms > 0).then(|| Duration::from_millis(self.tile_delay_ms))
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

    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions {
            execution: ExecutionMode::from_parallelism(self.processing.parallelism),
            tile_delay: self.processing.tile_delay(),
            max_tiles: (self.processing.max_tiles > 0).then_some(self.processing.max_tiles),
            seam: self.processing.seam,
            padding: self.inference.padding,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn model_path(&self, data_dir: &Path, processing_type: ProcessingType) -> PathBuf {
        let models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        resolve_relative_to(&models_dir, self.models.file_for(processing_type))
    }

    pub fn onnx_loader(&self, data_dir: &Path, processing_type: ProcessingType) -> OnnxLoader {
        let model_path = self.model_path(data_dir, processing_type);
        let cache_base = resolve_relative_to(data_dir, &self.paths.trt_cache_dir);
        OnnxLoader {
            trt_cache_dir: Some(model_cache_dir(&cache_base, &model_path)),
            model_path,
            backend: self.inference.backend,
            value_range: self.inference.value_range,
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. UPPSCALE_DATA_DIR environment variable
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

/// Creates the data directory and writes a default config.toml on first run.
/// An existing config file is left untouched.
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

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
