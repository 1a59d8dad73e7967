//! Run configuration for the `fashionvil` binary.
//!
//! Configuration is resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (`--config`, else ~/.config/fashionvil/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use fashionvil_core::{FashionVilConfig, OptimizerConfig};
use serde::{Deserialize, Serialize};

/// Where and in which precision the model runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `cpu`, `cuda` or `cuda:<ordinal>`.
    pub device: String,
    /// `f32`, `f16` or `bf16`.
    pub dtype: String,
    /// Log level used when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            dtype: "f32".to_string(),
            log_level: None,
        }
    }
}

impl RuntimeConfig {
    pub fn dtype(&self) -> Result<DType, ConfigError> {
        match self.dtype.to_lowercase().as_str() {
            "f32" | "fp32" | "float32" | "float" => Ok(DType::F32),
            "f16" | "fp16" | "float16" | "half" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            other => Err(ConfigError::Invalid(format!("unknown dtype `{other}`"))),
        }
    }

    pub fn device(&self) -> Result<Device, ConfigError> {
        let device = self.device.to_lowercase();
        if device == "cpu" {
            return Ok(Device::Cpu);
        }
        let ordinal = match device.as_str() {
            "cuda" => 0,
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| ConfigError::Invalid(format!("unknown device `{other}`")))?,
        };
        Device::new_cuda(ordinal).map_err(ConfigError::Device)
    }
}

/// A full run: model, optimizer and runtime sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: FashionVilConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Values given on the command line, applied over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub head_type: Option<String>,
    pub enable_prompt: Option<bool>,
    pub device: Option<String>,
    pub dtype: Option<String>,
    pub lr: Option<f64>,
}

impl RunConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fashionvil").join("config.toml"))
    }

    /// Load `path` if given, else the default path if it exists, else the
    /// defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Apply command-line values over the loaded ones.
    pub fn merge(&mut self, overrides: &Overrides) {
        if let Some(head_type) = &overrides.head_type {
            self.model.training_head_type = head_type.clone();
        }
        if let Some(enable_prompt) = overrides.enable_prompt {
            self.model.enable_prompt = enable_prompt;
        }
        if let Some(device) = &overrides.device {
            self.runtime.device = device.clone();
        }
        if let Some(dtype) = &overrides.dtype {
            self.runtime.dtype = dtype.clone();
        }
        if let Some(lr) = overrides.lr {
            self.optimizer.params.lr = lr;
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// The requested device could not be opened.
    Device(candle_core::Error),
    /// A value that parses but makes no sense.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::Device(e) => write!(f, "Device error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
