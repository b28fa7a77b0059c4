use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use unmosaic_ml::{Device, MaxResolution, ModelKind, Sensitivity};
use unmosaic_pipeline::{UncensorOptions, default_cache_dir};

use crate::cli::Cli;

/// Settings read from `--config`. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: Device,
    pub model: ModelKind,
    pub model_url: Option<String>,
    pub auto_detect: bool,
    pub sensitivity: Sensitivity,
    pub max_resolution: MaxResolution,
    pub output_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub hf_endpoint: Option<String>,
    pub threads: Option<usize>,
    pub high_memory: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            model: ModelKind::default(),
            model_url: None,
            auto_detect: true,
            sensitivity: Sensitivity::DEFAULT,
            max_resolution: MaxResolution::default(),
            output_dir: PathBuf::from("uncensored"),
            cache_dir: None,
            hf_endpoint: None,
            threads: None,
            high_memory: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Command-line flags win over file values.
    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(device) = cli.device {
            self.device = device;
        }
        if let Some(model) = cli.model {
            self.model = model;
        }
        if let Some(url) = &cli.model_url {
            self.model_url = Some(url.clone());
        }
        if cli.no_auto_detect {
            self.auto_detect = false;
        }
        if let Some(sensitivity) = cli.sensitivity {
            self.sensitivity = Sensitivity::new(sensitivity);
        }
        if let Some(max_resolution) = cli.max_resolution {
            self.max_resolution = max_resolution;
        }
        if let Some(dir) = &cli.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(dir) = &cli.cache_dir {
            self.cache_dir = Some(dir.clone());
        }
        if let Some(endpoint) = &cli.hf_endpoint {
            self.hf_endpoint = Some(endpoint.clone());
        }
        if let Some(threads) = cli.threads {
            self.threads = Some(threads);
        }
        if cli.high_memory {
            self.high_memory = true;
        }
        self
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn into_options(self) -> UncensorOptions {
        let cache_dir = self.cache_dir();
        UncensorOptions {
            device: self.device,
            model: self.model,
            model_url: self.model_url,
            auto_detect: self.auto_detect,
            sensitivity: self.sensitivity,
            max_resolution: self.max_resolution,
            output_dir: self.output_dir,
            cache_dir,
            hf_endpoint: self.hf_endpoint,
            threads: self.threads,
            high_memory: self.high_memory,
        }
    }
}
