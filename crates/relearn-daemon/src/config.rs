//! Configuration file (`relearn.toml`).

use anyhow::{Context, Result};
use relearn_core::artifacts::OutputFormat;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Used when `--config` is not given. A missing default file means defaults.
pub const DEFAULT_CONFIG_PATH: &str = "relearn.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trainer: TrainerConfig,
    pub detector: DetectorConfig,
    pub client: ClientConfig,
    pub paths: PathsConfig,
    pub training: TrainingConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Where image sources connect.
    pub image_source_bind: SocketAddr,
    /// Where detectors connect for model updates.
    pub detector_bind: SocketAddr,
    /// Trainer address used by `relearn upload`.
    pub image_source_url: String,
    /// Trainer address used by detectors.
    pub detector_url: String,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            image_source_bind: ([0, 0, 0, 0], 31982).into(),
            detector_bind: ([0, 0, 0, 0], 31984).into(),
            image_source_url: "ws://127.0.0.1:31982".to_string(),
            detector_url: "ws://127.0.0.1:31984".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Where clients connect.
    pub bind: SocketAddr,
    /// Detector address used by `relearn detect`.
    pub url: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            bind: ([0, 0, 0, 0], 31983).into(),
            url: "ws://127.0.0.1:31983".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Holds `train.sh` and `detect.sh`.
    pub scripts: PathBuf,
    pub temp_images: PathBuf,
    pub training: PathBuf,
    pub validation: PathBuf,
    pub models: PathBuf,
    /// Working directory for the scripts; tool-reported relative paths
    /// resolve against it.
    pub tool_dir: Option<PathBuf>,
    /// Dataset descriptor written for the training tool.
    pub dataset: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scripts: "scripts".into(),
            temp_images: "temp_images".into(),
            training: "training".into(),
            validation: "validation".into(),
            models: "models".into(),
            tool_dir: None,
            dataset: "yolov5/data/service_data.yaml".into(),
        }
    }
}

impl PathsConfig {
    /// Resolve every path against the current directory. The tools run in
    /// `tool_dir` and receive model, image and dataset paths from us.
    pub fn make_absolute(&mut self) -> Result<()> {
        for path in [
            &mut self.scripts,
            &mut self.temp_images,
            &mut self.training,
            &mut self.validation,
            &mut self.models,
            &mut self.dataset,
        ] {
            *path = std::path::absolute(&*path)
                .with_context(|| format!("failed to resolve {}", path.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub image_size: u32,
    pub batch_size: u32,
    pub epochs: u32,
    /// Number of label classes.
    pub classes: u32,
    pub interval_secs: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            image_size: 640,
            batch_size: 16,
            epochs: 3,
            classes: 1,
            interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// How the scripts report their artifacts.
    pub format: OutputFormat,
}

/// Load `path`, or the default file if present.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let (path, required) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG_PATH), false),
    };
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}
