//! Configuration management for hope.
//!
//! The config file is taken from the first of:
//! 1. `--config <path>` (or `$HOPE_CONFIG`)
//! 2. `<config dir>/config.toml`
//! 3. Default values
//!
//! `HOPE_DATA_DIR` relocates both tier directories.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use hope_core::HopeConfig;

/// Default Ollama API endpoint
pub const OLLAMA_DEFAULT_URL: &str = "http://127.0.0.1:11434";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tier, router, streaming and monitor settings
    #[serde(flatten)]
    pub knowledge: HopeConfig,

    /// Generative backend used by `serve`
    pub generator: GeneratorConfig,
}

/// Which generative backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorBackend {
    /// No generator; only cached answers are served
    #[default]
    None,
    /// Ollama's streaming /api/generate
    Ollama,
    /// An external program reading the prompt on stdin
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub backend: GeneratorBackend,

    /// Ollama base URL
    pub url: String,

    /// Ollama model name
    pub model: String,

    /// Program and arguments for the command backend
    pub command: Vec<String>,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Timeout for one-shot generation in seconds
    pub request_timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            backend: GeneratorBackend::None,
            url: OLLAMA_DEFAULT_URL.to_string(),
            model: "llama3.2".to_string(),
            command: Vec::new(),
            connect_timeout_secs: 5,
            request_timeout_secs: 120,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "hope", "hope")
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    match project_dirs() {
        Some(dirs) => dirs.config_dir().join("config.toml"),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hope")
            .join("config.toml"),
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// An explicitly named file must exist; the default location may not.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Some(data_dir) = std::env::var_os("HOPE_DATA_DIR") {
            config.set_data_dir(PathBuf::from(data_dir));
        }
        config
            .knowledge
            .validate()
            .context("Invalid knowledge cache configuration")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Store both tiers under `data_dir`.
    pub fn set_data_dir(&mut self, data_dir: PathBuf) {
        self.knowledge.permanent.storage_path = data_dir.join("permanent");
        self.knowledge.ordinary.storage_path = data_dir.join("ordinary");
    }
}
