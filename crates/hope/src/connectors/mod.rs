//! Generative backends for `serve`.

pub mod command;
pub mod ollama;

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use hope_stream::{ConnectorError, GenerativeConnector};

use crate::config::{GeneratorBackend, GeneratorConfig};

pub use command::CommandConnector;
pub use ollama::OllamaConnector;

/// Build the configured connector.
pub fn from_config(config: &GeneratorConfig) -> Result<Arc<dyn GenerativeConnector>> {
    Ok(match config.backend {
        GeneratorBackend::None => Arc::new(Unconfigured),
        GeneratorBackend::Ollama => Arc::new(OllamaConnector::new(config)?),
        GeneratorBackend::Command => {
            let Some((program, args)) = config.command.split_first() else {
                bail!("generator.command must name a program when backend = \"command\"");
            };
            Arc::new(CommandConnector::new(program, args.to_vec()))
        }
    })
}

/// Fails every generation; only cached answers get served
pub struct Unconfigured;

#[async_trait]
impl GenerativeConnector for Unconfigured {
    async fn generate(&self, _prompt: &str) -> Result<String, ConnectorError> {
        Err(ConnectorError::Unavailable("no generator configured".to_string()))
    }

    fn supports_streaming(&self) -> bool {
        false
    }
}
