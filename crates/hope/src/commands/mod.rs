//! Command implementations for the hope CLI.
//!
//! Each submodule implements the logic for a command group.

pub mod knowledge;
pub mod maintenance;
pub mod serve;

use anyhow::{Context, Result};
use serde::Serialize;

use hope_core::{KnowledgeManager, SharedClock};

use crate::config::Config;

/// Open every tier with the loaded configuration.
pub fn open_manager(config: &Config, clock: SharedClock) -> Result<KnowledgeManager> {
    KnowledgeManager::open(config.knowledge.clone(), clock).context("Failed to open knowledge tiers")
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
