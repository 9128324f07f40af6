//! hope - HOPE knowledge cache CLI
//!
//! Inspects and teaches the tiered knowledge cache, and serves questions
//! with a cached fast path running alongside a streaming generator.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cli;
mod commands;
mod config;
mod connectors;

use cli::{Cli, Commands};
use commands::{knowledge, maintenance, open_manager, serve};
use hope_core::{Clock, system_clock};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("hope=info".parse()?);
    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    // Load configuration
    let config = config::Config::load(cli.config.as_deref())?;
    let json = cli.json;

    let clock = system_clock();
    let open = || open_manager(&config, clock.clone());

    // Execute command
    match cli.command {
        Commands::Query { question, session } => knowledge::query(&open()?, &question, session.as_deref(), json),
        Commands::Save(args) => knowledge::save(&open()?, args, json),
        Commands::Rate(args) => knowledge::rate(&open()?, args, clock.now(), json),
        Commands::Feedback(args) => knowledge::feedback(&open()?, args, json),
        Commands::Promote => maintenance::promote(&open()?, json),
        Commands::Cleanup => maintenance::cleanup(&open()?, json),
        Commands::Stats => maintenance::stats(&open()?, json),
        Commands::Facts { all } => maintenance::facts(&open()?, all, json),
        Commands::Serve(args) => serve::execute(args, &config, json).await,
    }
}
