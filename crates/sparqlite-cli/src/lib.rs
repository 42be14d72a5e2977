//! Library side of the `sparq` binary
//!
//! Kept separate from `main.rs` so commands can be driven from tests.

pub mod cli;
pub mod commands;
pub mod output;

use anyhow::{Context, Result};
use sparqlite_store::{OpenOptions, StoreConfig};

/// Build the store configuration from the config file and CLI overrides
pub fn load_config(cli: &cli::Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StoreConfig::default(),
    };

    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Open options for a CLI invocation
pub fn open_options(cli: &cli::Cli) -> OpenOptions {
    if cli.read_only {
        OpenOptions::read_only()
    } else {
        OpenOptions::read_write()
    }
}
