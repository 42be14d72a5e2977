use anyhow::{bail, Result};
use serde::Serialize;
use sparqlite_store::{CheckpointMode, OpenOptions, StoreConfig, StoreError};
use tracing::info;

use crate::cli::OutputFormat;
use crate::commands::open_store;
use crate::output::render_pairs;

/// Findings of `sparq check`
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub existed: bool,
    pub stored_version: i32,
    pub rebuilt: bool,
    pub locale: String,
    pub locale_matches: bool,
    pub tokenizer_changed: bool,
    pub enough_space: bool,
}

pub fn check(config: StoreConfig, options: OpenOptions, format: OutputFormat) -> Result<()> {
    let manager = open_store(config, options)?;
    let inspection = manager.inspection();

    let locale_matches = match manager.locale_changed() {
        Ok(()) => true,
        Err(StoreError::LocaleMismatch { .. }) => false,
        Err(e) => return Err(e.into()),
    };

    let report = CheckReport {
        existed: inspection.exists,
        stored_version: inspection.version,
        rebuilt: manager.first_time(),
        locale: manager.current_locale(),
        locale_matches,
        tokenizer_changed: manager.tokenizer_changed()?,
        enough_space: manager.has_enough_space(),
    };

    let pairs = [
        ("Database existed", report.existed.to_string()),
        ("Stored schema version", report.stored_version.to_string()),
        ("Rebuilt", report.rebuilt.to_string()),
        ("Locale", report.locale.clone()),
        ("Locale matches", report.locale_matches.to_string()),
        ("Tokenizer changed", report.tokenizer_changed.to_string()),
        ("Enough free space", report.enough_space.to_string()),
    ];
    println!("{}", render_pairs(&pairs, &report, format)?);
    Ok(())
}

pub fn vacuum(mut config: StoreConfig, options: OpenOptions, threshold: Option<u64>) -> Result<()> {
    if options.read_only {
        bail!("Cannot vacuum a store opened read-only");
    }
    if let Some(threshold) = threshold {
        config.vacuum_threshold = threshold;
    }

    let manager = open_store(config, options)?;
    if manager.check_perform_vacuum()? {
        println!("Vacuumed {}", manager.location().database_path().display());
    } else {
        println!("Database is below the vacuum threshold, nothing to do");
    }
    Ok(())
}

pub fn checkpoint(config: StoreConfig, options: OpenOptions) -> Result<()> {
    if options.read_only {
        bail!("Cannot checkpoint a store opened read-only");
    }

    let manager = open_store(config, options)?;
    manager.checkpoint(CheckpointMode::Blocking)?;
    info!("Checkpoint complete");
    println!(
        "Checkpointed {}",
        manager.location().database_path().display()
    );
    Ok(())
}
