use anyhow::Result;
use sparqlite_store::{OpenOptions, StoreConfig};

use crate::cli::OutputFormat;
use crate::commands::open_store;
use crate::output::render_pairs;

pub fn execute(config: StoreConfig, options: OpenOptions, format: OutputFormat) -> Result<()> {
    let manager = open_store(config, options)?;
    let status = manager.status()?;

    let pairs = [
        ("Database", status.database_path.clone()),
        ("Read only", status.read_only.to_string()),
        ("Created by this open", status.first_time.to_string()),
        ("Schema version", status.schema_version.to_string()),
        ("File size (bytes)", status.file_size.to_string()),
        (
            "Read connections",
            format!(
                "{} / {}",
                status.pool.read_connections, status.pool.max_read_connections
            ),
        ),
        ("Write connection open", status.pool.write_open.to_string()),
        (
            "Checkpoints (blocking / background)",
            format!(
                "{} / {}",
                status.pool.checkpoints.blocking_runs, status.pool.checkpoints.background_runs
            ),
        ),
        (
            "Checkpoint failures",
            status.pool.checkpoints.failures.to_string(),
        ),
    ];

    println!("{}", render_pairs(&pairs, &status, format)?);
    Ok(())
}
