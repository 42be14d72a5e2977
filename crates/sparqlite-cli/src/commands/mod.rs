pub mod maintenance;
pub mod query;
pub mod status;

use anyhow::{Context, Result};
use sparqlite_store::{DatabaseManager, NoopObserver, OpenOptions, StoreConfig};
use std::sync::Arc;

/// Open the store for one command
pub(crate) fn open_store(config: StoreConfig, options: OpenOptions) -> Result<DatabaseManager> {
    let data_dir = config.data_dir.clone();
    DatabaseManager::open(config, options, Arc::new(NoopObserver))
        .with_context(|| format!("Failed to open store in {}", data_dir.display()))
}
