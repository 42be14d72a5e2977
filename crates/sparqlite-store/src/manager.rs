//! Database manager
//!
//! Owns the read pool, the write connection and the files of one store, and
//! runs the open sequence described in [`crate::lifecycle`].

use crate::checkpoint::CheckpointMode;
use crate::config::{FtsFlags, OpenOptions, StoreConfig};
use crate::connection::{Connection, ConnectionOptions};
use crate::error::{StoreError, StoreResult};
use crate::federation::{FederationContext, FederationStats, GraphIdResolver, ResourceTableResolver};
use crate::fsutil;
use crate::lifecycle::{self, DatabaseLocation, Inspection, Recovery};
use crate::metadata;
use crate::observer::StoreObserver;
use crate::pool::{ConnectionFactory, ConnectionPool, PoolStats};
use crate::schema::{self, SCHEMA_VERSION};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options and cache sizes the manager was opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerFlags {
    pub options: OpenOptions,
    pub select_cache_size: usize,
    pub update_cache_size: usize,
}

/// Summary used by diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub database_path: String,
    pub read_only: bool,
    pub first_time: bool,
    pub schema_version: i32,
    pub file_size: u64,
    pub pool: PoolStats,
    pub federation: FederationStats,
}

/// Entry point of the store
pub struct DatabaseManager {
    config: StoreConfig,
    options: OpenOptions,
    location: DatabaseLocation,
    pool: ConnectionPool,
    federation: Arc<FederationContext>,
    observer: Arc<dyn StoreObserver>,
    inspection: Inspection,
    first_time: bool,
    fts: FtsFlags,
    marker_created: bool,
    last_analyzed: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("location", &self.location)
            .field("options", &self.options)
            .field("first_time", &self.first_time)
            .finish()
    }
}

impl DatabaseManager {
    /// Open the store described by `config`, resolving graph ids through the
    /// resource table
    pub fn open(
        config: StoreConfig,
        options: OpenOptions,
        observer: Arc<dyn StoreObserver>,
    ) -> StoreResult<Self> {
        Self::open_with_resolver(
            config,
            options,
            observer,
            Box::new(ResourceTableResolver::default()),
        )
    }

    /// Open the store with a custom graph id resolver for federated tables
    pub fn open_with_resolver(
        config: StoreConfig,
        options: OpenOptions,
        observer: Arc<dyn StoreObserver>,
        resolver: Box<dyn GraphIdResolver>,
    ) -> StoreResult<Self> {
        config.validate()?;

        let location = DatabaseLocation::from_config(&config);
        if !options.read_only {
            location.ensure_directories()?;
        }

        let federation = Arc::new(FederationContext::new(resolver));
        let connection_options = ConnectionOptions {
            read_only: options.read_only,
            use_mutex: options.enable_mutexes,
            cache_size: config.cache_size,
            page_size: config.page_size,
            journal_size_limit: config.journal_size_limit,
            select_cache_size: config.select_cache_size,
            update_cache_size: config.update_cache_size,
            federation: federation.clone(),
        };
        let factory = ConnectionFactory::new(
            location.database_path(),
            connection_options,
            observer.clone(),
        );
        let pool = ConnectionPool::new(
            factory,
            config.max_read_connections,
            config.checkpoint_blocking_pages,
            observer.clone(),
        );

        let mut manager = Self {
            inspection: Inspection {
                exists: location.database_path().exists(),
                version: 0,
                need_reindex: false,
            },
            fts: options.fts,
            config,
            options,
            location,
            pool,
            federation,
            observer,
            first_time: false,
            marker_created: false,
            last_analyzed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        if options.remove_all {
            debug!(path = ?manager.location.database_path(), "Opened for removal only");
            return Ok(manager);
        }

        manager.inspection = lifecycle::inspect(&manager.location, options.read_only)?;
        manager.load()?;
        Ok(manager)
    }

    fn load(&mut self) -> StoreResult<()> {
        if self.options.read_only {
            if self.options.force_reindex || self.inspection.need_reindex {
                return Err(StoreError::UnsupportedOperation(
                    "No reindexing supported in read-only mode".to_string(),
                ));
            }
            self.adopt_stored_fts_flags();
        } else {
            let recovery = if self.options.force_reindex || self.inspection.need_reindex {
                Recovery::MustRecreate("reindex requested".to_string())
            } else {
                lifecycle::check_stale_lock(
                    &self.location,
                    &self.pool,
                    self.options.restoring_backup,
                    self.observer.as_ref(),
                )?
            };

            if let Recovery::MustRecreate(reason) = recovery {
                info!(%reason, "Recreating database and reindexing");
                self.recreate()?;
            }

            match self.location.create_marker() {
                Ok(()) => self.marker_created = true,
                Err(e) => warn!(error = %e, "Could not create crash marker"),
            }
        }

        if let Err(e) = self.pool.acquire_read() {
            if self.options.read_only || self.options.restoring_backup {
                return Err(e);
            }
            warn!(error = %e, "Could not open read connection, recreating database");
            self.recreate()?;
            self.pool.acquire_read()?;
        }

        // Pending checkpoints would move the mtime after the fact
        self.pool.checkpoints().wait_idle();
        self.last_analyzed
            .store(self.database_mtime(), Ordering::Relaxed);
        info!(
            path = ?self.location.database_path(),
            read_only = self.options.read_only,
            first_time = self.first_time,
            "Database manager loaded"
        );
        Ok(())
    }

    fn recreate(&mut self) -> StoreResult<()> {
        lifecycle::recreate(&self.location, &self.pool, self.config.min_free_space)?;
        self.first_time = true;
        self.update_version()?;
        self.set_current_locale()?;
        self.tokenizer_update()?;
        Ok(())
    }

    fn adopt_stored_fts_flags(&mut self) {
        let stored = self
            .pool
            .with_write(|conn| metadata::get_integer(conn, metadata::KEY_FTS_FLAGS));
        match stored {
            Ok(Some(bits)) => {
                self.fts = FtsFlags::from_bits(bits);
                debug!(bits, "Adopted stored FTS flags");
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Could not read stored FTS flags"),
        }
    }

    fn database_mtime(&self) -> u64 {
        fsutil::modified_secs(self.location.database_path()).unwrap_or(0)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    /// What the open sequence found on disk
    pub fn inspection(&self) -> Inspection {
        self.inspection
    }

    /// Whether the database was created (or recreated) by this open
    pub fn first_time(&self) -> bool {
        self.first_time
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn fts_flags(&self) -> FtsFlags {
        self.fts
    }

    pub fn flags(&self) -> ManagerFlags {
        ManagerFlags {
            options: self.options,
            select_cache_size: self.config.select_cache_size,
            update_cache_size: self.config.update_cache_size,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn federation_stats(&self) -> FederationStats {
        self.federation.stats()
    }

    /// Run `f` on a pooled read connection
    pub fn with_read<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T>,
    {
        self.pool.with_read(f)
    }

    /// Run `f` on the write connection
    pub fn with_write<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T>,
    {
        self.pool.with_write(f)
    }

    pub fn status(&self) -> StoreResult<ManagerStatus> {
        let schema_version = self.with_read(|conn| schema::read_version(conn))?;
        Ok(ManagerStatus {
            database_path: self.location.database_path().display().to_string(),
            read_only: self.options.read_only,
            first_time: self.first_time,
            schema_version,
            file_size: fsutil::file_size(self.location.database_path())?,
            pool: self.pool.stats(),
            federation: self.federation.stats(),
        })
    }

    /// Store the current schema version
    pub fn update_version(&self) -> StoreResult<()> {
        self.require_writable("update_version")?;
        self.with_write(|conn| schema::write_version(conn, SCHEMA_VERSION))
    }

    /// Collation locale in effect for this process
    pub fn current_locale(&self) -> String {
        self.config
            .locale
            .clone()
            .unwrap_or_else(fsutil::process_collation_locale)
    }

    /// Fail with [`StoreError::LocaleMismatch`] if the database was built
    /// with a different collation locale
    pub fn locale_changed(&self) -> StoreResult<()> {
        let current = self.current_locale();
        // A store that never recorded a locale counts as a mismatch
        let stored = self
            .with_read(|conn| metadata::get_text(conn, metadata::KEY_LOCALE))?
            .unwrap_or_default();

        if stored == current {
            Ok(())
        } else {
            info!(%stored, %current, "Locale change detected");
            Err(StoreError::LocaleMismatch { stored, current })
        }
    }

    /// Record the current collation locale in the database
    pub fn set_current_locale(&self) -> StoreResult<()> {
        self.require_writable("set_current_locale")?;
        let current = self.current_locale();
        info!(locale = %current, "Saving DB locale");
        self.with_write(|conn| metadata::set(conn, metadata::KEY_LOCALE, &current))
    }

    /// Whether the stored tokenizer settings differ from the current ones
    pub fn tokenizer_changed(&self) -> StoreResult<bool> {
        let (version, bits) = self.with_read(|conn| {
            Ok((
                metadata::get_text(conn, metadata::KEY_PARSER_VERSION)?,
                metadata::get_integer(conn, metadata::KEY_FTS_FLAGS)?,
            ))
        })?;

        Ok(version.as_deref() != Some(self.config.parser_version.as_str())
            || bits != Some(self.fts.bits()))
    }

    /// Store the current tokenizer settings
    pub fn tokenizer_update(&self) -> StoreResult<()> {
        self.require_writable("tokenizer_update")?;
        let version = self.config.parser_version.clone();
        let bits = self.fts.bits();
        self.with_write(|conn| {
            conn.transaction(|tx| {
                metadata::set(tx, metadata::KEY_PARSER_VERSION, &version)?;
                metadata::set(tx, metadata::KEY_FTS_FLAGS, bits)
            })
        })
    }

    pub fn has_enough_space(&self) -> bool {
        fsutil::has_enough_space(self.location.data_dir(), self.config.min_free_space)
    }

    /// VACUUM the main database once it has grown past the threshold.
    ///
    /// Returns whether a VACUUM ran.
    pub fn check_perform_vacuum(&self) -> StoreResult<bool> {
        if self.options.read_only {
            return Ok(false);
        }

        let size = fsutil::file_size(self.location.database_path())?;
        if size <= self.config.vacuum_threshold {
            return Ok(false);
        }

        info!(size, threshold = self.config.vacuum_threshold, "Vacuuming database");
        self.observer.busy("Vacuuming", 0.0);
        self.with_write(|conn| conn.execute_batch("VACUUM"))?;
        self.observer.busy("Vacuuming", 1.0);
        Ok(true)
    }

    /// Refresh the planner statistics if the database changed since the
    /// last run. Returns whether `ANALYZE` ran.
    pub fn optimize(&self) -> StoreResult<bool> {
        if self.options.read_only {
            return Ok(false);
        }

        let mtime = self.database_mtime();
        if mtime <= self.last_analyzed.load(Ordering::Relaxed) {
            debug!("Database unchanged since last ANALYZE");
            return Ok(false);
        }
        if self.pool.write_is_used() {
            debug!("Write connection busy, skipping ANALYZE");
            return Ok(false);
        }

        info!("Analyzing database");
        self.with_write(|conn| conn.execute_batch("ANALYZE"))?;
        self.pool.checkpoints().wait_idle();
        self.last_analyzed
            .store(self.database_mtime().max(mtime), Ordering::Relaxed);
        Ok(true)
    }

    /// Checkpoint the WAL on demand, serialized with the checkpoints
    /// commits trigger
    pub fn checkpoint(&self, mode: CheckpointMode) -> StoreResult<()> {
        if mode == CheckpointMode::Blocking {
            self.require_writable("checkpoint")?;
        }
        self.pool.checkpoint(mode)
    }

    /// Attach the graph database `name` to `conn`
    pub fn attach_database(&self, conn: &mut Connection, name: &str, create: bool) -> StoreResult<()> {
        if create && self.options.read_only {
            return Err(StoreError::UnsupportedOperation(
                "Cannot create graph databases in read-only mode".to_string(),
            ));
        }
        conn.attach(name, &self.location.graph_path(name), create)
    }

    pub fn detach_database(&self, conn: &mut Connection, name: &str) -> StoreResult<()> {
        conn.detach(name)
    }

    /// Close every connection and delete the main database files
    pub fn remove_all(&self) -> StoreResult<()> {
        self.require_writable("remove_all")?;
        self.pool.close(false);
        info!(path = ?self.location.database_path(), "Removing all database files");
        self.location.remove_database_files()
    }

    /// Shut the store down; also runs on drop.
    ///
    /// Joins the checkpoint worker, checkpoints and closes the write
    /// connection, then removes the crash marker.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.pool.close(!self.options.read_only);
        if self.marker_created {
            if let Err(e) = self.location.remove_marker() {
                warn!(error = %e, "Could not remove crash marker");
            }
        }
        info!(path = ?self.location.database_path(), "Database manager closed");
    }

    fn require_writable(&self, operation: &str) -> StoreResult<()> {
        if self.options.read_only {
            Err(StoreError::UnsupportedOperation(format!(
                "{} is not available in read-only mode",
                operation
            )))
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    fn forget_last_analyze(&self) {
        self.last_analyzed.store(0, Ordering::Relaxed);
    }
}

impl Drop for DatabaseManager {
    fn drop(&mut self) {
        self.close();
    }
}
