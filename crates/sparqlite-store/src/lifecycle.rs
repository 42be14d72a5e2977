//! Bringing a database directory into a usable state
//!
//! Opening goes through a fixed sequence: locate the files, inspect the
//! schema version, check for a stale crash marker, recreate if needed and
//! finally drop a fresh marker. The manager drives the sequence; the steps
//! live here so they can be exercised on their own.

use crate::error::{StoreError, StoreResult};
use crate::fsutil;
use crate::observer::StoreObserver;
use crate::pool::ConnectionPool;
use crate::schema::{self, SCHEMA_VERSION};
use crate::StoreConfig;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where the files of a store live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseLocation {
    data_dir: PathBuf,
    database: PathBuf,
    marker: PathBuf,
}

impl DatabaseLocation {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            database: config.database_path(),
            marker: config.marker_path(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    pub fn wal_path(&self) -> PathBuf {
        with_suffix(&self.database, "-wal")
    }

    pub fn shm_path(&self) -> PathBuf {
        with_suffix(&self.database, "-shm")
    }

    /// File backing the graph database `name`
    pub fn graph_path(&self, name: &str) -> PathBuf {
        let file = format!("{}.db", name);
        self.data_dir.join(urlencoding::encode(&file).as_ref())
    }

    pub fn ensure_directories(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.data_dir).map_err(|e| {
            StoreError::Open(format!(
                "Could not create data directory {}: {}",
                self.data_dir.display(),
                e
            ))
        })
    }

    /// Delete the main database and its WAL companions
    pub fn remove_database_files(&self) -> StoreResult<()> {
        for path in [self.database.clone(), self.wal_path(), self.shm_path()] {
            if fsutil::remove_if_exists(&path)? {
                info!(path = ?path, "Removed database file");
            }
        }
        Ok(())
    }

    pub fn has_marker(&self) -> bool {
        self.marker.exists()
    }

    /// Create the crash marker and flush it to disk
    pub fn create_marker(&self) -> StoreResult<()> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.marker)?;
        file.sync_all()?;
        debug!(path = ?self.marker, "Created crash marker");
        Ok(())
    }

    pub fn remove_marker(&self) -> StoreResult<()> {
        if fsutil::remove_if_exists(&self.marker)? {
            debug!(path = ?self.marker, "Removed crash marker");
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// What was found on disk before loading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inspection {
    pub exists: bool,
    /// Stored schema version, 0 when unreadable
    pub version: i32,
    pub need_reindex: bool,
}

/// Look at the main database without opening the store.
///
/// A missing file is an error in read-only mode, where nothing may be created.
pub fn inspect(location: &DatabaseLocation, read_only: bool) -> StoreResult<Inspection> {
    let path = location.database_path();
    if !path.exists() {
        if read_only {
            return Err(StoreError::Open(format!(
                "Could not find database file: {}",
                path.display()
            )));
        }
        info!(path = ?path, "Could not find database file, will reindex");
        return Ok(Inspection {
            exists: false,
            version: 0,
            need_reindex: true,
        });
    }

    let version = schema::file_version(path, read_only);
    let need_reindex = version < SCHEMA_VERSION;
    if need_reindex {
        info!(
            path = ?path,
            version,
            current = SCHEMA_VERSION,
            "Database version is older than current, will reindex"
        );
    }

    Ok(Inspection {
        exists: true,
        version,
        need_reindex,
    })
}

/// Outcome of the stale-lock check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// No marker: the previous run shut down cleanly
    Clean,
    /// Marker found, integrity checks passed
    Healthy,
    /// Marker found and the database is unusable
    MustRecreate(String),
}

/// Check the database after an unclean shutdown.
///
/// When restoring a backup a damaged database is an error rather than
/// something to throw away.
pub fn check_stale_lock(
    location: &DatabaseLocation,
    pool: &ConnectionPool,
    restoring_backup: bool,
    observer: &dyn StoreObserver,
) -> StoreResult<Recovery> {
    if !location.has_marker() {
        return Ok(Recovery::Clean);
    }

    info!("Didn't shut down cleanly last time, doing integrity checks");
    let damaged = |reason: String| {
        if restoring_backup {
            Err(StoreError::Open(reason))
        } else {
            warn!(%reason, "Database damaged");
            Ok(Recovery::MustRecreate(reason))
        }
    };

    let size = fsutil::file_size(location.database_path())?;
    if size <= 1 {
        return damaged(format!("Database file is {} bytes", size));
    }

    observer.busy("Integrity checking", 0.0);
    let integrity = pool.with_write(|conn| {
        let verdict: Option<String> =
            conn.query_row("PRAGMA integrity_check(1)", [], |row| row.get(0))?;
        observer.busy("Integrity checking", 0.5);
        if verdict.as_deref() != Some("ok") {
            return Err(StoreError::Query(format!(
                "Integrity check failed: {}",
                verdict.unwrap_or_default()
            )));
        }
        schema::has_resource_table(conn)
    });
    observer.busy("Integrity checking", 1.0);

    match integrity {
        Ok(()) => Ok(Recovery::Healthy),
        Err(e) => {
            // A failed check may leave the write connection half usable
            pool.reset_write();
            damaged(e.to_string())
        }
    }
}

/// Throw the main database away and create an empty one.
///
/// Nothing is touched unless the data directory has `min_free_space` bytes
/// available.
pub fn recreate(location: &DatabaseLocation, pool: &ConnectionPool, min_free_space: u64) -> StoreResult<()> {
    if !fsutil::has_enough_space(location.data_dir(), min_free_space) {
        return Err(StoreError::Open(format!(
            "Filesystem has not enough space (need {} bytes free in {})",
            min_free_space,
            location.data_dir().display()
        )));
    }

    info!(path = ?location.database_path(), "Recreating database");
    pool.reset_write();
    pool.clear_reads();
    location.remove_database_files()?;
    pool.with_write(|conn| schema::initialize(conn))
}
