//! SQLite connection handle
//!
//! A [`Connection`] owns one rusqlite handle over a single database file,
//! configured the way the store needs it: WAL journaling with engine
//! auto-checkpointing turned off, NORMAL sync, no auto-vacuum. Checkpointing
//! is driven from the outside by [`CheckpointScheduler`].

use crate::checkpoint::{CheckpointMode, CheckpointScheduler};
use crate::error::{StoreError, StoreResult};
use crate::federation::{self, FederationContext};
use crate::statement_cache::{CacheLookup, CacheStats, StatementCache, StatementKind};
use rusqlite::{ffi, CachedStatement, OpenFlags, Params, Row, Rows, Statement};
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::ops::{Deref, DerefMut};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What a connection is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Pooled, read-only
    Read,
    /// The single connection that runs write transactions
    Write,
    /// Helper that only runs background checkpoints
    Checkpoint,
}

/// Settings shared by every connection the store opens
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Open every role read-only (direct access mode)
    pub read_only: bool,
    /// Serialized threading mode instead of multi-thread mode
    pub use_mutex: bool,
    pub cache_size: i64,
    pub page_size: Option<u32>,
    pub journal_size_limit: i64,
    pub select_cache_size: usize,
    pub update_cache_size: usize,
    /// Shared state of the federation module registered on each handle
    pub federation: Arc<FederationContext>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            use_mutex: false,
            cache_size: 2000,
            page_size: None,
            journal_size_limit: 10_240_000,
            select_cache_size: 100,
            update_cache_size: 100,
            federation: Arc::new(FederationContext::default()),
        }
    }
}

/// Outstanding-cursor counter of a connection
///
/// Cloned into the pool so it can tell busy connections apart without
/// locking them.
#[derive(Debug, Clone, Default)]
pub struct ConnectionActivity(Arc<AtomicUsize>);

impl ConnectionActivity {
    pub fn outstanding_cursors(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// True while at least one cursor is open
    pub fn is_used(&self) -> bool {
        self.outstanding_cursors() > 0
    }

    fn enter(&self) -> CursorGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        CursorGuard(self.0.clone())
    }
}

struct CursorGuard(Arc<AtomicUsize>);

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Statement handed out by [`Connection::prepare`]
pub enum PreparedStatement<'conn> {
    /// Retained in the connection's statement cache after use
    Cached(CachedStatement<'conn>),
    /// Finalized when dropped
    Transient(Statement<'conn>),
}

impl<'conn> Deref for PreparedStatement<'conn> {
    type Target = Statement<'conn>;

    fn deref(&self) -> &Self::Target {
        match self {
            PreparedStatement::Cached(stmt) => stmt,
            PreparedStatement::Transient(stmt) => stmt,
        }
    }
}

impl DerefMut for PreparedStatement<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            PreparedStatement::Cached(stmt) => stmt,
            PreparedStatement::Transient(stmt) => stmt,
        }
    }
}

/// Rows of a running query; counts as an outstanding cursor while alive
pub struct Cursor<'stmt> {
    rows: Rows<'stmt>,
    _guard: CursorGuard,
}

impl<'stmt> Cursor<'stmt> {
    /// Advance to the next row
    pub fn next(&mut self) -> StoreResult<Option<&Row<'stmt>>> {
        Ok(self.rows.next()?)
    }
}

/// One handle to the engine over a single database file
pub struct Connection {
    inner: rusqlite::Connection,
    id: u64,
    path: PathBuf,
    role: ConnectionRole,
    read_only: bool,
    options: ConnectionOptions,
    attached: BTreeMap<String, PathBuf>,
    selects: StatementCache,
    updates: StatementCache,
    activity: ConnectionActivity,
    wal_hook: Option<Arc<CheckpointScheduler>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("role", &self.role)
            .field("read_only", &self.read_only)
            .field("attached", &self.attached.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Connection {
    /// Open and configure a connection.
    ///
    /// Any pragma that cannot be applied fails the whole open; a half
    /// configured handle is never returned.
    pub fn open(path: &Path, role: ConnectionRole, options: &ConnectionOptions) -> StoreResult<Self> {
        let read_only = options.read_only || role == ConnectionRole::Read;

        let mut flags = OpenFlags::SQLITE_OPEN_URI;
        if read_only {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        }
        if options.use_mutex {
            flags |= OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        } else {
            flags |= OpenFlags::SQLITE_OPEN_NO_MUTEX;
        }

        let inner = rusqlite::Connection::open_with_flags(path, flags).map_err(|e| {
            StoreError::Open(format!("Could not open '{}': {}", path.display(), e))
        })?;
        inner.set_prepared_statement_cache_capacity(
            options.select_cache_size + options.update_cache_size,
        );

        let select_cache_size = options.select_cache_size;
        // Read-only handles never run updates
        let update_cache_size = if read_only { 0 } else { options.update_cache_size };

        let conn = Self {
            inner,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            role,
            read_only,
            options: options.clone(),
            attached: BTreeMap::new(),
            selects: StatementCache::new(StatementKind::Select, select_cache_size),
            updates: StatementCache::new(StatementKind::Update, update_cache_size),
            activity: ConnectionActivity::default(),
            wal_hook: None,
        };

        conn.configure_session()?;
        apply_database_pragmas(&conn.inner, "main", &conn.options)?;

        federation::register(&conn.inner, conn.options.federation.clone()).map_err(|e| {
            StoreError::Open(format!("Could not register federation module: {}", e))
        })?;

        debug!(id = conn.id, path = ?conn.path, ?role, read_only, "Opened connection");
        Ok(conn)
    }

    fn configure_session(&self) -> StoreResult<()> {
        let temp_store = if self.read_only { "MEMORY" } else { "FILE" };
        self.inner
            .execute_batch(&format!(
                "PRAGMA encoding = \"UTF-8\"; PRAGMA temp_store = {};",
                temp_store
            ))
            .map_err(|e| StoreError::Open(format!("Could not configure session: {}", e)))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn uses_mutex(&self) -> bool {
        self.options.use_mutex
    }

    /// Counter shared with whoever needs to know if this connection is busy
    pub fn activity(&self) -> ConnectionActivity {
        self.activity.clone()
    }

    pub fn is_used(&self) -> bool {
        self.activity.is_used()
    }

    /// Underlying rusqlite handle
    pub fn raw(&self) -> &rusqlite::Connection {
        &self.inner
    }

    /// Names of the databases attached to this handle
    pub fn attached_databases(&self) -> impl Iterator<Item = &str> {
        self.attached.keys().map(String::as_str)
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.attached.contains_key(name)
    }

    pub fn cache_stats(&self, kind: StatementKind) -> CacheStats {
        match kind {
            StatementKind::Select => self.selects.stats(),
            StatementKind::Update => self.updates.stats(),
        }
    }

    /// Compile `sql`, reusing a cached statement when there is one
    pub fn prepare(&mut self, kind: StatementKind, sql: &str) -> StoreResult<PreparedStatement<'_>> {
        let cache = match kind {
            StatementKind::Select => &mut self.selects,
            StatementKind::Update => &mut self.updates,
        };
        let inner = &self.inner;

        match cache.lookup(sql) {
            CacheLookup::Uncached => Ok(PreparedStatement::Transient(inner.prepare(sql)?)),
            CacheLookup::Hit => Ok(PreparedStatement::Cached(
                inner.prepare_cached(&cache_key(kind, sql))?,
            )),
            CacheLookup::Miss { evicted } => {
                if let Some(evicted) = evicted {
                    // Pull the evicted statement out of rusqlite's cache too
                    if let Ok(stale) = inner.prepare_cached(&cache_key(kind, &evicted)) {
                        stale.discard();
                    }
                }
                match inner.prepare_cached(&cache_key(kind, sql)) {
                    Ok(stmt) => Ok(PreparedStatement::Cached(stmt)),
                    Err(e) => {
                        cache.forget(sql);
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Run a statement that does not return rows
    pub fn execute<P: Params>(&mut self, sql: &str, params: P) -> StoreResult<usize> {
        let mut stmt = self.prepare(StatementKind::Update, sql)?;
        Ok(stmt.execute(params)?)
    }

    /// Run several statements without caching them
    pub fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        Ok(self.inner.execute_batch(sql)?)
    }

    /// Run a query and hand its rows to `f`
    pub fn query<P, F, T>(&mut self, sql: &str, params: P, f: F) -> StoreResult<T>
    where
        P: Params,
        F: FnOnce(&mut Cursor<'_>) -> StoreResult<T>,
    {
        let guard = self.activity.enter();
        let mut stmt = self.prepare(StatementKind::Select, sql)?;
        let rows = stmt.query(params)?;
        let mut cursor = Cursor {
            rows,
            _guard: guard,
        };
        f(&mut cursor)
    }

    /// Run a query and map every row
    pub fn query_map<P, F, T>(&mut self, sql: &str, params: P, mut f: F) -> StoreResult<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.query(sql, params, |cursor| {
            let mut out = Vec::new();
            while let Some(row) = cursor.next()? {
                out.push(f(row)?);
            }
            Ok(out)
        })
    }

    /// Run a query and map its first row, if any
    pub fn query_row<P, F, T>(&mut self, sql: &str, params: P, f: F) -> StoreResult<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.query(sql, params, |cursor| match cursor.next()? {
            Some(row) => Ok(Some(f(row)?)),
            None => Ok(None),
        })
    }

    /// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on error
    pub fn transaction<F, T>(&mut self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T>,
    {
        self.inner.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.inner.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.inner.execute_batch("ROLLBACK") {
                    warn!(id = self.id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Attach the database file at `path` under `name`.
    ///
    /// With `create`, any existing file is deleted first so the database
    /// starts empty. The attached schema gets the same pragmas as `main`.
    pub fn attach(&mut self, name: &str, path: &Path, create: bool) -> StoreResult<()> {
        if self.attached.contains_key(name) {
            return Err(StoreError::Query(format!(
                "Database '{}' is already attached",
                name
            )));
        }

        if create {
            crate::fsutil::remove_if_exists(path)?;
        }

        self.inner.execute(
            "ATTACH DATABASE ?1 AS ?2",
            rusqlite::params![path.to_string_lossy(), name],
        )?;

        if let Err(e) = apply_database_pragmas(&self.inner, name, &self.options) {
            if let Err(detach) = self
                .inner
                .execute_batch(&format!("DETACH DATABASE {}", quote_identifier(name)))
            {
                warn!(name, error = %detach, "Could not detach misconfigured database");
            }
            return Err(e);
        }

        debug!(id = self.id, name, path = ?path, "Attached database");
        self.attached.insert(name.to_string(), path.to_path_buf());
        Ok(())
    }

    /// Detach a previously attached database
    pub fn detach(&mut self, name: &str) -> StoreResult<()> {
        if !self.attached.contains_key(name) {
            return Err(StoreError::Query(format!("Database '{}' is not attached", name)));
        }

        // Cached statements may reference the schema being removed
        self.release_statements();
        self.inner
            .execute_batch(&format!("DETACH DATABASE {}", quote_identifier(name)))?;
        self.attached.remove(name);
        debug!(id = self.id, name, "Detached database");
        Ok(())
    }

    /// Expose the federation module over `table` as `temp.<name>`
    pub fn create_federated_table(&mut self, name: &str, table: &str) -> StoreResult<()> {
        self.inner.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS temp.{} USING {}({})",
            quote_identifier(name),
            federation::MODULE_NAME,
            quote_identifier(table)
        ))?;
        Ok(())
    }

    /// Fold the WAL back into the database files of every attached schema.
    ///
    /// Blocking checkpoints wait for readers and writers (FULL), background
    /// ones take whatever they can get without waiting (PASSIVE).
    pub fn wal_checkpoint(&self, mode: CheckpointMode) -> StoreResult<()> {
        let sql = match mode {
            CheckpointMode::Blocking => "PRAGMA wal_checkpoint(FULL)",
            CheckpointMode::Background => "PRAGMA wal_checkpoint(PASSIVE)",
        };
        let (busy, log, checkpointed): (i64, i64, i64) = self
            .inner
            .query_row(sql, [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        debug!(id = self.id, ?mode, busy, log, checkpointed, "WAL checkpoint");
        Ok(())
    }

    /// Route WAL commit notifications of this handle to `scheduler`
    pub(crate) fn install_wal_hook(&mut self, scheduler: Arc<CheckpointScheduler>) {
        let data = Arc::as_ptr(&scheduler) as *mut c_void;
        // SAFETY: `data` points into the Arc stored in `self.wal_hook`, which
        // outlives the registration (see `Drop`).
        unsafe {
            ffi::sqlite3_wal_hook(self.inner.handle(), Some(wal_hook_callback), data);
        }
        self.wal_hook = Some(scheduler);
    }

    /// Finalize every cached statement
    pub fn release_statements(&mut self) {
        self.selects.clear();
        self.updates.clear();
        self.inner.flush_prepared_statement_cache();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(scheduler) = self.wal_hook.take() {
            // SAFETY: unregisters the hook before its user data goes away
            unsafe {
                ffi::sqlite3_wal_hook(self.inner.handle(), None, std::ptr::null_mut());
            }
            drop(scheduler);
        }
        self.release_statements();
        debug!(id = self.id, role = ?self.role, "Closing connection");
    }
}

unsafe extern "C" fn wal_hook_callback(
    data: *mut c_void,
    db: *mut ffi::sqlite3,
    _schema: *const c_char,
    pages: c_int,
) -> c_int {
    // SAFETY: registered by `install_wal_hook` with a live scheduler pointer
    let scheduler = unsafe { &*(data as *const CheckpointScheduler) };
    let pages = u32::try_from(pages).unwrap_or(0);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        scheduler.on_commit(pages, || unsafe { blocking_checkpoint(db) })
    }));
    if outcome.is_err() {
        error!(pages, "WAL hook panicked");
    }
    ffi::SQLITE_OK
}

/// FULL checkpoint of every schema on a raw handle, for use inside the WAL hook
unsafe fn blocking_checkpoint(db: *mut ffi::sqlite3) -> StoreResult<()> {
    let mut log: c_int = 0;
    let mut checkpointed: c_int = 0;
    let rc = unsafe {
        ffi::sqlite3_wal_checkpoint_v2(
            db,
            std::ptr::null(),
            ffi::SQLITE_CHECKPOINT_FULL,
            &mut log,
            &mut checkpointed,
        )
    };
    if rc == ffi::SQLITE_OK {
        debug!(log, checkpointed, "Blocking WAL checkpoint");
        Ok(())
    } else {
        Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(rc),
            Some("blocking WAL checkpoint failed".to_string()),
        )))
    }
}

/// Per-schema pragmas, applied to `main` on open and to every attached database
fn apply_database_pragmas(
    conn: &rusqlite::Connection,
    schema: &str,
    options: &ConnectionOptions,
) -> StoreResult<()> {
    let schema = quote_identifier(schema);
    let fail = |what: &str, e: rusqlite::Error| {
        StoreError::Open(format!("Could not set {} on {}: {}", what, schema, e))
    };

    // page_size only takes effect before the first page is written
    if let Some(page_size) = options.page_size {
        debug!(%schema, page_size, "Setting page size");
        conn.execute_batch(&format!("PRAGMA {}.page_size = {};", schema, page_size))
            .map_err(|e| fail("page_size", e))?;
    }

    conn.execute_batch(&format!(
        "PRAGMA {s}.synchronous = NORMAL; PRAGMA {s}.auto_vacuum = 0;",
        s = schema
    ))
    .map_err(|e| fail("synchronous/auto_vacuum", e))?;

    let mode: String = conn
        .query_row(&format!("PRAGMA {}.journal_mode = WAL", schema), [], |row| {
            row.get(0)
        })
        .map_err(|e| fail("journal_mode", e))?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(StoreError::Open(format!(
            "Can't set journal mode to WAL on {} (engine kept '{}')",
            schema, mode
        )));
    }

    conn.execute_batch(&format!(
        "PRAGMA {s}.wal_autocheckpoint = 0; PRAGMA {s}.journal_size_limit = {limit}; PRAGMA {s}.cache_size = {cache};",
        s = schema,
        limit = options.journal_size_limit,
        cache = options.cache_size
    ))
    .map_err(|e| fail("wal_autocheckpoint/journal_size_limit/cache_size", e))?;

    debug!(%schema, cache_size = options.cache_size, "Database pragmas applied");
    Ok(())
}

/// Double-quote an SQL identifier
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Text rusqlite caches a statement under, so the same SQL prepared as both
/// kinds gets two compiled statements
fn cache_key(kind: StatementKind, sql: &str) -> String {
    match kind {
        StatementKind::Select => format!("/* select */ {}", sql),
        StatementKind::Update => format!("/* update */ {}", sql),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_rw(dir: &TempDir) -> Connection {
        Connection::open(
            &dir.path().join("test.db"),
            ConnectionRole::Write,
            &ConnectionOptions::default(),
        )
        .expect("Failed to open connection")
    }

    fn pragma_text(conn: &Connection, sql: &str) -> String {
        conn.raw().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn pragma_int(conn: &Connection, sql: &str) -> i64 {
        conn.raw().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_open_applies_pragmas() {
        let dir = TempDir::new().unwrap();
        let conn = open_rw(&dir);

        assert_eq!(pragma_text(&conn, "PRAGMA journal_mode").to_lowercase(), "wal");
        assert_eq!(pragma_int(&conn, "PRAGMA synchronous"), 1);
        assert_eq!(pragma_int(&conn, "PRAGMA auto_vacuum"), 0);
        assert_eq!(pragma_int(&conn, "PRAGMA wal_autocheckpoint"), 0);
        assert_eq!(pragma_int(&conn, "PRAGMA journal_size_limit"), 10_240_000);
        assert_eq!(pragma_int(&conn, "PRAGMA temp_store"), 1);
        assert_eq!(pragma_text(&conn, "PRAGMA encoding"), "UTF-8");
    }

    #[test]
    fn test_in_memory_database_rejected() {
        let err = Connection::open(
            Path::new(":memory:"),
            ConnectionRole::Write,
            &ConnectionOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, StoreError::Open(_)));
    }

    #[test]
    fn test_read_only_role() {
        let dir = TempDir::new().unwrap();
        drop(open_rw(&dir));

        let mut reader = Connection::open(
            &dir.path().join("test.db"),
            ConnectionRole::Read,
            &ConnectionOptions::default(),
        )
        .unwrap();

        assert!(reader.is_read_only());
        assert_eq!(pragma_int(&reader, "PRAGMA temp_store"), 2);
        assert!(reader.execute("CREATE TABLE t (x)", []).is_err());
    }

    #[test]
    fn test_execute_and_query() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_rw(&dir);

        conn.execute("CREATE TABLE t (x INTEGER, y TEXT)", []).unwrap();
        for i in 0..3 {
            conn.execute("INSERT INTO t VALUES (?1, ?2)", rusqlite::params![i, format!("v{}", i)])
                .unwrap();
        }

        let rows: Vec<(i64, String)> = conn
            .query_map("SELECT x, y FROM t ORDER BY x", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], (2, "v2".to_string()));

        // Same insert text three times: compiled once
        let stats = conn.cache_stats(StatementKind::Update);
        assert_eq!(stats.prepares, 2);
        assert_eq!(stats.hits, 2);
    }

    fn compiled_statements(conn: &Connection) -> usize {
        let db = unsafe { conn.inner.handle() };
        let mut count = 0;
        let mut stmt = unsafe { ffi::sqlite3_next_stmt(db, std::ptr::null_mut()) };
        while !stmt.is_null() {
            count += 1;
            stmt = unsafe { ffi::sqlite3_next_stmt(db, stmt) };
        }
        count
    }

    #[test]
    fn test_kinds_sharing_sql_are_cached_apart() {
        let dir = TempDir::new().unwrap();
        let options = ConnectionOptions {
            select_cache_size: 1,
            update_cache_size: 1,
            ..ConnectionOptions::default()
        };
        let mut conn =
            Connection::open(&dir.path().join("test.db"), ConnectionRole::Write, &options).unwrap();
        let base = compiled_statements(&conn);

        drop(conn.prepare(StatementKind::Select, "SELECT 1").unwrap());
        drop(conn.prepare(StatementKind::Update, "SELECT 1").unwrap());
        assert_eq!(compiled_statements(&conn), base + 2);

        // Evicts the select copy only
        drop(conn.prepare(StatementKind::Select, "SELECT 2").unwrap());
        assert_eq!(compiled_statements(&conn), base + 2);

        drop(conn.prepare(StatementKind::Update, "SELECT 1").unwrap());
        assert_eq!(compiled_statements(&conn), base + 2);
        let updates = conn.cache_stats(StatementKind::Update);
        assert_eq!((updates.prepares, updates.hits), (1, 1));
        assert_eq!(conn.cache_stats(StatementKind::Select).evictions, 1);
    }

    #[test]
    fn test_cursor_marks_connection_used() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_rw(&dir);
        let activity = conn.activity();

        assert!(!activity.is_used());
        conn.query("SELECT 1 UNION ALL SELECT 2", [], |cursor| {
            assert!(activity.is_used());
            assert!(cursor.next()?.is_some());
            Ok(())
        })
        .unwrap();
        assert!(!activity.is_used());
    }

    #[test]
    fn test_malformed_sql_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_rw(&dir);

        let err = conn.query_row("SELEC nonsense", [], |row| row.get::<_, i64>(0)).unwrap_err();
        assert!(err.is_query_error());
        assert_eq!(conn.cache_stats(StatementKind::Select).prepares, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_rw(&dir);
        conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();

        let result: StoreResult<()> = conn.transaction(|tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])?;
            Err(StoreError::Query("abort".to_string()))
        });
        assert!(result.is_err());

        let count = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get::<_, i64>(0))
            .unwrap();
        assert_eq!(count, Some(0));
    }

    #[test]
    fn test_attach_and_detach() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_rw(&dir);
        let graph = dir.path().join("graph.db");

        conn.attach("g1", &graph, true).unwrap();
        assert!(conn.is_attached("g1"));
        assert_eq!(
            pragma_text(&conn, "PRAGMA \"g1\".journal_mode").to_lowercase(),
            "wal"
        );

        conn.execute("CREATE TABLE g1.t (x)", []).unwrap();
        conn.execute("INSERT INTO g1.t VALUES (42)", []).unwrap();

        assert!(conn.attach("g1", &graph, false).is_err());

        conn.detach("g1").unwrap();
        assert!(!conn.is_attached("g1"));
        assert!(conn.detach("g1").is_err());

        // Reattaching without create keeps the data
        conn.attach("g1", &graph, false).unwrap();
        let value = conn
            .query_row("SELECT x FROM g1.t", [], |row| row.get::<_, i64>(0))
            .unwrap();
        assert_eq!(value, Some(42));

        // With create the file starts over
        conn.detach("g1").unwrap();
        conn.attach("g1", &graph, true).unwrap();
        assert!(conn.query_row("SELECT x FROM g1.t", [], |row| row.get::<_, i64>(0)).is_err());
    }

    #[test]
    fn test_wal_checkpoint_modes() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_rw(&dir);
        conn.execute("CREATE TABLE t (x)", []).unwrap();

        conn.wal_checkpoint(CheckpointMode::Background).unwrap();
        conn.wal_checkpoint(CheckpointMode::Blocking).unwrap();
    }
}
