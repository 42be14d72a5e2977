//! Graph federation virtual table
//!
//! `CREATE VIRTUAL TABLE temp.x USING federation(T)` exposes the union of
//! table `T` across `main` and every attached graph database, with one extra
//! trailing `graph` column holding the id of the graph each row came from
//! (`0` for `main`, `NULL` when a graph has no registered id).
//!
//! Every usable `=, !=, <, <=, >, >=` constraint is pushed down into the
//! per-database queries. Constraints are never marked as omitted, so the
//! engine re-checks them; that is what makes constraints on the synthetic
//! `graph` column (which are not pushed down) still filter correctly.
//!
//! The per-database queries are stepped one row per `xNext`, so a scan the
//! engine stops early (`LIMIT`, `EXISTS`) never evaluates the rows after it.

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::vtab::{
    read_only_module, Context, CreateVTab, Filters, IndexConstraintOp, IndexInfo, VTab,
    VTabConnection, VTabCursor, VTabKind,
};
use rusqlite::{ffi, Connection as SqliteConnection, Error, OptionalExtension, Result};
use serde::Serialize;
use std::cell::RefCell;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Name the module is registered under
pub const MODULE_NAME: &str = "federation";

/// Name of the synthetic trailing column
pub const GRAPH_COLUMN: &str = "graph";

/// Column index the engine uses for the implicit row id
pub const ROWID_COLUMN: i32 = -1;

/// Graph id reported for rows of `main`
pub const MAIN_GRAPH_ID: i64 = 0;

/// Maps an attached database name to its graph id
pub trait GraphIdResolver: Send + Sync + fmt::Debug {
    /// `Ok(None)` when the database has no registered id
    fn resolve(&self, conn: &SqliteConnection, database: &str) -> Result<Option<i64>>;
}

/// Looks graph ids up in the resource table of `main`, keyed by URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTableResolver {
    pub table: String,
    pub id_column: String,
    pub uri_column: String,
}

impl Default for ResourceTableResolver {
    fn default() -> Self {
        Self {
            table: crate::schema::RESOURCE_TABLE.to_string(),
            id_column: "ID".to_string(),
            uri_column: "Uri".to_string(),
        }
    }
}

impl GraphIdResolver for ResourceTableResolver {
    fn resolve(&self, conn: &SqliteConnection, database: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT {} FROM main.{} WHERE {} = ?1",
            quote(&self.id_column),
            quote(&self.table),
            quote(&self.uri_column)
        );
        conn.query_row(&sql, [database], |row| row.get(0)).optional()
    }
}

#[derive(Debug, Default)]
struct Counters {
    prepares: AtomicU64,
    filters: AtomicU64,
    cursors: AtomicU64,
}

/// Snapshot of the module counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FederationStats {
    /// Per-database statements compiled
    pub prepares: u64,
    /// Filter (scan start) requests
    pub filters: u64,
    /// Cursors opened
    pub cursors: u64,
}

/// State shared by every federated table of a store
#[derive(Debug)]
pub struct FederationContext {
    resolver: Box<dyn GraphIdResolver>,
    counters: Counters,
}

impl Default for FederationContext {
    fn default() -> Self {
        Self::new(Box::new(ResourceTableResolver::default()))
    }
}

impl FederationContext {
    pub fn new(resolver: Box<dyn GraphIdResolver>) -> Self {
        Self {
            resolver,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> FederationStats {
        FederationStats {
            prepares: self.counters.prepares.load(Ordering::Relaxed),
            filters: self.counters.filters.load(Ordering::Relaxed),
            cursors: self.counters.cursors.load(Ordering::Relaxed),
        }
    }
}

/// Register the module on a connection
pub fn register(conn: &SqliteConnection, context: Arc<FederationContext>) -> Result<()> {
    conn.create_module(MODULE_NAME, read_only_module::<FederatedTable>(), Some(context))
}

/// Comparison operators that are pushed down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ConstraintOp {
    pub const ALL: [ConstraintOp; 6] = [
        ConstraintOp::Eq,
        ConstraintOp::Ne,
        ConstraintOp::Lt,
        ConstraintOp::Le,
        ConstraintOp::Gt,
        ConstraintOp::Ge,
    ];

    fn from_index_op(op: IndexConstraintOp) -> Option<Self> {
        match op {
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ => Some(ConstraintOp::Eq),
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_NE => Some(ConstraintOp::Ne),
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LT => Some(ConstraintOp::Lt),
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LE => Some(ConstraintOp::Le),
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GT => Some(ConstraintOp::Gt),
            IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GE => Some(ConstraintOp::Ge),
            _ => None,
        }
    }

    /// SQL spelling of the operator
    pub fn as_sql(self) -> &'static str {
        match self {
            ConstraintOp::Eq => "=",
            ConstraintOp::Ne => "!=",
            ConstraintOp::Lt => "<",
            ConstraintOp::Le => "<=",
            ConstraintOp::Gt => ">",
            ConstraintOp::Ge => ">=",
        }
    }

    fn code(self) -> &'static str {
        match self {
            ConstraintOp::Eq => "eq",
            ConstraintOp::Ne => "ne",
            ConstraintOp::Lt => "lt",
            ConstraintOp::Le => "le",
            ConstraintOp::Gt => "gt",
            ConstraintOp::Ge => "ge",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }
}

/// A constraint accepted by the planner; its position in the plan is the
/// position of its value among the filter arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraint {
    pub column: i32,
    pub op: ConstraintOp,
}

/// Serialize accepted constraints into the plan string handed back at filter time
pub fn encode_plan(constraints: &[Constraint]) -> String {
    constraints
        .iter()
        .map(|c| format!("{}:{}", c.column, c.op.code()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inverse of [`encode_plan`]
pub fn decode_plan(plan: &str) -> Option<Vec<Constraint>> {
    plan.split_whitespace()
        .map(|token| {
            let (column, op) = token.split_once(':')?;
            Some(Constraint {
                column: column.parse().ok()?,
                op: ConstraintOp::from_code(op)?,
            })
        })
        .collect()
}

/// WHERE clause for the per-database queries.
///
/// `bindings[i]` is the filter argument bound to placeholder `?{i + 1}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhereClause {
    pub sql: String,
    pub bindings: Vec<usize>,
}

/// Build the WHERE clause for `constraints` over a table with `columns`.
///
/// Constraints on the synthetic graph column are left to the engine; they
/// still own a filter argument, so placeholders are numbered by what is
/// actually emitted and mapped back through `bindings`.
pub fn build_where_clause(columns: &[String], constraints: &[Constraint]) -> WhereClause {
    let mut terms = Vec::with_capacity(constraints.len());
    let mut bindings = Vec::with_capacity(constraints.len());

    for (argument, constraint) in constraints.iter().enumerate() {
        let column = if constraint.column == ROWID_COLUMN {
            "ROWID".to_string()
        } else {
            match usize::try_from(constraint.column).ok().and_then(|i| columns.get(i)) {
                Some(name) => quote(name),
                None => continue,
            }
        };

        bindings.push(argument);
        terms.push(format!("{} {} ?{}", column, constraint.op.as_sql(), bindings.len()));
    }

    let sql = if terms.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", terms.join(" AND "))
    };
    WhereClause { sql, bindings }
}

/// The federated table declared in a connection's `temp` schema
#[repr(C)]
pub struct FederatedTable {
    base: ffi::sqlite3_vtab,
    /// Handle of the connection the table lives on; does not own it
    conn: SqliteConnection,
    context: Arc<FederationContext>,
    table: String,
    columns: Vec<String>,
    databases: RefCell<Option<Vec<String>>>,
}

impl FederatedTable {
    fn attached_databases(&self) -> Result<Vec<String>> {
        if let Some(databases) = self.databases.borrow().as_ref() {
            return Ok(databases.clone());
        }

        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_database_list WHERE name != 'temp' ORDER BY seq")?;
        let databases = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>>>()?;
        debug!(table = %self.table, ?databases, "Enumerated databases");

        *self.databases.borrow_mut() = Some(databases.clone());
        Ok(databases)
    }
}

unsafe impl<'vtab> VTab<'vtab> for FederatedTable {
    type Aux = Arc<FederationContext>;
    type Cursor = FederatedCursor<'vtab>;

    fn connect(
        db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> Result<(String, Self)> {
        let table = match args.get(3) {
            Some(arg) => std::str::from_utf8(arg)
                .map(dequote)
                .map_err(|e| Error::ModuleError(format!("federation: bad table name: {}", e)))?,
            None => {
                return Err(Error::ModuleError(
                    "federation: expected the table to federate as argument".to_string(),
                ))
            }
        };

        // SAFETY: the handle outlives the virtual table, which the engine
        // disconnects before closing the connection
        let conn = unsafe { SqliteConnection::from_handle(db.handle())? };

        let described: Vec<(String, String)> = {
            let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1, 'main')")?;
            let rows = stmt.query_map([&table], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>>>()?
        };
        if described.is_empty() {
            return Err(Error::ModuleError(format!("federation: no such table: {}", table)));
        }

        let mut declaration = described
            .iter()
            .map(|(name, ty)| format!("{} {}", quote(name), ty).trim_end().to_string())
            .collect::<Vec<_>>();
        declaration.push(format!("{} INTEGER", GRAPH_COLUMN));
        let schema = format!("CREATE TABLE x({})", declaration.join(", "));
        trace!(%table, %schema, "Declaring federated table");

        let context = aux.cloned().unwrap_or_default();
        Ok((
            schema,
            Self {
                base: ffi::sqlite3_vtab::default(),
                conn,
                context,
                table,
                columns: described.into_iter().map(|(name, _)| name).collect(),
                databases: RefCell::new(None),
            },
        ))
    }

    fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
        let mut accepted = Vec::new();
        let mut positions = Vec::new();

        for (i, constraint) in info.constraints().enumerate() {
            if !constraint.is_usable() {
                continue;
            }
            let Some(op) = ConstraintOp::from_index_op(constraint.operator()) else {
                continue;
            };
            accepted.push(Constraint {
                column: constraint.column(),
                op,
            });
            positions.push(i);
        }

        for (argument, position) in positions.into_iter().enumerate() {
            let mut usage = info.constraint_usage(position);
            usage.set_argv_index(argument as c_int + 1);
            usage.set_omit(false);
        }

        let equalities = accepted.iter().filter(|c| c.op == ConstraintOp::Eq).count();
        let cost = 1_000_000.0 / (1.0 + 10.0 * equalities as f64 + accepted.len() as f64);
        info.set_estimated_cost(cost);
        info.set_order_by_consumed(false);
        info.set_idx_str(&encode_plan(&accepted));
        Ok(())
    }

    fn open(&'vtab mut self) -> Result<FederatedCursor<'vtab>> {
        let table: &'vtab FederatedTable = self;
        let databases = table.attached_databases()?;
        table.context.counters.cursors.fetch_add(1, Ordering::Relaxed);
        Ok(FederatedCursor::new(table, databases))
    }
}

impl CreateVTab<'_> for FederatedTable {
    const KIND: VTabKind = VTabKind::Default;
}

/// Compiled statement the cursor steps by hand.
///
/// rusqlite only exposes stepping through `Rows`, which borrows its
/// statement and cannot outlive a single `xFilter`/`xNext` call.
struct SteppedStatement {
    db: *mut ffi::sqlite3,
    stmt: *mut ffi::sqlite3_stmt,
}

impl SteppedStatement {
    fn prepare(conn: &SqliteConnection, sql: &str) -> Result<Self> {
        let len = c_int::try_from(sql.len())
            .map_err(|_| Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_TOOBIG), None))?;
        // SAFETY: the handle is open for as long as the virtual table exists
        let db = unsafe { conn.handle() };
        let mut stmt = ptr::null_mut();
        let rc = unsafe { ffi::sqlite3_prepare_v2(db, sql.as_ptr().cast(), len, &mut stmt, ptr::null_mut()) };
        if rc != ffi::SQLITE_OK {
            return Err(failure(db, rc));
        }
        if stmt.is_null() {
            return Err(Error::ModuleError(format!("federation: empty query {:?}", sql)));
        }
        Ok(Self { db, stmt })
    }

    fn column_count(&self) -> c_int {
        unsafe { ffi::sqlite3_column_count(self.stmt) }
    }

    /// Rewind and drop every binding
    fn reset(&mut self) {
        unsafe {
            ffi::sqlite3_reset(self.stmt);
            ffi::sqlite3_clear_bindings(self.stmt);
        }
    }

    fn bind(&mut self, index: c_int, value: &Value) -> Result<()> {
        let rc = unsafe {
            match value {
                Value::Null => ffi::sqlite3_bind_null(self.stmt, index),
                Value::Integer(v) => ffi::sqlite3_bind_int64(self.stmt, index, *v),
                Value::Real(v) => ffi::sqlite3_bind_double(self.stmt, index, *v),
                Value::Text(text) => ffi::sqlite3_bind_text(
                    self.stmt,
                    index,
                    text.as_ptr().cast(),
                    byte_len(text.len())?,
                    ffi::SQLITE_TRANSIENT(),
                ),
                Value::Blob(blob) => ffi::sqlite3_bind_blob(
                    self.stmt,
                    index,
                    blob.as_ptr().cast(),
                    byte_len(blob.len())?,
                    ffi::SQLITE_TRANSIENT(),
                ),
            }
        };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(failure(self.db, rc))
        }
    }

    /// Move to the next row; false once the statement is done
    fn step(&mut self) -> Result<bool> {
        match unsafe { ffi::sqlite3_step(self.stmt) } {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            rc => Err(failure(self.db, rc)),
        }
    }

    /// Column `i` of the current row; valid until the next step or reset
    fn column(&self, i: c_int) -> ValueRef<'_> {
        // SAFETY: the text and blob pointers are read before their sizes and
        // stay valid while `self` is not stepped, which needs `&mut self`
        unsafe {
            match ffi::sqlite3_column_type(self.stmt, i) {
                ffi::SQLITE_INTEGER => ValueRef::Integer(ffi::sqlite3_column_int64(self.stmt, i)),
                ffi::SQLITE_FLOAT => ValueRef::Real(ffi::sqlite3_column_double(self.stmt, i)),
                ffi::SQLITE_TEXT => {
                    let data = ffi::sqlite3_column_text(self.stmt, i);
                    ValueRef::Text(column_bytes(data.cast(), ffi::sqlite3_column_bytes(self.stmt, i)))
                }
                ffi::SQLITE_BLOB => {
                    let data = ffi::sqlite3_column_blob(self.stmt, i);
                    ValueRef::Blob(column_bytes(data.cast(), ffi::sqlite3_column_bytes(self.stmt, i)))
                }
                _ => ValueRef::Null,
            }
        }
    }
}

impl Drop for SteppedStatement {
    fn drop(&mut self) {
        unsafe {
            ffi::sqlite3_finalize(self.stmt);
        }
    }
}

fn byte_len(len: usize) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_TOOBIG), None))
}

/// # Safety
///
/// `data` must be null or point to at least `len` readable bytes that
/// outlive `'a`.
unsafe fn column_bytes<'a>(data: *const u8, len: c_int) -> &'a [u8] {
    match usize::try_from(len) {
        Ok(len) if len > 0 && !data.is_null() => std::slice::from_raw_parts(data, len),
        _ => &[],
    }
}

fn failure(db: *mut ffi::sqlite3, rc: c_int) -> Error {
    let message = unsafe {
        let message = ffi::sqlite3_errmsg(db);
        (!message.is_null()).then(|| CStr::from_ptr(message).to_string_lossy().into_owned())
    };
    Error::SqliteFailure(ffi::Error::new(rc), message)
}

/// Scan over a federated table, one attached database after the other
#[repr(C)]
pub struct FederatedCursor<'vtab> {
    base: ffi::sqlite3_vtab_cursor,
    table: &'vtab FederatedTable,
    databases: Vec<String>,
    clause: Option<WhereClause>,
    statements: Vec<SteppedStatement>,
    arguments: Vec<Value>,
    next_database: usize,
    /// Statement positioned on the current row
    current: Option<usize>,
    rowid: i64,
    finished: bool,
}

impl<'vtab> FederatedCursor<'vtab> {
    fn new(table: &'vtab FederatedTable, databases: Vec<String>) -> Self {
        Self {
            base: ffi::sqlite3_vtab_cursor::default(),
            table,
            databases,
            clause: None,
            statements: Vec::new(),
            arguments: Vec::new(),
            next_database: 0,
            current: None,
            rowid: 0,
            finished: true,
        }
    }

    fn prepare_statements(&mut self) -> Result<()> {
        let table = self.table;
        let clause = self.clause.as_ref().map_or("", |c| c.sql.as_str());
        self.current = None;
        self.statements.clear();

        for database in &self.databases {
            let graph = if database == "main" {
                Some(MAIN_GRAPH_ID)
            } else {
                table.context.resolver.resolve(&table.conn, database)?
            };
            let graph = graph.map_or_else(|| "NULL".to_string(), |id| id.to_string());
            let sql = format!(
                "SELECT *, {} FROM {}.{} {}",
                graph,
                quote(database),
                quote(&table.table),
                clause
            );
            trace!(%sql, "Preparing federated query");
            self.statements.push(SteppedStatement::prepare(&table.conn, &sql)?);
            table.context.counters.prepares.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Rewind the statement of `index` and bind the current arguments to it
    fn start_database(&mut self, index: usize) -> Result<()> {
        let bindings = self.clause.as_ref().map_or(&[][..], |c| c.bindings.as_slice());
        let stmt = &mut self.statements[index];
        stmt.reset();

        for (position, argument) in bindings.iter().enumerate() {
            let value = self.arguments.get(*argument).ok_or_else(|| {
                Error::ModuleError(format!("federation: missing filter argument {}", argument))
            })?;
            stmt.bind(position as c_int + 1, value)?;
        }
        Ok(())
    }

    /// Leave the current row without finishing its statement
    fn stop(&mut self) {
        if let Some(index) = self.current.take() {
            self.statements[index].reset();
        }
    }

    /// Move to the next row, crossing into the next database when needed
    fn advance(&mut self) -> Result<()> {
        loop {
            if let Some(index) = self.current {
                match self.statements[index].step() {
                    Ok(true) => return Ok(()),
                    Ok(false) => self.stop(),
                    Err(e) => {
                        self.stop();
                        self.finished = true;
                        return Err(e);
                    }
                }
                continue;
            }
            if self.next_database >= self.statements.len() {
                self.finished = true;
                return Ok(());
            }

            let index = self.next_database;
            self.next_database += 1;
            if let Err(e) = self.start_database(index) {
                self.finished = true;
                return Err(e);
            }
            self.current = Some(index);
        }
    }
}

unsafe impl VTabCursor for FederatedCursor<'_> {
    fn filter(&mut self, _idx_num: c_int, idx_str: Option<&str>, args: &Filters<'_>) -> Result<()> {
        self.table.context.counters.filters.fetch_add(1, Ordering::Relaxed);
        self.stop();
        self.finished = false;
        self.next_database = 0;
        self.rowid = 0;

        let constraints = decode_plan(idx_str.unwrap_or_default()).ok_or_else(|| {
            Error::ModuleError(format!("federation: malformed plan {:?}", idx_str))
        })?;
        let clause = build_where_clause(&self.table.columns, &constraints);
        self.arguments = (0..args.len())
            .map(|i| args.get::<Value>(i))
            .collect::<Result<Vec<_>>>()?;

        let recompile = self.statements.len() != self.databases.len()
            || self.clause.as_ref().map_or(true, |current| current.sql != clause.sql);
        // Same text may still map placeholders to different arguments
        self.clause = Some(clause);

        if recompile {
            if let Err(e) = self.prepare_statements() {
                self.statements.clear();
                self.finished = true;
                return Err(e);
            }
        }

        self.advance()
    }

    fn next(&mut self) -> Result<()> {
        self.rowid += 1;
        self.advance()
    }

    fn eof(&self) -> bool {
        self.finished
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> Result<()> {
        match self.current.map(|index| &self.statements[index]) {
            Some(stmt) if !self.finished && (0..stmt.column_count()).contains(&i) => {
                ctx.set_result(&ToSqlOutput::Borrowed(stmt.column(i)))
            }
            _ => ctx.set_result(&Value::Null),
        }
    }

    fn rowid(&self) -> Result<i64> {
        Ok(self.rowid)
    }
}

impl Drop for FederatedCursor<'_> {
    fn drop(&mut self) {
        // Databases may be attached or detached before the next scan
        *self.table.databases.borrow_mut() = None;
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn dequote(name: &str) -> String {
    let name = name.trim();
    let quoted = [('"', '"'), ('\'', '\''), ('`', '`'), ('[', ']')]
        .into_iter()
        .find(|(open, close)| name.len() >= 2 && name.starts_with(*open) && name.ends_with(*close));
    match quoted {
        Some((open, close)) => {
            let inner = &name[1..name.len() - 1];
            if open == close {
                inner.replace(&format!("{}{}", close, close), &close.to_string())
            } else {
                inner.to_string()
            }
        }
        None => name.to_string(),
    }
}
