//! Read connection pool and the single write connection
//!
//! Read connections are kept in a FIFO and handed out round-robin. A
//! connection with open cursors is skipped in favour of a new one while the
//! pool is below its bound; once the bound is reached busy connections are
//! shared, which is safe because every connection serializes its own use.
//! Nested reads on one thread never share a connection with their caller.
//! The write connection is created lazily and there is only ever one.

use crate::checkpoint::{CheckpointMode, CheckpointScheduler, CheckpointStats, HelperOpener};
use crate::connection::{Connection, ConnectionActivity, ConnectionOptions, ConnectionRole};
use crate::error::{StoreError, StoreResult};
use crate::observer::StoreObserver;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};

/// Opens connections to one database file with the store's settings
#[derive(Clone)]
pub struct ConnectionFactory {
    path: PathBuf,
    options: ConnectionOptions,
    observer: Arc<dyn StoreObserver>,
}

impl ConnectionFactory {
    pub fn new(path: impl Into<PathBuf>, options: ConnectionOptions, observer: Arc<dyn StoreObserver>) -> Self {
        Self {
            path: path.into(),
            options,
            observer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Open a connection; read and write connections are passed to the
    /// observer's setup hook
    pub fn open(&self, role: ConnectionRole) -> StoreResult<Connection> {
        let mut conn = Connection::open(&self.path, role, &self.options)?;
        if role != ConnectionRole::Checkpoint {
            self.observer.setup_connection(&mut conn)?;
        }
        Ok(conn)
    }
}

/// Pooled read connection
pub struct PooledConnection {
    id: u64,
    activity: ConnectionActivity,
    conn: Mutex<Connection>,
    /// Thread currently running a closure on `conn`
    holder: Mutex<Option<ThreadId>>,
}

impl PooledConnection {
    fn new(conn: Connection) -> Self {
        Self {
            id: conn.id(),
            activity: conn.activity(),
            conn: Mutex::new(conn),
            holder: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a cursor is open on this connection
    pub fn is_used(&self) -> bool {
        self.activity.is_used()
    }

    fn is_held(&self) -> bool {
        self.holder.lock().is_some()
    }

    fn is_held_by(&self, thread: ThreadId) -> bool {
        *self.holder.lock() == Some(thread)
    }
}

/// Clears the holder of a pooled connection when the closure returns
struct Holding<'a>(&'a PooledConnection);

impl<'a> Holding<'a> {
    fn enter(slot: &'a PooledConnection) -> Self {
        *slot.holder.lock() = Some(thread::current().id());
        Self(slot)
    }
}

impl Drop for Holding<'_> {
    fn drop(&mut self) {
        *self.0.holder.lock() = None;
    }
}

/// Exclusive-use handle on a pooled read connection
pub struct ReadLease {
    slot: Arc<PooledConnection>,
    reused: bool,
    pooled: bool,
    needs_update: bool,
    observer: Arc<dyn StoreObserver>,
}

impl ReadLease {
    pub fn id(&self) -> u64 {
        self.slot.id()
    }

    /// Whether this lease handed out a connection that was already pooled
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// False for an overflow connection that is closed with the lease
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Lock the connection and run `f` on it
    pub fn with<F, T>(&mut self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T>,
    {
        let mut conn = self.slot.conn.lock();
        let _holding = Holding::enter(&self.slot);
        if self.needs_update {
            self.needs_update = false;
            self.observer.update_connection(&mut conn)?;
        }
        f(&mut conn)
    }
}

#[derive(Default)]
struct ReadSlots {
    connections: VecDeque<Arc<PooledConnection>>,
    /// Connections being opened outside the lock
    opening: usize,
}

/// Snapshot of the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub read_connections: usize,
    pub max_read_connections: usize,
    pub write_open: bool,
    /// Write connections created over the pool's lifetime
    pub write_connections_created: u64,
    pub checkpoints: CheckpointStats,
}

/// Bounded read pool plus the lazily created write connection
pub struct ConnectionPool {
    factory: ConnectionFactory,
    max_read: usize,
    reads: Mutex<ReadSlots>,
    write: Mutex<Option<Connection>>,
    writes_created: AtomicU64,
    checkpoints: Arc<CheckpointScheduler>,
    observer: Arc<dyn StoreObserver>,
}

impl ConnectionPool {
    pub fn new(
        factory: ConnectionFactory,
        max_read: usize,
        checkpoint_blocking_pages: u32,
        observer: Arc<dyn StoreObserver>,
    ) -> Self {
        let helper_factory = factory.clone();
        let opener: HelperOpener =
            Arc::new(move || helper_factory.open(ConnectionRole::Checkpoint));
        let checkpoints = Arc::new(CheckpointScheduler::new(
            checkpoint_blocking_pages,
            opener,
            observer.clone(),
        ));

        Self {
            factory,
            max_read: max_read.max(1),
            reads: Mutex::new(ReadSlots::default()),
            write: Mutex::new(None),
            writes_created: AtomicU64::new(0),
            checkpoints,
            observer,
        }
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub fn max_read_connections(&self) -> usize {
        self.max_read
    }

    pub fn checkpoints(&self) -> &CheckpointScheduler {
        &self.checkpoints
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            read_connections: self.reads.lock().connections.len(),
            max_read_connections: self.max_read,
            write_open: self.write.lock().is_some(),
            write_connections_created: self.writes_created.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.stats(),
        }
    }

    /// Hand out a read connection.
    ///
    /// Prefers the front connection of the FIFO unless it has open cursors
    /// and the pool may still grow. Connections are opened outside the lock.
    ///
    /// A thread that already runs on a pooled connection only gets
    /// connections nobody is running on. When every pooled connection is
    /// taken at the bound it gets an overflow connection that is closed with
    /// its lease, so nested reads never wait on a connection held further up
    /// the same call chain.
    pub fn acquire_read(&self) -> StoreResult<ReadLease> {
        let current = thread::current().id();
        let mut slots = self.reads.lock();
        let nested = slots.connections.iter().any(|slot| slot.is_held_by(current));
        let room = slots.connections.len() + slots.opening < self.max_read;
        let usable = |slot: &Arc<PooledConnection>| !nested || !slot.is_held();

        let candidate = slots.connections.iter().position(|slot| usable(slot));
        let reusable = match candidate {
            Some(i) if !(slots.connections[i].is_used() && room) => slots.connections.remove(i),
            _ => None,
        };

        if let Some(slot) = reusable {
            slots.connections.push_back(slot.clone());
            return Ok(self.lease(slot, true, true));
        }

        if nested && !room {
            drop(slots);
            let conn = self.factory.open(ConnectionRole::Read)?;
            debug!(id = conn.id(), max = self.max_read, "Opened overflow read connection");
            return Ok(self.lease(Arc::new(PooledConnection::new(conn)), false, false));
        }

        slots.opening += 1;
        drop(slots);
        let opened = self.factory.open(ConnectionRole::Read);
        let mut slots = self.reads.lock();
        slots.opening -= 1;

        match opened {
            Ok(conn) => {
                let slot = Arc::new(PooledConnection::new(conn));
                slots.connections.push_back(slot.clone());
                debug!(
                    id = slot.id(),
                    pooled = slots.connections.len(),
                    max = self.max_read,
                    "Opened read connection"
                );
                Ok(self.lease(slot, false, true))
            }
            Err(e) => {
                let fallback = slots
                    .connections
                    .iter()
                    .position(|slot| usable(slot))
                    .and_then(|i| slots.connections.remove(i));
                match fallback {
                    Some(slot) => {
                        warn!(error = %e, id = slot.id(), "Could not open read connection, sharing a busy one");
                        slots.connections.push_back(slot.clone());
                        Ok(self.lease(slot, true, true))
                    }
                    None => {
                        error!(error = %e, "Could not open read connection");
                        Err(e)
                    }
                }
            }
        }
    }

    fn lease(&self, slot: Arc<PooledConnection>, reused: bool, pooled: bool) -> ReadLease {
        ReadLease {
            slot,
            reused,
            pooled,
            needs_update: reused,
            observer: self.observer.clone(),
        }
    }

    /// Acquire a read connection and run `f` on it
    pub fn with_read<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T>,
    {
        self.acquire_read()?.with(f)
    }

    /// Run `f` on the write connection, opening it first if needed.
    ///
    /// Callers are serialized on the connection.
    pub fn with_write<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T>,
    {
        let mut slot = self.write.lock();
        if slot.is_none() {
            *slot = Some(self.open_write()?);
        }
        match slot.as_mut() {
            Some(conn) => f(conn),
            None => Err(StoreError::Open("write connection unavailable".to_string())),
        }
    }

    fn open_write(&self) -> StoreResult<Connection> {
        let mut conn = self.factory.open(ConnectionRole::Write)?;
        if !conn.is_read_only() {
            conn.install_wal_hook(self.checkpoints.clone());
        }
        let created = self.writes_created.fetch_add(1, Ordering::Relaxed) + 1;
        info!(id = conn.id(), path = ?self.factory.path(), created, "Opened write connection");
        Ok(conn)
    }

    /// Whether the write connection is locked by someone or has open cursors
    pub fn write_is_used(&self) -> bool {
        match self.write.try_lock() {
            Some(slot) => slot.as_ref().is_some_and(Connection::is_used),
            None => true,
        }
    }

    /// Close the write connection and the checkpoint helper
    pub fn reset_write(&self) {
        self.checkpoints.shutdown();
        if self.write.lock().take().is_some() {
            debug!("Write connection closed");
        }
    }

    /// Drop every pooled read connection; leases keep theirs alive until released
    pub fn clear_reads(&self) {
        let dropped = std::mem::take(&mut self.reads.lock().connections);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Read connections released");
        }
    }

    /// Tear everything down.
    ///
    /// Waits for the background checkpoint, then (unless read-only) runs a
    /// final blocking checkpoint on the write connection before closing it.
    pub fn close(&self, final_checkpoint: bool) {
        self.checkpoints.shutdown();

        if let Some(conn) = self.write.lock().take() {
            if final_checkpoint && !conn.is_read_only() {
                // Failures are already logged and reported by the scheduler
                let _ = self
                    .checkpoints
                    .run_blocking(|| conn.wal_checkpoint(CheckpointMode::Blocking));
            }
        }
        self.clear_reads();
    }

    /// Checkpoint on demand.
    ///
    /// Blocking checkpoints run on the write connection and return once the
    /// WAL has been folded back; background ones are queued to the worker.
    /// Either way they are serialized with the checkpoints commits trigger.
    pub fn checkpoint(&self, mode: CheckpointMode) -> StoreResult<()> {
        match mode {
            CheckpointMode::Blocking => self.with_write(|conn| {
                if conn.is_read_only() {
                    return Err(StoreError::UnsupportedOperation(
                        "Cannot checkpoint a read-only connection".to_string(),
                    ));
                }
                self.checkpoints
                    .run_blocking(|| conn.wal_checkpoint(CheckpointMode::Blocking))
            }),
            CheckpointMode::Background => {
                self.checkpoints.request_background();
                Ok(())
            }
        }
    }
}
