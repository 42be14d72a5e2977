//! WAL checkpoint scheduling
//!
//! The write connection reports every commit through its WAL hook. Small WALs
//! are folded back by a background worker on a dedicated helper connection;
//! once the WAL reaches the blocking threshold the committing thread does a
//! FULL checkpoint itself. At most one checkpoint runs at a time: each new
//! request first waits for the previous one to finish.

use crate::connection::Connection;
use crate::error::{StoreError, StoreResult};
use crate::observer::StoreObserver;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// How a checkpoint is run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CheckpointMode {
    /// FULL, on the committing thread
    Blocking,
    /// PASSIVE, on the background worker
    Background,
}

/// Opens the helper connection used by background checkpoints
pub type HelperOpener = Arc<dyn Fn() -> StoreResult<Connection> + Send + Sync>;

#[derive(Debug, Default)]
struct Counters {
    blocking_runs: AtomicU64,
    background_runs: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Snapshot of the scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointStats {
    pub blocking_runs: u64,
    pub background_runs: u64,
    pub failures: u64,
    /// Largest number of checkpoints observed running at once
    pub max_in_flight: usize,
}

struct Request {
    done: flume::Sender<()>,
}

struct Worker {
    requests: flume::Sender<Request>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    worker: Option<Worker>,
    /// Completion signal of the last background request
    pending: Option<flume::Receiver<()>>,
}

/// Decides between blocking and background checkpoints and runs them
pub struct CheckpointScheduler {
    blocking_pages: u32,
    opener: HelperOpener,
    observer: Arc<dyn StoreObserver>,
    counters: Arc<Counters>,
    state: Mutex<State>,
}

impl std::fmt::Debug for CheckpointScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointScheduler")
            .field("blocking_pages", &self.blocking_pages)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CheckpointScheduler {
    pub fn new(blocking_pages: u32, opener: HelperOpener, observer: Arc<dyn StoreObserver>) -> Self {
        Self {
            blocking_pages,
            opener,
            observer,
            counters: Arc::new(Counters::default()),
            state: Mutex::new(State::default()),
        }
    }

    pub fn blocking_pages(&self) -> u32 {
        self.blocking_pages
    }

    pub fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            blocking_runs: self.counters.blocking_runs.load(Ordering::Relaxed),
            background_runs: self.counters.background_runs.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            max_in_flight: self.counters.max_in_flight.load(Ordering::Relaxed),
        }
    }

    /// React to a commit that left `pages` frames in the WAL.
    ///
    /// `blocking` performs a FULL checkpoint on the committing handle; it is
    /// only called once the WAL has reached the blocking threshold.
    pub fn on_commit<F>(&self, pages: u32, blocking: F)
    where
        F: FnOnce() -> StoreResult<()>,
    {
        let mut state = self.state.lock();
        wait_pending(&mut state);

        if pages >= self.blocking_pages {
            debug!(pages, "WAL over threshold, checkpointing synchronously");
            let _ = self.run_locked(blocking);
        } else if pages > 0 {
            self.submit(&mut state);
        }
    }

    /// Run a blocking checkpoint outside the commit path, such as a manual
    /// or final one.
    ///
    /// Waits for the background checkpoint in flight and keeps other
    /// requests out until `checkpoint` returns.
    pub fn run_blocking<F>(&self, checkpoint: F) -> StoreResult<()>
    where
        F: FnOnce() -> StoreResult<()>,
    {
        let mut state = self.state.lock();
        wait_pending(&mut state);
        self.run_locked(checkpoint)
    }

    /// Caller holds the state lock
    fn run_locked<F>(&self, checkpoint: F) -> StoreResult<()>
    where
        F: FnOnce() -> StoreResult<()>,
    {
        let running = InFlight::enter(&self.counters);
        let result = checkpoint();
        self.counters.blocking_runs.fetch_add(1, Ordering::Relaxed);
        drop(running);
        report(&self.counters, self.observer.as_ref(), CheckpointMode::Blocking, &result);
        result
    }

    /// Queue a background checkpoint, waiting for the previous one first
    pub fn request_background(&self) {
        let mut state = self.state.lock();
        wait_pending(&mut state);
        self.submit(&mut state);
    }

    /// Wait for the background checkpoint in flight, if any
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        wait_pending(&mut state);
    }

    /// Stop the worker and close the helper connection.
    ///
    /// The scheduler stays usable; the next background request starts a new
    /// worker.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        wait_pending(&mut state);
        if let Some(worker) = state.worker.take() {
            drop(worker.requests);
            if worker.handle.join().is_err() {
                warn!("Checkpoint worker panicked");
            }
            debug!("Checkpoint worker stopped");
        }
    }

    fn submit(&self, state: &mut State) {
        if state.worker.is_none() {
            match self.spawn_worker() {
                Ok(worker) => state.worker = Some(worker),
                Err(e) => {
                    warn!(error = %e, "Could not start checkpoint worker");
                    return;
                }
            }
        }

        let (done, finished) = flume::bounded(1);
        let Some(worker) = state.worker.as_ref() else {
            return;
        };
        if worker.requests.send(Request { done }).is_err() {
            warn!("Checkpoint worker is gone, dropping request");
            state.worker = None;
            return;
        }
        state.pending = Some(finished);
    }

    fn spawn_worker(&self) -> StoreResult<Worker> {
        let (requests, inbox) = flume::unbounded::<Request>();
        let opener = self.opener.clone();
        let observer = self.observer.clone();
        let counters = self.counters.clone();

        let handle = thread::Builder::new()
            .name("wal-checkpoint".to_string())
            .spawn(move || {
                let mut helper: Option<Connection> = None;
                for request in inbox.iter() {
                    let running = InFlight::enter(&counters);
                    let result = open_helper(&mut helper, &opener)
                        .and_then(|conn| conn.wal_checkpoint(CheckpointMode::Background));
                    counters.background_runs.fetch_add(1, Ordering::Relaxed);
                    report(
                        &counters,
                        observer.as_ref(),
                        CheckpointMode::Background,
                        &result,
                    );
                    drop(running);
                    let _ = request.done.send(());
                }
                debug!("Checkpoint worker exiting");
            })
            .map_err(StoreError::Io)?;

        info!("Started checkpoint worker");
        Ok(Worker { requests, handle })
    }
}

impl Drop for CheckpointScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Lazily open the helper connection, keeping it for later runs
fn open_helper<'a>(slot: &'a mut Option<Connection>, opener: &HelperOpener) -> StoreResult<&'a Connection> {
    if slot.is_none() {
        *slot = Some(opener()?);
    }
    slot.as_ref()
        .ok_or_else(|| StoreError::Open("checkpoint helper unavailable".to_string()))
}

fn wait_pending(state: &mut State) {
    if let Some(finished) = state.pending.take() {
        // Disconnection also means the request is over
        let _ = finished.recv();
    }
}

fn report(
    counters: &Counters,
    observer: &dyn StoreObserver,
    mode: CheckpointMode,
    result: &StoreResult<()>,
) {
    if let Err(e) = result {
        counters.failures.fetch_add(1, Ordering::Relaxed);
        warn!(?mode, error = %e, "Error running checkpoint");
    }
    observer.checkpoint_finished(mode, result.as_ref().err());
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::AcqRel);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionOptions, ConnectionRole};
    use crate::observer::NoopObserver;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir, blocking_pages: u32) -> CheckpointScheduler {
        let path = dir.path().join("test.db");
        let opener: HelperOpener = Arc::new(move || {
            Connection::open(&path, ConnectionRole::Checkpoint, &ConnectionOptions::default())
        });
        CheckpointScheduler::new(blocking_pages, opener, Arc::new(NoopObserver))
    }

    #[test]
    fn test_small_wal_runs_in_background() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, 100);
        let called = AtomicBool::new(false);

        scheduler.on_commit(10, || {
            called.store(true, Ordering::SeqCst);
            Ok(())
        });
        scheduler.wait_idle();

        assert!(!called.load(Ordering::SeqCst));
        let stats = scheduler.stats();
        assert_eq!(stats.background_runs, 1);
        assert_eq!(stats.blocking_runs, 0);
    }

    #[test]
    fn test_large_wal_blocks() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, 100);
        let called = AtomicBool::new(false);

        scheduler.on_commit(100, || {
            called.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(called.load(Ordering::SeqCst));
        assert_eq!(scheduler.stats().blocking_runs, 1);
        assert_eq!(scheduler.stats().background_runs, 0);
    }

    #[test]
    fn test_failures_are_counted_not_raised() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, 1);

        scheduler.on_commit(5, || Err(StoreError::Query("disk on fire".to_string())));
        assert_eq!(scheduler.stats().failures, 1);
    }

    #[test]
    fn test_requests_never_overlap() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, 1_000);

        for _ in 0..20 {
            scheduler.request_background();
        }
        scheduler.on_commit(1_000, || Ok(()));
        scheduler.shutdown();

        let stats = scheduler.stats();
        assert_eq!(stats.background_runs, 20);
        assert_eq!(stats.max_in_flight, 1);
    }

    #[test]
    fn test_manual_checkpoints_never_overlap_background_runs() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, 1_000);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10 {
                        scheduler.request_background();
                        scheduler
                            .run_blocking(|| {
                                thread::sleep(std::time::Duration::from_millis(1));
                                Ok(())
                            })
                            .unwrap();
                    }
                });
            }
        });
        scheduler.wait_idle();

        let stats = scheduler.stats();
        assert_eq!(stats.blocking_runs, 40);
        assert_eq!(stats.background_runs, 40);
        assert_eq!(stats.max_in_flight, 1);
    }

    #[test]
    fn test_manual_checkpoint_reports_failure() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, 1_000);

        let err = scheduler
            .run_blocking(|| Err(StoreError::Query("locked".to_string())))
            .unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
        assert_eq!(scheduler.stats().failures, 1);
    }

    #[test]
    fn test_restart_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, 1_000);

        scheduler.request_background();
        scheduler.shutdown();
        scheduler.request_background();
        scheduler.wait_idle();

        assert_eq!(scheduler.stats().background_runs, 2);
    }
}
