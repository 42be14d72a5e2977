//! Hooks the owner of a store can plug into
//!
//! Connections are handed to [`StoreObserver::setup_connection`] right after
//! they are opened and to [`StoreObserver::update_connection`] when the pool
//! hands out an existing read connection again, so callers can register SQL
//! functions or refresh per-connection state.

use crate::checkpoint::CheckpointMode;
use crate::connection::{Connection, ConnectionRole};
use crate::error::{StoreError, StoreResult};

/// Callbacks fired by the store; every method has a no-op default
pub trait StoreObserver: Send + Sync {
    /// A connection was just opened
    fn setup_connection(&self, _conn: &mut Connection) -> StoreResult<()> {
        Ok(())
    }

    /// A pooled read connection is being reused
    fn update_connection(&self, _conn: &mut Connection) -> StoreResult<()> {
        Ok(())
    }

    /// A checkpoint ended; `error` is set when it failed
    fn checkpoint_finished(&self, _mode: CheckpointMode, _error: Option<&StoreError>) {}

    /// Progress of a long-running open step (integrity check, VACUUM)
    fn busy(&self, _status: &str, _progress: f64) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StoreObserver for NoopObserver {}

/// Event forwarded by [`ChannelObserver`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ConnectionSetup { id: u64, role: ConnectionRole },
    ConnectionReused { id: u64 },
    CheckpointFinished { mode: CheckpointMode, error: Option<String> },
    Busy { status: String, progress: f64 },
}

/// Observer that turns every callback into a [`StoreEvent`] on a channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: flume::Sender<StoreEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, flume::Receiver<StoreEvent>) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver)
    }

    fn emit(&self, event: StoreEvent) {
        // Nobody listening is fine
        let _ = self.sender.send(event);
    }
}

impl StoreObserver for ChannelObserver {
    fn setup_connection(&self, conn: &mut Connection) -> StoreResult<()> {
        self.emit(StoreEvent::ConnectionSetup {
            id: conn.id(),
            role: conn.role(),
        });
        Ok(())
    }

    fn update_connection(&self, conn: &mut Connection) -> StoreResult<()> {
        self.emit(StoreEvent::ConnectionReused { id: conn.id() });
        Ok(())
    }

    fn checkpoint_finished(&self, mode: CheckpointMode, error: Option<&StoreError>) {
        self.emit(StoreEvent::CheckpointFinished {
            mode,
            error: error.map(ToString::to_string),
        });
    }

    fn busy(&self, status: &str, progress: f64) {
        self.emit(StoreEvent::Busy {
            status: status.to_string(),
            progress,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_observer_forwards_events() {
        let (observer, events) = ChannelObserver::new();

        observer.busy("Integrity checking", 0.5);
        observer.checkpoint_finished(CheckpointMode::Background, None);
        observer.checkpoint_finished(
            CheckpointMode::Blocking,
            Some(&StoreError::Query("locked".to_string())),
        );

        let received: Vec<StoreEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                StoreEvent::Busy {
                    status: "Integrity checking".to_string(),
                    progress: 0.5
                },
                StoreEvent::CheckpointFinished {
                    mode: CheckpointMode::Background,
                    error: None
                },
                StoreEvent::CheckpointFinished {
                    mode: CheckpointMode::Blocking,
                    error: Some("Query error: locked".to_string())
                },
            ]
        );
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (observer, events) = ChannelObserver::new();
        drop(events);
        observer.busy("still fine", 1.0);
    }
}
