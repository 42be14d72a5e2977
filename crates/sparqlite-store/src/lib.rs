//! SQLite storage core for sparqlite
//!
//! This crate owns the on-disk side of a triple store: the database files,
//! the connections to them, and a virtual table that federates one table
//! across every attached graph database.
//!
//! ## Features
//!
//! - **DatabaseManager**: open sequence with crash marker, integrity checks
//!   and automatic recreation of damaged databases
//! - **ConnectionPool**: bounded read pool plus a single lazily created
//!   write connection
//! - **WAL checkpointing**: engine auto-checkpoints are off; commits are
//!   checkpointed in the background or, past a threshold, synchronously
//! - **Federation**: `USING federation(Table)` unions `Table` across `main`
//!   and all attached graphs, tagging each row with its graph id
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sparqlite_store::{DatabaseManager, NoopObserver, OpenOptions, StoreConfig};
//! use std::sync::Arc;
//!
//! let manager = DatabaseManager::open(
//!     StoreConfig::new("./data"),
//!     OpenOptions::read_write(),
//!     Arc::new(NoopObserver),
//! )?;
//!
//! manager.with_write(|conn| {
//!     manager.attach_database(conn, "urn:graph:work", true)?;
//!     conn.create_federated_table("all_items", "Items")
//! })?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod error;
pub mod federation;
pub mod fsutil;
pub mod lifecycle;
pub mod manager;
pub mod metadata;
pub mod observer;
pub mod pool;
pub mod schema;
pub mod statement_cache;

// Re-exports
pub use checkpoint::{CheckpointMode, CheckpointStats};
pub use config::{FtsFlags, OpenOptions, StoreConfig};
pub use connection::{Connection, ConnectionOptions, ConnectionRole, Cursor, PreparedStatement};
pub use error::{StoreError, StoreResult};
pub use federation::{FederationStats, GraphIdResolver, ResourceTableResolver};
pub use lifecycle::{DatabaseLocation, Inspection, Recovery};
pub use manager::{DatabaseManager, ManagerFlags, ManagerStatus};
pub use observer::{ChannelObserver, NoopObserver, StoreEvent, StoreObserver};
pub use pool::{ConnectionPool, PoolStats, ReadLease};
pub use schema::SCHEMA_VERSION;
pub use statement_cache::StatementKind;
