//! Per-connection prepared statement bookkeeping
//!
//! A [`StatementCache`] decides which SQL texts stay compiled on a connection.
//! Selects and updates are tracked separately so a burst of one-off updates
//! cannot push hot read queries out. The compiled statements themselves are
//! parked in rusqlite's own statement cache; this type is the LRU policy in
//! front of it and the source of truth for what is retained.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Which cache a statement belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Read-only queries
    Select,
    /// Statements that modify the database
    Update,
}

/// Outcome of looking a statement up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Already compiled and retained
    Hit,
    /// Not retained yet; it is now, and `evicted` fell out to make room
    Miss { evicted: Option<String> },
    /// Caching is disabled for this kind; compile a throwaway statement
    Uncached,
}

/// Counters exposed for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub prepares: u64,
    pub evictions: u64,
}

/// LRU set of SQL texts for one statement kind
#[derive(Debug)]
pub struct StatementCache {
    kind: StatementKind,
    entries: Option<LruCache<String, ()>>,
    stats: CacheStats,
}

impl StatementCache {
    /// Create a cache; `capacity == 0` disables caching for this kind
    pub fn new(kind: StatementKind, capacity: usize) -> Self {
        Self {
            kind,
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
            stats: CacheStats::default(),
        }
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.cap().get())
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.contains(sql))
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Record a use of `sql`, marking it most recently used.
    ///
    /// Every outcome other than [`CacheLookup::Hit`] means the caller is about
    /// to compile the statement, and counts as a prepare.
    pub fn lookup(&mut self, sql: &str) -> CacheLookup {
        let Some(entries) = self.entries.as_mut() else {
            self.stats.prepares += 1;
            return CacheLookup::Uncached;
        };

        if entries.get(sql).is_some() {
            self.stats.hits += 1;
            return CacheLookup::Hit;
        }

        self.stats.prepares += 1;
        let evicted = entries.push(sql.to_string(), ()).map(|(key, _)| key);
        if evicted.is_some() {
            self.stats.evictions += 1;
        }
        CacheLookup::Miss { evicted }
    }

    /// Drop `sql` after a failed compile so it is not reported as cached
    pub fn forget(&mut self, sql: &str) {
        if let Some(entries) = self.entries.as_mut() {
            entries.pop(sql);
        }
    }

    /// Empty the cache, returning what was retained
    pub fn clear(&mut self) -> Vec<String> {
        match self.entries.as_mut() {
            Some(entries) => {
                let drained: Vec<String> = entries.iter().map(|(sql, _)| sql.clone()).collect();
                entries.clear();
                drained
            }
            None => Vec::new(),
        }
    }
}
