//! Prepared-statement cache.
//!
//! A small pool of prepared SQLite statements keyed by SQL text, owned by
//! the database handle and dropped with it. `use_statement` acquires a
//! cached statement, invokes the closure, and returns the statement to the
//! pool; `checkout` exposes explicit check-out for streaming iterators (the
//! statement returns to the pool when the handle drops, which doubles as
//! the iterator finaliser on error unwind).
//!
//! Eviction is LRU with a configurable high-water mark, delegated to
//! SQLite's per-connection prepared-statement cache.

use std::cell::Cell;
use std::rc::Rc;

use rusqlite::{CachedStatement, Connection};

use crate::error::LiteTrickleError;

/// A prepared-statement pool bound to one SQLite connection.
pub struct StatementCache {
    conn: Rc<Connection>,
    capacity: Cell<usize>,
    uses: Cell<u64>,
}

impl StatementCache {
    /// Create a cache over `conn` with the given high-water mark.
    pub fn new(conn: Rc<Connection>, capacity: usize) -> Self {
        conn.set_prepared_statement_cache_capacity(capacity);
        StatementCache {
            conn,
            capacity: Cell::new(capacity),
            uses: Cell::new(0),
        }
    }

    /// The underlying connection handle.
    pub fn connection(&self) -> &Rc<Connection> {
        &self.conn
    }

    /// Acquire a cached statement for `sql`, run `f`, return it to the pool.
    pub fn use_statement<T>(
        &self,
        sql: &str,
        f: impl FnOnce(&mut CachedStatement<'_>) -> Result<T, LiteTrickleError>,
    ) -> Result<T, LiteTrickleError> {
        let mut stmt = self.checkout(sql)?;
        f(&mut stmt)
    }

    /// Explicitly check out a prepared statement. It returns to the pool on
    /// drop, so streaming iterators can hold it across row boundaries.
    pub fn checkout(&self, sql: &str) -> Result<CachedStatement<'_>, LiteTrickleError> {
        self.uses.set(self.uses.get() + 1);
        Ok(self.conn.prepare_cached(sql)?)
    }

    /// Adjust the high-water mark; statements beyond it are evicted LRU.
    pub fn set_capacity(&self, capacity: usize) {
        self.conn.set_prepared_statement_cache_capacity(capacity);
        self.capacity.set(capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Number of acquisitions since creation.
    pub fn uses(&self) -> u64 {
        self.uses.get()
    }
}
