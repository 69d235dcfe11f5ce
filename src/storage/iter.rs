//! Flushable result iterators
//!
//! Every multi-row query returns a lazy, one-pass `FlushableIter`. The
//! backend keeps a weak handle on each live iterator and *flushes* them all
//! before its next write: a pending query is executed and its rows buffered
//! in memory, so the iterator keeps yielding the results that were current
//! when it was obtained, no matter how many transactions follow.
//!
//! rusqlite statements borrow the connection, so a cursor cannot be held
//! across call boundaries; the streaming half of the state machine is a
//! deferred query instead, executed on first consumption or on flush,
//! whichever comes first. Both points happen-before the next write.

use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use super::sqlite::Inner;

/// Maps one result row to a yielded item
pub(crate) type RowMapper<T> = fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>;

/// A query whose execution is deferred until first use or flush
pub(crate) struct PendingQuery<T> {
    pub(crate) sql: String,
    pub(crate) params: Vec<Value>,
    pub(crate) map: RowMapper<T>,
}

impl<T> PendingQuery<T> {
    fn run(&self, conn: &Connection) -> rusqlite::Result<VecDeque<T>> {
        let mut stmt = conn.prepare(&self.sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(self.params.iter()), self.map)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

/// State of a result iterator: still a deferred query, or already buffered
pub(crate) enum IterState<T> {
    Pending(PendingQuery<T>),
    Materialized(VecDeque<T>),
}

impl<T> IterState<T> {
    /// Execute a pending query and buffer its rows. Idempotent.
    pub(crate) fn materialize(&mut self, conn: &Connection) {
        if let IterState::Pending(query) = self {
            let rows = match query.run(conn) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!("failed to materialize result iterator: {}", e);
                    VecDeque::new()
                }
            };
            *self = IterState::Materialized(rows);
        }
    }
}

/// Object-safe view of an iterator state, held weakly by the backend
pub(crate) trait FlushTarget: Send + Sync {
    fn flush(&self, conn: &Connection);
}

impl<T: Send + 'static> FlushTarget for Mutex<IterState<T>> {
    fn flush(&self, conn: &Connection) {
        if let Ok(mut state) = self.lock() {
            state.materialize(conn);
        }
    }
}

/// A lazy, one-pass result sequence that survives subsequent transactions
/// on the same connection.
///
/// Valid for the lifetime of the owning package; after the package (and
/// with it the backend connection) is closed, an unconsumed iterator
/// yields nothing.
pub struct FlushableIter<T> {
    state: Arc<Mutex<IterState<T>>>,
    backend: Weak<Mutex<Inner>>,
}

impl<T: Send + 'static> FlushableIter<T> {
    /// Build an iterator over a deferred query and register it with the
    /// backend so it gets flushed before the next write.
    pub(crate) fn register(
        backend: &Arc<Mutex<Inner>>,
        inner: &mut Inner,
        sql: String,
        params: Vec<Value>,
        map: RowMapper<T>,
    ) -> Self {
        let state = Arc::new(Mutex::new(IterState::Pending(PendingQuery {
            sql,
            params,
            map,
        })));
        let target: Arc<dyn FlushTarget> = state.clone();
        inner.iterators.retain(|w| w.strong_count() > 0);
        inner.iterators.push(Arc::downgrade(&target));
        Self {
            state,
            backend: Arc::downgrade(backend),
        }
    }
}

impl<T> Iterator for FlushableIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        // Fast path: already materialized, no connection needed.
        {
            let mut state = self.state.lock().ok()?;
            if let IterState::Materialized(rows) = &mut *state {
                return rows.pop_front();
            }
        }
        // Still pending: materialize against the live connection. Lock
        // order (backend, then state) matches the flush path.
        let backend = self.backend.upgrade()?;
        let guard = backend.lock().ok()?;
        let conn = guard.conn.as_ref()?;
        let mut state = self.state.lock().ok()?;
        state.materialize(conn);
        match &mut *state {
            IterState::Materialized(rows) => rows.pop_front(),
            IterState::Pending(_) => None,
        }
    }
}
