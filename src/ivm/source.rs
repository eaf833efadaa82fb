//! SQLite-backed table source.
//!
//! [`TableSource`] exposes one SQLite table as a sortable, filterable,
//! incrementally pushable source. Connections carry an immutable
//! `(sort, filters)` view; filters are split into a retained subquery-free
//! part pushed into SQL and a residual predicate evaluated in memory.
//!
//! # Push atomicity
//!
//! `push` applies a change atomically with respect to all connected
//! operators: it publishes an [`Overlay`], delivers the change to each
//! connection in registration order, clears the overlay, then writes the
//! SQL row. Fetches issued from inside a connection's push handler observe
//! the overlay, which is what makes self-joins correct.
//!
//! # Split edits
//!
//! Before delivery, an edit is rewritten as `remove(old) + add(new)` for
//! any connection whose `split_edit_keys` intersect the changed columns, so
//! downstream sorts and join keys never see a row move in place.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use rusqlite::params_from_iter;
use rusqlite::types::ValueRef;
use tracing::debug;

use crate::ast::Condition;
use crate::error::LiteTrickleError;
use crate::ivm::{
    Change, FetchItem, FetchRequest, Input, Node, NodeStream, Output, Start, StartBasis,
};
use crate::row::{Row, Value};
use crate::schema::{ColumnType, Direction, SortSpec, TableSchema};
use crate::statement_cache::StatementCache;
use crate::timeslice::TimeSlice;

/// Integers beyond this magnitude do not fit double precision losslessly.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

// ── Query statistics ───────────────────────────────────────────────────────

/// Per-source read counters keyed by normalised query text, plus optional
/// row samples. Shared by the analyzer host with every source it vends.
#[derive(Debug, Default)]
pub struct QueryStats {
    collect_rows: Cell<bool>,
    counts: RefCell<BTreeMap<String, BTreeMap<String, u64>>>,
    rows: RefCell<BTreeMap<String, Vec<Row>>>,
}

impl QueryStats {
    pub fn new(collect_rows: bool) -> Self {
        QueryStats {
            collect_rows: Cell::new(collect_rows),
            counts: RefCell::new(BTreeMap::new()),
            rows: RefCell::new(BTreeMap::new()),
        }
    }

    fn record(&self, table: &str, query: &str, row: &Row) {
        let mut counts = self.counts.borrow_mut();
        *counts
            .entry(table.to_string())
            .or_default()
            .entry(query.to_string())
            .or_insert(0) += 1;
        if self.collect_rows.get() {
            self.rows
                .borrow_mut()
                .entry(table.to_string())
                .or_default()
                .push(row.clone());
        }
    }

    /// `table → query text → rows read`.
    pub fn counts_by_query(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.counts.borrow().clone()
    }

    /// Total rows read across all sources.
    pub fn total_rows(&self) -> u64 {
        self.counts
            .borrow()
            .values()
            .flat_map(|by_query| by_query.values())
            .sum()
    }

    pub fn rows_by_table(&self) -> BTreeMap<String, Vec<Row>> {
        self.rows.borrow().clone()
    }
}

// ── Overlay ────────────────────────────────────────────────────────────────

/// A transient change applied on top of committed SQLite state for the
/// duration of one push.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub change: Change,
    pub epoch: u64,
}

// ── Connections ────────────────────────────────────────────────────────────

/// Options for [`TableSource::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Declared ordering; completed with missing PK columns ascending.
    pub sort: Vec<(String, Direction)>,
    /// Filters to apply; split into SQL-retained and in-memory residual.
    pub filters: Option<Condition>,
    /// Columns whose change forces an edit to be split into remove + add
    /// for this connection. Defaults to the completed sort's columns.
    pub split_edit_keys: Option<BTreeSet<String>>,
    /// Expected result cap directly above this connection, for SQL LIMIT
    /// pushdown and cost estimation.
    pub limit_hint: Option<u64>,
}

struct ConnectionCore {
    id: usize,
    sort: SortSpec,
    declared_sort: Vec<(String, Direction)>,
    retained: Option<Condition>,
    residual: Option<Condition>,
    fully_applied: bool,
    split_edit_keys: BTreeSet<String>,
    limit_hint: Option<u64>,
    output: RefCell<Option<Rc<dyn Output>>>,
    last_epoch: Cell<u64>,
    destroyed: Cell<bool>,
}

/// The leaf of an operator subtree, backed by a source. Obtained from
/// [`TableSource::connect`]; implements [`Input`].
pub struct SourceConnection {
    source: Rc<SourceCore>,
    conn: Rc<ConnectionCore>,
}

// ── The source ─────────────────────────────────────────────────────────────

struct SourceCore {
    schema: Rc<TableSchema>,
    cache: Rc<StatementCache>,
    connections: RefCell<Vec<Rc<ConnectionCore>>>,
    overlay: RefCell<Option<Overlay>>,
    epoch: Cell<u64>,
    next_connection_id: Cell<usize>,
    stats: RefCell<Option<Rc<QueryStats>>>,
    timeslice: RefCell<Option<Rc<TimeSlice>>>,
    /// Predicate ANDed into every connection's filters (permissions).
    base_filter: RefCell<Option<Condition>>,
}

/// A SQLite table exposed as an IVM source.
pub struct TableSource {
    core: Rc<SourceCore>,
}

impl TableSource {
    pub fn new(cache: Rc<StatementCache>, schema: Rc<TableSchema>) -> Result<Self, LiteTrickleError> {
        let pk = schema.primary_key.clone();
        if schema.unique_index_within(&pk).is_none() {
            return Err(LiteTrickleError::Internal(format!(
                "table {}: no unique index covers the primary key",
                schema.name
            )));
        }
        Ok(TableSource {
            core: Rc::new(SourceCore {
                schema,
                cache,
                connections: RefCell::new(Vec::new()),
                overlay: RefCell::new(None),
                epoch: Cell::new(0),
                next_connection_id: Cell::new(0),
                stats: RefCell::new(None),
                timeslice: RefCell::new(None),
                base_filter: RefCell::new(None),
            }),
        })
    }

    /// Install a predicate applied to every connection vended from here on,
    /// in addition to the connection's own filters. Used for permissions.
    pub fn set_base_filter(&self, condition: Condition) {
        *self.core.base_filter.borrow_mut() = Some(condition);
    }

    pub fn schema(&self) -> Rc<TableSchema> {
        self.core.schema.clone()
    }

    /// Attach the shared read-statistics collector.
    pub fn set_stats(&self, stats: Rc<QueryStats>) {
        *self.core.stats.borrow_mut() = Some(stats);
    }

    /// Attach the cooperative time-slice consulted during fetch and push.
    pub fn set_timeslice(&self, timeslice: Rc<TimeSlice>) {
        *self.core.timeslice.borrow_mut() = Some(timeslice);
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.borrow().len()
    }

    /// Create the backing table and unique indexes if absent. Intended for
    /// tests and replica bootstrap.
    pub fn ensure_table(&self) -> Result<(), LiteTrickleError> {
        let schema = &self.core.schema;
        let cols: Vec<String> = schema
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, sqlite_type(c.column_type)))
            .collect();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            schema.name,
            cols.join(", "),
            schema.primary_key.join(", "),
        );
        self.core.cache.connection().execute_batch(&ddl)?;
        for (i, index) in schema.unique_indexes.iter().enumerate() {
            if index.iter().all(|c| schema.primary_key.contains(c))
                && index.len() == schema.primary_key.len()
            {
                continue;
            }
            let ddl = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {}_uq_{} ON {} ({})",
                schema.name,
                i,
                schema.name,
                index.join(", "),
            );
            self.core.cache.connection().execute_batch(&ddl)?;
        }
        Ok(())
    }

    /// Connect an operator subtree onto this source.
    ///
    /// The returned handle carries an immutable view of `(sort, filters)`
    /// and is indexed onto the source's connection list in registration
    /// order. The completed sort is always PK-complete.
    pub fn connect(&self, opts: ConnectOptions) -> Result<Rc<SourceConnection>, LiteTrickleError> {
        let schema = &self.core.schema;
        for (column, _) in &opts.sort {
            if !schema.has_column(column) {
                return Err(LiteTrickleError::UnknownColumn {
                    table: schema.name.clone(),
                    column: column.clone(),
                });
            }
        }
        let sort = SortSpec::complete(&opts.sort, schema);
        if !sort.is_pk_complete(schema) {
            return Err(LiteTrickleError::Internal(format!(
                "table {}: completed sort is not PK-complete",
                schema.name
            )));
        }
        let filters = {
            let base = self.core.base_filter.borrow();
            match (base.clone(), opts.filters.clone()) {
                (Some(base), Some(own)) => Some(crate::ast::Condition::And {
                    conditions: vec![base, own],
                }),
                (Some(base), None) => Some(base),
                (None, own) => own,
            }
        };
        let (retained, residual, fully_applied) = match &filters {
            Some(cond) => cond.split_for_source(),
            None => (None, None, true),
        };
        let split_edit_keys = opts
            .split_edit_keys
            .unwrap_or_else(|| sort.columns().cloned().collect());

        let conn = Rc::new(ConnectionCore {
            id: self.core.next_connection_id.get(),
            declared_sort: opts.sort,
            sort,
            retained,
            residual,
            fully_applied,
            split_edit_keys,
            limit_hint: opts.limit_hint,
            output: RefCell::new(None),
            last_epoch: Cell::new(0),
            destroyed: Cell::new(false),
        });
        self.core.next_connection_id.set(conn.id + 1);
        self.core.connections.borrow_mut().push(conn.clone());
        debug!(
            table = %schema.name,
            connection = conn.id,
            fully_applied = conn.fully_applied,
            "source connected"
        );
        Ok(Rc::new(SourceConnection {
            source: self.core.clone(),
            conn,
        }))
    }

    /// Read a row by any unique-key subset of `key`'s columns, from the
    /// committed state.
    pub fn get_row(&self, key: &Row) -> Result<Option<Row>, LiteTrickleError> {
        self.core.get_row(key)
    }

    /// Apply a change atomically: publish the overlay, deliver to each
    /// connection in registration order (splitting edits where required),
    /// clear the overlay, then write SQLite.
    pub fn push(&self, change: Change) -> Result<(), LiteTrickleError> {
        let core = &self.core;
        let schema = &core.schema;

        // Existence check against committed state decides legality and
        // whether an edit needs UPDATE or DELETE+INSERT.
        match &change {
            Change::Add { node } => {
                if core.get_row(&pk_projection(schema, &node.row))?.is_some() {
                    return Err(LiteTrickleError::UniquenessViolation {
                        table: schema.name.clone(),
                        key: schema.describe_key(&node.row),
                    });
                }
            }
            Change::Remove { node } => {
                if core.get_row(&pk_projection(schema, &node.row))?.is_none() {
                    return Err(LiteTrickleError::RowNotFound {
                        table: schema.name.clone(),
                        key: schema.describe_key(&node.row),
                    });
                }
            }
            Change::Edit { old_node, node } => {
                if core
                    .get_row(&pk_projection(schema, &old_node.row))?
                    .is_none()
                {
                    return Err(LiteTrickleError::RowNotFound {
                        table: schema.name.clone(),
                        key: schema.describe_key(&old_node.row),
                    });
                }
                let pk_changed = schema
                    .primary_key
                    .iter()
                    .any(|c| old_node.row.get_or_null(c) != node.row.get_or_null(c));
                if pk_changed && core.get_row(&pk_projection(schema, &node.row))?.is_some() {
                    return Err(LiteTrickleError::UniquenessViolation {
                        table: schema.name.clone(),
                        key: schema.describe_key(&node.row),
                    });
                }
            }
            Change::Child { .. } => {
                return Err(LiteTrickleError::Internal(
                    "child changes cannot be pushed into a table source".into(),
                ));
            }
        }

        let epoch = core.epoch.get() + 1;
        core.epoch.set(epoch);
        *core.overlay.borrow_mut() = Some(Overlay {
            change: change.clone(),
            epoch,
        });
        let guard = OverlayGuard { core: core.as_ref() };

        let connections: Vec<Rc<ConnectionCore>> = core.connections.borrow().clone();
        let timeslice = core.timeslice.borrow().clone();
        for conn in connections {
            if conn.destroyed.get() || conn.last_epoch.get() == epoch {
                continue;
            }
            conn.last_epoch.set(epoch);
            if let Some(ts) = &timeslice {
                ts.check_budget()?;
            }
            let output = conn.output.borrow().clone();
            let Some(output) = output else { continue };
            match &change {
                Change::Edit { old_node, node } => {
                    let changed = old_node.row.changed_columns(&node.row);
                    if changed.iter().any(|c| conn.split_edit_keys.contains(c)) {
                        output.push(Change::remove(old_node.row.clone()))?;
                        output.push(Change::add(node.row.clone()))?;
                    } else {
                        output.push(change.clone())?;
                    }
                }
                _ => output.push(change.clone())?,
            }
        }

        // Overlay must be gone before the committed state changes.
        drop(guard);
        core.write_sql(&change)
    }

    /// Insert-or-edit by primary key; last write wins on non-PK columns.
    pub fn upsert(&self, row: Row) -> Result<(), LiteTrickleError> {
        let existing = self.core.get_row(&pk_projection(&self.core.schema, &row))?;
        match existing {
            Some(old) => self.push(Change::edit(old, row)),
            None => self.push(Change::add(row)),
        }
    }

    #[cfg(test)]
    pub(crate) fn overlay_is_clear(&self) -> bool {
        self.core.overlay.borrow().is_none()
    }
}

struct OverlayGuard<'a> {
    core: &'a SourceCore,
}

impl Drop for OverlayGuard<'_> {
    fn drop(&mut self) {
        self.core.overlay.borrow_mut().take();
    }
}

// ── Input implementation for connections ───────────────────────────────────

impl Input for SourceConnection {
    fn schema(&self) -> Rc<TableSchema> {
        self.source.schema.clone()
    }

    fn sort(&self) -> &SortSpec {
        &self.conn.sort
    }

    fn fetch(&self, req: FetchRequest) -> Result<NodeStream<'_>, LiteTrickleError> {
        if self.conn.destroyed.get() {
            return Err(LiteTrickleError::Internal(
                "fetch on destroyed connection".into(),
            ));
        }
        self.source.fetch_for(&self.conn, req)
    }

    fn set_output(&self, output: Rc<dyn Output>) {
        *self.conn.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) -> Result<(), LiteTrickleError> {
        let mut connections = self.source.connections.borrow_mut();
        let position = connections.iter().position(|c| c.id == self.conn.id);
        match position {
            Some(i) => {
                connections.remove(i);
                self.conn.destroyed.set(true);
                Ok(())
            }
            None => Err(LiteTrickleError::Internal(format!(
                "connection {} missing from {} during destroy",
                self.conn.id, self.source.schema.name
            ))),
        }
    }

    fn fully_applied_filters(&self) -> bool {
        self.conn.fully_applied
    }
}

// ── Fetch internals ────────────────────────────────────────────────────────

impl SourceCore {
    fn fetch_for(
        &self,
        conn: &Rc<ConnectionCore>,
        req: FetchRequest,
    ) -> Result<NodeStream<'static>, LiteTrickleError> {
        let req = self.resolve_before(conn, req)?;
        let scan_sort = if req.reverse {
            conn.sort.reversed()
        } else {
            conn.sort.clone()
        };

        let overlay = self.overlay.borrow().clone();
        let push_limit = if conn.fully_applied && conn.residual.is_none() && overlay.is_none() {
            conn.limit_hint
        } else {
            None
        };

        let (sql, params) = build_fetch_sql(&self.schema, conn, &req, &scan_sort, push_limit);
        let display_sql = build_display_sql(&self.schema, conn, &req);
        debug!(table = %self.schema.name, sql = %sql, "source fetch");

        let mut rows = self.run_query(&sql, &params)?;
        if let Some(residual) = &conn.residual {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if residual.evaluate(&row)? {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        // Fold the overlay in: an in-flight push must be visible to fetches
        // issued during that push, at the position the sort dictates.
        let mut overlay_add: Option<Row> = None;
        let mut overlay_remove: Option<u64> = None;
        if let Some(overlay) = overlay {
            let (removed, added) = match overlay.change {
                Change::Add { node } => (None, Some(node.row)),
                Change::Remove { node } => (Some(node.row), None),
                Change::Edit { old_node, node } => (Some(old_node.row), Some(node.row)),
                Change::Child { .. } => (None, None),
            };
            if let Some(removed) = removed {
                overlay_remove = Some(self.schema.row_key(&removed));
            }
            if let Some(added) = added {
                if self.overlay_row_visible(conn, &req, &scan_sort, &added)? {
                    overlay_add = Some(added);
                }
            }
        }

        let stats = self.stats.borrow().clone();
        let timeslice = self.timeslice.borrow().clone();
        Ok(Box::new(SourceStream {
            rows: rows.into_iter().peekable(),
            overlay_add,
            overlay_remove,
            scan_sort,
            schema: self.schema.clone(),
            stats: stats.map(|s| (s, display_sql)),
            timeslice,
            done: false,
            yielded: false,
        }))
    }

    /// Whether an overlay row would be vended by this fetch: it must match
    /// the constraint, pass the connection's filters, and lie within the
    /// start bound.
    fn overlay_row_visible(
        &self,
        conn: &ConnectionCore,
        req: &FetchRequest,
        scan_sort: &SortSpec,
        row: &Row,
    ) -> Result<bool, LiteTrickleError> {
        if let Some(constraint) = &req.constraint {
            if row.get_or_null(&constraint.column) != constraint.value {
                return Ok(false);
            }
        }
        if let Some(retained) = &conn.retained {
            if !retained.evaluate(row)? {
                return Ok(false);
            }
        }
        if let Some(residual) = &conn.residual {
            if !residual.evaluate(row)? {
                return Ok(false);
            }
        }
        if let Some(start) = &req.start {
            let ord = scan_sort.compare(row, &start.row);
            let within = match start.basis {
                StartBasis::At => ord != Ordering::Less,
                StartBasis::After => ord == Ordering::Greater,
                // resolve_before has rewritten Before already
                StartBasis::Before => true,
            };
            if !within {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Rewrite a `before` start into an `at` start on the row immediately
    /// preceding it in the scan order, via a reverse scan.
    fn resolve_before(
        &self,
        conn: &ConnectionCore,
        req: FetchRequest,
    ) -> Result<FetchRequest, LiteTrickleError> {
        let Some(start) = &req.start else {
            return Ok(req);
        };
        if start.basis != StartBasis::Before {
            return Ok(req);
        }
        let scan_sort = if req.reverse {
            conn.sort.reversed()
        } else {
            conn.sort.clone()
        };
        let probe = FetchRequest {
            constraint: req.constraint.clone(),
            start: Some(Start {
                row: start.row.clone(),
                basis: StartBasis::After,
            }),
            reverse: false,
        };
        let reversed = scan_sort.reversed();
        let (sql, params) = build_fetch_sql(&self.schema, conn, &probe, &reversed, None);
        let rows = self.run_query(&sql, &params)?;
        let mut predecessor = None;
        for row in rows {
            let passes = match &conn.residual {
                Some(residual) => residual.evaluate(&row)?,
                None => true,
            };
            if passes {
                predecessor = Some(row);
                break;
            }
        }
        Ok(FetchRequest {
            constraint: req.constraint,
            start: Some(Start {
                row: predecessor.unwrap_or_else(|| start.row.clone()),
                basis: StartBasis::At,
            }),
            reverse: req.reverse,
        })
    }

    fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, LiteTrickleError> {
        let schema = &self.schema;
        self.cache.use_statement(sql, |stmt| {
            let mut out = Vec::new();
            let mut rows = stmt.query(params_from_iter(params.iter().map(value_to_sql)))?;
            while let Some(row) = rows.next()? {
                out.push(convert_row(schema, row)?);
            }
            Ok(out)
        })
    }

    fn get_row(&self, key: &Row) -> Result<Option<Row>, LiteTrickleError> {
        let available: Vec<String> = key.column_names().cloned().collect();
        let Some(index) = self.schema.unique_index_within(&available) else {
            return Err(LiteTrickleError::InvalidArgument(format!(
                "no unique index of {} is covered by columns {:?}",
                self.schema.name, available
            )));
        };
        let predicate: Vec<String> = index.iter().map(|c| format!("{c} = ?")).collect();
        let params: Vec<Value> = index.iter().map(|c| key.get_or_null(c)).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            column_list(&self.schema),
            self.schema.name,
            predicate.join(" AND "),
        );
        let schema = &self.schema;
        self.cache.use_statement(&sql, |stmt| {
            let mut rows = stmt.query(params_from_iter(params.iter().map(value_to_sql)))?;
            match rows.next()? {
                Some(row) => Ok(Some(convert_row(schema, row)?)),
                None => Ok(None),
            }
        })
    }

    fn write_sql(&self, change: &Change) -> Result<(), LiteTrickleError> {
        match change {
            Change::Add { node } => self.insert_row(&node.row),
            Change::Remove { node } => self.delete_row(&node.row),
            Change::Edit { old_node, node } => {
                let pk_changed = self
                    .schema
                    .primary_key
                    .iter()
                    .any(|c| old_node.row.get_or_null(c) != node.row.get_or_null(c));
                if pk_changed {
                    // A PK move is never an in-place UPDATE.
                    self.delete_row(&old_node.row)?;
                    self.insert_row(&node.row)
                } else {
                    self.update_row(&node.row)
                }
            }
            Change::Child { .. } => Err(LiteTrickleError::Internal(
                "child changes cannot be written to a table source".into(),
            )),
        }
    }

    fn insert_row(&self, row: &Row) -> Result<(), LiteTrickleError> {
        let schema = &self.schema;
        let placeholders: Vec<&str> = schema.columns.iter().map(|_| "?").collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            schema.name,
            column_list(schema),
            placeholders.join(", "),
        );
        let params: Vec<Value> = schema
            .columns
            .iter()
            .map(|c| row.get_or_null(&c.name))
            .collect();
        self.cache.use_statement(&sql, |stmt| {
            stmt.execute(params_from_iter(params.iter().map(value_to_sql)))?;
            Ok(())
        })
    }

    fn delete_row(&self, row: &Row) -> Result<(), LiteTrickleError> {
        let schema = &self.schema;
        let predicate: Vec<String> = schema.primary_key.iter().map(|c| format!("{c} = ?")).collect();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            schema.name,
            predicate.join(" AND "),
        );
        let params: Vec<Value> = schema
            .primary_key
            .iter()
            .map(|c| row.get_or_null(c))
            .collect();
        self.cache.use_statement(&sql, |stmt| {
            stmt.execute(params_from_iter(params.iter().map(value_to_sql)))?;
            Ok(())
        })
    }

    fn update_row(&self, row: &Row) -> Result<(), LiteTrickleError> {
        let schema = &self.schema;
        let non_pk: Vec<&str> = schema
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|c| !schema.primary_key.iter().any(|pk| pk == c))
            .collect();
        if non_pk.is_empty() {
            return Ok(());
        }
        let set_list: Vec<String> = non_pk.iter().map(|c| format!("{c} = ?")).collect();
        let predicate: Vec<String> = schema.primary_key.iter().map(|c| format!("{c} = ?")).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            schema.name,
            set_list.join(", "),
            predicate.join(" AND "),
        );
        let params: Vec<Value> = non_pk
            .iter()
            .map(|c| row.get_or_null(c))
            .chain(schema.primary_key.iter().map(|c| row.get_or_null(c)))
            .collect();
        self.cache.use_statement(&sql, |stmt| {
            stmt.execute(params_from_iter(params.iter().map(value_to_sql)))?;
            Ok(())
        })
    }
}

// ── The fetch stream ───────────────────────────────────────────────────────

struct SourceStream {
    rows: std::iter::Peekable<std::vec::IntoIter<Row>>,
    overlay_add: Option<Row>,
    overlay_remove: Option<u64>,
    scan_sort: SortSpec,
    schema: Rc<TableSchema>,
    stats: Option<(Rc<QueryStats>, String)>,
    timeslice: Option<Rc<TimeSlice>>,
    done: bool,
    yielded: bool,
}

impl Iterator for SourceStream {
    type Item = Result<FetchItem, LiteTrickleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(ts) = &self.timeslice {
            if let Err(e) = ts.check_budget() {
                self.done = true;
                return Some(Err(e));
            }
            // At most one sentinel per row boundary so a tight lap cannot
            // starve the stream.
            if !self.yielded && ts.should_yield() {
                self.yielded = true;
                return Some(Ok(FetchItem::Yield));
            }
        }
        self.yielded = false;

        // Skip the committed image of a row the overlay removed or edited.
        while let Some(next) = self.rows.peek() {
            if self.overlay_remove == Some(self.schema.row_key(next)) {
                self.rows.next();
                self.overlay_remove = None;
            } else {
                break;
            }
        }

        let overlay_first = match (&self.overlay_add, self.rows.peek()) {
            (Some(added), Some(committed)) => {
                self.scan_sort.compare(added, committed) != Ordering::Greater
            }
            (Some(_), None) => true,
            (None, _) => false,
        };
        let row = if overlay_first {
            self.overlay_add.take()
        } else {
            self.rows.next()
        };
        match row {
            Some(row) => {
                if let Some((stats, display_sql)) = &self.stats {
                    stats.record(&self.schema.name, display_sql, &row);
                }
                Some(Ok(FetchItem::Node(Node::leaf(row))))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

// ── SQL composition ────────────────────────────────────────────────────────

fn column_list(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn sqlite_type(t: ColumnType) -> &'static str {
    match t {
        ColumnType::Boolean => "INTEGER",
        ColumnType::Number => "NUMERIC",
        ColumnType::String => "TEXT",
        ColumnType::Null => "TEXT",
        ColumnType::Json => "TEXT",
    }
}

/// Compose the executed SELECT for `(constraint, retained filters, sort,
/// reverse, start)`. The start basis becomes a row-comparison predicate
/// over the scan-order sort columns.
fn build_fetch_sql(
    schema: &TableSchema,
    conn: &ConnectionCore,
    req: &FetchRequest,
    scan_sort: &SortSpec,
    limit: Option<u64>,
) -> (String, Vec<Value>) {
    let mut params: Vec<Value> = Vec::new();
    let mut predicates: Vec<String> = Vec::new();

    if let Some(constraint) = &req.constraint {
        predicates.push(format!("{} = ?", constraint.column));
        params.push(constraint.value.clone());
    }
    if let Some(retained) = &conn.retained {
        predicates.push(retained.render_sql(&mut params));
    }
    if let Some(start) = &req.start {
        let inclusive = start.basis == StartBasis::At;
        predicates.push(start_predicate(scan_sort, &start.row, inclusive, &mut params));
    }

    let mut sql = format!("SELECT {} FROM {}", column_list(schema), schema.name);
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    let order: Vec<String> = scan_sort
        .keys
        .iter()
        .map(|(c, d)| match d {
            Direction::Asc => format!("{c} ASC"),
            Direction::Desc => format!("{c} DESC"),
        })
        .collect();
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));
    if let Some(limit) = limit {
        sql.push_str(" LIMIT ?");
        params.push(Value::Number(limit as f64));
    }
    (sql, params)
}

/// Normalised query text used for read statistics and EXPLAIN: constraint
/// and retained filters, the declared ordering (without the implicit PK
/// completion), and a LIMIT slot when one is hinted. Start predicates are
/// positional and deliberately excluded so repeated fetches share a key.
fn build_display_sql(schema: &TableSchema, conn: &ConnectionCore, req: &FetchRequest) -> String {
    let mut discard: Vec<Value> = Vec::new();
    let mut predicates: Vec<String> = Vec::new();
    if let Some(constraint) = &req.constraint {
        predicates.push(format!("{} = ?", constraint.column));
    }
    if let Some(retained) = &conn.retained {
        predicates.push(retained.render_sql(&mut discard));
    }
    let mut sql = format!("SELECT * FROM {}", schema.name);
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    if !conn.declared_sort.is_empty() {
        let order: Vec<String> = conn
            .declared_sort
            .iter()
            .map(|(c, d)| match d {
                Direction::Asc => c.clone(),
                Direction::Desc => format!("{c} DESC"),
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    if conn.limit_hint.is_some() {
        sql.push_str(" LIMIT ?");
    }
    sql
}

/// Row-comparison predicate positioning iteration at/after `row` in the
/// scan order. Expanded into OR branches because mixed ASC/DESC keys rule
/// out SQLite's native row-value comparison.
fn start_predicate(
    scan_sort: &SortSpec,
    row: &Row,
    inclusive: bool,
    params: &mut Vec<Value>,
) -> String {
    let mut branches: Vec<String> = Vec::new();
    for i in 0..scan_sort.keys.len() {
        let mut terms: Vec<String> = Vec::new();
        for (column, _) in &scan_sort.keys[..i] {
            terms.push(format!("{column} = ?"));
            params.push(row.get_or_null(column));
        }
        let (column, direction) = &scan_sort.keys[i];
        let op = match direction {
            Direction::Asc => ">",
            Direction::Desc => "<",
        };
        terms.push(format!("{column} {op} ?"));
        params.push(row.get_or_null(column));
        branches.push(format!("({})", terms.join(" AND ")));
    }
    if inclusive {
        let mut terms: Vec<String> = Vec::new();
        for (column, _) in &scan_sort.keys {
            terms.push(format!("{column} = ?"));
            params.push(row.get_or_null(column));
        }
        branches.push(format!("({})", terms.join(" AND ")));
    }
    format!("({})", branches.join(" OR "))
}

// ── Value conversion ───────────────────────────────────────────────────────

fn pk_projection(schema: &TableSchema, row: &Row) -> Row {
    schema
        .primary_key
        .iter()
        .map(|c| (c.clone(), row.get_or_null(c)))
        .collect()
}

pub(crate) fn value_to_sql(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64 {
                rusqlite::types::Value::Integer(*n as i64)
            } else {
                rusqlite::types::Value::Real(*n)
            }
        }
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Json(j) => rusqlite::types::Value::Text(j.to_string()),
    }
}

/// Convert one SQLite result row via schema metadata. Integers that do not
/// fit double precision and malformed JSON fail loudly, naming the
/// offending `table.column`.
fn convert_row(schema: &TableSchema, row: &rusqlite::Row<'_>) -> Result<Row, LiteTrickleError> {
    let mut out = Row::new();
    for (i, column) in schema.columns.iter().enumerate() {
        let value = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => {
                if column.column_type == ColumnType::Boolean {
                    Value::Bool(v != 0)
                } else if v.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                    return Err(LiteTrickleError::IntegerOutOfRange {
                        table: schema.name.clone(),
                        column: column.name.clone(),
                        value: v,
                    });
                } else {
                    Value::Number(v as f64)
                }
            }
            ValueRef::Real(v) => {
                if !v.is_finite() {
                    return Err(LiteTrickleError::NonFiniteNumber {
                        table: schema.name.clone(),
                        column: column.name.clone(),
                    });
                }
                Value::Number(v)
            }
            ValueRef::Text(bytes) => {
                let text =
                    std::str::from_utf8(bytes).map_err(|e| LiteTrickleError::JsonParse {
                        table: schema.name.clone(),
                        column: column.name.clone(),
                        reason: e.to_string(),
                    })?;
                if column.column_type == ColumnType::Json {
                    let parsed = serde_json::from_str(text).map_err(|e| {
                        LiteTrickleError::JsonParse {
                            table: schema.name.clone(),
                            column: column.name.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    Value::Json(parsed)
                } else {
                    Value::Text(text.to_string())
                }
            }
            ValueRef::Blob(_) => {
                return Err(LiteTrickleError::InvalidArgument(format!(
                    "unsupported BLOB value in {}.{}",
                    schema.name, column.name
                )));
            }
        };
        out.set(column.name.clone(), value);
    }
    Ok(out)
}
