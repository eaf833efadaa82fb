//! The analyze pipeline.
//!
//! Executes an AST read-only against a SQLite replica and collects
//! diagnostics: synced-row counts, per-source read statistics keyed by
//! query text, `EXPLAIN QUERY PLAN` output for each distinct query, and the
//! planner's debug events.
//!
//! The legacy result fields `vendedRowCounts` and `end` are still emitted;
//! new consumers must read `readRowCountsByQuery` and `start + elapsed`.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ast::{Ast, Condition};
use crate::config::EngineConfig;
use crate::error::LiteTrickleError;
use crate::ivm::Node;
use crate::ivm::source::{QueryStats, TableSource};
use crate::planner::cost::SqliteCostModel;
use crate::planner::debug::AccumulatorDebugger;
use crate::planner::{Planner, SourceProvider, build_pipeline};
use crate::row::Row;
use crate::schema::TableSchema;
use crate::statement_cache::StatementCache;
use crate::timeslice::TimeSlice;

/// The client-side table declarations the analyzer resolves ASTs against.
#[derive(Debug, Clone, Default)]
pub struct ClientSchema {
    pub tables: BTreeMap<String, Rc<TableSchema>>,
}

impl ClientSchema {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        ClientSchema {
            tables: tables
                .into_iter()
                .map(|t| (t.name.clone(), Rc::new(t)))
                .collect(),
        }
    }
}

/// What the analyzer should collect.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// Wrap sources with the configured permissions predicates.
    pub apply_permissions: bool,
    /// Collect the rows emitted by the terminus.
    pub synced_rows: bool,
    /// Collect per-source rows. (`vendedRows` is the legacy name.)
    pub read_rows: bool,
    /// Attach the SQLite cost model.
    pub cost_model: bool,
    /// Capture planner debug events. Requires `cost_model`.
    pub plan_debugger: bool,
    /// Wall-clock budget for the run.
    pub budget: Option<Duration>,
}

impl AnalyzeOptions {
    pub fn with_cost_model(mut self) -> Self {
        self.cost_model = true;
        self
    }

    pub fn with_plan_debugger(mut self) -> Self {
        self.cost_model = true;
        self.plan_debugger = true;
        self
    }
}

/// Analyzer output. Round-trippable JSON; legacy fields are emitted but
/// must be ignored by new consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResult {
    pub warnings: Vec<String>,
    pub synced_row_count: u64,
    /// Wall-clock start, milliseconds since the epoch.
    pub start: i64,
    /// Elapsed milliseconds; `end - start` by construction.
    pub elapsed: i64,
    /// Legacy. Always `start + elapsed`.
    pub end: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_row_counts_by_query: Option<BTreeMap<String, BTreeMap<String, u64>>>,
    /// Legacy mirror of `readRowCountsByQuery`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vended_row_counts: Option<BTreeMap<String, BTreeMap<String, u64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_row_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_rows: Option<BTreeMap<String, Vec<Row>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_rows: Option<BTreeMap<String, Vec<Row>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_plans: Option<BTreeMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_plans: Option<serde_json::Value>,
}

// ── Host delegate ──────────────────────────────────────────────────────────

/// The host the pipeline builder runs against: memoised sources over one
/// replica connection, shared statistics, shared time-slice, and optional
/// permissions predicates.
pub struct AnalyzeHost {
    cache: Rc<StatementCache>,
    schemas: BTreeMap<String, Rc<TableSchema>>,
    sources: RefCell<BTreeMap<String, Rc<TableSource>>>,
    stats: Rc<QueryStats>,
    timeslice: Rc<TimeSlice>,
    permissions: BTreeMap<String, Condition>,
    apply_permissions: bool,
}

impl AnalyzeHost {
    pub fn stats(&self) -> &Rc<QueryStats> {
        &self.stats
    }
}

impl SourceProvider for AnalyzeHost {
    fn get_source(&self, table: &str) -> Result<Rc<TableSource>, LiteTrickleError> {
        if let Some(source) = self.sources.borrow().get(table) {
            return Ok(source.clone());
        }
        let schema = self
            .schemas
            .get(table)
            .cloned()
            .ok_or_else(|| LiteTrickleError::UnknownTable(table.to_string()))?;
        let source = Rc::new(TableSource::new(self.cache.clone(), schema)?);
        source.set_stats(self.stats.clone());
        source.set_timeslice(self.timeslice.clone());
        if self.apply_permissions {
            if let Some(permission) = self.permissions.get(table) {
                source.set_base_filter(permission.clone());
            }
        }
        self.sources
            .borrow_mut()
            .insert(table.to_string(), source.clone());
        Ok(source)
    }
}

// ── The analyzer ───────────────────────────────────────────────────────────

pub struct Analyzer {
    config: EngineConfig,
    permissions: BTreeMap<String, Condition>,
}

impl Analyzer {
    pub fn new(config: EngineConfig) -> Self {
        Analyzer {
            config,
            permissions: BTreeMap::new(),
        }
    }

    /// Register a permissions predicate for one table, applied when the
    /// options ask for it.
    pub fn with_permission(mut self, table: impl Into<String>, condition: Condition) -> Self {
        self.permissions.insert(table.into(), condition);
        self
    }

    /// Run `ast` read-only against the replica behind `conn`.
    pub fn analyze(
        &self,
        conn: Rc<Connection>,
        client_schema: &ClientSchema,
        ast: &Ast,
        options: &AnalyzeOptions,
    ) -> Result<AnalyzeResult, LiteTrickleError> {
        if options.plan_debugger && !options.cost_model {
            return Err(LiteTrickleError::InvalidArgument(
                "planDebugger requires costModel".into(),
            ));
        }
        let start = chrono::Utc::now().timestamp_millis();
        let started = std::time::Instant::now();
        let mut warnings: Vec<String> = Vec::new();

        let timeslice = Rc::new(
            TimeSlice::new(self.config.yield_lap)
                .with_budget(options.budget.or(self.config.analyze_budget)),
        );
        let cache = Rc::new(StatementCache::new(
            conn.clone(),
            self.config.statement_cache_capacity,
        ));
        let stats = Rc::new(QueryStats::new(options.read_rows));

        let host = AnalyzeHost {
            cache,
            schemas: client_schema.tables.clone(),
            sources: RefCell::new(BTreeMap::new()),
            stats: stats.clone(),
            timeslice: timeslice.clone(),
            permissions: self.permissions.clone(),
            apply_permissions: options.apply_permissions,
        };

        // Replica layout verification: every table the AST touches must
        // exist with the declared columns. A missing table degrades to an
        // empty one so diagnostic runs still complete, with a warning.
        let mut tables = BTreeSet::new();
        collect_tables(ast, &mut tables);
        for table in &tables {
            match client_schema.tables.get(table) {
                Some(schema) => {
                    let missing = verify_replica_table(&conn, schema, &mut warnings)?;
                    if missing {
                        host.get_source(table)?.ensure_table()?;
                    }
                    debug!(
                        table = %table,
                        fingerprint = schema.fingerprint(),
                        "replica table verified"
                    );
                }
                None => {
                    return Err(LiteTrickleError::UnknownTable(table.clone()));
                }
            }
        }

        let cost_model = options
            .cost_model
            .then(|| SqliteCostModel::new(conn.clone()));
        let debugger = options.plan_debugger.then(AccumulatorDebugger::new);

        let mut planner = Planner::new(cost_model.as_ref().map(|m| m as &dyn crate::planner::cost::CostModel));
        planner.max_attempts = self.config.max_plan_attempts;
        if let Some(debugger) = &debugger {
            planner = planner.with_debugger(debugger);
        }
        let plan = planner.plan(ast)?;

        let pipeline = build_pipeline(&host, ast, &plan)?;
        let synced_row_count = pipeline.terminus.hydrate(Some(&timeslice))?;

        let synced_rows = options.synced_rows.then(|| {
            let mut by_table: BTreeMap<String, Vec<Row>> = BTreeMap::new();
            collect_synced_rows(&ast.table, &pipeline.terminus.view(), &mut by_table);
            by_table
        });

        let counts = stats.counts_by_query();
        let (sqlite_plans, explain_warnings) = explain_queries(&counts, &conn);
        warnings.extend(explain_warnings);

        let join_plans = debugger.as_ref().map(|d| d.to_json());

        pipeline.destroy()?;

        let elapsed = started.elapsed().as_millis() as i64;
        Ok(AnalyzeResult {
            warnings,
            synced_row_count,
            start,
            elapsed,
            end: start + elapsed,
            read_row_count: Some(stats.total_rows()),
            vended_row_counts: Some(counts.clone()),
            read_row_counts_by_query: Some(counts),
            synced_rows,
            read_rows: options.read_rows.then(|| stats.rows_by_table()),
            sqlite_plans: Some(sqlite_plans),
            join_plans,
        })
    }
}

/// `EXPLAIN QUERY PLAN` for each distinct query text observed, keyed by
/// that text. A pure function of its inputs; individual failures become
/// warnings instead of aborting the run.
pub fn explain_queries(
    read_row_counts_by_query: &BTreeMap<String, BTreeMap<String, u64>>,
    conn: &Connection,
) -> (BTreeMap<String, Vec<String>>, Vec<String>) {
    let mut plans = BTreeMap::new();
    let mut warnings = Vec::new();
    for by_query in read_row_counts_by_query.values() {
        for sql in by_query.keys() {
            if plans.contains_key(sql) {
                continue;
            }
            match explain_one(conn, sql) {
                Ok(lines) => {
                    plans.insert(sql.clone(), lines);
                }
                Err(e) => {
                    warn!(sql = %sql, error = %e, "EXPLAIN QUERY PLAN failed");
                    warnings.push(format!("explain failed for `{sql}`: {e}"));
                }
            }
        }
    }
    (plans, warnings)
}

fn explain_one(conn: &Connection, sql: &str) -> Result<Vec<String>, LiteTrickleError> {
    let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {sql}"))?;
    let mut rows = stmt.query([])?;
    let mut lines = Vec::new();
    while let Some(row) = rows.next()? {
        let detail: String = row.get(3)?;
        lines.push(detail);
    }
    Ok(lines)
}

fn collect_tables(ast: &Ast, out: &mut BTreeSet<String>) {
    out.insert(ast.table.clone());
    if let Some(related) = &ast.related {
        for clause in related {
            collect_tables(&clause.subquery, out);
        }
    }
    if let Some(where_clause) = &ast.where_clause {
        collect_condition_tables(where_clause, out);
    }
}

fn collect_condition_tables(condition: &Condition, out: &mut BTreeSet<String>) {
    match condition {
        Condition::And { conditions } | Condition::Or { conditions } => {
            for c in conditions {
                collect_condition_tables(c, out);
            }
        }
        Condition::Exists { subquery, .. } => collect_tables(subquery, out),
        Condition::Simple { .. } => {}
    }
}

fn collect_synced_rows(table: &str, nodes: &[Node], out: &mut BTreeMap<String, Vec<Row>>) {
    for node in nodes {
        out.entry(table.to_string()).or_default().push(node.row.clone());
        for (relationship, children) in &node.relationships {
            collect_synced_rows(relationship, children, out);
        }
    }
}

/// Compare the replica's on-disk columns with the declared schema. Returns
/// true when the table is absent entirely.
fn verify_replica_table(
    conn: &Connection,
    schema: &TableSchema,
    warnings: &mut Vec<String>,
) -> Result<bool, LiteTrickleError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", schema.name))?;
    let mut rows = stmt.query([])?;
    let mut on_disk: BTreeSet<String> = BTreeSet::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        on_disk.insert(name);
    }
    if on_disk.is_empty() {
        warnings.push(format!("replica is missing table {}", schema.name));
        return Ok(true);
    }
    for column in &schema.columns {
        if !on_disk.contains(&column.name) {
            warnings.push(format!(
                "replica table {} is missing column {}",
                schema.name, column.name
            ));
        }
    }
    Ok(false)
}
