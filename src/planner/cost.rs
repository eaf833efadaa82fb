//! Cost estimation.
//!
//! The planner prices each connection with a [`CostEstimate`] computed from
//! index coverage and cardinality statistics. The SQLite-backed model reads
//! real statistics from the replica; the uniform model is the approximate
//! fallback for memory-only sources.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rusqlite::Connection;
use serde::Serialize;

use crate::ast::Condition;
use crate::error::LiteTrickleError;

/// Cost of driving one connection under a set of constraints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    /// One-time cost of positioning (index descent), before the first row.
    pub startup_cost: f64,
    /// Estimated rows scanned.
    pub scan_est: f64,
    /// Cost per drive of this connection.
    pub cost: f64,
    /// Rows the connection is expected to return per drive.
    pub returned_rows: f64,
    /// Fraction of the table matching the constraint set.
    pub selectivity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// Prices connections for the planner.
pub trait CostModel {
    /// Estimate one drive of `table` with the given constrained columns and
    /// residual filters.
    fn estimate(
        &self,
        table: &str,
        constrained_columns: &[String],
        filters: Option<&Condition>,
        limit: Option<u64>,
    ) -> Result<CostEstimate, LiteTrickleError>;

    /// Whether an index prefix covers `column`.
    fn column_indexed(&self, table: &str, column: &str) -> Result<bool, LiteTrickleError>;

    fn cardinality(&self, table: &str) -> Result<f64, LiteTrickleError>;
}

// ── SQLite-backed model ────────────────────────────────────────────────────

/// Selectivity assumed for an equality probe on a non-unique index.
const INDEXED_SELECTIVITY: f64 = 0.05;
/// Selectivity assumed for an equality probe without an index.
const UNINDEXED_SELECTIVITY: f64 = 0.25;
/// Selectivity assumed per residual filter predicate.
const FILTER_SELECTIVITY: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexCoverage {
    unique: bool,
}

/// Cost model backed by the replica database: real cardinality via
/// `count(*)` and index coverage via the index pragmas. Both are memoised
/// per table for the lifetime of the model.
pub struct SqliteCostModel {
    conn: Rc<Connection>,
    cardinality: RefCell<HashMap<String, f64>>,
    indexes: RefCell<HashMap<String, HashMap<String, IndexCoverage>>>,
}

impl SqliteCostModel {
    pub fn new(conn: Rc<Connection>) -> Self {
        SqliteCostModel {
            conn,
            cardinality: RefCell::new(HashMap::new()),
            indexes: RefCell::new(HashMap::new()),
        }
    }

    fn index_coverage(
        &self,
        table: &str,
    ) -> Result<HashMap<String, IndexCoverage>, LiteTrickleError> {
        if let Some(cached) = self.indexes.borrow().get(table) {
            return Ok(cached.clone());
        }
        let mut coverage: HashMap<String, IndexCoverage> = HashMap::new();

        // Declared indexes: the first column of each index is probeable.
        let mut index_names: Vec<(String, bool)> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA index_list({table})"))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(1)?;
                let unique: i64 = row.get(2)?;
                index_names.push((name, unique != 0));
            }
        }
        for (name, unique) in index_names {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA index_info({name})"))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let seqno: i64 = row.get(0)?;
                if seqno != 0 {
                    continue;
                }
                let column: String = row.get(2)?;
                let entry = coverage.entry(column).or_insert(IndexCoverage { unique });
                entry.unique = entry.unique || unique;
            }
        }

        // The primary key is probeable even when realised as the rowid.
        let mut pk_columns: Vec<(String, i64)> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA table_info({table})"))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(1)?;
                let pk: i64 = row.get(5)?;
                if pk > 0 {
                    pk_columns.push((name, pk));
                }
            }
        }
        if let Some((first, _)) = pk_columns.iter().find(|(_, pk)| *pk == 1) {
            let unique = pk_columns.len() == 1;
            let entry = coverage
                .entry(first.clone())
                .or_insert(IndexCoverage { unique });
            entry.unique = entry.unique || unique;
        }

        self.indexes
            .borrow_mut()
            .insert(table.to_string(), coverage.clone());
        Ok(coverage)
    }
}

impl CostModel for SqliteCostModel {
    fn estimate(
        &self,
        table: &str,
        constrained_columns: &[String],
        filters: Option<&Condition>,
        limit: Option<u64>,
    ) -> Result<CostEstimate, LiteTrickleError> {
        let n = self.cardinality(table)?;
        let coverage = self.index_coverage(table)?;

        let mut selectivity = 1.0_f64;
        let mut indexed_probe = false;
        for column in constrained_columns {
            match coverage.get(column) {
                Some(IndexCoverage { unique: true }) => {
                    selectivity *= 1.0 / n.max(1.0);
                    indexed_probe = true;
                }
                Some(IndexCoverage { unique: false }) => {
                    selectivity *= INDEXED_SELECTIVITY;
                    indexed_probe = true;
                }
                None => selectivity *= UNINDEXED_SELECTIVITY,
            }
        }
        if let Some(filters) = filters {
            for _ in 0..count_simple_predicates(filters) {
                selectivity *= FILTER_SELECTIVITY;
            }
        }

        let scan_est = (n * selectivity).max(if n > 0.0 { 1.0 } else { 0.0 });
        let startup_cost = if indexed_probe { n.max(2.0).log2() } else { 0.0 };
        let cost = if indexed_probe {
            startup_cost + scan_est
        } else {
            n.max(1.0)
        };
        let returned_rows = match limit {
            Some(limit) => scan_est.min(limit as f64),
            None => scan_est,
        };
        Ok(CostEstimate {
            startup_cost,
            scan_est,
            cost,
            returned_rows,
            selectivity,
            limit,
        })
    }

    fn column_indexed(&self, table: &str, column: &str) -> Result<bool, LiteTrickleError> {
        Ok(self.index_coverage(table)?.contains_key(column))
    }

    fn cardinality(&self, table: &str) -> Result<f64, LiteTrickleError> {
        if let Some(n) = self.cardinality.borrow().get(table) {
            return Ok(*n);
        }
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        let n = n as f64;
        self.cardinality.borrow_mut().insert(table.to_string(), n);
        Ok(n)
    }
}

fn count_simple_predicates(condition: &Condition) -> usize {
    match condition {
        Condition::Simple { .. } => 1,
        Condition::And { conditions } | Condition::Or { conditions } => {
            conditions.iter().map(count_simple_predicates).sum()
        }
        Condition::Exists { .. } => 0,
    }
}

// ── Uniform fallback ───────────────────────────────────────────────────────

/// Uniform-selectivity model for sources without SQLite statistics.
/// Approximate by construction; documented as an open area.
pub struct UniformCostModel {
    pub assumed_cardinality: f64,
}

impl Default for UniformCostModel {
    fn default() -> Self {
        UniformCostModel {
            assumed_cardinality: 1_000.0,
        }
    }
}

impl CostModel for UniformCostModel {
    fn estimate(
        &self,
        _table: &str,
        constrained_columns: &[String],
        filters: Option<&Condition>,
        limit: Option<u64>,
    ) -> Result<CostEstimate, LiteTrickleError> {
        let n = self.assumed_cardinality;
        let mut selectivity = 1.0_f64;
        for _ in constrained_columns {
            selectivity *= UNINDEXED_SELECTIVITY;
        }
        if let Some(filters) = filters {
            for _ in 0..count_simple_predicates(filters) {
                selectivity *= FILTER_SELECTIVITY;
            }
        }
        let scan_est = (n * selectivity).max(1.0);
        let returned_rows = match limit {
            Some(limit) => scan_est.min(limit as f64),
            None => scan_est,
        };
        Ok(CostEstimate {
            startup_cost: 0.0,
            scan_est,
            cost: n,
            returned_rows,
            selectivity,
            limit,
        })
    }

    fn column_indexed(&self, _table: &str, _column: &str) -> Result<bool, LiteTrickleError> {
        Ok(false)
    }

    fn cardinality(&self, _table: &str) -> Result<f64, LiteTrickleError> {
        Ok(self.assumed_cardinality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::CompareOp;

    fn seeded_db() -> Rc<Connection> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT);
             CREATE UNIQUE INDEX users_email ON users (email);
             CREATE TABLE issues (id INTEGER PRIMARY KEY, user_id INTEGER, title TEXT);
             CREATE INDEX issues_user ON issues (user_id);",
        )
        .unwrap();
        for i in 0..100 {
            conn.execute(
                "INSERT INTO users (id, name, email) VALUES (?, ?, ?)",
                rusqlite::params![i, format!("user{i}"), format!("u{i}@example.com")],
            )
            .unwrap();
        }
        for i in 0..1000 {
            conn.execute(
                "INSERT INTO issues (id, user_id, title) VALUES (?, ?, ?)",
                rusqlite::params![i, i % 100, format!("issue {i}")],
            )
            .unwrap();
        }
        Rc::new(conn)
    }

    #[test]
    fn test_cardinality_is_real_and_cached() {
        let model = SqliteCostModel::new(seeded_db());
        assert_eq!(model.cardinality("users").unwrap(), 100.0);
        assert_eq!(model.cardinality("issues").unwrap(), 1000.0);
        // second read hits the memo
        assert_eq!(model.cardinality("users").unwrap(), 100.0);
    }

    #[test]
    fn test_index_coverage_detection() {
        let model = SqliteCostModel::new(seeded_db());
        assert!(model.column_indexed("users", "id").unwrap());
        assert!(model.column_indexed("users", "email").unwrap());
        assert!(!model.column_indexed("users", "name").unwrap());
        assert!(model.column_indexed("issues", "user_id").unwrap());
    }

    #[test]
    fn test_unique_probe_beats_scan() {
        let model = SqliteCostModel::new(seeded_db());
        let probe = model
            .estimate("users", &["id".to_string()], None, None)
            .unwrap();
        let scan = model.estimate("users", &[], None, None).unwrap();
        assert!(probe.cost < scan.cost, "{probe:?} vs {scan:?}");
        assert!(probe.selectivity < scan.selectivity);
        assert!(probe.startup_cost > 0.0);
        assert_eq!(scan.startup_cost, 0.0);
    }

    #[test]
    fn test_indexed_probe_beats_unindexed() {
        let model = SqliteCostModel::new(seeded_db());
        let indexed = model
            .estimate("issues", &["user_id".to_string()], None, None)
            .unwrap();
        let unindexed = model
            .estimate("issues", &["title".to_string()], None, None)
            .unwrap();
        assert!(indexed.cost < unindexed.cost);
    }

    #[test]
    fn test_filters_reduce_returned_rows() {
        let model = SqliteCostModel::new(seeded_db());
        let filtered = model
            .estimate(
                "users",
                &[],
                Some(&Condition::compare("name", CompareOp::Eq, "user1")),
                None,
            )
            .unwrap();
        let plain = model.estimate("users", &[], None, None).unwrap();
        assert!(filtered.returned_rows < plain.returned_rows);
    }

    #[test]
    fn test_limit_caps_returned_rows() {
        let model = SqliteCostModel::new(seeded_db());
        let est = model.estimate("users", &[], None, Some(10)).unwrap();
        assert_eq!(est.returned_rows, 10.0);
        assert_eq!(est.limit, Some(10));
    }

    #[test]
    fn test_uniform_model_is_flat() {
        let model = UniformCostModel::default();
        let a = model.estimate("anything", &[], None, None).unwrap();
        let b = model.estimate("other", &[], None, None).unwrap();
        assert_eq!(a, b);
        assert!(!model.column_indexed("t", "c").unwrap());
    }
}
