//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rusqlite::Connection;

use lite_trickle::{
    Change, ColumnSpec, ColumnType, LiteTrickleError, Row, SourceProvider, StatementCache,
    TableSchema, TableSource,
};

/// Initialise test logging once; respects `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A replica plus memoised sources, standing in for the pipeline host.
pub struct TestHost {
    pub conn: Rc<Connection>,
    pub cache: Rc<StatementCache>,
    schemas: BTreeMap<String, Rc<TableSchema>>,
    sources: RefCell<BTreeMap<String, Rc<TableSource>>>,
}

impl TestHost {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        let conn = Rc::new(Connection::open_in_memory().unwrap());
        let cache = Rc::new(StatementCache::new(conn.clone(), 32));
        let host = TestHost {
            conn,
            cache,
            schemas: tables
                .into_iter()
                .map(|t| (t.name.clone(), Rc::new(t)))
                .collect(),
            sources: RefCell::new(BTreeMap::new()),
        };
        let tables: Vec<String> = host.schemas.keys().cloned().collect();
        for table in tables {
            host.get_source(&table).unwrap().ensure_table().unwrap();
        }
        host
    }

    pub fn source(&self, table: &str) -> Rc<TableSource> {
        self.get_source(table).unwrap()
    }

    pub fn push_all(&self, table: &str, rows: Vec<Row>) {
        let source = self.source(table);
        for row in rows {
            source.push(Change::add(row)).unwrap();
        }
    }
}

impl SourceProvider for TestHost {
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
        self.sources
            .borrow_mut()
            .insert(table.to_string(), source.clone());
        Ok(source)
    }
}

// ── Schemas ────────────────────────────────────────────────────────────────

pub fn users_schema() -> TableSchema {
    TableSchema::new(
        "users",
        vec![
            ColumnSpec::new("id", ColumnType::Number),
            ColumnSpec::new("name", ColumnType::String),
            ColumnSpec::new("active", ColumnType::Boolean),
        ],
        vec!["id".into()],
        vec![],
    )
    .unwrap()
}

pub fn issues_schema() -> TableSchema {
    TableSchema::new(
        "issues",
        vec![
            ColumnSpec::new("id", ColumnType::Number),
            ColumnSpec::new("user_id", ColumnType::Number),
            ColumnSpec::new("title", ColumnType::String),
            ColumnSpec::new("open", ColumnType::Boolean),
        ],
        vec!["id".into()],
        vec![],
    )
    .unwrap()
}

pub fn scores_schema() -> TableSchema {
    TableSchema::new(
        "scores",
        vec![
            ColumnSpec::new("id", ColumnType::Number),
            ColumnSpec::new("score", ColumnType::Number),
        ],
        vec!["id".into()],
        vec![],
    )
    .unwrap()
}

// ── Rows ───────────────────────────────────────────────────────────────────

pub fn user(id: f64, name: &str, active: bool) -> Row {
    Row::new()
        .with("id", id)
        .with("name", name)
        .with("active", active)
}

pub fn issue(id: f64, user_id: f64, title: &str, open: bool) -> Row {
    Row::new()
        .with("id", id)
        .with("user_id", user_id)
        .with("title", title)
        .with("open", open)
}

pub fn score(id: f64, score: f64) -> Row {
    Row::new().with("id", id).with("score", score)
}
