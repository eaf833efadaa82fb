//! Shared fixtures for operator unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use rusqlite::Connection;

use crate::error::LiteTrickleError;
use crate::ivm::source::{ConnectOptions, SourceConnection, TableSource};
use crate::ivm::{Change, Input, Output};
use crate::row::Row;
use crate::schema::{ColumnSpec, ColumnType, TableSchema};
use crate::statement_cache::StatementCache;

pub fn shared_cache() -> Rc<StatementCache> {
    let conn = Rc::new(Connection::open_in_memory().unwrap());
    Rc::new(StatementCache::new(conn, 32))
}

// ── scores: a single-table fixture ─────────────────────────────────────────

pub struct ScoresFixture {
    pub source: TableSource,
    pub cache: Rc<StatementCache>,
}

impl ScoresFixture {
    pub fn connect_default(&self) -> Rc<dyn Input> {
        self.source.connect(ConnectOptions::default()).unwrap()
    }

    pub fn connect(&self, opts: ConnectOptions) -> Rc<SourceConnection> {
        self.source.connect(opts).unwrap()
    }
}

pub fn scores_schema() -> Rc<TableSchema> {
    Rc::new(
        TableSchema::new(
            "scores",
            vec![
                ColumnSpec::new("id", ColumnType::Number),
                ColumnSpec::new("score", ColumnType::Number),
            ],
            vec!["id".into()],
            vec![],
        )
        .unwrap(),
    )
}

pub fn score_row(id: f64, score: f64) -> Row {
    Row::new().with("id", id).with("score", score)
}

pub fn scores_fixture(rows: &[(f64, f64)]) -> ScoresFixture {
    let cache = shared_cache();
    let source = TableSource::new(cache.clone(), scores_schema()).unwrap();
    source.ensure_table().unwrap();
    for (id, score) in rows {
        source.push(Change::add(score_row(*id, *score))).unwrap();
    }
    ScoresFixture { source, cache }
}

// ── users ⋈ issues: a two-table fixture ────────────────────────────────────

pub struct JoinFixture {
    pub users: TableSource,
    pub issues: TableSource,
    pub cache: Rc<StatementCache>,
}

pub fn users_schema() -> Rc<TableSchema> {
    Rc::new(
        TableSchema::new(
            "users",
            vec![
                ColumnSpec::new("id", ColumnType::Number),
                ColumnSpec::new("name", ColumnType::String),
            ],
            vec!["id".into()],
            vec![],
        )
        .unwrap(),
    )
}

pub fn issues_schema() -> Rc<TableSchema> {
    Rc::new(
        TableSchema::new(
            "issues",
            vec![
                ColumnSpec::new("id", ColumnType::Number),
                ColumnSpec::new("user_id", ColumnType::Number),
                ColumnSpec::new("title", ColumnType::String),
            ],
            vec!["id".into()],
            vec![],
        )
        .unwrap(),
    )
}

pub fn user_row(id: f64, name: &str) -> Row {
    Row::new().with("id", id).with("name", name)
}

pub fn issue_row(id: f64, user_id: f64, title: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("user_id", user_id)
        .with("title", title)
}

pub fn join_fixture(users: &[(f64, &str)], issues: &[(f64, f64, &str)]) -> JoinFixture {
    let cache = shared_cache();
    let users_source = TableSource::new(cache.clone(), users_schema()).unwrap();
    users_source.ensure_table().unwrap();
    for (id, name) in users {
        users_source
            .push(Change::add(user_row(*id, name)))
            .unwrap();
    }
    let issues_source = TableSource::new(cache.clone(), issues_schema()).unwrap();
    issues_source.ensure_table().unwrap();
    for (id, user_id, title) in issues {
        issues_source
            .push(Change::add(issue_row(*id, *user_id, title)))
            .unwrap();
    }
    JoinFixture {
        users: users_source,
        issues: issues_source,
        cache,
    }
}

// ── change collector ───────────────────────────────────────────────────────

pub struct Collector {
    changes: RefCell<Vec<Change>>,
}

impl Collector {
    pub fn new() -> Rc<Self> {
        Rc::new(Collector {
            changes: RefCell::new(Vec::new()),
        })
    }

    pub fn take(&self) -> Vec<Change> {
        std::mem::take(&mut self.changes.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.changes.borrow().len()
    }
}

impl Output for Collector {
    fn push(&self, change: Change) -> Result<(), LiteTrickleError> {
        self.changes.borrow_mut().push(change);
        Ok(())
    }
}
