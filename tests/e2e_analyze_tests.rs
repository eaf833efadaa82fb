//! End-to-end analyzer scenarios against real replica databases.

mod common;

use std::rc::Rc;

use common::*;
use lite_trickle::{
    AnalyzeOptions, Analyzer, Ast, CompareOp, Condition, Correlation, Direction, EngineConfig,
    ExistsOp,
};

fn users_replica(rows: usize) -> (Rc<rusqlite::Connection>, lite_trickle::ClientSchema) {
    let host = TestHost::new(vec![users_schema()]);
    for i in 0..rows {
        host.source("users")
            .push(lite_trickle::Change::add(user(
                i as f64,
                &format!("user{i}"),
                i % 2 == 0,
            )))
            .unwrap();
    }
    let schema = lite_trickle::ClientSchema::new(vec![users_schema()]);
    (host.conn.clone(), schema)
}

#[test]
fn simple_analyze_counts_reads_and_captures_plans() {
    let (conn, schema) = users_replica(5);
    let analyzer = Analyzer::new(EngineConfig::default());
    let result = analyzer
        .analyze(conn, &schema, &Ast::table("users"), &AnalyzeOptions::default())
        .unwrap();

    assert_eq!(result.synced_row_count, 5);
    let counts = result.read_row_counts_by_query.as_ref().unwrap();
    assert_eq!(counts["users"]["SELECT * FROM users"], 5);
    let plans = result.sqlite_plans.as_ref().unwrap();
    assert!(
        plans["SELECT * FROM users"]
            .iter()
            .any(|line| line.contains("SCAN") || line.contains("SEARCH")),
        "got: {plans:?}"
    );
    assert_eq!(result.end, result.start + result.elapsed);
    assert!(result.warnings.is_empty(), "got: {:?}", result.warnings);
}

#[test]
fn predicate_pushdown_records_a_single_parameterised_key() {
    let (conn, schema) = users_replica(30);
    let ast = Ast::table("users")
        .with_where(Condition::compare("active", CompareOp::Eq, true))
        .with_order_by(vec![("name".into(), Direction::Asc)])
        .with_limit(10);
    let analyzer = Analyzer::new(EngineConfig::default());
    let result = analyzer
        .analyze(conn, &schema, &ast, &AnalyzeOptions::default())
        .unwrap();

    assert_eq!(result.synced_row_count, 10);
    let counts = result.read_row_counts_by_query.as_ref().unwrap();
    let by_query = &counts["users"];
    assert_eq!(by_query.len(), 1, "expected one key, got: {by_query:?}");
    let (sql, read) = by_query.iter().next().unwrap();
    assert_eq!(
        sql,
        "SELECT * FROM users WHERE active = ? ORDER BY name LIMIT ?"
    );
    assert_eq!(*read, 10);
}

#[test]
fn join_plans_captured_when_debugger_requested() {
    let host = TestHost::new(vec![users_schema(), issues_schema()]);
    host.push_all("users", vec![user(1.0, "alice", true)]);
    host.push_all("issues", vec![issue(10.0, 1.0, "a", true)]);
    let schema = lite_trickle::ClientSchema::new(vec![users_schema(), issues_schema()]);

    let ast = Ast::table("users").with_where(Condition::Exists {
        correlation: Correlation {
            parent_field: "id".into(),
            child_field: "user_id".into(),
        },
        subquery: Box::new(Ast::table("issues")),
        op: ExistsOp::Exists,
    });
    let analyzer = Analyzer::new(EngineConfig::default());
    let result = analyzer
        .analyze(
            host.conn.clone(),
            &schema,
            &ast,
            &AnalyzeOptions::default().with_plan_debugger(),
        )
        .unwrap();

    assert_eq!(result.synced_row_count, 1);
    let join_plans = result.join_plans.as_ref().unwrap().as_array().unwrap();
    assert!(!join_plans.is_empty());
    assert_eq!(
        join_plans.last().unwrap()["type"].as_str().unwrap(),
        "best-plan-selected"
    );
}

#[test]
fn related_analyze_counts_both_tables() {
    let host = TestHost::new(vec![users_schema(), issues_schema()]);
    host.push_all("users", vec![user(1.0, "alice", true), user(2.0, "bob", true)]);
    host.push_all(
        "issues",
        vec![issue(10.0, 1.0, "a", true), issue(11.0, 1.0, "b", true)],
    );
    let schema = lite_trickle::ClientSchema::new(vec![users_schema(), issues_schema()]);
    let ast = Ast::table("users").with_related(lite_trickle::RelatedClause {
        correlation: Correlation {
            parent_field: "id".into(),
            child_field: "user_id".into(),
        },
        subquery: Ast::table("issues"),
        alias: None,
    });
    let analyzer = Analyzer::new(EngineConfig::default());
    let result = analyzer
        .analyze(host.conn.clone(), &schema, &ast, &AnalyzeOptions::default())
        .unwrap();

    // 2 users + 2 related issues
    assert_eq!(result.synced_row_count, 4);
    let counts = result.read_row_counts_by_query.as_ref().unwrap();
    assert!(counts.contains_key("users"));
    assert!(counts.contains_key("issues"));
    // issue probes are keyed by the constrained query text
    assert!(
        counts["issues"]
            .keys()
            .any(|sql| sql.contains("WHERE user_id = ?")),
        "got: {:?}",
        counts["issues"]
    );
}

#[test]
fn synced_and_read_rows_collected_on_request() {
    let (conn, schema) = users_replica(4);
    let options = AnalyzeOptions {
        synced_rows: true,
        read_rows: true,
        ..Default::default()
    };
    let analyzer = Analyzer::new(EngineConfig::default());
    let result = analyzer
        .analyze(conn, &schema, &Ast::table("users"), &options)
        .unwrap();
    assert_eq!(result.synced_rows.unwrap()["users"].len(), 4);
    assert_eq!(result.read_rows.unwrap()["users"].len(), 4);
    assert_eq!(result.read_row_count, Some(4));
}

#[test]
fn analyze_result_round_trips_through_json() {
    let (conn, schema) = users_replica(2);
    let analyzer = Analyzer::new(EngineConfig::default());
    let result = analyzer
        .analyze(conn, &schema, &Ast::table("users"), &AnalyzeOptions::default())
        .unwrap();
    let json = serde_json::to_value(&result).unwrap();
    // new fields and legacy fields side by side
    assert!(json.get("readRowCountsByQuery").is_some());
    assert!(json.get("vendedRowCounts").is_some());
    assert!(json.get("start").is_some());
    assert!(json.get("elapsed").is_some());
    assert!(json.get("end").is_some());
    assert_eq!(
        json["readRowCountsByQuery"], json["vendedRowCounts"],
        "legacy mirror must match"
    );
}

#[test]
fn analyze_works_on_file_backed_replica() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, active INTEGER);
             INSERT INTO users (id, name, active) VALUES (1, 'alice', 1), (2, 'bob', 0);",
        )
        .unwrap();
    }
    let conn = Rc::new(rusqlite::Connection::open(&path).unwrap());
    let schema = lite_trickle::ClientSchema::new(vec![users_schema()]);
    let analyzer = Analyzer::new(EngineConfig::default());
    let result = analyzer
        .analyze(conn, &schema, &Ast::table("users"), &AnalyzeOptions::default())
        .unwrap();
    assert_eq!(result.synced_row_count, 2);
}

#[test]
fn analyze_honours_wall_clock_budget() {
    use std::time::Duration;
    let (conn, schema) = users_replica(50);
    let options = AnalyzeOptions {
        budget: Some(Duration::ZERO),
        ..Default::default()
    };
    let mut config = EngineConfig::default();
    config.yield_lap = Duration::ZERO;
    let analyzer = Analyzer::new(config);
    let err = analyzer
        .analyze(conn, &schema, &Ast::table("users"), &options)
        .unwrap_err();
    assert!(matches!(err, lite_trickle::LiteTrickleError::Cancelled(_)));
}
