//! End-to-end operator-graph scenarios: a planned pipeline is hydrated,
//! then source pushes must keep the materialised view convergent.

mod common;

use common::*;
use lite_trickle::planner::{Plan, build_pipeline};
use lite_trickle::{
    Ast, Change, CompareOp, Condition, Correlation, Direction, ExistsOp, RelatedClause, Value,
};

fn related_issues_ast() -> Ast {
    Ast::table("users").with_related(RelatedClause {
        correlation: Correlation {
            parent_field: "id".into(),
            child_field: "user_id".into(),
        },
        subquery: Ast::table("issues"),
        alias: None,
    })
}

#[test]
fn related_view_tracks_child_pushes() {
    let host = TestHost::new(vec![users_schema(), issues_schema()]);
    host.push_all("users", vec![user(1.0, "alice", true), user(2.0, "bob", true)]);
    host.push_all("issues", vec![issue(10.0, 1.0, "first", true)]);

    let pipeline = build_pipeline(&host, &related_issues_ast(), &Plan::unflipped()).unwrap();
    assert_eq!(pipeline.terminus.hydrate(None).unwrap(), 3);

    // a new child lands under the right parent
    host.source("issues")
        .push(Change::add(issue(11.0, 2.0, "second", true)))
        .unwrap();
    let view = pipeline.terminus.view();
    assert_eq!(view[0].relationships["issues"].len(), 1);
    assert_eq!(view[1].relationships["issues"].len(), 1);
    assert_eq!(pipeline.terminus.row_count(), 4);

    // removing it restores the old shape
    host.source("issues")
        .push(Change::remove(issue(11.0, 2.0, "second", true)))
        .unwrap();
    assert_eq!(pipeline.terminus.row_count(), 3);
    pipeline.destroy().unwrap();
}

#[test]
fn filtered_view_converges_on_boundary_crossing_edits() {
    let host = TestHost::new(vec![users_schema()]);
    host.push_all(
        "users",
        vec![user(1.0, "alice", true), user(2.0, "bob", false)],
    );
    let ast = Ast::table("users")
        .with_where(Condition::compare("active", CompareOp::Eq, true));
    let pipeline = build_pipeline(&host, &ast, &Plan::unflipped()).unwrap();
    assert_eq!(pipeline.terminus.hydrate(None).unwrap(), 1);

    // bob becomes active: net add
    host.source("users")
        .push(Change::edit(user(2.0, "bob", false), user(2.0, "bob", true)))
        .unwrap();
    assert_eq!(pipeline.terminus.row_count(), 2);

    // alice deactivates: net remove
    host.source("users")
        .push(Change::edit(user(1.0, "alice", true), user(1.0, "alice", false)))
        .unwrap();
    let view = pipeline.terminus.view();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].row.get_or_null("id"), Value::Number(2.0));
}

#[test]
fn exists_view_tracks_child_existence() {
    let host = TestHost::new(vec![users_schema(), issues_schema()]);
    host.push_all("users", vec![user(1.0, "alice", true), user(2.0, "bob", true)]);

    let ast = Ast::table("users").with_where(Condition::Exists {
        correlation: Correlation {
            parent_field: "id".into(),
            child_field: "user_id".into(),
        },
        subquery: Box::new(Ast::table("issues")),
        op: ExistsOp::Exists,
    });
    let pipeline = build_pipeline(&host, &ast, &Plan::unflipped()).unwrap();
    assert_eq!(pipeline.terminus.hydrate(None).unwrap(), 0);

    host.source("issues")
        .push(Change::add(issue(10.0, 1.0, "a", true)))
        .unwrap();
    assert_eq!(pipeline.terminus.row_count(), 1);

    // a second issue for the same user changes nothing
    host.source("issues")
        .push(Change::add(issue(11.0, 1.0, "b", true)))
        .unwrap();
    assert_eq!(pipeline.terminus.row_count(), 1);

    host.source("issues")
        .push(Change::remove(issue(10.0, 1.0, "a", true)))
        .unwrap();
    assert_eq!(pipeline.terminus.row_count(), 1);
    host.source("issues")
        .push(Change::remove(issue(11.0, 1.0, "b", true)))
        .unwrap();
    assert_eq!(pipeline.terminus.row_count(), 0);
}

#[test]
fn not_exists_view_is_complement() {
    let host = TestHost::new(vec![users_schema(), issues_schema()]);
    host.push_all("users", vec![user(1.0, "alice", true), user(2.0, "bob", true)]);
    host.push_all("issues", vec![issue(10.0, 1.0, "a", true)]);

    let ast = Ast::table("users").with_where(Condition::Exists {
        correlation: Correlation {
            parent_field: "id".into(),
            child_field: "user_id".into(),
        },
        subquery: Box::new(Ast::table("issues")),
        op: ExistsOp::NotExists,
    });
    let pipeline = build_pipeline(&host, &ast, &Plan::unflipped()).unwrap();
    pipeline.terminus.hydrate(None).unwrap();
    let view = pipeline.terminus.view();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].row.get_or_null("id"), Value::Number(2.0));

    // alice's last issue disappears: she joins the complement
    host.source("issues")
        .push(Change::remove(issue(10.0, 1.0, "a", true)))
        .unwrap();
    assert_eq!(pipeline.terminus.view().len(), 2);
}

#[test]
fn limited_view_maintains_window_across_pushes() {
    let host = TestHost::new(vec![scores_schema()]);
    host.push_all(
        "scores",
        vec![score(1.0, 10.0), score(2.0, 20.0), score(3.0, 30.0)],
    );
    let ast = Ast::table("scores")
        .with_order_by(vec![("score".into(), Direction::Asc)])
        .with_limit(2);
    let pipeline = build_pipeline(&host, &ast, &Plan::unflipped()).unwrap();
    assert_eq!(pipeline.terminus.hydrate(None).unwrap(), 2);

    // a new minimum enters and evicts the old bound
    host.source("scores")
        .push(Change::add(score(4.0, 5.0)))
        .unwrap();
    let scores: Vec<Value> = pipeline
        .terminus
        .view()
        .iter()
        .map(|n| n.row.get_or_null("score"))
        .collect();
    assert_eq!(scores, vec![Value::Number(5.0), Value::Number(10.0)]);

    // removing an in-window row pulls the next one back in
    host.source("scores")
        .push(Change::remove(score(4.0, 5.0)))
        .unwrap();
    let scores: Vec<Value> = pipeline
        .terminus
        .view()
        .iter()
        .map(|n| n.row.get_or_null("score"))
        .collect();
    assert_eq!(scores, vec![Value::Number(10.0), Value::Number(20.0)]);
}

#[test]
fn or_condition_view_converges_via_fan() {
    let host = TestHost::new(vec![scores_schema()]);
    host.push_all("scores", vec![score(1.0, 5.0), score(2.0, 50.0), score(3.0, 95.0)]);
    let ast = Ast::table("scores").with_where(Condition::or(vec![
        Condition::compare("score", CompareOp::Lt, 10.0),
        Condition::compare("score", CompareOp::Gt, 90.0),
    ]));
    let pipeline = build_pipeline(&host, &ast, &Plan::unflipped()).unwrap();
    assert_eq!(pipeline.terminus.hydrate(None).unwrap(), 2);

    // cross from one arm to the other: still one row, edited in place
    host.source("scores")
        .push(Change::edit(score(1.0, 5.0), score(1.0, 99.0)))
        .unwrap();
    assert_eq!(pipeline.terminus.row_count(), 2);

    // leave the disjunction entirely
    host.source("scores")
        .push(Change::edit(score(1.0, 99.0), score(1.0, 50.0)))
        .unwrap();
    assert_eq!(pipeline.terminus.row_count(), 1);
}

#[test]
fn self_referential_related_join() {
    use lite_trickle::{ColumnSpec, ColumnType, TableSchema};
    let comments = TableSchema::new(
        "comments",
        vec![
            ColumnSpec::new("id", ColumnType::Number),
            ColumnSpec::new("parent_id", ColumnType::Number),
            ColumnSpec::new("body", ColumnType::String),
        ],
        vec!["id".into()],
        vec![],
    )
    .unwrap();
    let host = TestHost::new(vec![comments]);
    host.push_all(
        "comments",
        vec![
            lite_trickle::Row::new()
                .with("id", 1.0)
                .with("parent_id", lite_trickle::Value::Null)
                .with("body", "root"),
            lite_trickle::Row::new()
                .with("id", 2.0)
                .with("parent_id", 1.0)
                .with("body", "reply"),
        ],
    );

    // comments with their replies: the same table on both sides of the
    // join, exercising two connections over one source.
    let ast = Ast::table("comments").with_related(RelatedClause {
        correlation: Correlation {
            parent_field: "id".into(),
            child_field: "parent_id".into(),
        },
        subquery: Ast::table("comments"),
        alias: Some("replies".into()),
    });
    let pipeline = build_pipeline(&host, &ast, &Plan::unflipped()).unwrap();
    // 2 comments + 1 reply nested under the root
    assert_eq!(pipeline.terminus.hydrate(None).unwrap(), 3);
    let view = pipeline.terminus.view();
    assert_eq!(view[0].relationships["replies"].len(), 1);
    assert_eq!(view[1].relationships["replies"].len(), 0);

    // a new reply pushed mid-stream lands under its parent, with the
    // overlay keeping the self-join consistent during the push
    host.source("comments")
        .push(Change::add(
            lite_trickle::Row::new()
                .with("id", 3.0)
                .with("parent_id", 2.0)
                .with("body", "nested"),
        ))
        .unwrap();
    let view = pipeline.terminus.view();
    assert_eq!(view[1].relationships["replies"].len(), 1);
}

#[test]
fn declared_order_with_filter_and_limit() {
    let host = TestHost::new(vec![users_schema()]);
    host.push_all(
        "users",
        vec![
            user(1.0, "cara", true),
            user(2.0, "alice", true),
            user(3.0, "bob", false),
            user(4.0, "dave", true),
        ],
    );
    let ast = Ast::table("users")
        .with_where(Condition::compare("active", CompareOp::Eq, true))
        .with_order_by(vec![("name".into(), Direction::Asc)])
        .with_limit(2);
    let pipeline = build_pipeline(&host, &ast, &Plan::unflipped()).unwrap();
    assert_eq!(pipeline.terminus.hydrate(None).unwrap(), 2);
    let names: Vec<Value> = pipeline
        .terminus
        .view()
        .iter()
        .map(|n| n.row.get_or_null("name"))
        .collect();
    assert_eq!(
        names,
        vec![Value::Text("alice".into()), Value::Text("cara".into())]
    );
}
