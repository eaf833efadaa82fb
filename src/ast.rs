//! Query ASTs and filter conditions.
//!
//! The AST is the stable wire form consumed by both the server analyzer and
//! the client planner: `{table, where?, orderBy?, limit?, related?}` with
//! ordering pairs `[column, 'asc'|'desc']` and the condition tree of §3.
//!
//! Conditions compare a column to a literal or another column via
//! `{=, !=, <, <=, >, >=, LIKE, IN}` and compose with `and`/`or`. A
//! condition may contain correlated `EXISTS` subqueries; subquery-free
//! conditions can be pushed into SQL, the rest is evaluated in memory.

use serde::{Deserialize, Serialize};

use crate::error::LiteTrickleError;
use crate::row::{Row, Value};
use crate::schema::Direction;

// ── Condition tree ─────────────────────────────────────────────────────────

/// Comparison operator of a simple predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "IN")]
    In,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::In => "IN",
        }
    }
}

/// One side of a simple predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operand {
    Column { name: String },
    Literal { value: Value },
}

impl Operand {
    pub fn column(name: impl Into<String>) -> Self {
        Operand::Column { name: name.into() }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal {
            value: value.into(),
        }
    }

    fn resolve(&self, row: &Row) -> Value {
        match self {
            Operand::Column { name } => row.get_or_null(name),
            Operand::Literal { value } => value.clone(),
        }
    }
}

/// Existence test direction for correlated subqueries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistsOp {
    #[serde(rename = "EXISTS")]
    Exists,
    #[serde(rename = "NOT EXISTS")]
    NotExists,
}

/// Correlation between a parent row and a child subquery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    pub parent_field: String,
    pub child_field: String,
}

/// A tree of simple predicates and boolean connectives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    Simple {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    #[serde(rename_all = "camelCase")]
    Exists {
        correlation: Correlation,
        subquery: Box<Ast>,
        op: ExistsOp,
    },
}

impl Condition {
    /// Convenience constructor: `column op literal`.
    pub fn compare(column: &str, op: CompareOp, value: impl Into<Value>) -> Condition {
        Condition::Simple {
            left: Operand::column(column),
            op,
            right: Operand::literal(value),
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Condition {
        Condition::And { conditions }
    }

    pub fn or(conditions: Vec<Condition>) -> Condition {
        Condition::Or { conditions }
    }

    /// Whether the tree is free of subqueries (a `NoSubqueryCondition`).
    pub fn is_subquery_free(&self) -> bool {
        match self {
            Condition::Simple { .. } => true,
            Condition::And { conditions } | Condition::Or { conditions } => {
                conditions.iter().all(|c| c.is_subquery_free())
            }
            Condition::Exists { .. } => false,
        }
    }

    /// Split into a SQL-pushable part and an in-memory residual.
    ///
    /// Top-level conjuncts that are subquery-free are retained for SQL;
    /// everything else (EXISTS tests, and any conjunct containing one)
    /// stays residual. The boolean is `fully_applied`: true iff nothing
    /// was removed.
    pub fn split_for_source(&self) -> (Option<Condition>, Option<Condition>, bool) {
        match self {
            Condition::And { conditions } => {
                let mut retained = Vec::new();
                let mut residual = Vec::new();
                for c in conditions {
                    if c.is_subquery_free() {
                        retained.push(c.clone());
                    } else {
                        residual.push(c.clone());
                    }
                }
                let fully_applied = residual.is_empty();
                let retained = conjunction_of(retained);
                let residual = conjunction_of(residual);
                (retained, residual, fully_applied)
            }
            _ if self.is_subquery_free() => (Some(self.clone()), None, true),
            _ => (None, Some(self.clone()), false),
        }
    }

    /// Evaluate a subquery-free condition against a row.
    ///
    /// Comparison follows SQL semantics for NULL: a simple predicate with a
    /// NULL operand is false (existence tests are compiled into join
    /// operators before evaluation and are an error here).
    pub fn evaluate(&self, row: &Row) -> Result<bool, LiteTrickleError> {
        match self {
            Condition::Simple { left, op, right } => {
                let lv = left.resolve(row);
                let rv = right.resolve(row);
                Ok(evaluate_compare(&lv, *op, &rv))
            }
            Condition::And { conditions } => {
                for c in conditions {
                    if !c.evaluate(row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or { conditions } => {
                for c in conditions {
                    if c.evaluate(row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Exists { .. } => Err(LiteTrickleError::Internal(
                "EXISTS condition reached in-memory evaluation; \
                 existence tests must be compiled into join operators"
                    .into(),
            )),
        }
    }

    /// All `EXISTS` tests in the tree, in syntactic order. Only top-level
    /// conjuncts may carry them (the split keeps OR-of-EXISTS residual and
    /// the planner rejects it).
    pub fn exists_conjuncts(&self) -> Vec<&Condition> {
        match self {
            Condition::Exists { .. } => vec![self],
            Condition::And { conditions } => conditions
                .iter()
                .flat_map(|c| c.exists_conjuncts())
                .collect(),
            _ => vec![],
        }
    }

    /// Render to a parameterized SQL fragment, appending bind values.
    ///
    /// Identifiers are rendered bare: the same text serves execution,
    /// per-query statistics keys, and `EXPLAIN QUERY PLAN`.
    pub fn render_sql(&self, params: &mut Vec<Value>) -> String {
        match self {
            Condition::Simple { left, op, right } => {
                let lhs = render_operand(left, params);
                if *op == CompareOp::In {
                    let placeholders = match right {
                        Operand::Literal {
                            value: Value::Json(serde_json::Value::Array(items)),
                        } => {
                            let mut slots = Vec::with_capacity(items.len());
                            for item in items {
                                params.push(json_to_value(item));
                                slots.push("?");
                            }
                            slots.join(", ")
                        }
                        other => {
                            params.push(match other {
                                Operand::Literal { value } => value.clone(),
                                Operand::Column { .. } => Value::Null,
                            });
                            "?".to_string()
                        }
                    };
                    format!("{lhs} IN ({placeholders})")
                } else {
                    let rhs = render_operand(right, params);
                    format!("{lhs} {} {rhs}", op.as_sql())
                }
            }
            Condition::And { conditions } => conditions
                .iter()
                .map(|c| match c {
                    Condition::Or { .. } => format!("({})", c.render_sql(params)),
                    _ => c.render_sql(params),
                })
                .collect::<Vec<_>>()
                .join(" AND "),
            Condition::Or { conditions } => conditions
                .iter()
                .map(|c| c.render_sql(params))
                .collect::<Vec<_>>()
                .join(" OR "),
            // Unreachable in practice: EXISTS is never retained for SQL.
            Condition::Exists { .. } => "0".to_string(),
        }
    }
}

pub(crate) fn conjunction_of(mut conditions: Vec<Condition>) -> Option<Condition> {
    match conditions.len() {
        0 => None,
        1 => conditions.pop(),
        _ => Some(Condition::And { conditions }),
    }
}

fn render_operand(operand: &Operand, params: &mut Vec<Value>) -> String {
    match operand {
        Operand::Column { name } => name.clone(),
        Operand::Literal { value } => {
            params.push(value.clone());
            "?".to_string()
        }
    }
}

fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Json(other.clone()),
    }
}

fn evaluate_compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    if matches!(op, CompareOp::In) {
        return match right {
            Value::Json(serde_json::Value::Array(items)) => {
                !left.is_null() && items.iter().any(|item| &json_to_value(item) == left)
            }
            _ => false,
        };
    }
    if left.is_null() || right.is_null() {
        return false;
    }
    match op {
        CompareOp::Eq => left == right,
        CompareOp::Ne => left != right,
        CompareOp::Lt => left < right,
        CompareOp::Le => left <= right,
        CompareOp::Gt => left > right,
        CompareOp::Ge => left >= right,
        CompareOp::Like => match (left, right) {
            (Value::Text(s), Value::Text(pattern)) => like_match(pattern, s),
            _ => false,
        },
        // Handled above; IN never reaches the scalar path.
        CompareOp::In => false,
    }
}

/// SQL LIKE with `%` and `_` wildcards, ASCII case-insensitive as SQLite's
/// default collation is.
fn like_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'%') => (0..=t.len()).any(|i| inner(&p[1..], &t[i..])),
            Some(b'_') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some(c) => match t.first() {
                Some(tc) => c.eq_ignore_ascii_case(tc) && inner(&p[1..], &t[1..]),
                None => false,
            },
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

// ── Query AST ──────────────────────────────────────────────────────────────

/// A declarative query over one table, with optional related subqueries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ast {
    pub table: String,
    #[serde(
        rename = "where",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub where_clause: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Vec<(String, Direction)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<Vec<RelatedClause>>,
}

impl Ast {
    pub fn table(table: impl Into<String>) -> Self {
        Ast {
            table: table.into(),
            where_clause: None,
            order_by: None,
            limit: None,
            related: None,
        }
    }

    pub fn with_where(mut self, condition: Condition) -> Self {
        self.where_clause = Some(condition);
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<(String, Direction)>) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_related(mut self, related: RelatedClause) -> Self {
        self.related.get_or_insert_with(Vec::new).push(related);
        self
    }

    /// The declared ordering, or empty when the caller accepts PK order.
    pub fn declared_order(&self) -> &[(String, Direction)] {
        self.order_by.as_deref().unwrap_or(&[])
    }
}

/// A related subquery attached beneath each parent row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedClause {
    pub correlation: Correlation,
    pub subquery: Ast,
    /// Relationship name in the output nodes; defaults to the child table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl RelatedClause {
    pub fn relationship(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.subquery.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_eq_true() -> Condition {
        Condition::compare("active", CompareOp::Eq, true)
    }

    // ── wire form ───────────────────────────────────────────────────

    #[test]
    fn test_simple_condition_wire_form() {
        let cond = active_eq_true();
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "simple",
                "left": {"type": "column", "name": "active"},
                "op": "=",
                "right": {"type": "literal", "value": true},
            })
        );
        let back: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(back, cond);
    }

    #[test]
    fn test_ast_wire_form() {
        let ast = Ast::table("users")
            .with_where(active_eq_true())
            .with_order_by(vec![("name".into(), Direction::Asc)])
            .with_limit(10);
        let json = serde_json::to_value(&ast).unwrap();
        assert_eq!(json["table"], "users");
        assert_eq!(json["orderBy"], serde_json::json!([["name", "asc"]]));
        assert_eq!(json["limit"], 10);
        assert!(json.get("where").is_some());
        let back: Ast = serde_json::from_value(json).unwrap();
        assert_eq!(back, ast);
    }

    #[test]
    fn test_exists_wire_form_round_trip() {
        let cond = Condition::Exists {
            correlation: Correlation {
                parent_field: "id".into(),
                child_field: "user_id".into(),
            },
            subquery: Box::new(Ast::table("issues")),
            op: ExistsOp::Exists,
        };
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "exists");
        assert_eq!(json["op"], "EXISTS");
        assert_eq!(json["correlation"]["parentField"], "id");
        let back: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(back, cond);
    }

    // ── split_for_source ────────────────────────────────────────────

    #[test]
    fn test_split_fully_pushable() {
        let cond = Condition::and(vec![
            active_eq_true(),
            Condition::compare("age", CompareOp::Ge, 18.0),
        ]);
        let (retained, residual, fully) = cond.split_for_source();
        assert!(retained.is_some());
        assert!(residual.is_none());
        assert!(fully);
    }

    #[test]
    fn test_split_keeps_exists_residual() {
        let exists = Condition::Exists {
            correlation: Correlation {
                parent_field: "id".into(),
                child_field: "user_id".into(),
            },
            subquery: Box::new(Ast::table("issues")),
            op: ExistsOp::Exists,
        };
        let cond = Condition::and(vec![active_eq_true(), exists.clone()]);
        let (retained, residual, fully) = cond.split_for_source();
        assert_eq!(retained, Some(active_eq_true()));
        assert_eq!(residual, Some(exists));
        assert!(!fully);
    }

    #[test]
    fn test_split_or_of_simple_is_pushable() {
        let cond = Condition::or(vec![
            active_eq_true(),
            Condition::compare("age", CompareOp::Lt, 13.0),
        ]);
        let (retained, residual, fully) = cond.split_for_source();
        assert_eq!(retained, Some(cond));
        assert!(residual.is_none());
        assert!(fully);
    }

    // ── evaluation ──────────────────────────────────────────────────

    #[test]
    fn test_evaluate_simple() {
        let row = Row::new().with("active", true).with("age", 30.0);
        assert!(active_eq_true().evaluate(&row).unwrap());
        assert!(
            Condition::compare("age", CompareOp::Gt, 18.0)
                .evaluate(&row)
                .unwrap()
        );
        assert!(
            !Condition::compare("age", CompareOp::Lt, 18.0)
                .evaluate(&row)
                .unwrap()
        );
    }

    #[test]
    fn test_evaluate_null_is_false() {
        let row = Row::new().with("age", Value::Null);
        assert!(
            !Condition::compare("age", CompareOp::Eq, Value::Null)
                .evaluate(&row)
                .unwrap()
        );
        assert!(
            !Condition::compare("age", CompareOp::Lt, 10.0)
                .evaluate(&row)
                .unwrap()
        );
    }

    #[test]
    fn test_evaluate_column_to_column() {
        let row = Row::new().with("a", 5.0).with("b", 5.0);
        let cond = Condition::Simple {
            left: Operand::column("a"),
            op: CompareOp::Eq,
            right: Operand::column("b"),
        };
        assert!(cond.evaluate(&row).unwrap());
    }

    #[test]
    fn test_evaluate_and_or() {
        let row = Row::new().with("a", 1.0).with("b", 2.0);
        let both = Condition::and(vec![
            Condition::compare("a", CompareOp::Eq, 1.0),
            Condition::compare("b", CompareOp::Eq, 2.0),
        ]);
        assert!(both.evaluate(&row).unwrap());
        let either = Condition::or(vec![
            Condition::compare("a", CompareOp::Eq, 99.0),
            Condition::compare("b", CompareOp::Eq, 2.0),
        ]);
        assert!(either.evaluate(&row).unwrap());
    }

    #[test]
    fn test_evaluate_like() {
        let row = Row::new().with("name", "Alice");
        assert!(
            Condition::compare("name", CompareOp::Like, "al%")
                .evaluate(&row)
                .unwrap()
        );
        assert!(
            Condition::compare("name", CompareOp::Like, "_lice")
                .evaluate(&row)
                .unwrap()
        );
        assert!(
            !Condition::compare("name", CompareOp::Like, "bob%")
                .evaluate(&row)
                .unwrap()
        );
    }

    #[test]
    fn test_evaluate_in() {
        let row = Row::new().with("status", "open");
        let cond = Condition::compare(
            "status",
            CompareOp::In,
            Value::Json(serde_json::json!(["open", "closed"])),
        );
        assert!(cond.evaluate(&row).unwrap());
        let other = Row::new().with("status", "archived");
        assert!(!cond.evaluate(&other).unwrap());
    }

    #[test]
    fn test_evaluate_exists_is_internal_error() {
        let cond = Condition::Exists {
            correlation: Correlation {
                parent_field: "id".into(),
                child_field: "user_id".into(),
            },
            subquery: Box::new(Ast::table("issues")),
            op: ExistsOp::Exists,
        };
        let err = cond.evaluate(&Row::new()).unwrap_err();
        assert!(format!("{err}").contains("EXISTS"));
    }

    // ── SQL rendering ───────────────────────────────────────────────

    #[test]
    fn test_render_simple() {
        let mut params = Vec::new();
        let sql = active_eq_true().render_sql(&mut params);
        assert_eq!(sql, "active = ?");
        assert_eq!(params, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_render_and_with_nested_or_parens() {
        let cond = Condition::and(vec![
            Condition::compare("a", CompareOp::Eq, 1.0),
            Condition::or(vec![
                Condition::compare("b", CompareOp::Eq, 2.0),
                Condition::compare("c", CompareOp::Eq, 3.0),
            ]),
        ]);
        let mut params = Vec::new();
        let sql = cond.render_sql(&mut params);
        assert_eq!(sql, "a = ? AND (b = ? OR c = ?)");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_render_in_list() {
        let cond = Condition::compare(
            "status",
            CompareOp::In,
            Value::Json(serde_json::json!(["a", "b"])),
        );
        let mut params = Vec::new();
        let sql = cond.render_sql(&mut params);
        assert_eq!(sql, "status IN (?, ?)");
        assert_eq!(
            params,
            vec![Value::Text("a".into()), Value::Text("b".into())]
        );
    }

    #[test]
    fn test_render_column_to_column_has_no_params() {
        let cond = Condition::Simple {
            left: Operand::column("a"),
            op: CompareOp::Le,
            right: Operand::column("b"),
        };
        let mut params = Vec::new();
        assert_eq!(cond.render_sql(&mut params), "a <= b");
        assert!(params.is_empty());
    }

    // ── related clauses ─────────────────────────────────────────────

    #[test]
    fn test_related_relationship_defaults_to_table() {
        let clause = RelatedClause {
            correlation: Correlation {
                parent_field: "id".into(),
                child_field: "user_id".into(),
            },
            subquery: Ast::table("issues"),
            alias: None,
        };
        assert_eq!(clause.relationship(), "issues");
        let aliased = RelatedClause {
            alias: Some("openIssues".into()),
            ..clause
        };
        assert_eq!(aliased.relationship(), "openIssues");
    }
}
