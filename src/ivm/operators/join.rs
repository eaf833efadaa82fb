//! Join operators: related, semi, and anti.
//!
//! A join drives one side (the parent) and probes the other by a
//! constraint built from the join columns. Related joins emit parent nodes
//! carrying child streams under a relationship name; semi/anti joins emit
//! the parent rows whose existence test passes.
//!
//! # Push translation
//!
//! A parent-side change is decorated (children attached, or the existence
//! test applied) and forwarded. A child-side change either becomes a
//! [`Change::Child`] under every matching parent (related joins) or an
//! add/remove of the parent when the existence count flips through 0↔1
//! (semi/anti joins). Join-key edits never reach a join in place: the
//! pipeline registers the join columns in `split_edit_keys`, so key moves
//! arrive as remove + add.
//!
//! # Flipped semi joins
//!
//! The planner may flip a semi join so the (small) child side drives: the
//! child is scanned once, its distinct key values probe the parent by
//! constraint, and the probe results merge under the parent sort. Related
//! and anti joins are unflippable.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::error::LiteTrickleError;
use crate::ivm::{
    Change, Constraint, FetchItem, FetchRequest, Input, Node, NodeStream, Output, drain,
    drain_up_to,
};
use crate::row::Value;
use crate::schema::{SortSpec, TableSchema};

/// The shape of a join's output.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinKind {
    /// Emit every parent with matching children attached under
    /// `relationship`.
    Related { relationship: String },
    /// Emit parents having at least one matching child.
    Semi,
    /// Emit parents having no matching child.
    Anti,
}

pub struct JoinOperator {
    parent: Rc<dyn Input>,
    child: Rc<dyn Input>,
    parent_key: String,
    child_key: String,
    kind: JoinKind,
    flipped: bool,
    output: RefCell<Option<Rc<dyn Output>>>,
}

/// Output endpoint for the parent subtree.
struct ParentEnd {
    join: Weak<JoinOperator>,
}

/// Output endpoint for the child subtree.
struct ChildEnd {
    join: Weak<JoinOperator>,
}

impl Output for ParentEnd {
    fn push(&self, change: Change) -> Result<(), LiteTrickleError> {
        match self.join.upgrade() {
            Some(join) => join.push_parent(change),
            None => Ok(()),
        }
    }
}

impl Output for ChildEnd {
    fn push(&self, change: Change) -> Result<(), LiteTrickleError> {
        match self.join.upgrade() {
            Some(join) => join.push_child(change),
            None => Ok(()),
        }
    }
}

impl JoinOperator {
    pub fn connect(
        parent: Rc<dyn Input>,
        child: Rc<dyn Input>,
        parent_key: impl Into<String>,
        child_key: impl Into<String>,
        kind: JoinKind,
        flipped: bool,
    ) -> Result<Rc<Self>, LiteTrickleError> {
        if flipped && kind != JoinKind::Semi {
            return Err(LiteTrickleError::InvalidArgument(
                "only semi joins can be flipped".into(),
            ));
        }
        let op = Rc::new(JoinOperator {
            parent,
            child,
            parent_key: parent_key.into(),
            child_key: child_key.into(),
            kind,
            flipped,
            output: RefCell::new(None),
        });
        op.parent.set_output(Rc::new(ParentEnd {
            join: Rc::downgrade(&op),
        }));
        op.child.set_output(Rc::new(ChildEnd {
            join: Rc::downgrade(&op),
        }));
        Ok(op)
    }

    fn forward(&self, change: Change) -> Result<(), LiteTrickleError> {
        let output = self.output.borrow().clone();
        match output {
            Some(output) => output.push(change),
            None => Ok(()),
        }
    }

    /// Fetch the children matching one parent row.
    fn children_of(&self, parent_row_key: &Value) -> Result<Vec<Node>, LiteTrickleError> {
        if parent_row_key.is_null() {
            return Ok(Vec::new());
        }
        let req = FetchRequest {
            constraint: Some(Constraint {
                column: self.child_key.clone(),
                value: parent_row_key.clone(),
            }),
            start: None,
            reverse: false,
        };
        drain(self.child.fetch(req)?)
    }

    /// How many children currently match `value`, capped at 2: existence
    /// flips only care about 0, 1, and "more".
    fn child_count(&self, value: &Value) -> Result<usize, LiteTrickleError> {
        if value.is_null() {
            return Ok(0);
        }
        let req = FetchRequest {
            constraint: Some(Constraint {
                column: self.child_key.clone(),
                value: value.clone(),
            }),
            start: None,
            reverse: false,
        };
        Ok(drain_up_to(self.child.fetch(req)?, 2)?.len())
    }

    /// The parent nodes matching a child-side key value.
    fn parents_of(&self, value: &Value) -> Result<Vec<Node>, LiteTrickleError> {
        if value.is_null() {
            return Ok(Vec::new());
        }
        let req = FetchRequest {
            constraint: Some(Constraint {
                column: self.parent_key.clone(),
                value: value.clone(),
            }),
            start: None,
            reverse: false,
        };
        drain(self.parent.fetch(req)?)
    }

    /// Decorate a parent node: attach children (related) or apply the
    /// existence test (semi/anti). `None` means the node is suppressed.
    fn decorate(&self, mut node: Node) -> Result<Option<Node>, LiteTrickleError> {
        let key_value = node.row.get_or_null(&self.parent_key);
        match &self.kind {
            JoinKind::Related { relationship } => {
                let children = self.children_of(&key_value)?;
                node.relationships.insert(relationship.clone(), children);
                Ok(Some(node))
            }
            JoinKind::Semi => Ok((self.child_count(&key_value)? > 0).then_some(node)),
            JoinKind::Anti => Ok((self.child_count(&key_value)? == 0).then_some(node)),
        }
    }

    // ── push from the parent side ────────────────────────────────────────

    fn push_parent(&self, change: Change) -> Result<(), LiteTrickleError> {
        match change {
            Change::Add { node } => {
                if let Some(node) = self.decorate(node)? {
                    self.forward(Change::Add { node })?;
                }
                Ok(())
            }
            Change::Remove { node } => {
                if let Some(node) = self.decorate(node)? {
                    self.forward(Change::Remove { node })?;
                }
                Ok(())
            }
            Change::Edit { old_node, node } => {
                let old_key = old_node.row.get_or_null(&self.parent_key);
                let new_key = node.row.get_or_null(&self.parent_key);
                if old_key != new_key {
                    // The pipeline splits key edits upstream; handle a raw
                    // one defensively as remove + add.
                    self.push_parent(Change::Remove { node: old_node })?;
                    return self.push_parent(Change::Add { node });
                }
                match &self.kind {
                    JoinKind::Related { relationship } => {
                        let children = self.children_of(&new_key)?;
                        let mut old_node = old_node;
                        let mut node = node;
                        old_node
                            .relationships
                            .insert(relationship.clone(), children.clone());
                        node.relationships.insert(relationship.clone(), children);
                        self.forward(Change::Edit { old_node, node })
                    }
                    JoinKind::Semi => {
                        if self.child_count(&new_key)? > 0 {
                            self.forward(Change::Edit { old_node, node })?;
                        }
                        Ok(())
                    }
                    JoinKind::Anti => {
                        if self.child_count(&new_key)? == 0 {
                            self.forward(Change::Edit { old_node, node })?;
                        }
                        Ok(())
                    }
                }
            }
            Change::Child {
                row,
                relationship,
                change,
            } => {
                let key_value = row.get_or_null(&self.parent_key);
                let passes = match &self.kind {
                    JoinKind::Related { .. } => true,
                    JoinKind::Semi => self.child_count(&key_value)? > 0,
                    JoinKind::Anti => self.child_count(&key_value)? == 0,
                };
                if passes {
                    self.forward(Change::Child {
                        row,
                        relationship,
                        change,
                    })?;
                }
                Ok(())
            }
        }
    }

    // ── push from the child side ─────────────────────────────────────────

    fn push_child(&self, change: Change) -> Result<(), LiteTrickleError> {
        match &self.kind {
            JoinKind::Related { relationship } => {
                let value = change.row().get_or_null(&self.child_key);
                for parent in self.parents_of(&value)? {
                    self.forward(Change::Child {
                        row: parent.row,
                        relationship: relationship.clone(),
                        change: Box::new(change.clone()),
                    })?;
                }
                Ok(())
            }
            JoinKind::Semi => match &change {
                Change::Add { node } => {
                    let value = node.row.get_or_null(&self.child_key);
                    // The overlay makes this add visible: a count of one
                    // means existence just flipped on.
                    if self.child_count(&value)? == 1 {
                        for parent in self.parents_of(&value)? {
                            self.forward(Change::Add { node: parent })?;
                        }
                    }
                    Ok(())
                }
                Change::Remove { node } => {
                    let value = node.row.get_or_null(&self.child_key);
                    if self.child_count(&value)? == 0 {
                        for parent in self.parents_of(&value)? {
                            self.forward(Change::Remove { node: parent })?;
                        }
                    }
                    Ok(())
                }
                // A key-preserving edit cannot flip existence; key moves
                // arrive split as remove + add.
                Change::Edit { .. } | Change::Child { .. } => Ok(()),
            },
            JoinKind::Anti => match &change {
                Change::Add { node } => {
                    let value = node.row.get_or_null(&self.child_key);
                    if self.child_count(&value)? == 1 {
                        for parent in self.parents_of(&value)? {
                            self.forward(Change::Remove { node: parent })?;
                        }
                    }
                    Ok(())
                }
                Change::Remove { node } => {
                    let value = node.row.get_or_null(&self.child_key);
                    if self.child_count(&value)? == 0 {
                        for parent in self.parents_of(&value)? {
                            self.forward(Change::Add { node: parent })?;
                        }
                    }
                    Ok(())
                }
                Change::Edit { .. } | Change::Child { .. } => Ok(()),
            },
        }
    }

    /// Child-driven probe for a flipped semi join: scan the child, probe
    /// the parent per distinct key value, and emit in parent-sort order.
    fn fetch_flipped(&self, req: &FetchRequest) -> Result<NodeStream<'_>, LiteTrickleError> {
        let children = drain(self.child.fetch(FetchRequest::unconstrained())?)?;
        let mut values: BTreeSet<Value> = BTreeSet::new();
        for child in &children {
            let value = child.row.get_or_null(&self.child_key);
            if !value.is_null() {
                values.insert(value);
            }
        }
        debug!(
            values = values.len(),
            "flipped semi join probing parent side"
        );
        let mut nodes: Vec<Node> = Vec::new();
        for value in values {
            let probe = FetchRequest {
                constraint: Some(Constraint {
                    column: self.parent_key.clone(),
                    value,
                }),
                start: req.start.clone(),
                reverse: req.reverse,
            };
            nodes.extend(drain(self.parent.fetch(probe)?)?);
        }
        let sort = if req.reverse {
            self.parent.sort().reversed()
        } else {
            self.parent.sort().clone()
        };
        nodes.sort_by(|a, b| sort.compare(&a.row, &b.row));
        Ok(Box::new(nodes.into_iter().map(|n| Ok(FetchItem::Node(n)))))
    }
}

impl Input for JoinOperator {
    fn schema(&self) -> Rc<TableSchema> {
        self.parent.schema()
    }

    fn sort(&self) -> &SortSpec {
        self.parent.sort()
    }

    fn fetch(&self, req: FetchRequest) -> Result<NodeStream<'_>, LiteTrickleError> {
        if self.flipped && req.constraint.is_none() {
            return self.fetch_flipped(&req);
        }
        let parents = self.parent.fetch(req)?;
        Ok(Box::new(parents.filter_map(move |item| match item {
            Ok(FetchItem::Node(node)) => match self.decorate(node) {
                Ok(Some(node)) => Some(Ok(FetchItem::Node(node))),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            },
            other => Some(other),
        })))
    }

    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) -> Result<(), LiteTrickleError> {
        self.parent.destroy()?;
        self.child.destroy()
    }

    fn fully_applied_filters(&self) -> bool {
        self.parent.fully_applied_filters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivm::operators::test_helpers::*;
    use crate::ivm::source::ConnectOptions;

    fn related_join(fx: &JoinFixture) -> Rc<JoinOperator> {
        let parent = fx.users.connect(ConnectOptions::default()).unwrap();
        let child = fx
            .issues
            .connect(ConnectOptions {
                split_edit_keys: Some(["user_id".to_string()].into_iter().collect()),
                ..Default::default()
            })
            .unwrap();
        JoinOperator::connect(
            parent,
            child,
            "id",
            "user_id",
            JoinKind::Related {
                relationship: "issues".into(),
            },
            false,
        )
        .unwrap()
    }

    fn semi_join(fx: &JoinFixture, flipped: bool) -> Rc<JoinOperator> {
        let parent = fx.users.connect(ConnectOptions::default()).unwrap();
        let child = fx
            .issues
            .connect(ConnectOptions {
                split_edit_keys: Some(["user_id".to_string()].into_iter().collect()),
                ..Default::default()
            })
            .unwrap();
        JoinOperator::connect(parent, child, "id", "user_id", JoinKind::Semi, flipped).unwrap()
    }

    fn anti_join(fx: &JoinFixture) -> Rc<JoinOperator> {
        let parent = fx.users.connect(ConnectOptions::default()).unwrap();
        let child = fx.issues.connect(ConnectOptions::default()).unwrap();
        JoinOperator::connect(parent, child, "id", "user_id", JoinKind::Anti, false).unwrap()
    }

    fn fetch_all(join: &Rc<JoinOperator>) -> Vec<Node> {
        drain(join.fetch(FetchRequest::unconstrained()).unwrap()).unwrap()
    }

    // ── related fetch ───────────────────────────────────────────────

    #[test]
    fn test_related_attaches_children() {
        let fx = join_fixture(
            &[(1.0, "alice"), (2.0, "bob")],
            &[(10.0, 1.0, "a"), (11.0, 1.0, "b")],
        );
        let join = related_join(&fx);
        let nodes = fetch_all(&join);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].relationships["issues"].len(), 2);
        assert_eq!(nodes[1].relationships["issues"].len(), 0);
    }

    #[test]
    fn test_semi_keeps_only_parents_with_children() {
        let fx = join_fixture(&[(1.0, "alice"), (2.0, "bob")], &[(10.0, 1.0, "a")]);
        let join = semi_join(&fx, false);
        let nodes = fetch_all(&join);
        assert_eq!(nodes.len(), 1);
        assert_eq!(
            nodes[0].row.get_or_null("name"),
            crate::row::Value::Text("alice".into())
        );
    }

    #[test]
    fn test_anti_keeps_only_parents_without_children() {
        let fx = join_fixture(&[(1.0, "alice"), (2.0, "bob")], &[(10.0, 1.0, "a")]);
        let join = anti_join(&fx);
        let nodes = fetch_all(&join);
        assert_eq!(nodes.len(), 1);
        assert_eq!(
            nodes[0].row.get_or_null("name"),
            crate::row::Value::Text("bob".into())
        );
    }

    #[test]
    fn test_flipped_semi_matches_unflipped() {
        let fx = join_fixture(
            &[(1.0, "alice"), (2.0, "bob"), (3.0, "cara")],
            &[(10.0, 1.0, "a"), (11.0, 3.0, "b"), (12.0, 3.0, "c")],
        );
        let unflipped = fetch_all(&semi_join(&fx, false));
        let fx2 = join_fixture(
            &[(1.0, "alice"), (2.0, "bob"), (3.0, "cara")],
            &[(10.0, 1.0, "a"), (11.0, 3.0, "b"), (12.0, 3.0, "c")],
        );
        let flipped = fetch_all(&semi_join(&fx2, true));
        let ids = |nodes: &[Node]| {
            nodes
                .iter()
                .map(|n| n.row.get_or_null("id"))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&unflipped), ids(&flipped));
        assert_eq!(unflipped.len(), 2);
    }

    #[test]
    fn test_only_semi_flippable() {
        let fx = join_fixture(&[], &[]);
        let parent = fx.users.connect(ConnectOptions::default()).unwrap();
        let child = fx.issues.connect(ConnectOptions::default()).unwrap();
        let result = JoinOperator::connect(
            parent,
            child,
            "id",
            "user_id",
            JoinKind::Related {
                relationship: "issues".into(),
            },
            true,
        );
        assert!(result.is_err());
    }

    // ── parent-side pushes ──────────────────────────────────────────

    #[test]
    fn test_parent_add_carries_children() {
        let fx = join_fixture(&[], &[(10.0, 1.0, "a")]);
        let join = related_join(&fx);
        let out = Collector::new();
        join.set_output(out.clone());

        fx.users.push(Change::add(user_row(1.0, "alice"))).unwrap();
        let changes = out.take();
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            Change::Add { node } => {
                assert_eq!(node.relationships["issues"].len(), 1);
            }
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn test_parent_add_suppressed_by_semi() {
        let fx = join_fixture(&[], &[]);
        let join = semi_join(&fx, false);
        let out = Collector::new();
        join.set_output(out.clone());
        fx.users.push(Change::add(user_row(1.0, "alice"))).unwrap();
        assert_eq!(out.len(), 0);
    }

    // ── child-side pushes ───────────────────────────────────────────

    #[test]
    fn test_child_add_becomes_child_change() {
        let fx = join_fixture(&[(1.0, "alice")], &[]);
        let join = related_join(&fx);
        let out = Collector::new();
        join.set_output(out.clone());

        fx.issues
            .push(Change::add(issue_row(10.0, 1.0, "new")))
            .unwrap();
        let changes = out.take();
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            Change::Child {
                row,
                relationship,
                change,
            } => {
                assert_eq!(row.get_or_null("id"), crate::row::Value::Number(1.0));
                assert_eq!(relationship, "issues");
                assert!(matches!(**change, Change::Add { .. }));
            }
            other => panic!("expected child change, got {other:?}"),
        }
    }

    #[test]
    fn test_child_add_flips_semi_existence() {
        let fx = join_fixture(&[(1.0, "alice")], &[]);
        let join = semi_join(&fx, false);
        let out = Collector::new();
        join.set_output(out.clone());

        // 0 → 1: parent becomes visible
        fx.issues
            .push(Change::add(issue_row(10.0, 1.0, "a")))
            .unwrap();
        // 1 → 2: no change downstream
        fx.issues
            .push(Change::add(issue_row(11.0, 1.0, "b")))
            .unwrap();
        let changes = out.take();
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], Change::Add { .. }));
    }

    #[test]
    fn test_child_remove_flips_semi_existence() {
        let fx = join_fixture(&[(1.0, "alice")], &[(10.0, 1.0, "a"), (11.0, 1.0, "b")]);
        let join = semi_join(&fx, false);
        let out = Collector::new();
        join.set_output(out.clone());

        // 2 → 1: still exists
        fx.issues
            .push(Change::remove(issue_row(10.0, 1.0, "a")))
            .unwrap();
        // 1 → 0: parent leaves the view
        fx.issues
            .push(Change::remove(issue_row(11.0, 1.0, "b")))
            .unwrap();
        let changes = out.take();
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], Change::Remove { .. }));
    }

    #[test]
    fn test_child_add_flips_anti_existence() {
        let fx = join_fixture(&[(1.0, "alice")], &[]);
        let join = anti_join(&fx);
        let out = Collector::new();
        join.set_output(out.clone());

        fx.issues
            .push(Change::add(issue_row(10.0, 1.0, "a")))
            .unwrap();
        let changes = out.take();
        assert_eq!(changes.len(), 1);
        // Parent had no children, so it was visible; now it must leave.
        assert!(matches!(changes[0], Change::Remove { .. }));
    }

    #[test]
    fn test_child_push_without_matching_parent_is_silent() {
        let fx = join_fixture(&[(1.0, "alice")], &[]);
        let join = related_join(&fx);
        let out = Collector::new();
        join.set_output(out.clone());
        fx.issues
            .push(Change::add(issue_row(10.0, 999.0, "orphan")))
            .unwrap();
        assert_eq!(out.len(), 0);
    }

    #[test]
    fn test_destroy_tears_down_both_sides() {
        let fx = join_fixture(&[], &[]);
        let join = related_join(&fx);
        join.destroy().unwrap();
        assert_eq!(fx.users.connection_count(), 0);
        assert_eq!(fx.issues.connection_count(), 0);
    }
}
