//! The output sink.
//!
//! [`Terminus`] sits at the root of an operator tree: it drives pull
//! iteration (`hydrate`) and keeps the materialised result view current by
//! applying pushed changes. The view is a vector of nodes kept sorted under
//! the tree's sort, which is PK-complete and therefore total.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::debug;

use crate::error::LiteTrickleError;
use crate::ivm::{Change, FetchItem, FetchRequest, Input, Node, Output};
use crate::timeslice::TimeSlice;

pub struct Terminus {
    input: Rc<dyn Input>,
    view: RefCell<Vec<Node>>,
    hydrated: Cell<bool>,
    yields_observed: Cell<u64>,
}

impl Terminus {
    pub fn connect(input: Rc<dyn Input>) -> Rc<Self> {
        let op = Rc::new(Terminus {
            input,
            view: RefCell::new(Vec::new()),
            hydrated: Cell::new(false),
            yields_observed: Cell::new(0),
        });
        op.input.set_output(op.clone() as Rc<dyn Output>);
        op
    }

    /// Pull the full result set and materialise the view. Returns the
    /// number of rows synced (nodes plus their related children).
    ///
    /// `Yield` sentinels are honoured by checking the optional time-slice
    /// budget before resuming, so a cancelled run unwinds mid-hydration.
    pub fn hydrate(&self, timeslice: Option<&TimeSlice>) -> Result<u64, LiteTrickleError> {
        let mut view = Vec::new();
        {
            let stream = self.input.fetch(FetchRequest::unconstrained())?;
            for item in stream {
                match item? {
                    FetchItem::Node(node) => view.push(node),
                    FetchItem::Yield => {
                        self.yields_observed.set(self.yields_observed.get() + 1);
                        if let Some(ts) = timeslice {
                            ts.check_budget()?;
                        }
                    }
                }
            }
        }
        let count = view.iter().map(Node::row_count).sum();
        debug!(rows = count, "terminus hydrated");
        *self.view.borrow_mut() = view;
        self.hydrated.set(true);
        Ok(count)
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated.get()
    }

    /// A snapshot of the materialised view.
    pub fn view(&self) -> Vec<Node> {
        self.view.borrow().clone()
    }

    /// Rows currently in the view, related children included.
    pub fn row_count(&self) -> u64 {
        self.view.borrow().iter().map(Node::row_count).sum()
    }

    /// Number of `Yield` sentinels observed during hydration.
    pub fn yields_observed(&self) -> u64 {
        self.yields_observed.get()
    }

    pub fn destroy(&self) -> Result<(), LiteTrickleError> {
        self.input.destroy()
    }

    fn apply(&self, view: &mut Vec<Node>, change: Change) {
        match change {
            Change::Add { node } => {
                let position =
                    view.binary_search_by(|n| self.input.sort().compare(&n.row, &node.row));
                match position {
                    Ok(i) => view[i] = node,
                    Err(i) => view.insert(i, node),
                }
            }
            Change::Remove { node } => {
                if let Ok(i) =
                    view.binary_search_by(|n| self.input.sort().compare(&n.row, &node.row))
                {
                    view.remove(i);
                }
            }
            Change::Edit { old_node, mut node } => {
                if let Ok(i) =
                    view.binary_search_by(|n| self.input.sort().compare(&n.row, &old_node.row))
                {
                    // An edit from below a join carries refreshed children;
                    // a plain row edit keeps whatever was attached.
                    if node.relationships.is_empty() {
                        node.relationships = view[i].relationships.clone();
                    }
                    view[i] = node;
                }
            }
            Change::Child {
                row,
                relationship,
                change,
            } => {
                if let Ok(i) = view.binary_search_by(|n| self.input.sort().compare(&n.row, &row)) {
                    let children = view[i].relationships.entry(relationship).or_default();
                    apply_child(children, *change);
                }
            }
        }
    }
}

/// Apply a change to a relationship's child list. Children keep arrival
/// order; identity is full-row equality.
fn apply_child(children: &mut Vec<Node>, change: Change) {
    match change {
        Change::Add { node } => children.push(node),
        Change::Remove { node } => children.retain(|c| c.row != node.row),
        Change::Edit { old_node, mut node } => {
            if let Some(i) = children.iter().position(|c| c.row == old_node.row) {
                let kept = std::mem::take(&mut children[i].relationships);
                if node.relationships.is_empty() {
                    node.relationships = kept;
                }
                children[i] = node;
            }
        }
        Change::Child {
            row,
            relationship,
            change,
        } => {
            if let Some(i) = children.iter().position(|c| c.row == row) {
                let grandchildren = children[i].relationships.entry(relationship).or_default();
                apply_child(grandchildren, *change);
            }
        }
    }
}

impl Output for Terminus {
    fn push(&self, change: Change) -> Result<(), LiteTrickleError> {
        let mut view = self.view.borrow_mut();
        self.apply(&mut view, change);
        Ok(())
    }
}
