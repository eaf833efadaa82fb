//! LIMIT enforcement.
//!
//! [`TakeOperator`] caps the stream at `limit` rows while preserving the
//! sort, and translates pushes that cross the window boundary: an add
//! inside a full window evicts the current bound row; a remove inside the
//! window pulls the first row beyond the old bound back in. The window
//! state is a small invariant (size + bound row) recomputed from fetch
//! whenever the boundary moves.
//!
//! Pushes arrive while the source overlay is still set, so every fetch
//! issued here observes the post-change state.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::error::LiteTrickleError;
use crate::ivm::{
    Change, FetchItem, FetchRequest, Input, Node, NodeStream, Output, Start, StartBasis,
    drain_up_to,
};
use crate::schema::{SortSpec, TableSchema};

#[derive(Debug, Clone)]
struct WindowState {
    size: u64,
    /// The last (greatest, under the sort) row currently in the window.
    bound: Option<Node>,
}

pub struct TakeOperator {
    input: Rc<dyn Input>,
    limit: u64,
    output: RefCell<Option<Rc<dyn Output>>>,
    state: RefCell<Option<WindowState>>,
}

impl TakeOperator {
    pub fn connect(input: Rc<dyn Input>, limit: u64) -> Rc<Self> {
        let op = Rc::new(TakeOperator {
            input,
            limit,
            output: RefCell::new(None),
            state: RefCell::new(None),
        });
        op.input.set_output(op.clone() as Rc<dyn Output>);
        op
    }

    fn forward(&self, change: Change) -> Result<(), LiteTrickleError> {
        let output = self.output.borrow().clone();
        match output {
            Some(output) => output.push(change),
            None => Ok(()),
        }
    }

    /// Recompute the window invariant from a fresh fetch.
    fn refresh_window(&self) -> Result<WindowState, LiteTrickleError> {
        let nodes = drain_up_to(
            self.input.fetch(FetchRequest::unconstrained())?,
            self.limit as usize,
        )?;
        let state = WindowState {
            size: nodes.len() as u64,
            bound: nodes.last().cloned(),
        };
        *self.state.borrow_mut() = Some(state.clone());
        Ok(state)
    }

    fn window(&self) -> Result<WindowState, LiteTrickleError> {
        let cached = self.state.borrow().clone();
        match cached {
            Some(state) => Ok(state),
            None => self.refresh_window(),
        }
    }

    /// Whether a row lies inside the current window.
    fn in_window(&self, state: &WindowState, row: &crate::row::Row) -> bool {
        if state.size < self.limit {
            return true;
        }
        match &state.bound {
            Some(bound) => self.input.sort().compare(row, &bound.row) != Ordering::Greater,
            None => true,
        }
    }
}

impl Input for TakeOperator {
    fn schema(&self) -> Rc<TableSchema> {
        self.input.schema()
    }

    fn sort(&self) -> &SortSpec {
        self.input.sort()
    }

    fn fetch(&self, req: FetchRequest) -> Result<NodeStream<'_>, LiteTrickleError> {
        if self.limit == 0 {
            return Ok(Box::new(std::iter::empty()));
        }
        let record = req == FetchRequest::unconstrained();
        let stream = self.input.fetch(req)?;
        Ok(Box::new(TakeStream {
            inner: stream,
            remaining: self.limit,
            emitted: 0,
            last: None,
            op: self,
            record,
            finished: false,
        }))
    }

    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) -> Result<(), LiteTrickleError> {
        self.input.destroy()
    }

    fn fully_applied_filters(&self) -> bool {
        self.input.fully_applied_filters()
    }
}

struct TakeStream<'a> {
    inner: NodeStream<'a>,
    remaining: u64,
    emitted: u64,
    last: Option<Node>,
    op: &'a TakeOperator,
    record: bool,
    finished: bool,
}

impl TakeStream<'_> {
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.record {
            *self.op.state.borrow_mut() = Some(WindowState {
                size: self.emitted,
                bound: self.last.take(),
            });
        }
    }
}

impl Iterator for TakeStream<'_> {
    type Item = Result<FetchItem, LiteTrickleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.finish();
            return None;
        }
        match self.inner.next() {
            Some(Ok(FetchItem::Node(node))) => {
                self.remaining -= 1;
                self.emitted += 1;
                self.last = Some(node.clone());
                if self.remaining == 0 {
                    self.finish();
                }
                Some(Ok(FetchItem::Node(node)))
            }
            Some(other) => Some(other),
            None => {
                self.finish();
                None
            }
        }
    }
}

impl Output for TakeOperator {
    fn push(&self, change: Change) -> Result<(), LiteTrickleError> {
        if self.limit == 0 {
            return Ok(());
        }
        let state = self.window()?;
        match change {
            Change::Add { node } => {
                if state.size < self.limit {
                    self.forward(Change::Add { node })?;
                    self.refresh_window()?;
                    return Ok(());
                }
                let bound = state.bound.clone();
                let Some(bound) = bound else {
                    return Ok(());
                };
                if self.input.sort().compare(&node.row, &bound.row) == Ordering::Less {
                    // The new row displaces the current bound.
                    self.forward(Change::Add { node })?;
                    self.forward(Change::Remove { node: bound })?;
                    self.refresh_window()?;
                }
                Ok(())
            }
            Change::Remove { node } => {
                if !self.in_window(&state, &node.row) {
                    return Ok(());
                }
                self.forward(Change::Remove { node })?;
                // At most one row past the old bound slides in.
                if let Some(bound) = &state.bound {
                    if state.size == self.limit {
                        let replacement = drain_up_to(
                            self.input.fetch(FetchRequest {
                                constraint: None,
                                start: Some(Start {
                                    row: bound.row.clone(),
                                    basis: StartBasis::After,
                                }),
                                reverse: false,
                            })?,
                            1,
                        )?;
                        if let Some(replacement) = replacement.into_iter().next() {
                            self.forward(Change::Add { node: replacement })?;
                        }
                    }
                }
                self.refresh_window()?;
                Ok(())
            }
            Change::Edit { old_node, node } => {
                // Sort-key edits are split upstream, so the position is
                // stable; only window membership matters.
                if self.in_window(&state, &old_node.row) {
                    let was_bound = match &state.bound {
                        Some(bound) => {
                            self.input.sort().compare(&old_node.row, &bound.row)
                                == Ordering::Equal
                        }
                        None => false,
                    };
                    self.forward(Change::Edit {
                        old_node,
                        node: node.clone(),
                    })?;
                    if was_bound {
                        let mut cached = self.state.borrow_mut();
                        if let Some(cached) = cached.as_mut() {
                            cached.bound = Some(node);
                        }
                    }
                }
                Ok(())
            }
            Change::Child {
                row,
                relationship,
                change,
            } => {
                if self.in_window(&state, &row) {
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
}
