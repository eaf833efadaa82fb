//! Residual-predicate operator.
//!
//! Evaluates a subquery-free [`Condition`] per row. On fetch the predicate
//! drops non-matching nodes; on push an edit crossing the predicate
//! boundary becomes the net add/remove so downstream views converge: a row
//! transitioning from non-matching to matching arrives as `add(new)`, the
//! converse as `remove(old)`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::Condition;
use crate::error::LiteTrickleError;
use crate::ivm::{Change, FetchItem, FetchRequest, Input, NodeStream, Output};
use crate::schema::{SortSpec, TableSchema};

pub struct FilterOperator {
    input: Rc<dyn Input>,
    condition: Condition,
    output: RefCell<Option<Rc<dyn Output>>>,
}

impl FilterOperator {
    /// Wire a filter above `input`. The condition must be subquery-free;
    /// existence tests are the join planner's job.
    pub fn connect(
        input: Rc<dyn Input>,
        condition: Condition,
    ) -> Result<Rc<Self>, LiteTrickleError> {
        if !condition.is_subquery_free() {
            return Err(LiteTrickleError::Internal(
                "filter operator requires a subquery-free condition".into(),
            ));
        }
        let op = Rc::new(FilterOperator {
            input,
            condition,
            output: RefCell::new(None),
        });
        op.input.set_output(op.clone() as Rc<dyn Output>);
        Ok(op)
    }

    fn forward(&self, change: Change) -> Result<(), LiteTrickleError> {
        let output = self.output.borrow().clone();
        match output {
            Some(output) => output.push(change),
            None => Ok(()),
        }
    }
}

impl Input for FilterOperator {
    fn schema(&self) -> Rc<TableSchema> {
        self.input.schema()
    }

    fn sort(&self) -> &SortSpec {
        self.input.sort()
    }

    fn fetch(&self, req: FetchRequest) -> Result<NodeStream<'_>, LiteTrickleError> {
        let stream = self.input.fetch(req)?;
        let condition = &self.condition;
        Ok(Box::new(stream.filter_map(move |item| match item {
            Ok(FetchItem::Node(node)) => match condition.evaluate(&node.row) {
                Ok(true) => Some(Ok(FetchItem::Node(node))),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            },
            other => Some(other),
        })))
    }

    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) -> Result<(), LiteTrickleError> {
        self.input.destroy()
    }

    fn fully_applied_filters(&self) -> bool {
        true
    }
}

impl Output for FilterOperator {
    fn push(&self, change: Change) -> Result<(), LiteTrickleError> {
        match change {
            Change::Add { node } => {
                if self.condition.evaluate(&node.row)? {
                    self.forward(Change::Add { node })?;
                }
                Ok(())
            }
            Change::Remove { node } => {
                if self.condition.evaluate(&node.row)? {
                    self.forward(Change::Remove { node })?;
                }
                Ok(())
            }
            Change::Edit { old_node, node } => {
                let was_in = self.condition.evaluate(&old_node.row)?;
                let is_in = self.condition.evaluate(&node.row)?;
                match (was_in, is_in) {
                    (true, true) => self.forward(Change::Edit { old_node, node }),
                    (true, false) => self.forward(Change::Remove { node: old_node }),
                    (false, true) => self.forward(Change::Add { node }),
                    (false, false) => Ok(()),
                }
            }
            Change::Child {
                row,
                relationship,
                change,
            } => {
                if self.condition.evaluate(&row)? {
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
