//! Fan-out / fan-in.
//!
//! A [`FanOut`] lets a single source connection feed multiple downstream
//! branches without double execution; the matching [`FanIn`] re-merges the
//! branches. Used for disjunctive filters: each branch carries one arm of
//! the OR.
//!
//! Exactly-once delivery: the fan-out stamps every push with an epoch; the
//! fan-in acts on the first branch delivery of an epoch and suppresses the
//! rest, no matter how many branches let the change through.
//!
//! Branch filters decompose an edit that crosses their own predicate into
//! remove/add halves before the fan-in ever sees it, so a delivered change
//! only signals that *some* arm matched. For net semantics the fan-in goes
//! back to the fan-out's original in-flight change and re-derives the
//! downstream change under the full disjunction: an edit crossing from one
//! arm to another (still inside the OR) converges as a single edit, and an
//! edit leaving the OR entirely becomes the one net remove.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::ast::Condition;
use crate::error::LiteTrickleError;
use crate::ivm::{Change, FetchItem, FetchRequest, Input, Node, NodeStream, Output};
use crate::schema::{SortSpec, TableSchema};

pub struct FanOut {
    input: Rc<dyn Input>,
    branches: RefCell<Vec<Rc<dyn Output>>>,
    push_epoch: Cell<u64>,
    /// The change currently being delivered to the branches, before any
    /// branch filter decomposed it. The fan-in reads this to re-derive the
    /// net downstream change.
    in_flight: RefCell<Option<Change>>,
    destroyed_branches: Cell<usize>,
}

impl FanOut {
    pub fn connect(input: Rc<dyn Input>) -> Rc<Self> {
        let op = Rc::new(FanOut {
            input,
            branches: RefCell::new(Vec::new()),
            push_epoch: Cell::new(0),
            in_flight: RefCell::new(None),
            destroyed_branches: Cell::new(0),
        });
        op.input.set_output(op.clone() as Rc<dyn Output>);
        op
    }

    pub fn current_epoch(&self) -> u64 {
        self.push_epoch.get()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.borrow().len()
    }

    /// The original change of the push in progress, if any.
    fn original_change(&self) -> Option<Change> {
        self.in_flight.borrow().clone()
    }
}

impl Input for FanOut {
    fn schema(&self) -> Rc<TableSchema> {
        self.input.schema()
    }

    fn sort(&self) -> &SortSpec {
        self.input.sort()
    }

    fn fetch(&self, req: FetchRequest) -> Result<NodeStream<'_>, LiteTrickleError> {
        self.input.fetch(req)
    }

    /// Register a branch. Unlike single-output operators, every call adds
    /// an endpoint; pushes are delivered to each branch exactly once.
    fn set_output(&self, output: Rc<dyn Output>) {
        self.branches.borrow_mut().push(output);
    }

    /// Each branch destroys the fan-out once; the upstream input goes down
    /// with the last branch.
    fn destroy(&self) -> Result<(), LiteTrickleError> {
        let total = self.branches.borrow().len();
        let done = self.destroyed_branches.get() + 1;
        if done > total {
            return Err(LiteTrickleError::Internal(
                "fan-out destroyed more times than it has branches".into(),
            ));
        }
        self.destroyed_branches.set(done);
        if done == total {
            self.input.destroy()?;
        }
        Ok(())
    }

    fn fully_applied_filters(&self) -> bool {
        self.input.fully_applied_filters()
    }
}

impl Output for FanOut {
    fn push(&self, change: Change) -> Result<(), LiteTrickleError> {
        self.push_epoch.set(self.push_epoch.get() + 1);
        *self.in_flight.borrow_mut() = Some(change.clone());
        let branches: Vec<Rc<dyn Output>> = self.branches.borrow().clone();
        for branch in branches {
            if let Err(e) = branch.push(change.clone()) {
                self.in_flight.borrow_mut().take();
                return Err(e);
            }
        }
        self.in_flight.borrow_mut().take();
        Ok(())
    }
}

// ── Fan-in ─────────────────────────────────────────────────────────────────

pub struct FanIn {
    fan_out: Rc<FanOut>,
    branches: Vec<Rc<dyn Input>>,
    /// The full disjunction across branches, for net-change recomputation.
    condition: Option<Condition>,
    output: RefCell<Option<Rc<dyn Output>>>,
    last_epoch: Cell<u64>,
}

struct BranchEnd {
    fan_in: Weak<FanIn>,
}

impl Output for BranchEnd {
    fn push(&self, change: Change) -> Result<(), LiteTrickleError> {
        match self.fan_in.upgrade() {
            Some(fan_in) => fan_in.push_branch(change),
            None => Ok(()),
        }
    }
}

impl FanIn {
    /// Merge `branches` (each fed by `fan_out`) back into one stream. The
    /// branches must share their sort.
    pub fn connect(
        fan_out: Rc<FanOut>,
        branches: Vec<Rc<dyn Input>>,
        condition: Option<Condition>,
    ) -> Result<Rc<Self>, LiteTrickleError> {
        if branches.is_empty() {
            return Err(LiteTrickleError::Internal(
                "fan-in requires at least one branch".into(),
            ));
        }
        let op = Rc::new(FanIn {
            fan_out,
            branches,
            condition,
            output: RefCell::new(None),
            last_epoch: Cell::new(0),
        });
        for branch in &op.branches {
            branch.set_output(Rc::new(BranchEnd {
                fan_in: Rc::downgrade(&op),
            }) as Rc<dyn Output>);
        }
        Ok(op)
    }

    fn forward(&self, change: Change) -> Result<(), LiteTrickleError> {
        let output = self.output.borrow().clone();
        match output {
            Some(output) => output.push(change),
            None => Ok(()),
        }
    }

    /// Receive a delivery from one branch. Only the first delivery of an
    /// epoch is acted on.
    ///
    /// The delivered change is not forwarded as-is: a branch filter has
    /// already decomposed any edit that crossed its own arm (an edit
    /// 5→95 under `score<20 OR score>80` arrives here as the remove half
    /// from the arm it left). The delivery only proves that some arm
    /// matched; the net change is re-derived from the fan-out's original
    /// in-flight change under the full disjunction. Every change that
    /// needs downstream action passes at least one arm on its old or new
    /// row, so acting on the first delivery loses nothing.
    fn push_branch(&self, delivered: Change) -> Result<(), LiteTrickleError> {
        let epoch = self.fan_out.current_epoch();
        if self.last_epoch.get() == epoch {
            return Ok(());
        }
        self.last_epoch.set(epoch);

        let change = self.fan_out.original_change().unwrap_or(delivered);
        let Some(condition) = &self.condition else {
            return self.forward(change);
        };
        match change {
            Change::Add { node } => {
                if condition.evaluate(&node.row)? {
                    self.forward(Change::Add { node })?;
                }
                Ok(())
            }
            Change::Remove { node } => {
                if condition.evaluate(&node.row)? {
                    self.forward(Change::Remove { node })?;
                }
                Ok(())
            }
            Change::Edit { old_node, node } => {
                let was_in = condition.evaluate(&old_node.row)?;
                let is_in = condition.evaluate(&node.row)?;
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
                if condition.evaluate(&row)? {
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

impl Input for FanIn {
    fn schema(&self) -> Rc<TableSchema> {
        self.fan_out.schema()
    }

    fn sort(&self) -> &SortSpec {
        self.branches[0].sort()
    }

    /// Merge the branch streams under the shared sort, dropping rows more
    /// than one branch admits.
    fn fetch(&self, req: FetchRequest) -> Result<NodeStream<'_>, LiteTrickleError> {
        let schema = self.schema();
        let mut nodes: Vec<Node> = Vec::new();
        for branch in &self.branches {
            nodes.extend(crate::ivm::drain(branch.fetch(req.clone())?)?);
        }
        let sort = if req.reverse {
            self.sort().reversed()
        } else {
            self.sort().clone()
        };
        nodes.sort_by(|a, b| sort.compare(&a.row, &b.row));
        nodes.dedup_by_key(|n| schema.row_key(&n.row));
        Ok(Box::new(nodes.into_iter().map(|n| Ok(FetchItem::Node(n)))))
    }

    fn set_output(&self, output: Rc<dyn Output>) {
        *self.output.borrow_mut() = Some(output);
    }

    fn destroy(&self) -> Result<(), LiteTrickleError> {
        for branch in &self.branches {
            branch.destroy()?;
        }
        Ok(())
    }

    fn fully_applied_filters(&self) -> bool {
        self.branches.iter().all(|b| b.fully_applied_filters())
    }
}
