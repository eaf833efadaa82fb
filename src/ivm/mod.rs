//! The incremental view maintenance operator model.
//!
//! Data flows from SQLite-backed sources up through a tree of operators
//! (filter, join, fan-out/fan-in, take) to a terminus that materialises the
//! result view. Every operator implements both directions of the contract:
//!
//! - **push**: an upstream change arrives; the operator computes the
//!   downstream change(s) — possibly amplifying or suppressing them — and
//!   forwards them to its output.
//! - **fetch**: a downstream request arrives; the operator delegates
//!   upstream, transforming the request (e.g. a join adds a constraint for
//!   the probed row).
//!
//! Fetch streams are explicit iterators producing [`FetchItem`]s; the
//! `Yield` variant is the cooperative-scheduling sentinel that callers must
//! respect. Operators are stateless with respect to committed data, keeping
//! memory proportional to the view at the terminus.

pub mod operators;
pub mod source;

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::LiteTrickleError;
use crate::row::{Row, Value};
use crate::schema::{SortSpec, TableSchema};

/// A result row plus its per-relationship children.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub row: Row,
    pub relationships: BTreeMap<String, Vec<Node>>,
}

impl Node {
    /// A node with no relationships, as sources produce them.
    pub fn leaf(row: Row) -> Node {
        Node {
            row,
            relationships: BTreeMap::new(),
        }
    }

    /// Total number of rows in this subtree, itself included.
    pub fn row_count(&self) -> u64 {
        1 + self
            .relationships
            .values()
            .flat_map(|children| children.iter())
            .map(Node::row_count)
            .sum::<u64>()
    }
}

/// An item produced by a fetch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchItem {
    Node(Node),
    /// Cooperative checkpoint: the caller should hand control back to the
    /// host before resuming iteration.
    Yield,
}

/// A change propagating through the operator tree.
///
/// An edit whose primary key changes is modelled externally as
/// remove + add; a connection may split an edit into remove + add when
/// selected columns change (see `split_edit_keys`).
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Add {
        node: Node,
    },
    Remove {
        node: Node,
    },
    Edit {
        old_node: Node,
        node: Node,
    },
    /// A change beneath an existing parent row, scoped to one relationship.
    Child {
        row: Row,
        relationship: String,
        change: Box<Change>,
    },
}

impl Change {
    pub fn add(row: Row) -> Change {
        Change::Add {
            node: Node::leaf(row),
        }
    }

    pub fn remove(row: Row) -> Change {
        Change::Remove {
            node: Node::leaf(row),
        }
    }

    pub fn edit(old_row: Row, row: Row) -> Change {
        Change::Edit {
            old_node: Node::leaf(old_row),
            node: Node::leaf(row),
        }
    }

    /// The row this change is keyed on at the current level.
    pub fn row(&self) -> &Row {
        match self {
            Change::Add { node } => &node.row,
            Change::Remove { node } => &node.row,
            Change::Edit { node, .. } => &node.row,
            Change::Child { row, .. } => row,
        }
    }
}

/// Restriction of one column to a single value, used by join probes and
/// constraint propagation.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub column: String,
    pub value: Value,
}

impl Constraint {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Constraint {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Where iteration starts relative to a row the caller already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBasis {
    At,
    After,
    Before,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Start {
    pub row: Row,
    pub basis: StartBasis,
}

/// A fetch request against an operator or source connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    pub constraint: Option<Constraint>,
    pub start: Option<Start>,
    pub reverse: bool,
}

impl FetchRequest {
    pub fn unconstrained() -> FetchRequest {
        FetchRequest::default()
    }

    pub fn constrained(column: impl Into<String>, value: impl Into<Value>) -> FetchRequest {
        FetchRequest {
            constraint: Some(Constraint::new(column, value)),
            start: None,
            reverse: false,
        }
    }
}

/// A stream of fetched nodes interleaved with cooperative `Yield`s.
pub type NodeStream<'a> = Box<dyn Iterator<Item = Result<FetchItem, LiteTrickleError>> + 'a>;

/// Downstream endpoint receiving pushed changes.
pub trait Output {
    fn push(&self, change: Change) -> Result<(), LiteTrickleError>;
}

/// Upstream endpoint an operator pulls from and subscribes to.
///
/// Dyn-safe so operators can be boxed behind an output pointer; the set of
/// concrete operators is open.
pub trait Input {
    /// Schema of the table this subtree is rooted on.
    fn schema(&self) -> Rc<TableSchema>;

    /// The (PK-complete) sort this subtree emits in.
    fn sort(&self) -> &SortSpec;

    fn fetch(&self, req: FetchRequest) -> Result<NodeStream<'_>, LiteTrickleError>;

    fn set_output(&self, output: Rc<dyn Output>);

    /// Tear down this subtree's subscription. Destroying twice is a
    /// programmer error.
    fn destroy(&self) -> Result<(), LiteTrickleError>;

    /// True iff every filter the caller handed down was applied upstream,
    /// with nothing left for in-memory evaluation.
    fn fully_applied_filters(&self) -> bool;
}

/// Drain a stream to completion, dropping `Yield` sentinels. For callers
/// that need all nodes at once (join probes, existence tests).
pub fn drain(stream: NodeStream<'_>) -> Result<Vec<Node>, LiteTrickleError> {
    let mut nodes = Vec::new();
    for item in stream {
        if let FetchItem::Node(node) = item? {
            nodes.push(node);
        }
    }
    Ok(nodes)
}

/// Drain at most `limit` nodes from a stream.
pub fn drain_up_to(stream: NodeStream<'_>, limit: usize) -> Result<Vec<Node>, LiteTrickleError> {
    let mut nodes = Vec::new();
    for item in stream {
        if let FetchItem::Node(node) = item? {
            nodes.push(node);
            if nodes.len() >= limit {
                break;
            }
        }
    }
    Ok(nodes)
}
