//! lite_trickle — client-side reactive materialized views over SQLite.
//!
//! Clients declare queries as ASTs; the engine incrementally maintains the
//! result rows and pushes diffs. The core is the query execution and
//! planning machinery:
//!
//! - the incremental view maintenance (IVM) pipeline: SQLite-backed table
//!   sources, joins, filters, fan-out/fan-in, take, and the terminus, all
//!   speaking a two-way push/fetch protocol ([`ivm`]);
//! - the join planner: cost estimation, constraint propagation, and
//!   flip-pattern enumeration ([`planner`]);
//! - the analyze pipeline: running an AST against a SQLite replica and
//!   collecting read statistics, `EXPLAIN QUERY PLAN` output, and planner
//!   debug events ([`analyze`]);
//! - the mutation tracker: correlating optimistic client mutations with
//!   server acknowledgements from the sync stream ([`mutation`],
//!   [`protocol`]).
//!
//! # Theoretical Basis
//!
//! - **DBSP**: Budiu et al., "DBSP: Automatic Differential View Maintenance
//!   for Rich Query Languages", PVLDB 2023. <https://arxiv.org/abs/2203.16684>
//! - **Gupta & Mumick (1995)**: "Maintenance of Materialized Views:
//!   Problems, Techniques, and Applications", IEEE Data Engineering
//!   Bulletin.
//!
//! # Concurrency model
//!
//! Single-threaded cooperative: there are no background threads, and long
//! iterations surrender control by emitting a `Yield` sentinel which
//! callers must respect. Multiple pipeline instances may run on distinct
//! threads, each with its own SQLite connection and statement cache; they
//! must not share a `TableSource`.

pub mod analyze;
pub mod ast;
pub mod config;
pub mod error;
pub mod hash;
pub mod ivm;
pub mod mutation;
pub mod planner;
pub mod protocol;
pub mod row;
pub mod schema;
pub mod statement_cache;
pub mod timeslice;

pub use analyze::{AnalyzeOptions, AnalyzeResult, Analyzer, ClientSchema};
pub use ast::{Ast, CompareOp, Condition, Correlation, ExistsOp, Operand, RelatedClause};
pub use config::EngineConfig;
pub use error::{ErrorKind, LiteTrickleError, ProtocolError};
pub use ivm::source::{ConnectOptions, QueryStats, TableSource};
pub use ivm::{Change, FetchItem, FetchRequest, Input, Node, Output, Start, StartBasis};
pub use mutation::{MutationHandle, MutationOutcome, MutationTracker};
pub use planner::cost::{CostEstimate, CostModel, SqliteCostModel, UniformCostModel};
pub use planner::debug::{AccumulatorDebugger, PlanDebugger, PlanEvent};
pub use planner::{Plan, Planner, SourceProvider, build_pipeline};
pub use protocol::{Downstream, PokeDecoder, PushResponse};
pub use row::{Row, Value};
pub use schema::{ColumnSpec, ColumnType, Direction, SortSpec, TableSchema};
pub use statement_cache::StatementCache;
pub use timeslice::TimeSlice;
