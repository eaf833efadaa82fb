//! The join planner.
//!
//! Turns a subquery-normalised AST into an operator tree that minimises
//! expected cost. The planner does not rewrite predicates; it only orders
//! joins and picks drive sides:
//!
//! 1. Enumerate **flip patterns**: a bitmask over join sites deciding, for
//!    each, which side drives. Related and `NOT EXISTS` sites are
//!    unflippable; `EXISTS` (semi) sites may flip.
//! 2. For each attempt, propagate constraints top-down from filters and
//!    join correlations to connections, price every connection with the
//!    cost model, and sum `startup + returnedRowsOfParent × cost` down the
//!    branch.
//! 3. Select the minimum-cost attempt; ties break toward the smaller
//!    bitmask so plans are stable for debugging.
//!
//! An attempt whose mandatory constraints cannot be met (a flipped probe
//! with no index on the probed column) is reported as `plan-failed` rather
//! than raising; the planner raises only when no attempt passes.

pub mod cost;
pub mod debug;

use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::debug;

use crate::ast::{Ast, CompareOp, Condition, ExistsOp, Operand, conjunction_of};
use crate::error::LiteTrickleError;
use crate::ivm::Input;
use crate::ivm::operators::fan::{FanIn, FanOut};
use crate::ivm::operators::filter::FilterOperator;
use crate::ivm::operators::join::{JoinKind, JoinOperator};
use crate::ivm::operators::take::TakeOperator;
use crate::ivm::operators::terminus::Terminus;
use crate::ivm::source::{ConnectOptions, TableSource};
use crate::planner::cost::CostModel;
use crate::planner::debug::{PlanDebugger, PlanEvent};
use crate::schema::SortSpec;

/// Vends (memoised) sources to the pipeline builder.
pub trait SourceProvider {
    fn get_source(&self, table: &str) -> Result<Rc<TableSource>, LiteTrickleError>;
}

/// The outcome of planning: the chosen flip pattern and its cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub pattern: u64,
    pub total_cost: f64,
    pub attempts_explored: usize,
}

impl Plan {
    /// The trivial plan used when no cost model is attached: nothing flips.
    pub fn unflipped() -> Plan {
        Plan {
            pattern: 0,
            total_cost: 0.0,
            attempts_explored: 0,
        }
    }
}

// ── Join sites ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum SiteKind {
    Related,
    Semi,
    Anti,
}

/// One join in the AST, flattened for enumeration. `EXISTS` conjuncts come
/// first (in syntactic order), then related clauses; pattern bit `i`
/// corresponds to site `i`.
#[derive(Debug, Clone)]
struct JoinSite {
    parent_key: String,
    child_key: String,
    child_ast: Ast,
    kind: SiteKind,
    relationship: Option<String>,
}

impl JoinSite {
    fn flippable(&self) -> bool {
        self.kind == SiteKind::Semi
    }
}

/// Split a WHERE clause into its subquery-free part and its top-level
/// existence conjuncts. `EXISTS` anywhere else is not plannable.
fn decompose_where(
    where_clause: Option<Condition>,
) -> Result<(Option<Condition>, Vec<Condition>), LiteTrickleError> {
    let Some(cond) = where_clause else {
        return Ok((None, Vec::new()));
    };
    match cond {
        Condition::Exists { .. } => Ok((None, vec![cond])),
        Condition::And { conditions } => {
            let mut plain = Vec::new();
            let mut exists = Vec::new();
            for c in conditions {
                if matches!(c, Condition::Exists { .. }) {
                    exists.push(c);
                } else if c.is_subquery_free() {
                    plain.push(c);
                } else {
                    return Err(LiteTrickleError::InvalidQuery(
                        "EXISTS may only appear as a top-level conjunct".into(),
                    ));
                }
            }
            Ok((conjunction_of(plain), exists))
        }
        c if c.is_subquery_free() => Ok((Some(c), Vec::new())),
        _ => Err(LiteTrickleError::InvalidQuery(
            "EXISTS may only appear as a top-level conjunct".into(),
        )),
    }
}

fn analyze_ast(ast: &Ast) -> Result<(Option<Condition>, Vec<JoinSite>), LiteTrickleError> {
    let (plain, exists_conds) = decompose_where(ast.where_clause.clone())?;
    let mut sites = Vec::new();
    for cond in exists_conds {
        if let Condition::Exists {
            correlation,
            subquery,
            op,
        } = cond
        {
            sites.push(JoinSite {
                parent_key: correlation.parent_field,
                child_key: correlation.child_field,
                child_ast: *subquery,
                kind: match op {
                    ExistsOp::Exists => SiteKind::Semi,
                    ExistsOp::NotExists => SiteKind::Anti,
                },
                relationship: None,
            });
        }
    }
    if let Some(related) = &ast.related {
        for clause in related {
            sites.push(JoinSite {
                parent_key: clause.correlation.parent_field.clone(),
                child_key: clause.correlation.child_field.clone(),
                child_ast: clause.subquery.clone(),
                kind: SiteKind::Related,
                relationship: Some(clause.relationship().to_string()),
            });
        }
    }
    Ok((plain, sites))
}

/// Columns pinned to a single value by top-level equality filters.
fn equality_columns(condition: Option<&Condition>) -> Vec<String> {
    match condition {
        None => Vec::new(),
        Some(Condition::Simple {
            left: Operand::Column { name },
            op: CompareOp::Eq,
            right: Operand::Literal { .. },
        }) => vec![name.clone()],
        Some(Condition::And { conditions }) => conditions
            .iter()
            .flat_map(|c| equality_columns(Some(c)))
            .collect(),
        Some(_) => Vec::new(),
    }
}

// ── The planner ────────────────────────────────────────────────────────────

enum AttemptOutcome {
    Passed(f64),
    Failed(String),
}

pub struct Planner<'a> {
    pub cost_model: Option<&'a dyn CostModel>,
    pub debugger: Option<&'a dyn PlanDebugger>,
    /// Cap on explored flip patterns; the best seen so far wins beyond it.
    pub max_attempts: usize,
}

impl<'a> Planner<'a> {
    pub fn new(cost_model: Option<&'a dyn CostModel>) -> Self {
        Planner {
            cost_model,
            debugger: None,
            max_attempts: 1024,
        }
    }

    pub fn with_debugger(mut self, debugger: &'a dyn PlanDebugger) -> Self {
        self.debugger = Some(debugger);
        self
    }

    fn emit(&self, event: PlanEvent) {
        if let Some(debugger) = self.debugger {
            debugger.event(event);
        }
    }

    /// Choose a flip pattern for `ast`. Without a cost model the trivial
    /// unflipped plan is returned.
    pub fn plan(&self, ast: &Ast) -> Result<Plan, LiteTrickleError> {
        let (plain, sites) = analyze_ast(ast)?;
        let Some(cost_model) = self.cost_model else {
            return Ok(Plan::unflipped());
        };

        let flippable: Vec<usize> = sites
            .iter()
            .enumerate()
            .filter(|(_, s)| s.flippable())
            .map(|(i, _)| i)
            .collect();
        let combos: usize = 1 << flippable.len().min(20);

        let mut best: Option<(f64, u64)> = None;
        let mut explored = 0usize;
        for combo in 0..combos {
            if explored >= self.max_attempts {
                break;
            }
            explored += 1;
            let mut pattern = 0u64;
            for (bit, site_index) in flippable.iter().enumerate() {
                if combo & (1 << bit) != 0 {
                    pattern |= 1 << site_index;
                }
            }
            match self.cost_attempt(ast, plain.as_ref(), &sites, pattern, cost_model)? {
                AttemptOutcome::Passed(total_cost) => {
                    self.emit(PlanEvent::PlanComplete {
                        pattern,
                        total_cost,
                    });
                    let better = match best {
                        None => true,
                        Some((best_cost, best_pattern)) => {
                            total_cost < best_cost
                                || (total_cost == best_cost && pattern < best_pattern)
                        }
                    };
                    if better {
                        best = Some((total_cost, pattern));
                    }
                }
                AttemptOutcome::Failed(reason) => {
                    self.emit(PlanEvent::PlanFailed { pattern, reason });
                }
            }
        }

        let Some((total_cost, pattern)) = best else {
            return Err(LiteTrickleError::PlanningFailed(
                "no flip pattern satisfied the mandatory constraints".into(),
            ));
        };
        self.emit(PlanEvent::BestPlanSelected {
            pattern,
            total_cost,
        });
        debug!(pattern, total_cost, explored, "plan selected");
        Ok(Plan {
            pattern,
            total_cost,
            attempts_explored: explored,
        })
    }

    fn cost_attempt(
        &self,
        ast: &Ast,
        plain: Option<&Condition>,
        sites: &[JoinSite],
        pattern: u64,
        cost_model: &dyn CostModel,
    ) -> Result<AttemptOutcome, LiteTrickleError> {
        self.emit(PlanEvent::AttemptStart { pattern });
        let root = &ast.table;

        // Constraint propagation: a correlation pins the probed side's
        // connection constraint to the driving side's key column.
        let root_constraints = equality_columns(plain);
        let mut propagated = 0usize;
        for (i, site) in sites.iter().enumerate() {
            let flipped = pattern & (1 << i) != 0;
            if flipped {
                self.emit(PlanEvent::NodeConstraint {
                    table: root.clone(),
                    column: site.parent_key.clone(),
                    source: site.child_ast.table.clone(),
                });
            } else {
                self.emit(PlanEvent::NodeConstraint {
                    table: site.child_ast.table.clone(),
                    column: site.child_key.clone(),
                    source: root.clone(),
                });
            }
            propagated += 1;
        }
        self.emit(PlanEvent::ConstraintsPropagated {
            pattern,
            count: propagated,
        });

        let all_flipped =
            !sites.is_empty() && (0..sites.len()).all(|i| pattern & (1 << i) != 0);
        let drive_table = if all_flipped {
            sites[0].child_ast.table.clone()
        } else {
            root.clone()
        };
        self.emit(PlanEvent::ConnectionSelected { table: drive_table });

        let root_est = cost_model.estimate(root, &root_constraints, plain, ast.limit)?;
        self.emit(PlanEvent::ConnectionCosts {
            table: root.clone(),
            estimate: root_est.clone(),
        });

        let mut total = 0.0;
        if !all_flipped {
            self.emit(PlanEvent::NodeCost {
                table: root.clone(),
                estimate: root_est.clone(),
                accumulated_rows: 1.0,
            });
            total += root_est.startup_cost + root_est.cost;
        }

        for (i, site) in sites.iter().enumerate() {
            let flipped = pattern & (1 << i) != 0;
            let child_table = &site.child_ast.table;
            let child_filters = site.child_ast.where_clause.as_ref();
            if flipped {
                // Mandatory constraint: a flipped probe needs an index on
                // the probed (parent) column.
                if !cost_model.column_indexed(root, &site.parent_key)? {
                    return Ok(AttemptOutcome::Failed(format!(
                        "flipped join probe on {root}.{} has no index",
                        site.parent_key
                    )));
                }
                let child_est = cost_model.estimate(child_table, &[], child_filters, None)?;
                self.emit(PlanEvent::ConnectionCosts {
                    table: child_table.clone(),
                    estimate: child_est.clone(),
                });
                self.emit(PlanEvent::NodeCost {
                    table: child_table.clone(),
                    estimate: child_est.clone(),
                    accumulated_rows: 1.0,
                });
                let probe_est =
                    cost_model.estimate(root, &[site.parent_key.clone()], plain, None)?;
                self.emit(PlanEvent::NodeCost {
                    table: root.clone(),
                    estimate: probe_est.clone(),
                    accumulated_rows: child_est.returned_rows,
                });
                total += child_est.startup_cost + child_est.cost;
                total += probe_est.startup_cost + child_est.returned_rows * probe_est.cost;
            } else {
                let child_est = cost_model.estimate(
                    child_table,
                    &[site.child_key.clone()],
                    child_filters,
                    None,
                )?;
                self.emit(PlanEvent::ConnectionCosts {
                    table: child_table.clone(),
                    estimate: child_est.clone(),
                });
                self.emit(PlanEvent::NodeCost {
                    table: child_table.clone(),
                    estimate: child_est.clone(),
                    accumulated_rows: root_est.returned_rows,
                });
                total += child_est.startup_cost + root_est.returned_rows * child_est.cost;
            }
        }
        Ok(AttemptOutcome::Passed(total))
    }
}

// ── Pipeline construction ──────────────────────────────────────────────────

/// A built operator tree, rooted at its terminus.
pub struct Pipeline {
    pub terminus: Rc<Terminus>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn destroy(&self) -> Result<(), LiteTrickleError> {
        self.terminus.destroy()
    }
}

/// Materialise the operator tree for `ast` under `plan`.
pub fn build_pipeline(
    host: &dyn SourceProvider,
    ast: &Ast,
    plan: &Plan,
) -> Result<Pipeline, LiteTrickleError> {
    let input = build_input(host, ast, plan.pattern, true, &[])?;
    Ok(Pipeline {
        terminus: Terminus::connect(input),
    })
}

fn build_input(
    host: &dyn SourceProvider,
    ast: &Ast,
    pattern: u64,
    is_root: bool,
    extra_split_keys: &[String],
) -> Result<Rc<dyn Input>, LiteTrickleError> {
    if !is_root && ast.limit.is_some() {
        return Err(LiteTrickleError::InvalidQuery(
            "limit inside related subqueries is not supported".into(),
        ));
    }
    let source = host.get_source(&ast.table)?;
    let schema = source.schema();
    let (plain, sites) = analyze_ast(ast)?;

    for site in &sites {
        if !schema.has_column(&site.parent_key) {
            return Err(LiteTrickleError::UnknownColumn {
                table: schema.name.clone(),
                column: site.parent_key.clone(),
            });
        }
    }

    // Sort keys, join keys, and caller-correlated keys all force edits to
    // split so rows never move in place downstream.
    let declared = ast.declared_order().to_vec();
    let completed = SortSpec::complete(&declared, &schema);
    let mut split_keys: BTreeSet<String> = completed.columns().cloned().collect();
    split_keys.extend(extra_split_keys.iter().cloned());
    for site in &sites {
        split_keys.insert(site.parent_key.clone());
    }

    // A semi/anti join may suppress parent rows after the source fetch, so
    // the limit can only be pushed down when none is present.
    let has_existence_site = sites.iter().any(|s| s.kind != SiteKind::Related);
    let limit_hint = if is_root && !has_existence_site {
        ast.limit
    } else {
        None
    };

    let connection = source.connect(ConnectOptions {
        sort: declared,
        filters: plain.clone(),
        split_edit_keys: Some(split_keys),
        limit_hint,
    })?;
    let mut current: Rc<dyn Input> = connection;

    // Push-path filtering. A disjunction fans out into one branch per arm
    // and re-merges; anything else is a single filter operator.
    if let Some(plain_cond) = &plain {
        match plain_cond {
            Condition::Or { conditions } if conditions.len() > 1 => {
                let fan_out = FanOut::connect(current);
                let mut branches: Vec<Rc<dyn Input>> = Vec::new();
                for arm in conditions {
                    branches
                        .push(FilterOperator::connect(fan_out.clone(), arm.clone())?
                            as Rc<dyn Input>);
                }
                current = FanIn::connect(fan_out, branches, Some(plain_cond.clone()))?;
            }
            _ => {
                current = FilterOperator::connect(current, plain_cond.clone())?;
            }
        }
    }

    for (i, site) in sites.iter().enumerate() {
        let child = build_input(host, &site.child_ast, 0, false, &[site.child_key.clone()])?;
        let flipped = is_root && site.kind == SiteKind::Semi && (pattern & (1 << i)) != 0;
        let kind = match &site.kind {
            SiteKind::Related => JoinKind::Related {
                relationship: site
                    .relationship
                    .clone()
                    .unwrap_or_else(|| site.child_ast.table.clone()),
            },
            SiteKind::Semi => JoinKind::Semi,
            SiteKind::Anti => JoinKind::Anti,
        };
        current = JoinOperator::connect(
            current,
            child,
            site.parent_key.clone(),
            site.child_key.clone(),
            kind,
            flipped,
        )?;
    }

    if is_root {
        if let Some(limit) = ast.limit {
            current = TakeOperator::connect(current, limit);
        }
    }
    Ok(current)
}
