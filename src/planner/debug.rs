//! Planner debug events.
//!
//! When a debugger is attached the planner emits an order-preserving stream
//! of tagged events carrying every input needed to replay its decisions.
//! The accumulator collects them for the analyzer's `joinPlans` output.

use std::cell::RefCell;

use serde::Serialize;

use crate::planner::cost::CostEstimate;

/// One tagged planner event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PlanEvent {
    #[serde(rename_all = "camelCase")]
    AttemptStart { pattern: u64 },
    #[serde(rename_all = "camelCase")]
    ConnectionCosts {
        table: String,
        estimate: CostEstimate,
    },
    #[serde(rename_all = "camelCase")]
    ConstraintsPropagated { pattern: u64, count: usize },
    #[serde(rename_all = "camelCase")]
    ConnectionSelected { table: String },
    #[serde(rename_all = "camelCase")]
    PlanComplete { pattern: u64, total_cost: f64 },
    #[serde(rename_all = "camelCase")]
    PlanFailed { pattern: u64, reason: String },
    #[serde(rename_all = "camelCase")]
    NodeCost {
        table: String,
        estimate: CostEstimate,
        accumulated_rows: f64,
    },
    #[serde(rename_all = "camelCase")]
    NodeConstraint {
        table: String,
        column: String,
        /// The node that pinned this constraint.
        source: String,
    },
    #[serde(rename_all = "camelCase")]
    BestPlanSelected { pattern: u64, total_cost: f64 },
}

/// Receiver for planner events.
pub trait PlanDebugger {
    fn event(&self, event: PlanEvent);
}

/// A debugger that accumulates events in order for later serialisation.
#[derive(Debug, Default)]
pub struct AccumulatorDebugger {
    events: RefCell<Vec<PlanEvent>>,
}

impl AccumulatorDebugger {
    pub fn new() -> Self {
        AccumulatorDebugger::default()
    }

    pub fn events(&self) -> Vec<PlanEvent> {
        self.events.borrow().clone()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.events.borrow().clone()).unwrap_or(serde_json::Value::Null)
    }
}

impl PlanDebugger for AccumulatorDebugger {
    fn event(&self, event: PlanEvent) {
        self.events.borrow_mut().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimate() -> CostEstimate {
        CostEstimate {
            startup_cost: 1.0,
            scan_est: 10.0,
            cost: 11.0,
            returned_rows: 10.0,
            selectivity: 0.1,
            limit: None,
        }
    }

    #[test]
    fn test_events_preserve_order() {
        let dbg = AccumulatorDebugger::new();
        dbg.event(PlanEvent::AttemptStart { pattern: 0 });
        dbg.event(PlanEvent::PlanComplete {
            pattern: 0,
            total_cost: 12.5,
        });
        dbg.event(PlanEvent::BestPlanSelected {
            pattern: 0,
            total_cost: 12.5,
        });
        let events = dbg.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], PlanEvent::AttemptStart { .. }));
        assert!(matches!(events[2], PlanEvent::BestPlanSelected { .. }));
    }

    #[test]
    fn test_event_wire_tags_are_kebab_case() {
        let json = serde_json::to_value(PlanEvent::AttemptStart { pattern: 3 }).unwrap();
        assert_eq!(json["type"], "attempt-start");
        assert_eq!(json["pattern"], 3);

        let json = serde_json::to_value(PlanEvent::BestPlanSelected {
            pattern: 1,
            total_cost: 4.0,
        })
        .unwrap();
        assert_eq!(json["type"], "best-plan-selected");
        assert_eq!(json["totalCost"], 4.0);

        let json = serde_json::to_value(PlanEvent::NodeConstraint {
            table: "issues".into(),
            column: "user_id".into(),
            source: "users".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "node-constraint");
    }

    #[test]
    fn test_connection_costs_embed_estimate() {
        let json = serde_json::to_value(PlanEvent::ConnectionCosts {
            table: "users".into(),
            estimate: estimate(),
        })
        .unwrap();
        assert_eq!(json["estimate"]["startupCost"], 1.0);
        assert_eq!(json["estimate"]["returnedRows"], 10.0);
    }
}
