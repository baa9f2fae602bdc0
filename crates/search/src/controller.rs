//! Filter Controller: owns the active criteria and the derived matched-id set.

#![forbid(unsafe_code)]

use crcwatch_core::{CrcId, Snapshot};
use serde::Serialize;
use tracing::info;

use crate::{FilterCriteria, FilterDebugInfo, MatchedSet};

/// What the cancel buttons act on under the current filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CancelScope {
    All,
    Plan(String),
    /// Matched ids; the plan, when present, is context for the server.
    Filtered { crc_ids: Vec<CrcId>, plan_name: Option<String> },
}

impl CancelScope {
    /// Scope of a cancel button: `plan` picks a plan's button, `None` the
    /// global one. An active filter narrows either to the matched ids.
    pub fn for_filter(active: bool, matched: &MatchedSet, plan: Option<&str>) -> Self {
        match (active, plan) {
            (true, plan) => CancelScope::Filtered { crc_ids: matched.ids().to_vec(), plan_name: plan.map(str::to_string) },
            (false, Some(plan)) => CancelScope::Plan(plan.to_string()),
            (false, None) => CancelScope::All,
        }
    }

    /// Button label for this scope.
    pub fn label(&self) -> &'static str {
        match self {
            CancelScope::All => "Cancel all",
            CancelScope::Plan(_) => "Cancel plan",
            CancelScope::Filtered { plan_name: None, .. } => "Cancel all (filtered)",
            CancelScope::Filtered { plan_name: Some(_), .. } => "Cancel plan (filtered)",
        }
    }
}

/// Criteria plus the matched set they produced on the latest snapshot.
///
/// With trivial criteria every id of the snapshot is matched and the cancel
/// buttons keep their un-scoped meaning.
#[derive(Debug, Default)]
pub struct FilterController {
    criteria: FilterCriteria,
    matched: MatchedSet,
    debug: FilterDebugInfo,
}

impl FilterController {
    pub fn new() -> Self { Self::default() }

    pub fn criteria(&self) -> &FilterCriteria { &self.criteria }
    pub fn matched(&self) -> &MatchedSet { &self.matched }
    pub fn debug(&self) -> &FilterDebugInfo { &self.debug }

    /// A non-trivial filter is in effect.
    pub fn is_active(&self) -> bool { !self.criteria.is_trivial() }

    /// Replace the criteria and recompute against `snap`.
    pub fn apply_filter(&mut self, criteria: FilterCriteria, snap: &Snapshot) -> &MatchedSet {
        self.criteria = criteria;
        self.recompute(snap);
        info!(active = self.is_active(), matched = self.matched.len(), total = snap.len(), "filter: applied");
        &self.matched
    }

    /// Drop every criterion; all rows become visible again.
    pub fn clear(&mut self, snap: &Snapshot) {
        self.criteria = FilterCriteria::default();
        self.recompute(snap);
        info!(total = snap.len(), "filter: cleared");
    }

    /// Recompute for a fresh snapshot.
    pub fn on_snapshot(&mut self, snap: &Snapshot) -> &MatchedSet {
        self.recompute(snap);
        &self.matched
    }

    fn recompute(&mut self, snap: &Snapshot) {
        if self.is_active() {
            let (matched, dbg) = self.criteria.evaluate(snap);
            self.matched = matched;
            self.debug = dbg;
        } else {
            self.matched = MatchedSet::everything(snap);
            let n = snap.len();
            self.debug = FilterDebugInfo {
                total: n,
                after_testcase: n,
                after_testplan: n,
                after_configuration: n,
                after_state: n,
                after_result: n,
                after_workflow: n,
            };
        }
    }

    /// Row visibility is membership in the matched set.
    pub fn is_visible(&self, id: &str) -> bool {
        self.matched.contains(id)
    }

    /// Scope of the "cancel all" button.
    pub fn cancel_all_scope(&self) -> CancelScope {
        CancelScope::for_filter(self.is_active(), &self.matched, None)
    }

    /// Scope of a plan's cancel button. Under a filter the whole matched set is
    /// sent; the server narrows it to the plan.
    pub fn cancel_plan_scope(&self, plan: &str) -> CancelScope {
        CancelScope::for_filter(self.is_active(), &self.matched, Some(plan))
    }
}
