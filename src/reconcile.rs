// ===============================
// src/reconcile.rs
// ===============================
//
// Diff state lokal vs open orders di venue. Id yang hilang dianggap fill
// (fill-or-cancel diperlakukan sebagai fill).
//
use crate::gateway::OpenOrderIds;
use crate::grid::GridState;
use crate::takeprofit::TpLadderState;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// At least one tracked TP id is gone from the book.
    pub tp_vanished: bool,
    /// Tracked grid ids no longer open, in placement order.
    pub filled_grid: Vec<String>,
}

impl Observation {
    pub fn grid_changed(&self) -> bool {
        !self.filled_grid.is_empty()
    }
}

pub fn observe(open: &OpenOrderIds, grid: &GridState, tp: &TpLadderState) -> Observation {
    Observation {
        tp_vanished: tp.order_ids.iter().any(|id| !open.contains(id)),
        filled_grid: grid.order_ids.iter().filter(|id| !open.contains(*id)).cloned().collect(),
    }
}

/// Drop filled ids so the same fill does not re-trigger a TP rebuild next tick.
pub fn prune_grid(grid: &mut GridState, filled: &[String]) {
    grid.order_ids.retain(|id| !filled.contains(id));
}
