//! Grid level: a single price step in the lattice

use serde::{Deserialize, Serialize};

/// Index of a level in the grid manager's arena.
///
/// Paired levels reference each other through ids rather than owning
/// pointers, so the cross-references stay cycle-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelId(pub usize);

/// Per-level lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleState {
    /// Level can take either side (hedged layout only)
    ReadyToBuyOrSell,
    ReadyToBuy,
    /// Buy order resting, waiting for the fill
    WaitingForBuyFill,
    ReadyToSell,
    /// Sell order resting, waiting for the fill
    WaitingForSellFill,
}

impl CycleState {
    /// True while a live order is attached to the level
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            CycleState::WaitingForBuyFill | CycleState::WaitingForSellFill
        )
    }
}

/// A price step in the lattice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub id: LevelId,
    pub price: f64,
    pub state: CycleState,
    /// Ordered ids of the orders that touched this level
    pub order_ids: Vec<String>,
    /// Paired buy level, set by the grid manager's pairing
    pub paired_buy: Option<LevelId>,
    /// Paired sell level, set by the grid manager's pairing
    pub paired_sell: Option<LevelId>,
}

impl GridLevel {
    pub fn new(id: LevelId, price: f64, state: CycleState) -> Self {
        Self {
            id,
            price,
            state,
            order_ids: Vec::new(),
            paired_buy: None,
            paired_sell: None,
        }
    }

    /// Record an order against this level
    pub fn add_order(&mut self, order_id: impl Into<String>) {
        self.order_ids.push(order_id.into());
    }

    /// The most recent order attached to this level
    pub fn latest_order_id(&self) -> Option<&str> {
        self.order_ids.last().map(|s| s.as_str())
    }
}
