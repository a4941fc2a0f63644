//! Grid manager: owns the price lattice and each level's cycle state

use log::{info, warn};
use tokio::sync::RwLock;

use crate::config::{GridSettings, SpacingType, StrategyType};
use crate::errors::{BotError, BotResult};
use crate::order::{OrderSide, PerpOrder};

use super::level::{CycleState, GridLevel, LevelId};

/// Direction of a level pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingType {
    Buy,
    Sell,
}

/// Owns the lattice: computes levels, tracks per-level cycle state, pairs
/// levels and decides placement eligibility.
///
/// Levels live in an arena indexed by [`LevelId`] (ascending by price), so
/// the paired cross-references are plain indices. All mutations go through
/// the manager; the arena sits behind a single lock.
pub struct GridManager {
    strategy_type: StrategyType,
    leverage: f64,
    maintenance_margin_ratio: f64,
    grid_value: f64,
    max_placed_orders: usize,
    reversion_price: f64,
    central_price: f64,
    /// Level prices, ascending; immutable after construction
    prices: Vec<f64>,
    /// Buy-eligible projection, ascending
    sorted_buy_ids: Vec<LevelId>,
    /// Sell-eligible projection, ascending
    sorted_sell_ids: Vec<LevelId>,
    levels: RwLock<Vec<GridLevel>>,
}

/// Maintenance margin ratio applied to order sizing
const DEFAULT_MAINTENANCE_MARGIN_RATIO: f64 = 0.01;

impl GridManager {
    pub fn new(settings: &GridSettings, leverage: f64) -> BotResult<Self> {
        if settings.reversion_price <= 0.0 {
            return Err(BotError::InvalidConfig(
                "reversion_price must be positive".into(),
            ));
        }
        if settings.grid_ratio <= 0.0 || settings.grid_ratio >= 1.0 {
            return Err(BotError::InvalidConfig(
                "grid_ratio must be in (0, 1)".into(),
            ));
        }
        if settings.num_grids < 2 {
            return Err(BotError::InvalidConfig("num_grids must be at least 2".into()));
        }
        if settings.grid_value <= 0.0 {
            return Err(BotError::InvalidConfig("grid_value must be positive".into()));
        }
        if leverage < 1.0 {
            return Err(BotError::InvalidConfig("leverage must be at least 1".into()));
        }

        let prices = Self::calculate_price_grids(settings, leverage);
        let central_price = Self::calculate_central_price(&prices, settings.spacing_type);
        let n = prices.len();

        let (levels, sorted_buy_ids, sorted_sell_ids) = match settings.strategy_type {
            StrategyType::SimpleGrid => {
                let levels: Vec<GridLevel> = prices
                    .iter()
                    .enumerate()
                    .map(|(i, &price)| {
                        let state = if price <= central_price {
                            CycleState::ReadyToBuy
                        } else {
                            CycleState::ReadyToSell
                        };
                        GridLevel::new(LevelId(i), price, state)
                    })
                    .collect();
                let buys = levels
                    .iter()
                    .filter(|l| l.price <= central_price)
                    .map(|l| l.id)
                    .collect();
                let sells = levels
                    .iter()
                    .filter(|l| l.price > central_price)
                    .map(|l| l.id)
                    .collect();
                (levels, buys, sells)
            }
            StrategyType::HedgedGrid => {
                let levels: Vec<GridLevel> = prices
                    .iter()
                    .enumerate()
                    .map(|(i, &price)| {
                        let state = if i == n - 1 {
                            CycleState::ReadyToSell
                        } else {
                            CycleState::ReadyToBuyOrSell
                        };
                        GridLevel::new(LevelId(i), price, state)
                    })
                    .collect();
                let buys = (0..n - 1).map(LevelId).collect();
                let sells = (1..n).map(LevelId).collect();
                (levels, buys, sells)
            }
        };

        info!(
            "Grid initialized: {} levels [{:.4} .. {:.4}], central={:.4}, reversion={:.4}",
            n,
            prices.first().copied().unwrap_or(0.0),
            prices.last().copied().unwrap_or(0.0),
            central_price,
            settings.reversion_price
        );

        Ok(Self {
            strategy_type: settings.strategy_type,
            leverage,
            maintenance_margin_ratio: DEFAULT_MAINTENANCE_MARGIN_RATIO,
            grid_value: settings.grid_value,
            max_placed_orders: settings.max_placed_orders,
            reversion_price: settings.reversion_price,
            central_price,
            prices,
            sorted_buy_ids,
            sorted_sell_ids,
            levels: RwLock::new(levels),
        })
    }

    /// Compute the lattice prices. The top of range is the reversion price,
    /// the bottom is `reversion · (1 − ratio)ⁿ`.
    fn calculate_price_grids(settings: &GridSettings, leverage: f64) -> Vec<f64> {
        let n = settings.num_grids;
        let ratio = settings.grid_ratio;
        let top = settings.reversion_price;
        let bottom = top * (1.0 - ratio).powi(n as i32);

        match settings.spacing_type {
            SpacingType::Arithmetic => {
                // Spacing widens with leverage to keep fills apart under risk
                let spacing = (top - bottom) / (n - 1) as f64 * (1.0 + (leverage - 1.0) * 0.1);
                (0..n).map(|i| bottom + i as f64 * spacing).collect()
            }
            SpacingType::Geometric => {
                // The range floor seeds the progression; the lowest placed
                // level sits one ratio step above it.
                let mut price = bottom / (1.0 - ratio);
                let mut grids = Vec::with_capacity(n);
                for _ in 0..n {
                    grids.push(price);
                    price *= 1.0 + ratio;
                }
                grids
            }
        }
    }

    /// The price that splits buy-eligible from sell-eligible levels
    fn calculate_central_price(prices: &[f64], spacing: SpacingType) -> f64 {
        match spacing {
            SpacingType::Arithmetic => (prices[0] + prices[prices.len() - 1]) / 2.0,
            SpacingType::Geometric => {
                let mid = prices.len() / 2;
                if prices.len() % 2 == 0 {
                    (prices[mid - 1] + prices[mid]) / 2.0
                } else {
                    prices[mid]
                }
            }
        }
    }

    pub fn strategy_type(&self) -> StrategyType {
        self.strategy_type
    }

    pub fn reversion_price(&self) -> f64 {
        self.reversion_price
    }

    pub fn central_price(&self) -> f64 {
        self.central_price
    }

    pub fn num_levels(&self) -> usize {
        self.prices.len()
    }

    pub fn max_placed_orders(&self) -> usize {
        self.max_placed_orders
    }

    pub fn price_of(&self, id: LevelId) -> f64 {
        self.prices[id.0]
    }

    /// All lattice prices, ascending
    pub fn prices(&self) -> &[f64] {
        &self.prices
    }

    /// Buy-eligible projection, ascending by price
    pub fn sorted_buy_ids(&self) -> &[LevelId] {
        &self.sorted_buy_ids
    }

    /// Sell-eligible projection, ascending by price
    pub fn sorted_sell_ids(&self) -> &[LevelId] {
        &self.sorted_sell_ids
    }

    pub async fn state_of(&self, id: LevelId) -> CycleState {
        self.levels.read().await[id.0].state
    }

    /// Snapshot of a level for display and tests
    pub async fn level_snapshot(&self, id: LevelId) -> GridLevel {
        self.levels.read().await[id.0].clone()
    }

    /// Whether the level's state permits placing an order of this side
    pub async fn can_place(&self, id: LevelId, side: OrderSide) -> bool {
        let levels = self.levels.read().await;
        Self::can_place_in(&levels, self.strategy_type, id, side)
    }

    fn can_place_in(
        levels: &[GridLevel],
        strategy_type: StrategyType,
        id: LevelId,
        side: OrderSide,
    ) -> bool {
        let state = levels[id.0].state;
        match strategy_type {
            StrategyType::SimpleGrid => {
                if side.is_buy() {
                    state == CycleState::ReadyToBuy
                } else {
                    state == CycleState::ReadyToSell
                }
            }
            StrategyType::HedgedGrid => {
                if side.is_buy() {
                    matches!(state, CycleState::ReadyToBuy | CycleState::ReadyToBuyOrSell)
                } else {
                    matches!(state, CycleState::ReadyToSell | CycleState::ReadyToBuyOrSell)
                }
            }
        }
    }

    /// Append the order to the level history and move the level into the
    /// matching waiting state.
    pub async fn mark_pending(&self, id: LevelId, order: &PerpOrder) {
        let mut levels = self.levels.write().await;
        let level = &mut levels[id.0];
        level.add_order(order.identifier.clone());
        if order.side.is_buy() {
            level.state = CycleState::WaitingForBuyFill;
            info!("Buy order pending at grid level {:.4}", level.price);
        } else {
            level.state = CycleState::WaitingForSellFill;
            info!("Sell order pending at grid level {:.4}", level.price);
        }
    }

    /// Transition the level on a completed fill.
    pub async fn complete(&self, id: LevelId, side: OrderSide) {
        let mut levels = self.levels.write().await;
        match self.strategy_type {
            StrategyType::SimpleGrid => {
                let next = if side == OrderSide::BuyOpen {
                    CycleState::ReadyToSell
                } else {
                    CycleState::ReadyToBuy
                };
                levels[id.0].state = next;
                info!(
                    "Order completed at level {:.4}, transitioning to {:?}",
                    levels[id.0].price, next
                );
            }
            StrategyType::HedgedGrid => {
                levels[id.0].state = CycleState::ReadyToBuyOrSell;
                if side == OrderSide::BuyOpen {
                    if let Some(paired) = levels[id.0].paired_sell {
                        levels[paired.0].state = CycleState::ReadyToSell;
                        info!(
                            "Paired sell level {:.4} transitioned to ReadyToSell",
                            levels[paired.0].price
                        );
                    }
                } else if let Some(paired) = levels[id.0].paired_buy {
                    levels[paired.0].state = CycleState::ReadyToBuy;
                    info!(
                        "Paired buy level {:.4} transitioned to ReadyToBuy",
                        levels[paired.0].price
                    );
                }
            }
        }
    }

    /// Set the pairing cross-references consistently on both levels.
    pub async fn pair(&self, source: LevelId, target: LevelId, pairing: PairingType) {
        let mut levels = self.levels.write().await;
        match pairing {
            PairingType::Buy => {
                levels[source.0].paired_buy = Some(target);
                levels[target.0].paired_sell = Some(source);
            }
            PairingType::Sell => {
                levels[source.0].paired_sell = Some(target);
                levels[target.0].paired_buy = Some(source);
            }
        }
    }

    /// The sell level that should harvest a fill on `buy_id`.
    ///
    /// Simple layout: the lowest eligible sell level strictly above the buy
    /// price. Hedged layout: the level immediately above in sort order.
    pub async fn paired_sell_level(&self, buy_id: LevelId) -> Option<LevelId> {
        let levels = self.levels.read().await;
        let buy_price = levels[buy_id.0].price;
        match self.strategy_type {
            StrategyType::SimpleGrid => {
                for &sell_id in &self.sorted_sell_ids {
                    if !Self::can_place_in(&levels, self.strategy_type, sell_id, OrderSide::SellClose)
                    {
                        continue;
                    }
                    if levels[sell_id.0].price > buy_price {
                        return Some(sell_id);
                    }
                }
                warn!("No eligible sell level above {:.4}", buy_price);
                None
            }
            StrategyType::HedgedGrid => {
                if buy_id.0 + 1 < self.prices.len() {
                    Some(LevelId(buy_id.0 + 1))
                } else {
                    warn!("No sell level above {:.4}", buy_price);
                    None
                }
            }
        }
    }

    /// The buy level paired with a fill on `sell_id`: the stored pairing
    /// when it is still eligible, else the level immediately below.
    pub async fn paired_buy_level(&self, sell_id: LevelId) -> Option<LevelId> {
        let levels = self.levels.read().await;
        if let Some(paired) = levels[sell_id.0].paired_buy {
            if Self::can_place_in(&levels, self.strategy_type, paired, OrderSide::BuyOpen) {
                return Some(paired);
            }
        }
        drop(levels);
        self.level_below(sell_id)
    }

    /// The level immediately below in price order
    pub fn level_below(&self, id: LevelId) -> Option<LevelId> {
        if id.0 > 0 {
            Some(LevelId(id.0 - 1))
        } else {
            None
        }
    }

    /// Notional to buy when seeding the base position: the per-grid value
    /// summed over every level strictly above the current price.
    pub fn initial_quantity(&self, current_price: f64) -> f64 {
        let count = self.prices.iter().filter(|&&p| p > current_price).count();
        count as f64 * self.grid_value
    }

    /// Contract quantity for one grid order given the margin budget.
    pub fn order_size(&self, total_margin: f64, current_price: f64) -> f64 {
        let margin_per_grid = total_margin / self.prices.len() as f64;
        let max_size = margin_per_grid * self.leverage / current_price;
        max_size * (1.0 - self.maintenance_margin_ratio)
    }
}
