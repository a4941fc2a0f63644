//! In-memory index of all orders, grouped by side and intent

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::grid::LevelId;

use super::types::{OrderIntent, OrderStatus, PerpOrder};

#[derive(Default)]
struct BookInner {
    /// Canonical storage, keyed by venue identifier
    orders: HashMap<String, PerpOrder>,
    /// Buy-to-open orders, insertion order
    long_open: Vec<String>,
    /// Sell-to-close orders
    long_close: Vec<String>,
    /// Sell-to-open orders
    short_open: Vec<String>,
    /// Buy-to-close orders
    short_close: Vec<String>,
    /// Stop / take-profit / trailing orders
    conditional: Vec<String>,
    /// Order id → owning grid level
    order_to_level: HashMap<String, LevelId>,
    /// Orders placed without a grid level (seeding market order, stops)
    non_grid: Vec<String>,
}

impl BookInner {
    fn bucket_for(&mut self, order: &PerpOrder) -> &mut Vec<String> {
        if order.order_type.is_conditional() {
            return &mut self.conditional;
        }
        match (order.side.is_buy(), order.side.intent()) {
            (true, OrderIntent::Open) => &mut self.long_open,
            (false, OrderIntent::Close) => &mut self.long_close,
            (false, OrderIntent::Open) => &mut self.short_open,
            (true, OrderIntent::Close) => &mut self.short_close,
        }
    }

    fn all_ids(&self) -> impl Iterator<Item = &String> {
        self.long_open
            .iter()
            .chain(self.long_close.iter())
            .chain(self.short_open.iter())
            .chain(self.short_close.iter())
            .chain(self.conditional.iter())
    }
}

/// Order book index. Identifiers are assumed unique within the lifetime of a
/// bot instance.
#[derive(Default)]
pub struct OrderBook {
    inner: RwLock<BookInner>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an order, optionally bound to a grid level.
    pub async fn add(&self, order: PerpOrder, level: Option<LevelId>) {
        let mut inner = self.inner.write().await;
        let id = order.identifier.clone();
        inner.bucket_for(&order).push(id.clone());
        match level {
            Some(level_id) => {
                inner.order_to_level.insert(id.clone(), level_id);
            }
            None => inner.non_grid.push(id.clone()),
        }
        inner.orders.insert(id, order);
    }

    /// Set a new status on the first order matching the identifier.
    pub async fn update_status(&self, id: &str, new_status: OrderStatus) {
        let mut inner = self.inner.write().await;
        if let Some(order) = inner.orders.get_mut(id) {
            order.status = new_status;
        }
    }

    /// Replace a stored order with fresher venue data.
    pub async fn update(&self, order: PerpOrder) {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.orders.get_mut(&order.identifier) {
            *existing = order;
        }
    }

    pub async fn get(&self, id: &str) -> Option<PerpOrder> {
        self.inner.read().await.orders.get(id).cloned()
    }

    /// All orders still open on the venue, across every bucket
    pub async fn get_open(&self) -> Vec<PerpOrder> {
        let inner = self.inner.read().await;
        inner
            .all_ids()
            .filter_map(|id| inner.orders.get(id))
            .filter(|o| o.is_open())
            .cloned()
            .collect()
    }

    /// All fully filled orders, across every bucket
    pub async fn get_completed(&self) -> Vec<PerpOrder> {
        let inner = self.inner.read().await;
        inner
            .all_ids()
            .filter_map(|id| inner.orders.get(id))
            .filter(|o| o.is_filled())
            .cloned()
            .collect()
    }

    /// Orders of one side joined with their grid level, if any
    pub async fn get_with_grid(
        &self,
        side: crate::order::OrderSide,
    ) -> Vec<(PerpOrder, Option<LevelId>)> {
        let inner = self.inner.read().await;
        let ids = match (side.is_buy(), side.intent()) {
            (true, OrderIntent::Open) => &inner.long_open,
            (false, OrderIntent::Close) => &inner.long_close,
            (false, OrderIntent::Open) => &inner.short_open,
            (true, OrderIntent::Close) => &inner.short_close,
        };
        ids.iter()
            .filter_map(|id| {
                inner
                    .orders
                    .get(id)
                    .map(|o| (o.clone(), inner.order_to_level.get(id).copied()))
            })
            .collect()
    }

    /// The grid level that owns an order; None for non-grid orders
    pub async fn level_for(&self, id: &str) -> Option<LevelId> {
        self.inner.read().await.order_to_level.get(id).copied()
    }

    /// Orders placed without a grid level
    pub async fn non_grid_orders(&self) -> Vec<PerpOrder> {
        let inner = self.inner.read().await;
        inner
            .non_grid
            .iter()
            .filter_map(|id| inner.orders.get(id))
            .cloned()
            .collect()
    }

    /// All conditional (stop / take-profit / trailing) orders
    pub async fn conditional_orders(&self) -> Vec<PerpOrder> {
        let inner = self.inner.read().await;
        inner
            .conditional
            .iter()
            .filter_map(|id| inner.orders.get(id))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.orders.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.orders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{MarginMode, OrderSide, OrderType, PositionSide};

    fn order(id: &str, side: OrderSide, order_type: OrderType, status: OrderStatus) -> PerpOrder {
        PerpOrder {
            identifier: id.into(),
            status,
            order_type,
            side,
            price: 100.0,
            average: None,
            contracts: 1.0,
            contract_size: 1.0,
            filled: 0.0,
            remaining: 1.0,
            timestamp: 0,
            last_trade_timestamp: None,
            symbol: "BTC/USDT:USDT".into(),
            time_in_force: Some("GTC".into()),
            leverage: 1.0,
            margin_mode: MarginMode::Isolated,
            position_side: PositionSide::Long,
            reduce_only: false,
            stop_price: None,
            activation_price: None,
            callback_rate: None,
            fee: None,
            trades: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_add_and_lookup() {
        let book = OrderBook::new();
        book.add(
            order("a", OrderSide::BuyOpen, OrderType::Limit, OrderStatus::Open),
            Some(LevelId(2)),
        )
        .await;

        assert_eq!(book.len().await, 1);
        assert_eq!(book.level_for("a").await, Some(LevelId(2)));
        assert!(book.get("a").await.is_some());
        assert!(book.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_non_grid_orders_tracked_separately() {
        let book = OrderBook::new();
        book.add(
            order("seed", OrderSide::BuyOpen, OrderType::Market, OrderStatus::Closed),
            None,
        )
        .await;

        assert_eq!(book.level_for("seed").await, None);
        let non_grid = book.non_grid_orders().await;
        assert_eq!(non_grid.len(), 1);
        assert_eq!(non_grid[0].identifier, "seed");
    }

    #[tokio::test]
    async fn test_conditional_bucket() {
        let book = OrderBook::new();
        book.add(
            order("stop", OrderSide::SellClose, OrderType::StopMarket, OrderStatus::Open),
            None,
        )
        .await;

        assert_eq!(book.conditional_orders().await.len(), 1);
        // Conditional orders still show up in the open scan
        assert_eq!(book.get_open().await.len(), 1);
        assert!(book.get_with_grid(OrderSide::SellClose).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_status() {
        let book = OrderBook::new();
        book.add(
            order("a", OrderSide::BuyOpen, OrderType::Limit, OrderStatus::Open),
            Some(LevelId(0)),
        )
        .await;

        book.update_status("a", OrderStatus::Closed).await;
        assert_eq!(book.get("a").await.unwrap().status, OrderStatus::Closed);
        assert!(book.get_open().await.is_empty());
        assert_eq!(book.get_completed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_and_completed_scans() {
        let book = OrderBook::new();
        book.add(
            order("open-buy", OrderSide::BuyOpen, OrderType::Limit, OrderStatus::Open),
            Some(LevelId(0)),
        )
        .await;
        book.add(
            order("done-sell", OrderSide::SellClose, OrderType::Limit, OrderStatus::Closed),
            Some(LevelId(1)),
        )
        .await;
        book.add(
            order("canceled", OrderSide::SellOpen, OrderType::Limit, OrderStatus::Canceled),
            None,
        )
        .await;

        let open = book.get_open().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].identifier, "open-buy");

        let completed = book.get_completed().await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].identifier, "done-sell");
    }

    #[tokio::test]
    async fn test_get_with_grid_joins_levels() {
        let book = OrderBook::new();
        book.add(
            order("a", OrderSide::SellClose, OrderType::Limit, OrderStatus::Open),
            Some(LevelId(3)),
        )
        .await;
        book.add(
            order("b", OrderSide::SellClose, OrderType::Limit, OrderStatus::Open),
            None,
        )
        .await;

        let rows = book.get_with_grid(OrderSide::SellClose).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, Some(LevelId(3)));
        assert_eq!(rows[1].1, None);
    }

    #[tokio::test]
    async fn test_side_buckets_distinguish_intent() {
        let book = OrderBook::new();
        book.add(
            order("bo", OrderSide::BuyOpen, OrderType::Limit, OrderStatus::Open),
            None,
        )
        .await;
        book.add(
            order("bc", OrderSide::BuyClose, OrderType::Limit, OrderStatus::Open),
            None,
        )
        .await;

        assert_eq!(book.get_with_grid(OrderSide::BuyOpen).await.len(), 1);
        assert_eq!(book.get_with_grid(OrderSide::BuyClose).await.len(), 1);
        assert!(book.get_with_grid(OrderSide::SellOpen).await.is_empty());
    }
}
