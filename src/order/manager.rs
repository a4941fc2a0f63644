//! Order manager: reacts to fills and keeps the lattice populated

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::balance::BalanceTracker;
use crate::config::TradingMode;
use crate::errors::BotResult;
use crate::events::{BotEvent, EventBus};
use crate::exchange::Exchange;
use crate::execution::OrderExecutor;
use crate::grid::{GridManager, LevelId, PairingType};
use crate::order::{OrderBook, OrderIntent, OrderSide, OrderStatus, OrderType, PerpOrder};

use super::validator::OrderValidator;

/// Drives order placement: grid seeding, fill pairing, and the backtest
/// fill simulation.
pub struct OrderManager {
    trading_mode: TradingMode,
    symbol: String,
    leverage: f64,
    grid: Arc<GridManager>,
    order_book: Arc<OrderBook>,
    balance: Arc<BalanceTracker>,
    validator: OrderValidator,
    executor: Arc<dyn OrderExecutor>,
    exchange: Arc<dyn Exchange>,
    event_bus: Arc<EventBus>,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trading_mode: TradingMode,
        symbol: impl Into<String>,
        leverage: f64,
        grid: Arc<GridManager>,
        order_book: Arc<OrderBook>,
        balance: Arc<BalanceTracker>,
        validator: OrderValidator,
        executor: Arc<dyn OrderExecutor>,
        exchange: Arc<dyn Exchange>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            trading_mode,
            symbol: symbol.into(),
            leverage,
            grid,
            order_book,
            balance,
            validator,
            executor,
            exchange,
            event_bus,
        }
    }

    /// Handle a completed fill: update accounting, transition the level,
    /// and schedule the paired counter-order.
    ///
    /// Grid, balance and book mutations for one fill all happen inside this
    /// handler before the next fill is delivered.
    pub async fn on_order_filled(&self, order: &PerpOrder) {
        self.balance.record_fill(order).await;

        let level_id = match self.order_book.level_for(&order.identifier).await {
            Some(id) => id,
            None => {
                debug!(
                    "Fill {} is not associated with a grid level; ignoring",
                    order.identifier
                );
                return;
            }
        };

        self.grid.complete(level_id, order.side).await;

        match order.side {
            OrderSide::BuyOpen => self.place_paired_sell(level_id, order).await,
            _ => self.place_paired_buy(level_id, order).await,
        }
    }

    async fn place_paired_sell(&self, buy_level: LevelId, fill: &PerpOrder) {
        let sell_level = match self.grid.paired_sell_level(buy_level).await {
            Some(id) => id,
            None => {
                warn!(
                    "No paired sell level for fill at {:.4}",
                    self.grid.price_of(buy_level)
                );
                return;
            }
        };
        if !self.grid.can_place(sell_level, OrderSide::SellClose).await {
            debug!(
                "Paired sell level {:.4} not eligible",
                self.grid.price_of(sell_level)
            );
            return;
        }

        let price = self.grid.price_of(sell_level);
        match self
            .place_limit_order(OrderSide::SellClose, price, fill.filled, Some(sell_level))
            .await
        {
            Ok(Some(_)) => {
                self.grid.pair(buy_level, sell_level, PairingType::Sell).await;
            }
            Ok(None) => {}
            Err(e) => error!("Failed to place paired sell at {:.4}: {e}", price),
        }
    }

    async fn place_paired_buy(&self, sell_level: LevelId, fill: &PerpOrder) {
        let buy_level = match self.grid.paired_buy_level(sell_level).await {
            Some(id) => id,
            None => {
                warn!(
                    "No paired buy level below {:.4}",
                    self.grid.price_of(sell_level)
                );
                return;
            }
        };
        if !self.grid.can_place(buy_level, OrderSide::BuyOpen).await {
            debug!(
                "Paired buy level {:.4} not eligible",
                self.grid.price_of(buy_level)
            );
            return;
        }

        let price = self.grid.price_of(buy_level);
        match self
            .place_limit_order(OrderSide::BuyOpen, price, fill.filled, Some(buy_level))
            .await
        {
            Ok(Some(_)) => {
                self.grid.pair(sell_level, buy_level, PairingType::Buy).await;
            }
            Ok(None) => {}
            Err(e) => error!("Failed to place paired buy at {:.4}: {e}", price),
        }
    }

    /// Validate, reserve margin for, and submit one limit order. Validation
    /// failures skip the level with a warning; execution failures publish
    /// ORDER_FAILED. Both return `Ok(None)` so the caller continues.
    pub async fn place_limit_order(
        &self,
        side: OrderSide,
        price: f64,
        quantity: f64,
        level: Option<LevelId>,
    ) -> BotResult<Option<PerpOrder>> {
        let adjusted = match side.intent() {
            OrderIntent::Open => {
                let available = self.balance.available_margin().await;
                match self
                    .validator
                    .validate_open(available, quantity, price, self.leverage)
                {
                    Ok(qty) => qty,
                    Err(e) => {
                        warn!("Skipping {side:?} at {price:.4}: {e}");
                        return Ok(None);
                    }
                }
            }
            OrderIntent::Close => {
                let held = if side.is_buy() {
                    self.balance.short_position().await
                } else {
                    self.balance.long_position().await
                };
                match self.validator.validate_close(held, quantity) {
                    Ok(qty) => qty,
                    Err(e) => {
                        warn!("Skipping {side:?} at {price:.4}: {e}");
                        return Ok(None);
                    }
                }
            }
        };

        let reserved = side.intent() == OrderIntent::Open;
        if reserved {
            if let Err(e) = self.balance.reserve_margin(adjusted, price).await {
                warn!("Cannot reserve margin for {side:?} at {price:.4}: {e}");
                return Ok(None);
            }
        }

        match self
            .executor
            .execute_limit_order(side, &self.symbol, adjusted, price)
            .await
        {
            Ok(order) => {
                self.order_book.add(order.clone(), level).await;
                if let Some(level_id) = level {
                    self.grid.mark_pending(level_id, &order).await;
                }
                info!(
                    "Placed {side:?} limit {:.6} @ {:.4} (id {})",
                    adjusted, price, order.identifier
                );
                self.event_bus.publish(BotEvent::OrderPlaced(order.clone()));
                Ok(Some(order))
            }
            Err(e) => {
                if reserved {
                    self.balance.release_margin(adjusted, price).await;
                }
                error!("Order execution failed: {e}");
                self.event_bus.publish(BotEvent::OrderFailed(e.to_string()));
                Ok(None)
            }
        }
    }

    /// Seed the long base position that the sell side of the lattice will
    /// distribute.
    pub async fn perform_initial_purchase(&self, current_price: f64) -> BotResult<()> {
        let notional = self.grid.initial_quantity(current_price);
        if notional <= 0.0 {
            warn!("Initial purchase quantity is zero; skipping");
            return Ok(());
        }

        let precision = self.exchange.amount_precision().await;
        let amount = (notional / current_price).max(precision);
        info!(
            "Performing initial purchase: {:.6} contracts at {:.4}",
            amount, current_price
        );

        match self
            .executor
            .execute_market_order(OrderSide::BuyOpen, &self.symbol, amount, current_price)
            .await
        {
            Ok(order) => {
                self.order_book.add(order.clone(), None).await;
                if order.is_filled() {
                    self.balance.record_fill(&order).await;
                }
                self.event_bus.publish(BotEvent::OrderPlaced(order));
                Ok(())
            }
            Err(e) => {
                error!("Initial purchase failed: {e}");
                self.event_bus.publish(BotEvent::OrderFailed(e.to_string()));
                Ok(())
            }
        }
    }

    /// Place the opening lattice orders around the current price: buys
    /// descending from just below it, sell-closes ascending above it, at
    /// most `max_placed_orders` per side.
    pub async fn initialize_grid_orders(&self, current_price: f64) -> BotResult<()> {
        let total_margin = self.balance.total_margin().await;
        let max_placed = self.grid.max_placed_orders();

        let mut placed_buys = 0usize;
        for &id in self.grid.sorted_buy_ids().iter().rev() {
            if placed_buys >= max_placed {
                break;
            }
            let price = self.grid.price_of(id);
            if price >= current_price {
                debug!("Skipping buy level {:.4}: at or above current price", price);
                continue;
            }
            if !self.grid.can_place(id, OrderSide::BuyOpen).await {
                continue;
            }
            let quantity = self.grid.order_size(total_margin, current_price);
            if self
                .place_limit_order(OrderSide::BuyOpen, price, quantity, Some(id))
                .await?
                .is_some()
            {
                placed_buys += 1;
            }
        }

        let mut placed_sells = 0usize;
        for &id in self.grid.sorted_sell_ids() {
            if placed_sells >= max_placed {
                break;
            }
            let price = self.grid.price_of(id);
            if price <= current_price {
                debug!("Skipping sell level {:.4}: at or below current price", price);
                continue;
            }
            if !self.grid.can_place(id, OrderSide::SellClose).await {
                continue;
            }
            let quantity = self.grid.order_size(total_margin, current_price);
            if self
                .place_limit_order(OrderSide::SellClose, price, quantity, Some(id))
                .await?
                .is_some()
            {
                placed_sells += 1;
            }
        }

        info!(
            "Grid orders initialized: {} buys, {} sells around {:.4}",
            placed_buys, placed_sells, current_price
        );
        Ok(())
    }

    /// Backtest replay hook: fill every resting limit order whose price the
    /// candle range touched. Returns the number of fills applied.
    pub async fn simulate_order_fills(&self, high: f64, low: f64, timestamp: i64) -> usize {
        let mut fills = 0usize;
        for order in self.order_book.get_open().await {
            if order.order_type != OrderType::Limit {
                continue;
            }
            if order.price < low || order.price > high {
                continue;
            }

            let mut filled = order.clone();
            filled.status = OrderStatus::Closed;
            filled.average = Some(order.price);
            filled.filled = order.contracts;
            filled.remaining = 0.0;
            filled.last_trade_timestamp = Some(timestamp);

            self.order_book.update(filled.clone()).await;
            self.on_order_filled(&filled).await;
            self.event_bus.publish(BotEvent::OrderFilled(filled));
            fills += 1;
        }
        fills
    }

    /// Reduce exposure on one side by a fraction via a market close. Used by
    /// the funding de-risk hook and margin-call handling.
    pub async fn reduce_exposure(&self, reduce_long: bool, fraction: f64) -> BotResult<()> {
        let held = if reduce_long {
            self.balance.long_position().await
        } else {
            self.balance.short_position().await
        };
        let quantity = held * fraction;
        if quantity <= 0.0 {
            return Ok(());
        }

        let side = if reduce_long {
            OrderSide::SellClose
        } else {
            OrderSide::BuyClose
        };
        let price = self.exchange.get_current_price(&self.symbol).await?;

        info!(
            "Reducing {} exposure by {:.6} contracts",
            if reduce_long { "long" } else { "short" },
            quantity
        );
        match self
            .executor
            .execute_market_order(side, &self.symbol, quantity, price)
            .await
        {
            Ok(order) => {
                self.order_book.add(order.clone(), None).await;
                if order.is_filled() {
                    self.balance.record_fill(&order).await;
                }
                Ok(())
            }
            Err(e) => {
                error!("Exposure reduction failed: {e}");
                self.event_bus.publish(BotEvent::OrderFailed(e.to_string()));
                Ok(())
            }
        }
    }

    pub fn trading_mode(&self) -> TradingMode {
        self.trading_mode
    }
}
