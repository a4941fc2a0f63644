//! Backtest execution strategy: synthesizes orders for the replay loop

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;

use crate::errors::{BotError, BotResult, ExecutionError};
use crate::order::{MarginMode, OrderSide, OrderStatus, OrderType, PerpOrder};

use super::{position_side_for, OrderExecutor};

/// Synthesizes orders with deterministic identifiers. Market orders start
/// CLOSED; limit orders start OPEN and are filled by the replay loop when a
/// candle range crosses them.
pub struct BacktestOrderExecutor {
    leverage: f64,
    margin_mode: MarginMode,
    funding_rate: f64,
    next_id: AtomicU64,
    /// Virtual clock advanced by the replay loop, milliseconds
    clock_ms: AtomicI64,
}

impl BacktestOrderExecutor {
    pub fn new(leverage: f64, margin_mode: MarginMode, funding_rate: f64) -> Self {
        Self {
            leverage,
            margin_mode,
            funding_rate,
            next_id: AtomicU64::new(1),
            clock_ms: AtomicI64::new(0),
        }
    }

    /// Advance the virtual clock; stamped onto synthesized orders.
    pub fn set_clock(&self, timestamp_ms: i64) {
        self.clock_ms.store(timestamp_ms, Ordering::SeqCst);
    }

    fn next_identifier(&self) -> String {
        format!("backtest-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn synthesize(
        &self,
        side: OrderSide,
        order_type: OrderType,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> PerpOrder {
        let filled_now = order_type == OrderType::Market;
        PerpOrder {
            identifier: self.next_identifier(),
            status: if filled_now {
                OrderStatus::Closed
            } else {
                OrderStatus::Open
            },
            order_type,
            side,
            price,
            average: filled_now.then_some(price),
            contracts: quantity,
            contract_size: 1.0,
            filled: if filled_now { quantity } else { 0.0 },
            remaining: if filled_now { 0.0 } else { quantity },
            timestamp: self.clock_ms.load(Ordering::SeqCst),
            last_trade_timestamp: filled_now.then(|| self.clock_ms.load(Ordering::SeqCst)),
            symbol: symbol.into(),
            time_in_force: Some("GTC".into()),
            leverage: self.leverage,
            margin_mode: self.margin_mode,
            position_side: position_side_for(side),
            reduce_only: false,
            stop_price: None,
            activation_price: None,
            callback_rate: None,
            fee: None,
            trades: Vec::new(),
        }
    }
}

impl Default for BacktestOrderExecutor {
    fn default() -> Self {
        Self::new(1.0, MarginMode::Isolated, 0.0001)
    }
}

#[async_trait]
impl OrderExecutor for BacktestOrderExecutor {
    async fn execute_market_order(
        &self,
        side: OrderSide,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<PerpOrder, ExecutionError> {
        Ok(self.synthesize(side, OrderType::Market, symbol, quantity, price))
    }

    async fn execute_limit_order(
        &self,
        side: OrderSide,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<PerpOrder, ExecutionError> {
        Ok(self.synthesize(side, OrderType::Limit, symbol, quantity, price))
    }

    async fn get_order(
        &self,
        order_id: &str,
        _symbol: &str,
        _side: OrderSide,
    ) -> BotResult<PerpOrder> {
        // The replay loop owns fill state; there is no venue to ask
        Err(BotError::OrderNotFound(order_id.into()))
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> BotResult<()> {
        Ok(())
    }

    async fn get_funding_rate(&self, _symbol: &str) -> BotResult<f64> {
        Ok(self.funding_rate)
    }
}
