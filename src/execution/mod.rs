//! Order execution strategies: typed wrappers over the gateway
//!
//! [`LiveOrderExecutor`] drives a real or paper venue with retry and
//! slippage handling; [`BacktestOrderExecutor`] synthesizes orders that the
//! replay loop fills.

mod backtest;
mod live;

use async_trait::async_trait;

use crate::errors::{BotResult, ExecutionError};
use crate::exchange::RawOrder;
use crate::order::{
    MarginMode, OrderSide, OrderStatus, OrderType, PerpOrder, PositionSide,
};

pub use backtest::BacktestOrderExecutor;
pub use live::LiveOrderExecutor;

/// Produces domain orders from venue submissions
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Submit a market order and wait until the venue reports it filled.
    async fn execute_market_order(
        &self,
        side: OrderSide,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<PerpOrder, ExecutionError>;

    /// Submit a limit order.
    async fn execute_limit_order(
        &self,
        side: OrderSide,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<PerpOrder, ExecutionError>;

    /// Fetch the venue's view of an order. `side` restores the open/close
    /// intent the wire format cannot carry.
    async fn get_order(&self, order_id: &str, symbol: &str, side: OrderSide)
        -> BotResult<PerpOrder>;

    /// Cancel an order; an already-gone order is not an error.
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> BotResult<()>;

    async fn get_funding_rate(&self, symbol: &str) -> BotResult<f64>;
}

fn order_type_from_wire(s: &str) -> OrderType {
    match s.to_ascii_lowercase().as_str() {
        "market" => OrderType::Market,
        "stop_market" => OrderType::StopMarket,
        "stop_limit" => OrderType::StopLimit,
        "take_profit_market" => OrderType::TakeProfitMarket,
        "take_profit_limit" => OrderType::TakeProfitLimit,
        "trailing_stop" => OrderType::TrailingStop,
        _ => OrderType::Limit,
    }
}

fn position_side_for(side: OrderSide) -> PositionSide {
    match side {
        OrderSide::BuyOpen | OrderSide::SellClose => PositionSide::Long,
        OrderSide::SellOpen | OrderSide::BuyClose => PositionSide::Short,
    }
}

/// Map a raw venue payload onto a domain order, restoring the intent that
/// the wire side string collapses.
pub(crate) fn parse_raw_order(
    raw: &RawOrder,
    side: OrderSide,
    leverage: f64,
    margin_mode: MarginMode,
) -> PerpOrder {
    PerpOrder {
        identifier: raw.id.clone(),
        status: OrderStatus::from_wire(&raw.status),
        order_type: order_type_from_wire(&raw.order_type),
        side,
        price: raw.price.unwrap_or(0.0),
        average: raw.average,
        contracts: raw.amount,
        contract_size: 1.0,
        filled: raw.filled,
        remaining: raw.remaining,
        timestamp: raw.timestamp,
        last_trade_timestamp: None,
        symbol: raw.symbol.clone(),
        time_in_force: raw.time_in_force.clone(),
        leverage,
        margin_mode,
        position_side: position_side_for(side),
        reduce_only: raw.reduce_only,
        stop_price: None,
        activation_price: None,
        callback_rate: None,
        fee: raw.fee.as_ref().map(|f| f.cost),
        trades: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_order_restores_intent() {
        let raw = RawOrder {
            id: "42".into(),
            status: "closed".into(),
            order_type: "limit".into(),
            side: "sell".into(),
            price: Some(110.0),
            average: Some(110.0),
            amount: 1.0,
            filled: 1.0,
            remaining: 0.0,
            timestamp: 1,
            symbol: "BTC/USDT:USDT".into(),
            time_in_force: Some("GTC".into()),
            reduce_only: true,
            fee: Some(crate::exchange::RawFee {
                cost: 0.055,
                currency: "USDT".into(),
            }),
        };

        let order = parse_raw_order(&raw, OrderSide::SellClose, 10.0, MarginMode::Isolated);
        assert_eq!(order.side, OrderSide::SellClose);
        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(order.position_side, PositionSide::Long);
        assert_eq!(order.fee, Some(0.055));
        assert!(order.reduce_only);
    }

    #[test]
    fn test_unknown_status_survives_parsing() {
        let raw = RawOrder {
            id: "9".into(),
            status: "weird".into(),
            order_type: "limit".into(),
            side: "buy".into(),
            price: Some(50.0),
            average: None,
            amount: 1.0,
            filled: 0.0,
            remaining: 1.0,
            timestamp: 1,
            symbol: "BTC/USDT:USDT".into(),
            time_in_force: None,
            reduce_only: false,
            fee: None,
        };

        let order = parse_raw_order(&raw, OrderSide::BuyOpen, 1.0, MarginMode::Cross);
        assert_eq!(order.status, OrderStatus::Unknown);
    }
}
