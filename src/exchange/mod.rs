//! Exchange gateway abstraction
//!
//! The venue is reached only through the [`Exchange`] trait. Concrete
//! adapters: [`PaperExchange`] (simulated venue for paper trading and unit
//! tests) and [`BacktestExchange`] (candle replay). A live REST/WebSocket
//! adapter implements the same trait out of tree.

mod backtest;
mod paper;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::errors::BotResult;
use crate::order::MarginMode;

pub use backtest::BacktestExchange;
pub use paper::PaperExchange;

/// Account balance snapshot. At least the quote currency must be present in
/// `free` for perpetual accounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub free: HashMap<String, f64>,
    #[serde(default)]
    pub used: HashMap<String, f64>,
    #[serde(default)]
    pub total: HashMap<String, f64>,
}

/// Venue-reported position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// "long" or "short"
    pub side: String,
    pub contracts: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub margin_mode: MarginMode,
    pub leverage: f64,
    pub margin_ratio: Option<f64>,
    pub liquidation_price: Option<f64>,
    pub maintenance_margin: Option<f64>,
}

/// Raw order payload as the venue reports it. Field names follow the wire
/// format; the execution strategy parses this into a domain order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOrder {
    pub id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    pub price: Option<f64>,
    pub average: Option<f64>,
    pub amount: f64,
    pub filled: f64,
    pub remaining: f64,
    pub timestamp: i64,
    pub symbol: String,
    #[serde(default)]
    pub time_in_force: Option<String>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub fee: Option<RawFee>,
}

/// Fee entry on a raw order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFee {
    pub cost: f64,
    pub currency: String,
}

/// Result of a cancellation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCancel {
    pub id: String,
    pub status: String,
}

/// One bar of historical OHLCV data, the unit of the backtest replay
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Abstract venue: order entry, account state, market data and perpetual
/// account configuration.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Load markets, discover precision, ensure position mode, leverage and
    /// margin mode. Called once before trading starts.
    async fn initialize(&self) -> BotResult<()>;

    async fn get_balance(&self) -> BotResult<AccountBalance>;

    async fn get_position(&self, symbol: &str) -> BotResult<Option<PositionInfo>>;

    async fn get_current_price(&self, symbol: &str) -> BotResult<f64>;

    /// Submit an order. `price` is required for limit-style orders.
    async fn place_order(
        &self,
        symbol: &str,
        order_type: &str,
        side: &str,
        amount: f64,
        price: Option<f64>,
    ) -> BotResult<RawOrder>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> BotResult<RawOrder>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> BotResult<RawCancel>;

    async fn get_funding_rate(&self, symbol: &str) -> BotResult<f64>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> BotResult<()>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> BotResult<()>;

    async fn set_position_mode(&self, symbol: &str, hedged: bool) -> BotResult<()>;

    /// Amount precision (smallest order increment) discovered at initialize
    async fn amount_precision(&self) -> f64;

    /// Historical OHLCV window for backtest replay
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        start_date: &str,
        end_date: &str,
    ) -> BotResult<Vec<Candle>>;

    /// Stream last-trade prices into `tx` every `interval` until the
    /// connection is closed. Reconnects on transient errors with delay
    /// `min(5·attempt, 60)` seconds, giving up after `max_retries`.
    async fn listen_to_ticker_updates(
        &self,
        symbol: &str,
        tx: UnboundedSender<f64>,
        interval: Duration,
    ) -> BotResult<()>;

    async fn close_connection(&self) -> BotResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_order_deserializes_wire_shape() {
        let raw: RawOrder = serde_json::from_str(
            r#"{
                "id": "12345",
                "status": "open",
                "type": "limit",
                "side": "buy",
                "price": 70.0,
                "average": null,
                "amount": 1.5,
                "filled": 0.0,
                "remaining": 1.5,
                "timestamp": 1700000000000,
                "symbol": "BTC/USDT:USDT",
                "fee": {"cost": 0.05, "currency": "USDT"}
            }"#,
        )
        .unwrap();

        assert_eq!(raw.id, "12345");
        assert_eq!(raw.order_type, "limit");
        assert_eq!(raw.fee.as_ref().unwrap().currency, "USDT");
        assert!(!raw.reduce_only);
    }

    #[test]
    fn test_account_balance_quote_lookup() {
        let mut balance = AccountBalance::default();
        balance.free.insert("USDT".into(), 1234.5);
        assert_eq!(balance.free.get("USDT").copied(), Some(1234.5));
        assert_eq!(balance.free.get("BTC").copied(), None);
    }
}
