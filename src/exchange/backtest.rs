//! In-memory gateway for historical replay
//!
//! Serves the preloaded OHLCV window and a virtual clock price. Order entry
//! is not routed here: the backtest execution strategy synthesizes orders
//! and the replay loop fills them.

use std::time::Duration;

use async_trait::async_trait;
use log::info;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::errors::{BotError, BotResult};
use crate::order::MarginMode;

use super::{AccountBalance, Candle, Exchange, PositionInfo, RawCancel, RawOrder};

const SUPPORTED_TIMEFRAMES: &[&str] = &["1m", "5m", "15m", "30m", "1h", "4h", "1d"];

/// Gateway backed by a preloaded candle series
pub struct BacktestExchange {
    quote_currency: String,
    candles: Vec<Candle>,
    price: Mutex<f64>,
    funding_rate: Mutex<f64>,
    amount_precision: f64,
}

impl BacktestExchange {
    pub fn new(quote_currency: impl Into<String>, candles: Vec<Candle>) -> Self {
        let first_close = candles.first().map(|c| c.close).unwrap_or(0.0);
        Self {
            quote_currency: quote_currency.into(),
            candles,
            price: Mutex::new(first_close),
            funding_rate: Mutex::new(0.0001),
            amount_precision: 0.001,
        }
    }

    /// Advance the virtual clock price; called by the replay loop per bar.
    pub async fn set_price(&self, price: f64) {
        *self.price.lock().await = price;
    }

    pub async fn set_funding_rate(&self, rate: f64) {
        *self.funding_rate.lock().await = rate;
    }
}

#[async_trait]
impl Exchange for BacktestExchange {
    async fn initialize(&self) -> BotResult<()> {
        info!("Backtest gateway ready: {} candles loaded", self.candles.len());
        Ok(())
    }

    async fn get_balance(&self) -> BotResult<AccountBalance> {
        // Backtest margin is seeded from configuration, not the venue
        let mut balance = AccountBalance::default();
        balance.free.insert(self.quote_currency.clone(), 0.0);
        Ok(balance)
    }

    async fn get_position(&self, _symbol: &str) -> BotResult<Option<PositionInfo>> {
        Ok(None)
    }

    async fn get_current_price(&self, _symbol: &str) -> BotResult<f64> {
        Ok(*self.price.lock().await)
    }

    async fn place_order(
        &self,
        _symbol: &str,
        _order_type: &str,
        _side: &str,
        _amount: f64,
        _price: Option<f64>,
    ) -> BotResult<RawOrder> {
        Err(BotError::DataFetch(
            "backtest does not route orders to a venue".into(),
        ))
    }

    async fn fetch_order(&self, order_id: &str, _symbol: &str) -> BotResult<RawOrder> {
        Err(BotError::OrderNotFound(order_id.into()))
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> BotResult<RawCancel> {
        Ok(RawCancel {
            id: order_id.into(),
            status: "canceled".into(),
        })
    }

    async fn get_funding_rate(&self, _symbol: &str) -> BotResult<f64> {
        Ok(*self.funding_rate.lock().await)
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> BotResult<()> {
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, _mode: MarginMode) -> BotResult<()> {
        Ok(())
    }

    async fn set_position_mode(&self, _symbol: &str, _hedged: bool) -> BotResult<()> {
        Ok(())
    }

    async fn amount_precision(&self) -> f64 {
        self.amount_precision
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        timeframe: &str,
        _start_date: &str,
        _end_date: &str,
    ) -> BotResult<Vec<Candle>> {
        if !SUPPORTED_TIMEFRAMES.contains(&timeframe) {
            return Err(BotError::UnsupportedTimeframe(timeframe.into()));
        }
        Ok(self.candles.clone())
    }

    async fn listen_to_ticker_updates(
        &self,
        _symbol: &str,
        tx: UnboundedSender<f64>,
        _interval: Duration,
    ) -> BotResult<()> {
        // Replay drives prices directly; streaming just drains the closes
        for candle in &self.candles {
            if tx.send(candle.close).is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn close_connection(&self) -> BotResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles() -> Vec<Candle> {
        (0..3)
            .map(|i| Candle {
                timestamp: i * 60_000,
                open: 100.0 + i as f64,
                high: 101.0 + i as f64,
                low: 99.0 + i as f64,
                close: 100.5 + i as f64,
                volume: 10.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fetch_ohlcv_returns_window() {
        let venue = BacktestExchange::new("USDT", candles());
        let data = venue
            .fetch_ohlcv("BTC/USDT:USDT", "1h", "2024-01-01", "2024-02-01")
            .await
            .unwrap();
        assert_eq!(data.len(), 3);
    }

    #[tokio::test]
    async fn test_unsupported_timeframe_rejected() {
        let venue = BacktestExchange::new("USDT", candles());
        let err = venue
            .fetch_ohlcv("BTC/USDT:USDT", "7m", "2024-01-01", "2024-02-01")
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::UnsupportedTimeframe(_)));
    }

    #[tokio::test]
    async fn test_virtual_clock_price() {
        let venue = BacktestExchange::new("USDT", candles());
        assert_eq!(venue.get_current_price("x").await.unwrap(), 100.5);
        venue.set_price(123.0).await;
        assert_eq!(venue.get_current_price("x").await.unwrap(), 123.0);
    }

    #[tokio::test]
    async fn test_order_entry_not_routed() {
        let venue = BacktestExchange::new("USDT", candles());
        assert!(venue
            .place_order("x", "limit", "buy", 1.0, Some(100.0))
            .await
            .is_err());
    }
}
