//! Simulated venue for paper trading and tests
//!
//! Keeps an in-memory book of raw orders. Market orders fill at the current
//! price immediately; resting limit orders fill when a pushed price crosses
//! them, the same crossing rule a real venue applies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{BotError, BotResult};
use crate::order::MarginMode;

use super::{AccountBalance, Candle, Exchange, PositionInfo, RawCancel, RawOrder};

const DEFAULT_AMOUNT_PRECISION: f64 = 0.001;

struct PaperState {
    price: f64,
    quote_balance: f64,
    orders: HashMap<String, RawOrder>,
    position: Option<PositionInfo>,
    funding_rate: f64,
    leverage: u32,
    margin_mode: Option<MarginMode>,
    hedged: bool,
    fail_orders: bool,
}

/// In-memory paper trading venue
pub struct PaperExchange {
    quote_currency: String,
    amount_precision: f64,
    connection_active: AtomicBool,
    state: Mutex<PaperState>,
    ticker_subscribers: Mutex<Vec<UnboundedSender<f64>>>,
}

impl PaperExchange {
    pub fn new(quote_currency: impl Into<String>, initial_price: f64, quote_balance: f64) -> Self {
        Self {
            quote_currency: quote_currency.into(),
            amount_precision: DEFAULT_AMOUNT_PRECISION,
            connection_active: AtomicBool::new(false),
            state: Mutex::new(PaperState {
                price: initial_price,
                quote_balance,
                orders: HashMap::new(),
                position: None,
                funding_rate: 0.0001,
                leverage: 1,
                margin_mode: None,
                hedged: false,
                fail_orders: false,
            }),
            ticker_subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Push a new last-trade price: fills any crossing limit orders and
    /// forwards the price to ticker subscribers.
    pub async fn push_price(&self, price: f64) {
        {
            let mut state = self.state.lock().await;
            state.price = price;
            for order in state.orders.values_mut() {
                if order.status != "open" {
                    continue;
                }
                let limit = match order.price {
                    Some(p) => p,
                    None => continue,
                };
                let crossed = match order.side.as_str() {
                    "buy" => price <= limit,
                    _ => price >= limit,
                };
                if crossed {
                    order.status = "closed".into();
                    order.average = Some(limit);
                    order.filled = order.amount;
                    order.remaining = 0.0;
                    debug!("Paper fill: {} {} @ {}", order.side, order.amount, limit);
                }
            }
        }

        let mut subscribers = self.ticker_subscribers.lock().await;
        subscribers.retain(|tx| tx.send(price).is_ok());
    }

    /// Current simulated price
    pub async fn current_price(&self) -> f64 {
        self.state.lock().await.price
    }

    /// Test knob: make subsequent order submissions fail
    pub async fn set_fail_orders(&self, fail: bool) {
        self.state.lock().await.fail_orders = fail;
    }

    /// Test knob: seed a venue-side position
    pub async fn set_position(&self, position: Option<PositionInfo>) {
        self.state.lock().await.position = position;
    }

    pub async fn set_funding_rate(&self, rate: f64) {
        self.state.lock().await.funding_rate = rate;
    }

    /// Number of orders the venue has seen
    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    /// Leverage, margin mode and position mode as configured by the client
    pub async fn venue_config(&self) -> (u32, Option<MarginMode>, bool) {
        let state = self.state.lock().await;
        (state.leverage, state.margin_mode, state.hedged)
    }

    fn next_order_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn initialize(&self) -> BotResult<()> {
        self.connection_active.store(true, Ordering::SeqCst);
        let state = self.state.lock().await;
        info!(
            "Paper venue ready: price={}, balance={} {}",
            state.price, state.quote_balance, self.quote_currency
        );
        Ok(())
    }

    async fn get_balance(&self) -> BotResult<AccountBalance> {
        let state = self.state.lock().await;
        let mut balance = AccountBalance::default();
        balance
            .free
            .insert(self.quote_currency.clone(), state.quote_balance);
        Ok(balance)
    }

    async fn get_position(&self, symbol: &str) -> BotResult<Option<PositionInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .position
            .as_ref()
            .filter(|p| p.symbol == symbol)
            .cloned())
    }

    async fn get_current_price(&self, _symbol: &str) -> BotResult<f64> {
        Ok(self.state.lock().await.price)
    }

    async fn place_order(
        &self,
        symbol: &str,
        order_type: &str,
        side: &str,
        amount: f64,
        price: Option<f64>,
    ) -> BotResult<RawOrder> {
        let mut state = self.state.lock().await;
        if state.fail_orders {
            return Err(BotError::DataFetch("paper venue refused the order".into()));
        }

        let id = Self::next_order_id();
        let market = order_type == "market";
        let effective_price = price.unwrap_or(state.price);
        let order = RawOrder {
            id: id.clone(),
            status: if market { "closed".into() } else { "open".into() },
            order_type: order_type.into(),
            side: side.into(),
            price: Some(effective_price),
            average: market.then_some(state.price),
            amount,
            filled: if market { amount } else { 0.0 },
            remaining: if market { 0.0 } else { amount },
            timestamp: chrono::Utc::now().timestamp_millis(),
            symbol: symbol.into(),
            time_in_force: Some("GTC".into()),
            reduce_only: false,
            fee: None,
        };
        state.orders.insert(id, order.clone());
        debug!(
            "Paper order accepted: {} {} {} {} @ {:?}",
            order.id, order_type, side, amount, price
        );
        Ok(order)
    }

    async fn fetch_order(&self, order_id: &str, _symbol: &str) -> BotResult<RawOrder> {
        let state = self.state.lock().await;
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BotError::OrderNotFound(order_id.into()))
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> BotResult<RawCancel> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(order) if order.status == "open" => {
                order.status = "canceled".into();
                Ok(RawCancel {
                    id: order_id.into(),
                    status: "canceled".into(),
                })
            }
            Some(order) => Ok(RawCancel {
                id: order_id.into(),
                status: order.status.clone(),
            }),
            None => Err(BotError::OrderNotFound(order_id.into())),
        }
    }

    async fn get_funding_rate(&self, _symbol: &str) -> BotResult<f64> {
        Ok(self.state.lock().await.funding_rate)
    }

    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> BotResult<()> {
        self.state.lock().await.leverage = leverage;
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, mode: MarginMode) -> BotResult<()> {
        self.state.lock().await.margin_mode = Some(mode);
        Ok(())
    }

    async fn set_position_mode(&self, _symbol: &str, hedged: bool) -> BotResult<()> {
        self.state.lock().await.hedged = hedged;
        Ok(())
    }

    async fn amount_precision(&self) -> f64 {
        self.amount_precision
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _start_date: &str,
        _end_date: &str,
    ) -> BotResult<Vec<Candle>> {
        Err(BotError::DataFetch(
            "historical data is not available on the paper venue".into(),
        ))
    }

    async fn listen_to_ticker_updates(
        &self,
        symbol: &str,
        tx: UnboundedSender<f64>,
        interval: Duration,
    ) -> BotResult<()> {
        self.connection_active.store(true, Ordering::SeqCst);
        self.ticker_subscribers.lock().await.push(tx);
        info!("Paper ticker stream attached for {symbol}");

        while self.connection_active.load(Ordering::SeqCst) {
            tokio::time::sleep(interval).await;
        }
        warn!("Paper ticker stream for {symbol} closed");
        Ok(())
    }

    async fn close_connection(&self) -> BotResult<()> {
        self.connection_active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_order_fills_immediately() {
        let venue = PaperExchange::new("USDT", 100.0, 10_000.0);
        let order = venue
            .place_order("BTC/USDT:USDT", "market", "buy", 1.0, Some(100.0))
            .await
            .unwrap();
        assert_eq!(order.status, "closed");
        assert_eq!(order.filled, 1.0);
        assert_eq!(order.average, Some(100.0));
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_crossed() {
        let venue = PaperExchange::new("USDT", 100.0, 10_000.0);
        let order = venue
            .place_order("BTC/USDT:USDT", "limit", "buy", 2.0, Some(95.0))
            .await
            .unwrap();
        assert_eq!(order.status, "open");

        venue.push_price(97.0).await;
        let fetched = venue.fetch_order(&order.id, "BTC/USDT:USDT").await.unwrap();
        assert_eq!(fetched.status, "open");

        venue.push_price(94.0).await;
        let fetched = venue.fetch_order(&order.id, "BTC/USDT:USDT").await.unwrap();
        assert_eq!(fetched.status, "closed");
        assert_eq!(fetched.average, Some(95.0));
        assert_eq!(fetched.remaining, 0.0);
    }

    #[tokio::test]
    async fn test_sell_limit_crossing() {
        let venue = PaperExchange::new("USDT", 100.0, 10_000.0);
        let order = venue
            .place_order("BTC/USDT:USDT", "limit", "sell", 1.0, Some(110.0))
            .await
            .unwrap();

        venue.push_price(111.0).await;
        let fetched = venue.fetch_order(&order.id, "BTC/USDT:USDT").await.unwrap();
        assert_eq!(fetched.status, "closed");
    }

    #[tokio::test]
    async fn test_cancel_and_not_found() {
        let venue = PaperExchange::new("USDT", 100.0, 10_000.0);
        let order = venue
            .place_order("BTC/USDT:USDT", "limit", "buy", 1.0, Some(90.0))
            .await
            .unwrap();

        let cancel = venue.cancel_order(&order.id, "BTC/USDT:USDT").await.unwrap();
        assert_eq!(cancel.status, "canceled");

        let err = venue.cancel_order("nope", "BTC/USDT:USDT").await.unwrap_err();
        assert!(matches!(err, BotError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_knob() {
        let venue = PaperExchange::new("USDT", 100.0, 10_000.0);
        venue.set_fail_orders(true).await;
        let err = venue
            .place_order("BTC/USDT:USDT", "limit", "buy", 1.0, Some(90.0))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::DataFetch(_)));
    }

    #[tokio::test]
    async fn test_ticker_subscribers_receive_pushed_prices() {
        let venue = PaperExchange::new("USDT", 100.0, 10_000.0);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        venue.ticker_subscribers.lock().await.push(tx);

        venue.push_price(101.0).await;
        venue.push_price(102.0).await;
        assert_eq!(rx.recv().await, Some(101.0));
        assert_eq!(rx.recv().await, Some(102.0));
    }
}
