//! Live/paper execution strategy with retry and slippage handling

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::errors::{BotError, BotResult, ExecutionError};
use crate::exchange::Exchange;
use crate::order::{MarginMode, OrderSide, OrderType, PerpOrder};

use super::{parse_raw_order, OrderExecutor};

const MARKET_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Forwards to the gateway with bounded retries. Before the first order the
/// venue's leverage and margin mode are configured; a setup failure aborts.
pub struct LiveOrderExecutor<E: Exchange> {
    exchange: Arc<E>,
    max_retries: u32,
    retry_delay: Duration,
    max_slippage: f64,
    leverage: u32,
    margin_mode: MarginMode,
    setup_done: Mutex<bool>,
}

impl<E: Exchange> LiveOrderExecutor<E> {
    pub fn new(exchange: Arc<E>, leverage: u32, margin_mode: MarginMode) -> Self {
        Self {
            exchange,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_slippage: 0.01,
            leverage,
            margin_mode,
            setup_done: Mutex::new(false),
        }
    }

    pub fn with_retry_config(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Configure leverage, margin mode and one-way position mode on the
    /// venue before the first order. Failures here abort the caller.
    async fn ensure_setup(&self, symbol: &str) -> BotResult<()> {
        let mut done = self.setup_done.lock().await;
        if *done {
            return Ok(());
        }
        self.exchange.set_position_mode(symbol, false).await?;
        self.exchange.set_leverage(symbol, self.leverage).await?;
        self.exchange.set_margin_mode(symbol, self.margin_mode).await?;
        info!(
            "Venue configured: {}x leverage, {} margin",
            self.leverage,
            self.margin_mode.as_str()
        );
        *done = true;
        Ok(())
    }

    /// Mark-price based adjustment: inflate buys and deflate sells by
    /// `max_slippage · attempt / max_retries` so retries cross the book.
    async fn adjust_price(&self, side: OrderSide, price: f64, attempt: u32) -> f64 {
        let reference = match self.exchange.get_current_price("").await {
            Ok(mark) if mark > 0.0 => mark,
            _ => price,
        };
        let adjustment = self.max_slippage * attempt as f64 / self.max_retries as f64;
        if side.is_buy() {
            reference * (1.0 + adjustment)
        } else {
            reference * (1.0 - adjustment)
        }
    }

    /// Poll the venue until it reports the order closed, then parse it.
    async fn await_market_fill(
        &self,
        order_id: &str,
        symbol: &str,
        side: OrderSide,
    ) -> BotResult<PerpOrder> {
        loop {
            tokio::time::sleep(MARKET_POLL_INTERVAL).await;
            match self.exchange.fetch_order(order_id, symbol).await {
                Ok(raw) if raw.status == "closed" => {
                    info!("Market order {} filled, average {:?}", order_id, raw.average);
                    return Ok(parse_raw_order(
                        &raw,
                        side,
                        self.leverage as f64,
                        self.margin_mode,
                    ));
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("Polling market order {order_id} failed: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl<E: Exchange> OrderExecutor for LiveOrderExecutor<E> {
    async fn execute_market_order(
        &self,
        side: OrderSide,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<PerpOrder, ExecutionError> {
        let fail = |message: String| {
            ExecutionError::new(message, side, OrderType::Market, symbol, quantity, price)
        };
        self.ensure_setup(symbol)
            .await
            .map_err(|e| fail(format!("venue setup failed: {e}")))?;

        for attempt in 0..self.max_retries {
            let submit_price = if attempt == 0 {
                price
            } else {
                self.adjust_price(side, price, attempt).await
            };

            match self
                .exchange
                .place_order(symbol, "market", side.wire_side(), quantity, Some(submit_price))
                .await
            {
                Ok(raw) => {
                    if raw.status == "closed" {
                        return Ok(parse_raw_order(
                            &raw,
                            side,
                            self.leverage as f64,
                            self.margin_mode,
                        ));
                    }
                    return self
                        .await_market_fill(&raw.id, symbol, side)
                        .await
                        .map_err(|e| fail(e.to_string()));
                }
                Err(e) => {
                    error!(
                        "Market order attempt {}/{} failed: {}",
                        attempt + 1,
                        self.max_retries,
                        e
                    );
                    // Linear backoff between attempts
                    tokio::time::sleep(self.retry_delay * (attempt + 1)).await;
                }
            }
        }

        Err(fail("market order failed after maximum retries".into()))
    }

    async fn execute_limit_order(
        &self,
        side: OrderSide,
        symbol: &str,
        quantity: f64,
        price: f64,
    ) -> Result<PerpOrder, ExecutionError> {
        let fail = |message: String| {
            ExecutionError::new(message, side, OrderType::Limit, symbol, quantity, price)
        };
        self.ensure_setup(symbol)
            .await
            .map_err(|e| fail(format!("venue setup failed: {e}")))?;

        let raw = self
            .exchange
            .place_order(symbol, "limit", side.wire_side(), quantity, Some(price))
            .await
            .map_err(|e| fail(e.to_string()))?;

        Ok(parse_raw_order(
            &raw,
            side,
            self.leverage as f64,
            self.margin_mode,
        ))
    }

    async fn get_order(
        &self,
        order_id: &str,
        symbol: &str,
        side: OrderSide,
    ) -> BotResult<PerpOrder> {
        let raw = self.exchange.fetch_order(order_id, symbol).await?;
        Ok(parse_raw_order(
            &raw,
            side,
            self.leverage as f64,
            self.margin_mode,
        ))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> BotResult<()> {
        for attempt in 0..self.max_retries {
            match self.exchange.cancel_order(order_id, symbol).await {
                Ok(result) if result.status == "canceled" || result.status == "closed" => {
                    info!("Order {order_id} cancelled (venue status {})", result.status);
                    return Ok(());
                }
                Ok(result) => {
                    warn!(
                        "Cancel attempt {}/{} for {} returned status {}",
                        attempt + 1,
                        self.max_retries,
                        order_id,
                        result.status
                    );
                }
                Err(BotError::OrderNotFound(_)) => {
                    // Already gone: filled or cancelled before we asked
                    info!("Order {order_id} not found on cancel; treating as done");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Cancel attempt {}/{} for {} failed: {}",
                        attempt + 1,
                        self.max_retries,
                        order_id,
                        e
                    );
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
        Err(BotError::OrderCancellation(format!(
            "order {order_id} not cancelled after {} attempts",
            self.max_retries
        )))
    }

    async fn get_funding_rate(&self, symbol: &str) -> BotResult<f64> {
        self.exchange.get_funding_rate(symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::order::OrderStatus;

    fn executor(venue: Arc<PaperExchange>) -> LiveOrderExecutor<PaperExchange> {
        LiveOrderExecutor::new(venue, 10, MarginMode::Isolated)
            .with_retry_config(2, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_market_order_resolves_to_closed() {
        let venue = Arc::new(PaperExchange::new("USDT", 100.0, 10_000.0));
        let exec = executor(venue);

        let order = exec
            .execute_market_order(OrderSide::BuyOpen, "BTC/USDT:USDT", 1.0, 100.0)
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(order.side, OrderSide::BuyOpen);
        assert!((order.filled - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_limit_order_rests_open() {
        let venue = Arc::new(PaperExchange::new("USDT", 100.0, 10_000.0));
        let exec = executor(venue.clone());

        let order = exec
            .execute_limit_order(OrderSide::SellClose, "BTC/USDT:USDT", 1.0, 110.0)
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.remaining, 1.0);
        assert_eq!(venue.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_context() {
        let venue = Arc::new(PaperExchange::new("USDT", 100.0, 10_000.0));
        venue.set_fail_orders(true).await;
        let exec = executor(venue);

        let err = exec
            .execute_market_order(OrderSide::BuyOpen, "BTC/USDT:USDT", 2.0, 100.0)
            .await
            .unwrap_err();

        assert_eq!(err.symbol, "BTC/USDT:USDT");
        assert_eq!(err.side, OrderSide::BuyOpen);
        assert!((err.quantity - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_cancel_missing_order_is_ok() {
        let venue = Arc::new(PaperExchange::new("USDT", 100.0, 10_000.0));
        let exec = executor(venue);

        // OrderNotFound is treated as already-gone
        assert!(exec.cancel_order("ghost", "BTC/USDT:USDT").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_resting_order() {
        let venue = Arc::new(PaperExchange::new("USDT", 100.0, 10_000.0));
        let exec = executor(venue);

        let order = exec
            .execute_limit_order(OrderSide::BuyOpen, "BTC/USDT:USDT", 1.0, 90.0)
            .await
            .unwrap();
        assert!(exec
            .cancel_order(&order.identifier, "BTC/USDT:USDT")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_setup_runs_once_before_first_order() {
        let venue = Arc::new(PaperExchange::new("USDT", 100.0, 10_000.0));
        let exec = executor(venue.clone());

        assert!(!*exec.setup_done.lock().await);
        exec.execute_limit_order(OrderSide::BuyOpen, "BTC/USDT:USDT", 1.0, 90.0)
            .await
            .unwrap();
        assert!(*exec.setup_done.lock().await);

        // Leverage and margin mode landed on the venue
        let (leverage, margin_mode, hedged) = venue.venue_config().await;
        assert_eq!(leverage, 10);
        assert_eq!(margin_mode, Some(MarginMode::Isolated));
        assert!(!hedged);
    }
}
