//! Top-level trading strategy: ticker loop, seeding, TP/SL and replay

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::Mutex;

use crate::balance::BalanceTracker;
use crate::config::TradingMode;
use crate::errors::{BotError, BotResult};
use crate::events::{BotEvent, EventBus};
use crate::exchange::{Candle, Exchange};
use crate::execution::BacktestOrderExecutor;
use crate::grid::GridManager;
use crate::order::{OrderBook, OrderManager};

const DEFAULT_TICKER_INTERVAL: Duration = Duration::from_secs(3);

/// Fraction of the paying side unwound when funding crosses the threshold
const FUNDING_DERISK_FRACTION: f64 = 0.2;

/// One observation of account state, taken per ticker tick or per bar
#[derive(Debug, Clone, Copy)]
pub struct MetricSample {
    pub timestamp: i64,
    pub account_value: f64,
    pub price: f64,
}

/// End-of-run report assembled from the metric series and the books
#[derive(Debug, Clone)]
pub struct PerformanceSummary {
    pub initial_account_value: f64,
    pub final_account_value: f64,
    pub realized_pnl: f64,
    pub trading_fees: f64,
    pub funding_fees: f64,
    pub completed_orders: usize,
    pub samples: usize,
}

/// Runs the grid: consumes ticker prices, seeds the lattice when price
/// reverts below the anchor, replays history in backtest mode, and raises
/// STOP_BOT when take-profit or stop-loss trips.
pub struct GridTradingStrategy {
    trading_mode: TradingMode,
    symbol: String,
    funding_rate_threshold: f64,
    take_profit_price: Option<f64>,
    stop_loss_price: Option<f64>,
    ticker_interval: Duration,
    exchange: Arc<dyn Exchange>,
    grid: Arc<GridManager>,
    order_manager: Arc<OrderManager>,
    order_book: Arc<OrderBook>,
    balance: Arc<BalanceTracker>,
    event_bus: Arc<EventBus>,
    /// Virtual clock shared with the backtest executor, when replaying
    backtest_clock: Option<Arc<BacktestOrderExecutor>>,
    running: AtomicBool,
    grid_seeded: AtomicBool,
    metrics: Mutex<Vec<MetricSample>>,
    /// (timestamp, rate, amount) funding settlements observed
    funding_history: Mutex<Vec<(i64, f64, f64)>>,
    candles: Mutex<Option<Vec<Candle>>>,
}

impl GridTradingStrategy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trading_mode: TradingMode,
        symbol: impl Into<String>,
        funding_rate_threshold: f64,
        take_profit_price: Option<f64>,
        stop_loss_price: Option<f64>,
        exchange: Arc<dyn Exchange>,
        grid: Arc<GridManager>,
        order_manager: Arc<OrderManager>,
        order_book: Arc<OrderBook>,
        balance: Arc<BalanceTracker>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            trading_mode,
            symbol: symbol.into(),
            funding_rate_threshold,
            take_profit_price,
            stop_loss_price,
            ticker_interval: DEFAULT_TICKER_INTERVAL,
            exchange,
            grid,
            order_manager,
            order_book,
            balance,
            event_bus,
            backtest_clock: None,
            running: AtomicBool::new(false),
            grid_seeded: AtomicBool::new(false),
            metrics: Mutex::new(Vec::new()),
            funding_history: Mutex::new(Vec::new()),
            candles: Mutex::new(None),
        }
    }

    /// Attach the backtest executor so the replay can advance its clock
    pub fn with_backtest_clock(mut self, executor: Arc<BacktestOrderExecutor>) -> Self {
        self.backtest_clock = Some(executor);
        self
    }

    pub fn with_ticker_interval(mut self, interval: Duration) -> Self {
        self.ticker_interval = interval;
        self
    }

    /// Load the OHLCV window for backtest mode
    pub async fn load_historical_data(
        &self,
        timeframe: &str,
        start_date: &str,
        end_date: &str,
    ) -> BotResult<()> {
        let data = self
            .exchange
            .fetch_ohlcv(&self.symbol, timeframe, start_date, end_date)
            .await?;
        info!("Loaded {} candles for replay", data.len());
        *self.candles.lock().await = Some(data);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_seeded(&self) -> bool {
        self.grid_seeded.load(Ordering::SeqCst)
    }

    /// Run until stopped (live/paper) or until the data is exhausted
    /// (backtest).
    pub async fn run(&self) -> BotResult<()> {
        self.running.store(true, Ordering::SeqCst);
        let result = if self.trading_mode.is_backtest() {
            self.run_backtest().await
        } else {
            self.run_live().await
        };
        self.running.store(false, Ordering::SeqCst);
        info!("Strategy loop exited");
        result
    }

    /// Stop consuming prices and close the gateway connection.
    pub async fn stop(&self) -> BotResult<()> {
        self.running.store(false, Ordering::SeqCst);
        self.exchange.close_connection().await?;
        info!("Trading execution stopped");
        Ok(())
    }

    /// Re-enter the run loop after a stop. Grid and book state carry over;
    /// configuration is not re-read.
    pub async fn restart(&self) -> BotResult<()> {
        if self.is_running() {
            return Ok(());
        }
        info!("Restarting trading session");
        self.run().await
    }

    async fn run_live(&self) -> BotResult<()> {
        let reversion_price = self.grid.reversion_price();
        info!(
            "Starting {} trading, reversion price {:.4}",
            if self.trading_mode.is_live() { "live" } else { "paper" },
            reversion_price
        );

        let (tx, mut rx) = unbounded_channel();
        let exchange = Arc::clone(&self.exchange);
        let symbol = self.symbol.clone();
        let interval = self.ticker_interval;
        let ticker_task = tokio::spawn(async move {
            if let Err(e) = exchange.listen_to_ticker_updates(&symbol, tx, interval).await {
                error!("Ticker stream terminated: {e}");
            }
        });

        let mut last_price: Option<f64> = None;
        while let Some(price) = rx.recv().await {
            if !self.is_running() {
                info!("Trading stopped; halting price updates");
                break;
            }
            if let Err(e) = self.on_tick(price, last_price).await {
                error!("Error during ticker update: {e}");
            }
            last_price = Some(price);
        }

        ticker_task.abort();
        Ok(())
    }

    /// One ticker tick: sample metrics, seed once below the reversion
    /// price, then watch take-profit/stop-loss.
    async fn on_tick(&self, price: f64, last_price: Option<f64>) -> BotResult<()> {
        self.balance.update_mark(price).await;
        self.record_sample(chrono::Utc::now().timestamp_millis(), price)
            .await;

        if !self.is_seeded() {
            if last_price.is_none() {
                return Ok(());
            }
            if price < self.grid.reversion_price() {
                info!(
                    "Price {:.4} below reversion {:.4}: seeding grid",
                    price,
                    self.grid.reversion_price()
                );
                self.order_manager.perform_initial_purchase(price).await?;
                self.order_manager.initialize_grid_orders(price).await?;
                self.grid_seeded.store(true, Ordering::SeqCst);
            }
            return Ok(());
        }

        if self.evaluate_tp_sl(price) {
            info!("Take-profit or stop-loss triggered at {:.4}", price);
            self.event_bus
                .publish(BotEvent::StopBot("TP or SL hit.".into()));
        }
        Ok(())
    }

    async fn run_backtest(&self) -> BotResult<()> {
        let candles = self
            .candles
            .lock()
            .await
            .clone()
            .ok_or_else(|| BotError::DataFetch("no data available for backtesting".into()))?;
        info!("Starting backtest over {} bars", candles.len());

        let reversion_price = self.grid.reversion_price();
        let mut last_price: Option<f64> = None;

        for candle in &candles {
            if let Some(clock) = &self.backtest_clock {
                clock.set_clock(candle.timestamp);
            }
            self.balance.update_mark(candle.close).await;

            if !self.is_seeded() {
                if last_price.is_some() && candle.close < reversion_price {
                    self.order_manager
                        .perform_initial_purchase(candle.close)
                        .await?;
                    self.order_manager
                        .initialize_grid_orders(candle.close)
                        .await?;
                    self.grid_seeded.store(true, Ordering::SeqCst);
                }
                self.record_sample(candle.timestamp, candle.close).await;
                last_price = Some(candle.close);
                continue;
            }

            self.order_manager
                .simulate_order_fills(candle.high, candle.low, candle.timestamp)
                .await;
            self.balance.update_mark(candle.close).await;

            if self.evaluate_tp_sl(candle.close) {
                info!("Take-profit or stop-loss hit during replay");
                self.event_bus
                    .publish(BotEvent::StopBot("TP or SL hit.".into()));
                break;
            }

            self.record_sample(candle.timestamp, candle.close).await;
            last_price = Some(candle.close);
        }

        info!("Backtest replay complete");
        Ok(())
    }

    fn evaluate_tp_sl(&self, price: f64) -> bool {
        if let Some(tp) = self.take_profit_price {
            if price >= tp {
                return true;
            }
        }
        if let Some(sl) = self.stop_loss_price {
            if price <= sl {
                return true;
            }
        }
        false
    }

    async fn record_sample(&self, timestamp: i64, price: f64) -> MetricSample {
        let sample = MetricSample {
            timestamp,
            account_value: self.balance.total_margin().await,
            price,
        };
        self.metrics.lock().await.push(sample);
        sample
    }

    /// React to a settled funding fee: record it, and unwind part of the
    /// paying side when the rate magnitude crosses the threshold.
    pub async fn on_funding_fee_settled(&self, rate: f64, amount: f64) -> BotResult<()> {
        self.funding_history
            .lock()
            .await
            .push((chrono::Utc::now().timestamp_millis(), rate, amount));

        if rate.abs() > self.funding_rate_threshold {
            warn!(
                "Funding rate {:.6} beyond threshold {:.6}: reducing exposure",
                rate, self.funding_rate_threshold
            );
            // Longs pay when the rate is positive, shorts when negative
            self.order_manager
                .reduce_exposure(rate > 0.0, FUNDING_DERISK_FRACTION)
                .await?;
        }
        Ok(())
    }

    pub async fn metrics(&self) -> Vec<MetricSample> {
        self.metrics.lock().await.clone()
    }

    pub async fn funding_history(&self) -> Vec<(i64, f64, f64)> {
        self.funding_history.lock().await.clone()
    }

    /// Assemble the end-of-run report.
    pub async fn performance_summary(&self) -> PerformanceSummary {
        let metrics = self.metrics.lock().await;
        let balance = self.balance.snapshot().await;
        PerformanceSummary {
            initial_account_value: metrics.first().map(|m| m.account_value).unwrap_or(0.0),
            final_account_value: metrics.last().map(|m| m.account_value).unwrap_or(0.0),
            realized_pnl: balance.realized_pnl,
            trading_fees: balance.trading_fees,
            funding_fees: balance.funding_fees,
            completed_orders: self.order_book.get_completed().await.len(),
            samples: metrics.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GridSettings, SpacingType, StrategyType};
    use crate::events::EventKind;
    use crate::exchange::BacktestExchange;
    use crate::execution::OrderExecutor;
    use crate::order::OrderValidator;

    fn candle(timestamp: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    struct Fixture {
        strategy: Arc<GridTradingStrategy>,
        balance: Arc<BalanceTracker>,
        book: Arc<OrderBook>,
        bus: Arc<EventBus>,
    }

    async fn backtest_fixture(
        candles: Vec<Candle>,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    ) -> Fixture {
        // Arithmetic lattice {50, 70, 90, 110, 130}
        let ratio = 1.0 - (50.0_f64 / 130.0).powf(0.2);
        let settings = GridSettings {
            strategy_type: StrategyType::SimpleGrid,
            spacing_type: SpacingType::Arithmetic,
            reversion_price: 130.0,
            grid_ratio: ratio,
            grid_value: 100.0,
            num_grids: 5,
            max_placed_orders: 5,
        };
        let grid = Arc::new(GridManager::new(&settings, 1.0).unwrap());
        let book = Arc::new(OrderBook::new());
        let balance = Arc::new(BalanceTracker::new(TradingMode::Backtest, "USDT", 0.0005));
        let bus = Arc::new(EventBus::new());
        let executor = Arc::new(BacktestOrderExecutor::default());
        let exchange: Arc<BacktestExchange> =
            Arc::new(BacktestExchange::new("USDT", candles));

        balance
            .setup(1000.0, exchange.as_ref(), "BTC/USDT:USDT")
            .await
            .unwrap();

        let order_manager = Arc::new(OrderManager::new(
            TradingMode::Backtest,
            "BTC/USDT:USDT",
            1.0,
            Arc::clone(&grid),
            Arc::clone(&book),
            Arc::clone(&balance),
            OrderValidator::default(),
            executor.clone() as Arc<dyn crate::execution::OrderExecutor>,
            exchange.clone() as Arc<dyn Exchange>,
            Arc::clone(&bus),
        ));

        let strategy = Arc::new(
            GridTradingStrategy::new(
                TradingMode::Backtest,
                "BTC/USDT:USDT",
                0.0003,
                take_profit,
                stop_loss,
                exchange as Arc<dyn Exchange>,
                grid,
                order_manager,
                Arc::clone(&book),
                Arc::clone(&balance),
                Arc::clone(&bus),
            )
            .with_backtest_clock(executor),
        );
        Fixture {
            strategy,
            balance,
            book,
            bus,
        }
    }

    #[tokio::test]
    async fn test_backtest_seeds_and_harvests() {
        // Bar 1 records only; bar 2 seeds at 90; bar 3 dips to fill the 70
        // buy; bar 4 rallies through 110 to harvest the paired sell
        let candles = vec![
            candle(0, 95.0, 96.0, 94.0, 95.0),
            candle(60_000, 95.0, 95.0, 89.0, 90.0),
            candle(120_000, 90.0, 90.0, 65.0, 72.0),
            candle(180_000, 72.0, 112.0, 72.0, 111.0),
        ];
        let f = backtest_fixture(candles, None, None).await;
        f.strategy
            .load_historical_data("1h", "2024-01-01", "2024-02-01")
            .await
            .unwrap();

        f.strategy.run().await.unwrap();

        assert!(f.strategy.is_seeded());
        assert!(!f.strategy.is_running());

        // The 70 buy and at least one sell-close completed
        let completed = f.book.get_completed().await;
        assert!(completed.iter().any(|o| o.price == 70.0));
        assert!(completed.iter().any(|o| o.price == 110.0));

        // The harvested spread landed in realized PnL
        let snapshot = f.balance.snapshot().await;
        assert!(snapshot.realized_pnl > 0.0);

        let summary = f.strategy.performance_summary().await;
        assert_eq!(summary.samples, 4);
        assert!(summary.completed_orders >= 2);
        assert!(summary.trading_fees > 0.0);
    }

    #[tokio::test]
    async fn test_backtest_without_data_fails() {
        let f = backtest_fixture(vec![], None, None).await;
        assert!(f.strategy.run().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_loss_publishes_stop_bot() {
        let candles = vec![
            candle(0, 95.0, 96.0, 94.0, 95.0),
            candle(60_000, 95.0, 95.0, 89.0, 90.0),
            candle(120_000, 90.0, 90.0, 40.0, 45.0),
            candle(180_000, 45.0, 46.0, 44.0, 45.0),
        ];
        let f = backtest_fixture(candles, None, Some(48.0)).await;
        let mut stops = f.bus.subscribe(EventKind::StopBot);
        f.strategy
            .load_historical_data("1h", "2024-01-01", "2024-02-01")
            .await
            .unwrap();

        f.strategy.run().await.unwrap();

        match stops.try_recv() {
            Ok(BotEvent::StopBot(reason)) => assert!(reason.contains("TP or SL")),
            other => panic!("expected StopBot, got {other:?}"),
        }
        // Replay halted at the trigger bar
        assert_eq!(f.strategy.metrics().await.len(), 2);
    }

    #[tokio::test]
    async fn test_seeding_requires_prior_tick() {
        // The very first bar is already below reversion; seeding still
        // waits for a second observation
        let candles = vec![
            candle(0, 90.0, 91.0, 89.0, 90.0),
            candle(60_000, 90.0, 91.0, 89.0, 90.0),
        ];
        let f = backtest_fixture(candles, None, None).await;
        f.strategy
            .load_historical_data("1h", "2024-01-01", "2024-02-01")
            .await
            .unwrap();

        f.strategy.run().await.unwrap();

        assert!(f.strategy.is_seeded());
        // Only the second bar could seed, so no fills were simulated
        assert!(f.book.get_completed().await.len() <= 1);
    }

    #[tokio::test]
    async fn test_funding_settlement_derisks_longs() {
        let f = backtest_fixture(vec![candle(0, 90.0, 91.0, 89.0, 90.0)], None, None).await;

        // Build a long to unwind
        let order = BacktestOrderExecutor::default()
            .execute_market_order(crate::order::OrderSide::BuyOpen, "BTC/USDT:USDT", 2.0, 90.0)
            .await
            .unwrap();
        f.balance.record_fill(&order).await;
        assert!((f.balance.long_position().await - 2.0).abs() < 1e-9);

        // Below threshold: nothing happens
        f.strategy.on_funding_fee_settled(0.0001, 0.1).await.unwrap();
        assert!((f.balance.long_position().await - 2.0).abs() < 1e-9);

        // Above threshold: a fifth of the long is closed
        f.strategy.on_funding_fee_settled(0.001, 0.9).await.unwrap();
        assert!((f.balance.long_position().await - 1.6).abs() < 1e-9);

        let history = f.strategy.funding_history().await;
        assert_eq!(history.len(), 2);
    }
}
