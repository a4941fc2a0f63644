//! Bot wiring and lifecycle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::balance::BalanceTracker;
use crate::config::{Settings, TradingMode};
use crate::errors::{BotError, BotResult};
use crate::events::{BotEvent, EventBus, EventKind};
use crate::exchange::{BacktestExchange, Candle, Exchange, PaperExchange};
use crate::execution::{BacktestOrderExecutor, LiveOrderExecutor, OrderExecutor};
use crate::grid::GridManager;
use crate::order::{OrderBook, OrderManager, OrderValidator};
use crate::strategy::{GridTradingStrategy, PerformanceSummary};
use crate::tracker::OrderStatusTracker;

/// Fraction unwound per side when a margin call cannot be covered
const MARGIN_CALL_REDUCTION: f64 = 0.3;

/// Lifecycle commands from the control dispatcher to the run loop
enum Lifecycle {
    Restart,
    Quit,
}

/// Health report for the operator surface
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub strategy_running: bool,
    pub margin_ok: bool,
    pub overall: bool,
}

/// The assembled trading engine: owns every component, dispatches bus
/// events, and drives the strategy through stop/restart cycles.
pub struct PerpGridBot {
    settings: Settings,
    symbol: String,
    event_bus: Arc<EventBus>,
    exchange: Arc<dyn Exchange>,
    order_book: Arc<OrderBook>,
    balance: Arc<BalanceTracker>,
    grid: Arc<GridManager>,
    order_manager: Arc<OrderManager>,
    strategy: Arc<GridTradingStrategy>,
    tracker: Arc<OrderStatusTracker>,
    is_running: AtomicBool,
    lifecycle_tx: UnboundedSender<Lifecycle>,
    lifecycle_rx: Mutex<UnboundedReceiver<Lifecycle>>,
    dispatch_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PerpGridBot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerpGridBot")
            .field("symbol", &self.symbol)
            .finish_non_exhaustive()
    }
}

impl PerpGridBot {
    /// Build a bot for the configured trading mode. Live modes require a
    /// venue adapter injected from outside this crate.
    pub fn new(settings: Settings) -> BotResult<Arc<Self>> {
        settings.validate()?;
        match settings.exchange.trading_mode {
            TradingMode::PaperTrading => {
                let venue = Arc::new(PaperExchange::new(
                    settings.exchange.quote_currency.clone(),
                    settings.grid.reversion_price,
                    settings.risk.initial_balance,
                ));
                Self::with_paper_venue(settings, venue)
            }
            TradingMode::Backtest => Err(BotError::InvalidConfig(
                "backtest mode requires historical data; use with_backtest_data".into(),
            )),
            TradingMode::Live | TradingMode::PerpetualLive => Err(BotError::UnsupportedExchange(
                settings.exchange.exchange_name.clone(),
            )),
        }
    }

    /// Build a paper-trading bot against the given simulated venue.
    pub fn with_paper_venue(
        settings: Settings,
        venue: Arc<PaperExchange>,
    ) -> BotResult<Arc<Self>> {
        let executor = Arc::new(LiveOrderExecutor::new(
            Arc::clone(&venue),
            settings.risk.leverage,
            settings.risk.margin_mode,
        ));
        Self::assemble(
            settings,
            venue as Arc<dyn Exchange>,
            executor as Arc<dyn OrderExecutor>,
            None,
        )
    }

    /// Build a backtest bot replaying the given candle series.
    pub fn with_backtest_data(settings: Settings, candles: Vec<Candle>) -> BotResult<Arc<Self>> {
        let venue = Arc::new(BacktestExchange::new(
            settings.exchange.quote_currency.clone(),
            candles,
        ));
        let executor = Arc::new(BacktestOrderExecutor::new(
            settings.risk.leverage as f64,
            settings.risk.margin_mode,
            0.0001,
        ));
        Self::assemble(
            settings,
            venue as Arc<dyn Exchange>,
            Arc::clone(&executor) as Arc<dyn OrderExecutor>,
            Some(executor),
        )
    }

    fn assemble(
        settings: Settings,
        exchange: Arc<dyn Exchange>,
        executor: Arc<dyn OrderExecutor>,
        backtest_clock: Option<Arc<BacktestOrderExecutor>>,
    ) -> BotResult<Arc<Self>> {
        let symbol = settings.symbol();
        let trading_mode = settings.exchange.trading_mode;
        info!(
            "Starting perpetual grid bot in {:?} mode for {}",
            trading_mode, symbol
        );

        let event_bus = Arc::new(EventBus::new());
        let order_book = Arc::new(OrderBook::new());
        let balance = Arc::new(
            BalanceTracker::new(
                trading_mode,
                settings.exchange.quote_currency.clone(),
                settings.risk.trading_fee,
            )
            .with_margin_ratios(1.0 / settings.risk.leverage as f64, 0.05),
        );
        let grid = Arc::new(GridManager::new(
            &settings.grid,
            settings.risk.leverage as f64,
        )?);

        let order_manager = Arc::new(OrderManager::new(
            trading_mode,
            symbol.clone(),
            settings.risk.leverage as f64,
            Arc::clone(&grid),
            Arc::clone(&order_book),
            Arc::clone(&balance),
            OrderValidator::default(),
            Arc::clone(&executor),
            Arc::clone(&exchange),
            Arc::clone(&event_bus),
        ));

        let tracker = Arc::new(OrderStatusTracker::new(
            Arc::clone(&order_book),
            Arc::clone(&executor),
            Arc::clone(&event_bus),
            symbol.clone(),
        ));

        let mut strategy = GridTradingStrategy::new(
            trading_mode,
            symbol.clone(),
            settings.risk.funding_rate_threshold,
            settings.risk.take_profit_price,
            settings.risk.stop_loss_price,
            Arc::clone(&exchange),
            Arc::clone(&grid),
            Arc::clone(&order_manager),
            Arc::clone(&order_book),
            Arc::clone(&balance),
            Arc::clone(&event_bus),
        );
        if let Some(clock) = backtest_clock {
            strategy = strategy.with_backtest_clock(clock);
        }

        let (lifecycle_tx, lifecycle_rx) = unbounded_channel();

        Ok(Arc::new(Self {
            settings,
            symbol,
            event_bus,
            exchange,
            order_book,
            balance,
            grid,
            order_manager,
            strategy: Arc::new(strategy),
            tracker,
            is_running: AtomicBool::new(false),
            lifecycle_tx,
            lifecycle_rx: Mutex::new(lifecycle_rx),
            dispatch_handles: Mutex::new(Vec::new()),
        }))
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    pub fn order_book(&self) -> Arc<OrderBook> {
        Arc::clone(&self.order_book)
    }

    pub fn balance(&self) -> Arc<BalanceTracker> {
        Arc::clone(&self.balance)
    }

    pub fn grid(&self) -> Arc<GridManager> {
        Arc::clone(&self.grid)
    }

    pub fn strategy(&self) -> Arc<GridTradingStrategy> {
        Arc::clone(&self.strategy)
    }

    pub async fn tracker_running(&self) -> bool {
        self.tracker.is_running().await
    }

    /// Run to completion: backtest ends with the data, live/paper ends when
    /// the operator quits.
    pub async fn run(self: &Arc<Self>) -> BotResult<PerformanceSummary> {
        self.is_running.store(true, Ordering::SeqCst);

        self.exchange.initialize().await?;
        self.balance
            .setup(
                self.settings.risk.initial_balance,
                self.exchange.as_ref(),
                &self.symbol,
            )
            .await?;

        let is_backtest = self.settings.exchange.trading_mode.is_backtest();
        if is_backtest {
            let window = self
                .settings
                .backtest
                .as_ref()
                .ok_or_else(|| BotError::InvalidConfig("missing [backtest] section".into()))?;
            self.strategy
                .load_historical_data(&window.timeframe, &window.start_date, &window.end_date)
                .await?;
        } else {
            self.tracker.start_tracking().await;
        }

        self.spawn_dispatchers().await;

        loop {
            self.strategy.run().await?;
            if is_backtest {
                break;
            }
            // Strategy stopped; wait for a lifecycle decision
            let decision = self.lifecycle_rx.lock().await.recv().await;
            match decision {
                Some(Lifecycle::Restart) => {
                    info!("Restarting strategy loop");
                    continue;
                }
                Some(Lifecycle::Quit) | None => break,
            }
        }

        self.shutdown().await;
        let summary = self.strategy.performance_summary().await;
        info!(
            "Run complete: realized {:.4}, fees {:.4}, funding {:.4}, {} completed orders",
            summary.realized_pnl, summary.trading_fees, summary.funding_fees,
            summary.completed_orders
        );
        Ok(summary)
    }

    /// Stop the tracker loops and the strategy; the in-memory grid and
    /// order book are preserved for a later restart.
    pub async fn stop(&self) {
        if !self.is_running.load(Ordering::SeqCst) {
            info!("Bot is not running; nothing to stop");
            return;
        }
        info!("Stopping perpetual grid bot");
        self.tracker.stop_tracking().await;
        if let Err(e) = self.strategy.stop().await {
            error!("Error while stopping strategy: {e}");
        }
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Bring the loops back up without re-reading configuration.
    pub async fn restart(&self) {
        info!("Restart requested");
        if !self.settings.exchange.trading_mode.is_backtest() {
            self.tracker.start_tracking().await;
        }
        self.is_running.store(true, Ordering::SeqCst);
        let _ = self.lifecycle_tx.send(Lifecycle::Restart);
    }

    /// Strategy liveness plus margin risk against the configured
    /// liquidation threshold.
    pub async fn health_status(&self) -> HealthStatus {
        let strategy_running = self.strategy.is_running();
        let margin_ok = self.check_margin_risk().await;
        HealthStatus {
            strategy_running,
            margin_ok,
            overall: strategy_running && margin_ok,
        }
    }

    /// Margin-ratio floor check; a breach publishes MARGIN_RISK.
    pub async fn check_margin_risk(&self) -> bool {
        let mark = self.balance.snapshot().await.last_mark_price;
        if mark <= 0.0 {
            return true;
        }
        let ratio = self.balance.margin_ratio(mark).await;
        if ratio <= self.settings.risk.liquidation_threshold {
            warn!(
                "Margin ratio {:.4} at or below liquidation threshold {:.4}",
                ratio, self.settings.risk.liquidation_threshold
            );
            self.event_bus.publish(BotEvent::MarginRisk(format!(
                "margin ratio {ratio:.4} below threshold"
            )));
            return false;
        }
        true
    }

    /// Wire the event dispatchers. One task per event kind keeps handler
    /// execution ordered within each kind.
    async fn spawn_dispatchers(self: &Arc<Self>) {
        let mut handles = self.dispatch_handles.lock().await;
        if !handles.is_empty() {
            return;
        }

        // Fills feed the order manager in live/paper mode. The backtest
        // replay invokes the handler inline instead, so wiring it here
        // would double-apply every fill.
        if !self.settings.exchange.trading_mode.is_backtest() {
            let bot = Arc::clone(self);
            let mut fills = self.event_bus.subscribe(EventKind::OrderFilled);
            handles.push(tokio::spawn(async move {
                while let Some(BotEvent::OrderFilled(order)) = fills.recv().await {
                    bot.order_manager.on_order_filled(&order).await;
                }
            }));
        }

        // Funding probes settle against the position notional
        let bot = Arc::clone(self);
        let mut funding = self.event_bus.subscribe(EventKind::FundingFee);
        handles.push(tokio::spawn(async move {
            while let Some(BotEvent::FundingFee { rate, .. }) = funding.recv().await {
                let mark = bot.balance.snapshot().await.last_mark_price;
                let amount = bot.balance.total_position_value(mark).await * rate;
                bot.balance.apply_funding_fee(amount).await;
                bot.event_bus.publish(BotEvent::FundingFeeCharged { amount });
                bot.event_bus
                    .publish(BotEvent::FundingFeeSettled { rate, amount });
            }
        }));

        // Settled funding reaches the strategy's de-risking hook
        let bot = Arc::clone(self);
        let mut settled = self.event_bus.subscribe(EventKind::FundingFeeSettled);
        handles.push(tokio::spawn(async move {
            while let Some(BotEvent::FundingFeeSettled { rate, amount }) = settled.recv().await {
                if let Err(e) = bot.strategy.on_funding_fee_settled(rate, amount).await {
                    error!("Funding settlement handling failed: {e}");
                }
            }
        }));

        // Lifecycle control
        let bot = Arc::clone(self);
        let mut stops = self.event_bus.subscribe(EventKind::StopBot);
        handles.push(tokio::spawn(async move {
            while let Some(BotEvent::StopBot(reason)) = stops.recv().await {
                info!("Handling STOP_BOT event: {reason}");
                let quitting = reason.contains("shutdown");
                bot.stop().await;
                if quitting {
                    let _ = bot.lifecycle_tx.send(Lifecycle::Quit);
                }
            }
        }));

        let bot = Arc::clone(self);
        let mut starts = self.event_bus.subscribe(EventKind::StartBot);
        handles.push(tokio::spawn(async move {
            while let Some(BotEvent::StartBot(reason)) = starts.recv().await {
                info!("Handling START_BOT event: {reason}");
                bot.restart().await;
            }
        }));

        // Margin calls: cover from free margin when possible, else unwind
        let bot = Arc::clone(self);
        let mut margin_calls = self.event_bus.subscribe(EventKind::MarginCall);
        handles.push(tokio::spawn(async move {
            while let Some(BotEvent::MarginCall {
                required_margin,
                current_margin,
            }) = margin_calls.recv().await
            {
                warn!(
                    "Margin call: required {:.4}, current {:.4}",
                    required_margin, current_margin
                );
                let shortfall = required_margin - current_margin;
                if shortfall <= 0.0 {
                    continue;
                }
                if bot.balance.available_margin().await >= shortfall {
                    info!("Shortfall covered by available margin");
                    continue;
                }
                warn!("Insufficient balance for margin call, reducing positions");
                let _ = bot
                    .order_manager
                    .reduce_exposure(true, MARGIN_CALL_REDUCTION)
                    .await;
                let _ = bot
                    .order_manager
                    .reduce_exposure(false, MARGIN_CALL_REDUCTION)
                    .await;
            }
        }));

        // Operator-facing notifications end up in the log
        let mut cancelled = self.event_bus.subscribe(EventKind::OrderCancelled);
        handles.push(tokio::spawn(async move {
            while let Some(BotEvent::OrderCancelled(order)) = cancelled.recv().await {
                warn!("Order {} cancelled on the venue", order.identifier);
            }
        }));

        let mut failures = self.event_bus.subscribe(EventKind::OrderFailed);
        handles.push(tokio::spawn(async move {
            while let Some(BotEvent::OrderFailed(detail)) = failures.recv().await {
                error!("Order failed: {detail}");
            }
        }));

        let mut adl = self.event_bus.subscribe(EventKind::AdlTriggered);
        handles.push(tokio::spawn(async move {
            while let Some(BotEvent::AdlTriggered(order)) = adl.recv().await {
                warn!("Auto-deleveraging hit order {}", order.identifier);
            }
        }));

        let mut warnings = self.event_bus.subscribe(EventKind::LiquidationWarning);
        handles.push(tokio::spawn(async move {
            while let Some(BotEvent::LiquidationWarning {
                order,
                margin_ratio,
                liquidation_price,
            }) = warnings.recv().await
            {
                warn!(
                    "Liquidation warning for {}: margin ratio {:.4}, liq price {:?}",
                    order.identifier, margin_ratio, liquidation_price
                );
            }
        }));
    }

    async fn shutdown(&self) {
        self.tracker.stop_tracking().await;
        if let Err(e) = self.exchange.close_connection().await {
            error!("Error closing gateway connection: {e}");
        }
        let mut handles = self.dispatch_handles.lock().await;
        let aborted: Vec<_> = handles
            .drain(..)
            .map(|handle| {
                handle.abort();
                handle
            })
            .collect();
        let _ = futures_util::future::join_all(aborted).await;
        self.is_running.store(false, Ordering::SeqCst);
        info!("Perpetual grid bot has been stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BacktestSettings, ExchangeSettings, GridSettings, InstrumentType, LogSettings,
        RiskSettings, SpacingType, StrategyType,
    };
    use crate::order::MarginMode;
    use std::time::Duration;

    fn settings(mode: TradingMode) -> Settings {
        let ratio = 1.0 - (50.0_f64 / 130.0).powf(0.2);
        Settings {
            exchange: ExchangeSettings {
                exchange_name: "paper".into(),
                base_currency: "BTC".into(),
                quote_currency: "USDT".into(),
                trading_mode: mode,
                instrument_type: InstrumentType::Perpetual,
            },
            grid: GridSettings {
                strategy_type: StrategyType::SimpleGrid,
                spacing_type: SpacingType::Arithmetic,
                reversion_price: 130.0,
                grid_ratio: ratio,
                grid_value: 100.0,
                num_grids: 5,
                max_placed_orders: 5,
            },
            risk: RiskSettings {
                leverage: 1,
                margin_mode: MarginMode::Isolated,
                trading_fee: 0.0005,
                liquidation_threshold: 0.05,
                funding_rate_threshold: 0.0003,
                initial_balance: 1000.0,
                take_profit_price: None,
                stop_loss_price: None,
            },
            backtest: Some(BacktestSettings {
                timeframe: "1h".into(),
                start_date: "2024-01-01".into(),
                end_date: "2024-02-01".into(),
            }),
            log: LogSettings::default(),
        }
    }

    fn candle(timestamp: i64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn test_live_mode_requires_external_adapter() {
        let err = PerpGridBot::new(settings(TradingMode::Live)).unwrap_err();
        assert!(matches!(err, BotError::UnsupportedExchange(_)));
    }

    #[tokio::test]
    async fn test_backtest_run_produces_summary() {
        let candles = vec![
            candle(0, 96.0, 94.0, 95.0),
            candle(60_000, 95.0, 89.0, 90.0),
            candle(120_000, 90.0, 65.0, 72.0),
            candle(180_000, 112.0, 72.0, 111.0),
        ];
        let bot = PerpGridBot::with_backtest_data(settings(TradingMode::Backtest), candles).unwrap();

        let summary = bot.run().await.unwrap();

        assert!(summary.realized_pnl > 0.0);
        assert!(summary.completed_orders >= 2);
        assert_eq!(summary.samples, 4);
        assert!(bot.strategy().is_seeded());
    }

    #[tokio::test]
    async fn test_paper_restart_preserves_state() {
        let venue = Arc::new(PaperExchange::new("USDT", 130.0, 1000.0));
        let bot = PerpGridBot::with_paper_venue(settings(TradingMode::PaperTrading), venue.clone())
            .unwrap();
        // Fast ticker so the test does not wait on the 3s default
        // (the strategy reads prices as they are pushed regardless)
        let runner = Arc::clone(&bot);
        let run_handle = tokio::spawn(async move { runner.run().await });

        // Let the run loop come up, then cross the reversion price
        tokio::time::sleep(Duration::from_millis(50)).await;
        venue.push_price(95.0).await;
        venue.push_price(90.0).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(bot.strategy().is_seeded());
        let orders_before = bot.order_book().len().await;
        assert!(orders_before > 0);
        assert!(bot.tracker_running().await);

        // Stop, then start again
        bot.event_bus()
            .publish(BotEvent::StopBot("User issued stop command".into()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!bot.strategy().is_running());

        bot.event_bus()
            .publish(BotEvent::StartBot("User issued restart command".into()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Loops are back, grid and book preserved, no duplicate orders
        assert!(bot.tracker_running().await);
        assert!(bot.strategy().is_running());
        assert_eq!(bot.order_book().len().await, orders_before);

        // Quit ends the run loop
        bot.event_bus()
            .publish(BotEvent::StopBot("User requested shutdown".into()));
        let summary = tokio::time::timeout(Duration::from_secs(5), run_handle)
            .await
            .expect("run loop should exit on shutdown")
            .unwrap()
            .unwrap();
        assert!(summary.samples >= 2);
    }

    #[tokio::test]
    async fn test_margin_risk_check_publishes_event() {
        let venue = Arc::new(PaperExchange::new("USDT", 100.0, 10.0));
        let bot = PerpGridBot::with_paper_venue(settings(TradingMode::PaperTrading), venue)
            .unwrap();
        let mut risks = bot.event_bus().subscribe(EventKind::MarginRisk);

        // A large position against a tiny margin balance
        bot.balance()
            .setup(0.0, bot.exchange.as_ref(), "BTC/USDT:USDT")
            .await
            .unwrap();
        let order = BacktestOrderExecutor::default()
            .execute_market_order(crate::order::OrderSide::BuyOpen, "BTC/USDT:USDT", 5.0, 100.0)
            .await
            .unwrap();
        bot.balance().record_fill(&order).await;
        bot.balance().update_mark(100.0).await;

        assert!(!bot.check_margin_risk().await);
        assert!(matches!(risks.try_recv(), Ok(BotEvent::MarginRisk(_))));
    }
}
