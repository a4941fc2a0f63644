//! Concurrent order status polling and funding-rate monitoring

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::events::{BotEvent, EventBus};
use crate::execution::OrderExecutor;
use crate::order::{OrderBook, OrderStatus, PerpOrder};

const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_FUNDING_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Polls open orders and the funding rate, publishing fill/cancel/
/// liquidation events on the bus.
///
/// Each poll round launches one child query per open order; the children are
/// registered in a `JoinSet` and awaited together before the round ends, so
/// shutdown never strands an in-flight query.
pub struct OrderStatusTracker {
    order_book: Arc<OrderBook>,
    executor: Arc<dyn OrderExecutor>,
    event_bus: Arc<EventBus>,
    symbol: String,
    polling_interval: Duration,
    funding_check_interval: Duration,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    funding_handle: Mutex<Option<JoinHandle<()>>>,
}

impl OrderStatusTracker {
    pub fn new(
        order_book: Arc<OrderBook>,
        executor: Arc<dyn OrderExecutor>,
        event_bus: Arc<EventBus>,
        symbol: impl Into<String>,
    ) -> Self {
        Self {
            order_book,
            executor,
            event_bus,
            symbol: symbol.into(),
            polling_interval: DEFAULT_POLLING_INTERVAL,
            funding_check_interval: DEFAULT_FUNDING_CHECK_INTERVAL,
            shutdown: Mutex::new(None),
            monitor_handle: Mutex::new(None),
            funding_handle: Mutex::new(None),
        }
    }

    pub fn with_intervals(mut self, polling: Duration, funding_check: Duration) -> Self {
        self.polling_interval = polling;
        self.funding_check_interval = funding_check;
        self
    }

    /// Start the poll and funding loops. A no-op when already running.
    pub async fn start_tracking(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.lock().await;
        if shutdown.is_some() {
            warn!("Order status tracker is already running");
            return;
        }
        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);

        let tracker = Arc::clone(self);
        let mut monitor_rx = rx.clone();
        *self.monitor_handle.lock().await = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.polling_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tracker.process_open_orders().await,
                    _ = monitor_rx.changed() => break,
                }
            }
            info!("Order poll loop stopped");
        }));

        let tracker = Arc::clone(self);
        let mut funding_rx = rx;
        *self.funding_handle.lock().await = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.funding_check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tracker.check_funding_rate().await,
                    _ = funding_rx.changed() => break,
                }
            }
            info!("Funding rate loop stopped");
        }));

        info!("Order status tracking started for {}", self.symbol);
    }

    /// Stop both loops and wait for them, including any child queries still
    /// in flight in the current round.
    pub async fn stop_tracking(&self) {
        let sender = self.shutdown.lock().await.take();
        match sender {
            Some(tx) => {
                let _ = tx.send(true);
            }
            None => return,
        }

        if let Some(handle) = self.monitor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Order poll loop join error: {e}");
            }
        }
        if let Some(handle) = self.funding_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Funding loop join error: {e}");
            }
        }
        info!("Order status tracking stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.shutdown.lock().await.is_some()
    }

    /// One poll round: query every open order in parallel and dispatch the
    /// observed statuses.
    async fn process_open_orders(&self) {
        let open_orders = self.order_book.get_open().await;
        if open_orders.is_empty() {
            return;
        }

        let mut queries = JoinSet::new();
        for local in open_orders {
            let executor = Arc::clone(&self.executor);
            let symbol = self.symbol.clone();
            queries.spawn(async move {
                let result = executor
                    .get_order(&local.identifier, &symbol, local.side)
                    .await;
                (local, result)
            });
        }

        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((_, Ok(remote))) => self.handle_status_change(remote).await,
                Ok((local, Err(e))) => {
                    error!("Failed to query order {}: {e}", local.identifier);
                }
                Err(e) => error!("Order query task failed: {e}"),
            }
        }
    }

    /// Dispatch one observed remote order status.
    async fn handle_status_change(&self, remote: PerpOrder) {
        match remote.status {
            OrderStatus::Unknown => {
                // Never silently coerce a missing status into a final state
                error!(
                    "Order {} reported without a usable status; rejecting update",
                    remote.identifier
                );
            }
            OrderStatus::Closed => {
                self.order_book.update(remote.clone()).await;
                info!("Order {} filled", remote.identifier);
                self.event_bus.publish(BotEvent::OrderFilled(remote));
            }
            OrderStatus::Canceled => {
                self.order_book
                    .update_status(&remote.identifier, OrderStatus::Canceled)
                    .await;
                warn!("Order {} was canceled", remote.identifier);
                self.event_bus.publish(BotEvent::OrderCancelled(remote));
            }
            OrderStatus::Liquidated => {
                self.order_book
                    .update_status(&remote.identifier, OrderStatus::Liquidated)
                    .await;
                warn!("Order {} was liquidated", remote.identifier);
                self.event_bus.publish(BotEvent::PositionUpdate(remote));
            }
            OrderStatus::Adl => {
                self.order_book
                    .update_status(&remote.identifier, OrderStatus::Adl)
                    .await;
                warn!("Order {} was auto-deleveraged", remote.identifier);
                self.event_bus.publish(BotEvent::AdlTriggered(remote));
            }
            OrderStatus::PartialClose => {
                self.order_book.update(remote.clone()).await;
                info!(
                    "Order {} partially closed: filled {}, remaining {}",
                    remote.identifier, remote.filled, remote.remaining
                );
                self.event_bus.publish(BotEvent::PositionUpdate(remote));
            }
            OrderStatus::Open => {
                if remote.filled > 0.0 {
                    // Partial fill is still an open order, no pairing yet
                    self.order_book.update(remote.clone()).await;
                    info!(
                        "Order {} partially filled: {} of {}",
                        remote.identifier, remote.filled, remote.contracts
                    );
                }
            }
            other => {
                warn!(
                    "Unhandled status {:?} for order {}",
                    other, remote.identifier
                );
            }
        }
    }

    /// Probe the funding rate and publish it.
    async fn check_funding_rate(&self) {
        match self.executor.get_funding_rate(&self.symbol).await {
            Ok(rate) => {
                self.event_bus.publish(BotEvent::FundingFee {
                    symbol: self.symbol.clone(),
                    rate,
                });
            }
            Err(e) => error!("Error checking funding rate: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::exchange::{Exchange, PaperExchange};
    use crate::execution::LiveOrderExecutor;
    use crate::order::{MarginMode, OrderSide};

    struct Fixture {
        venue: Arc<PaperExchange>,
        book: Arc<OrderBook>,
        bus: Arc<EventBus>,
        tracker: Arc<OrderStatusTracker>,
        executor: Arc<LiveOrderExecutor<PaperExchange>>,
    }

    fn fixture() -> Fixture {
        let venue = Arc::new(PaperExchange::new("USDT", 100.0, 10_000.0));
        let executor = Arc::new(LiveOrderExecutor::new(
            Arc::clone(&venue),
            10,
            MarginMode::Isolated,
        ));
        let book = Arc::new(OrderBook::new());
        let bus = Arc::new(EventBus::new());
        let tracker = Arc::new(
            OrderStatusTracker::new(
                Arc::clone(&book),
                executor.clone() as Arc<dyn OrderExecutor>,
                Arc::clone(&bus),
                "BTC/USDT:USDT",
            )
            .with_intervals(Duration::from_millis(20), Duration::from_millis(20)),
        );
        Fixture {
            venue,
            book,
            bus,
            tracker,
            executor,
        }
    }

    #[tokio::test]
    async fn test_poll_round_publishes_fill() {
        let f = fixture();
        let mut fills = f.bus.subscribe(EventKind::OrderFilled);

        let order = f
            .executor
            .execute_limit_order(OrderSide::BuyOpen, "BTC/USDT:USDT", 1.0, 95.0)
            .await
            .unwrap();
        f.book.add(order.clone(), None).await;

        // Cross the limit on the venue, then run one poll round directly
        f.venue.push_price(94.0).await;
        f.tracker.process_open_orders().await;

        match fills.try_recv() {
            Ok(BotEvent::OrderFilled(filled)) => {
                assert_eq!(filled.identifier, order.identifier);
                assert_eq!(filled.status, OrderStatus::Closed);
            }
            other => panic!("expected a fill event, got {other:?}"),
        }
        assert_eq!(
            f.book.get(&order.identifier).await.unwrap().status,
            OrderStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_poll_round_publishes_cancel() {
        let f = fixture();
        let mut cancels = f.bus.subscribe(EventKind::OrderCancelled);

        let order = f
            .executor
            .execute_limit_order(OrderSide::SellClose, "BTC/USDT:USDT", 1.0, 110.0)
            .await
            .unwrap();
        f.book.add(order.clone(), None).await;

        f.venue
            .cancel_order(&order.identifier, "BTC/USDT:USDT")
            .await
            .unwrap();
        f.tracker.process_open_orders().await;

        assert!(matches!(
            cancels.try_recv(),
            Ok(BotEvent::OrderCancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_liquidation_dispatch() {
        let f = fixture();
        let mut updates = f.bus.subscribe(EventKind::PositionUpdate);

        let mut order = f
            .executor
            .execute_limit_order(OrderSide::BuyOpen, "BTC/USDT:USDT", 1.0, 95.0)
            .await
            .unwrap();
        f.book.add(order.clone(), None).await;

        order.status = OrderStatus::Liquidated;
        f.tracker.handle_status_change(order.clone()).await;

        assert!(matches!(
            updates.try_recv(),
            Ok(BotEvent::PositionUpdate(_))
        ));
        assert_eq!(
            f.book.get(&order.identifier).await.unwrap().status,
            OrderStatus::Liquidated
        );
    }

    #[tokio::test]
    async fn test_unknown_status_is_rejected() {
        let f = fixture();
        let mut fills = f.bus.subscribe(EventKind::OrderFilled);

        let mut order = f
            .executor
            .execute_limit_order(OrderSide::BuyOpen, "BTC/USDT:USDT", 1.0, 95.0)
            .await
            .unwrap();
        f.book.add(order.clone(), None).await;

        order.status = OrderStatus::Unknown;
        f.tracker.handle_status_change(order.clone()).await;

        // No event, and the stored order keeps its original status
        assert!(fills.try_recv().is_err());
        assert_eq!(
            f.book.get(&order.identifier).await.unwrap().status,
            OrderStatus::Open
        );
    }

    #[tokio::test]
    async fn test_partial_fill_does_not_publish() {
        let f = fixture();
        let mut fills = f.bus.subscribe(EventKind::OrderFilled);

        let mut order = f
            .executor
            .execute_limit_order(OrderSide::BuyOpen, "BTC/USDT:USDT", 2.0, 95.0)
            .await
            .unwrap();
        f.book.add(order.clone(), None).await;

        order.filled = 0.5;
        order.remaining = 1.5;
        f.tracker.handle_status_change(order.clone()).await;

        assert!(fills.try_recv().is_err());
        let stored = f.book.get(&order.identifier).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Open);
        assert!((stored.filled - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_funding_loop_publishes_rate() {
        let f = fixture();
        let mut funding = f.bus.subscribe(EventKind::FundingFee);
        f.venue.set_funding_rate(0.0007).await;

        f.tracker.check_funding_rate().await;

        match funding.try_recv() {
            Ok(BotEvent::FundingFee { symbol, rate }) => {
                assert_eq!(symbol, "BTC/USDT:USDT");
                assert!((rate - 0.0007).abs() < 1e-12);
            }
            other => panic!("expected a funding event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let f = fixture();
        f.tracker.start_tracking().await;
        assert!(f.tracker.is_running().await);

        // Second start is a no-op
        f.tracker.start_tracking().await;

        f.tracker.stop_tracking().await;
        assert!(!f.tracker.is_running().await);

        // Restart works after a stop
        f.tracker.start_tracking().await;
        assert!(f.tracker.is_running().await);
        f.tracker.stop_tracking().await;
    }
}
