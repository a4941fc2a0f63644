//! Typed event bus for inter-component notifications
//!
//! Subscribers register per event kind and receive events over an unbounded
//! channel. Delivery fans out in registration order; each subscriber drains
//! its channel one event at a time, so a handler finishes before the next
//! event of the same kind reaches it.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::order::PerpOrder;

/// Domain events published on the bus
#[derive(Debug, Clone)]
pub enum BotEvent {
    StopBot(String),
    StartBot(String),
    OrderPlaced(PerpOrder),
    OrderFilled(PerpOrder),
    OrderCancelled(PerpOrder),
    OrderFailed(String),
    PositionUpdate(PerpOrder),
    AdlTriggered(PerpOrder),
    LiquidationWarning {
        order: PerpOrder,
        margin_ratio: f64,
        liquidation_price: Option<f64>,
    },
    FundingFee {
        symbol: String,
        rate: f64,
    },
    FundingFeeCharged {
        amount: f64,
    },
    FundingFeeSettled {
        rate: f64,
        amount: f64,
    },
    MarginCall {
        required_margin: f64,
        current_margin: f64,
    },
    MarginRisk(String),
}

impl BotEvent {
    /// The kind used for subscription routing
    pub fn kind(&self) -> EventKind {
        match self {
            BotEvent::StopBot(_) => EventKind::StopBot,
            BotEvent::StartBot(_) => EventKind::StartBot,
            BotEvent::OrderPlaced(_) => EventKind::OrderPlaced,
            BotEvent::OrderFilled(_) => EventKind::OrderFilled,
            BotEvent::OrderCancelled(_) => EventKind::OrderCancelled,
            BotEvent::OrderFailed(_) => EventKind::OrderFailed,
            BotEvent::PositionUpdate(_) => EventKind::PositionUpdate,
            BotEvent::AdlTriggered(_) => EventKind::AdlTriggered,
            BotEvent::LiquidationWarning { .. } => EventKind::LiquidationWarning,
            BotEvent::FundingFee { .. } => EventKind::FundingFee,
            BotEvent::FundingFeeCharged { .. } => EventKind::FundingFeeCharged,
            BotEvent::FundingFeeSettled { .. } => EventKind::FundingFeeSettled,
            BotEvent::MarginCall { .. } => EventKind::MarginCall,
            BotEvent::MarginRisk(_) => EventKind::MarginRisk,
        }
    }
}

/// Event kinds for subscription routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StopBot,
    StartBot,
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    OrderFailed,
    PositionUpdate,
    AdlTriggered,
    LiquidationWarning,
    FundingFee,
    FundingFeeCharged,
    FundingFeeSettled,
    MarginCall,
    MarginRisk,
}

/// Typed pub/sub bus: event kind → list of subscriber senders
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<UnboundedSender<BotEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind. Events arrive on the returned receiver
    /// in publication order.
    pub fn subscribe(&self, kind: EventKind) -> UnboundedReceiver<BotEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .entry(kind)
            .or_default()
            .push(tx);
        rx
    }

    /// Publish an event to every subscriber of its kind, in registration
    /// order. Subscribers whose receiver was dropped are pruned.
    pub fn publish(&self, event: BotEvent) {
        let kind = event.kind();
        let mut subs = self.subscribers.lock().expect("event bus lock poisoned");
        if let Some(senders) = subs.get_mut(&kind) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                debug!("No live subscribers for {kind:?}");
            }
        } else {
            debug!("Event {kind:?} published with no subscribers");
        }
    }

    /// Number of live subscribers for a kind
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .get(&kind)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventKind::StopBot);

        bus.publish(BotEvent::StopBot("test".into()));

        match rx.recv().await {
            Some(BotEvent::StopBot(reason)) => assert_eq!(reason, "test"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_events_routed_by_kind() {
        let bus = EventBus::new();
        let mut stop_rx = bus.subscribe(EventKind::StopBot);
        let mut start_rx = bus.subscribe(EventKind::StartBot);

        bus.publish(BotEvent::StartBot("go".into()));

        assert!(matches!(start_rx.recv().await, Some(BotEvent::StartBot(_))));
        // Nothing for the stop subscriber
        assert!(stop_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delivery_preserves_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventKind::FundingFee);

        for i in 0..5 {
            bus.publish(BotEvent::FundingFee {
                symbol: "BTC/USDT:USDT".into(),
                rate: i as f64 * 0.0001,
            });
        }

        for i in 0..5 {
            match rx.recv().await {
                Some(BotEvent::FundingFee { rate, .. }) => {
                    assert!((rate - i as f64 * 0.0001).abs() < 1e-12)
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(EventKind::MarginRisk);
        assert_eq!(bus.subscriber_count(EventKind::MarginRisk), 1);

        drop(rx);
        bus.publish(BotEvent::MarginRisk("gone".into()));
        assert_eq!(bus.subscriber_count(EventKind::MarginRisk), 0);
    }
}
