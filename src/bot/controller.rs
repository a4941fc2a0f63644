//! Line-oriented operator command surface

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::balance::BalanceTracker;
use crate::errors::{BotError, BotResult};
use crate::events::{BotEvent, EventBus, EventKind};
use crate::order::OrderBook;

/// Reads operator commands from stdin and translates them into bus events.
///
/// Supported commands: `quit`, `orders`, `balance`, `stop`, `restart`,
/// `pause <seconds>`.
pub struct BotController {
    event_bus: Arc<EventBus>,
    order_book: Arc<OrderBook>,
    balance: Arc<BalanceTracker>,
    stop_listening: AtomicBool,
}

impl BotController {
    pub fn new(
        event_bus: Arc<EventBus>,
        order_book: Arc<OrderBook>,
        balance: Arc<BalanceTracker>,
    ) -> Self {
        Self {
            event_bus,
            order_book,
            balance,
            stop_listening: AtomicBool::new(false),
        }
    }

    /// Listen for commands until `quit` or a STOP_BOT shutdown.
    pub async fn command_listener(self: Arc<Self>) {
        info!("Command listener started. Type 'quit' to exit.");

        // A shutdown elsewhere also ends the listener
        let watcher = Arc::clone(&self);
        let mut stops = self.event_bus.subscribe(EventKind::StopBot);
        tokio::spawn(async move {
            while let Some(BotEvent::StopBot(reason)) = stops.recv().await {
                if reason.contains("shutdown") {
                    watcher.stop_listening.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while !self.stop_listening.load(Ordering::SeqCst) {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read command: {e}");
                    break;
                }
            };
            if let Err(e) = self.handle_command(line.trim().to_lowercase().as_str()).await {
                warn!("Command error: {e}");
            }
        }
        info!("Command listener stopped");
    }

    /// Dispatch one operator command.
    pub async fn handle_command(&self, command: &str) -> BotResult<()> {
        match command {
            "" => Ok(()),
            "quit" => {
                info!("Stop bot command received");
                self.event_bus
                    .publish(BotEvent::StopBot("User requested shutdown".into()));
                self.stop_listening.store(true, Ordering::SeqCst);
                Ok(())
            }
            "orders" => self.display_orders().await,
            "balance" => self.display_balance().await,
            "stop" => {
                self.event_bus
                    .publish(BotEvent::StopBot("User issued stop command".into()));
                Ok(())
            }
            "restart" => {
                self.event_bus
                    .publish(BotEvent::StopBot("User issued restart command".into()));
                self.event_bus
                    .publish(BotEvent::StartBot("User issued restart command".into()));
                Ok(())
            }
            cmd if cmd.starts_with("pause") => self.pause(cmd).await,
            unknown => Err(BotError::CommandParsing(format!(
                "Unknown command: {unknown}"
            ))),
        }
    }

    async fn display_orders(&self) -> BotResult<()> {
        let open = self.order_book.get_open().await;
        let completed = self.order_book.get_completed().await;
        info!("Open orders ({}):", open.len());
        for order in &open {
            info!(
                "  {} {:?} {:?} {:.6} @ {:.4} filled {:.6}",
                order.identifier, order.side, order.status, order.contracts, order.price,
                order.filled
            );
        }
        info!("Completed orders ({}):", completed.len());
        for order in &completed {
            info!(
                "  {} {:?} {:.6} @ {:.4}",
                order.identifier,
                order.side,
                order.filled,
                order.fill_price()
            );
        }
        Ok(())
    }

    async fn display_balance(&self) -> BotResult<()> {
        let snapshot = self.balance.snapshot().await;
        info!(
            "Balance: margin {:.4}, reserved {:.4}, long {:.6}@{:.4}, short {:.6}@{:.4}, \
             realized {:.4}, unrealized {:.4}, fees {:.4}, funding {:.4}",
            snapshot.margin_balance,
            snapshot.reserved_margin,
            snapshot.long_position,
            snapshot.long_avg_price,
            snapshot.short_position,
            snapshot.short_avg_price,
            snapshot.realized_pnl,
            snapshot.unrealized_pnl,
            snapshot.trading_fees,
            snapshot.funding_fees,
        );
        Ok(())
    }

    /// `pause N`: stop the bot, sleep N seconds, then start it again.
    async fn pause(&self, command: &str) -> BotResult<()> {
        let duration: u64 = command
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                BotError::CommandParsing(
                    "Invalid pause duration. Please specify in seconds.".into(),
                )
            })?;

        info!("Pause bot command received");
        self.event_bus
            .publish(BotEvent::StopBot("User issued pause command".into()));
        info!("Bot paused for {duration} seconds");
        tokio::time::sleep(Duration::from_secs(duration)).await;
        info!("Resuming bot after pause");
        self.event_bus
            .publish(BotEvent::StartBot("Resuming bot after pause".into()));
        Ok(())
    }
}
