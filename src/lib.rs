//! Grid trading engine for USDT-margined perpetual futures
//!
//! Places a lattice of limit orders around a reference price and harvests
//! the spread as price oscillates inside the lattice. Every filled open
//! order deterministically schedules a closing counter-order on its paired
//! level; margin, positions and PnL are tracked under leverage.
//!
//! The venue is abstracted behind [`exchange::Exchange`]; paper-trading and
//! backtest adapters ship in-crate, live adapters implement the same trait
//! externally.

#![deny(unreachable_pub)]

pub mod balance;
pub mod bot;
pub mod config;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod execution;
pub mod grid;
pub mod order;
pub mod strategy;
pub mod tracker;

pub use balance::BalanceTracker;
pub use bot::{BotController, PerpGridBot};
pub use config::Settings;
pub use errors::{BotError, BotResult};
pub use events::{BotEvent, EventBus, EventKind};
pub use exchange::Exchange;
pub use grid::GridManager;
pub use order::{OrderBook, OrderManager, PerpOrder};
pub use strategy::GridTradingStrategy;
pub use tracker::OrderStatusTracker;
