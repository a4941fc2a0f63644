//! Margin, position and PnL accounting under leverage

use log::info;
use tokio::sync::RwLock;

use crate::config::TradingMode;
use crate::errors::{BotResult, ValidationError};
use crate::exchange::Exchange;
use crate::order::PerpOrder;

/// Mutable accounting state, all quantities in quote currency unless noted
#[derive(Debug, Clone, Default)]
pub struct BalanceState {
    pub margin_balance: f64,
    pub reserved_margin: f64,
    /// Long contracts held
    pub long_position: f64,
    pub long_avg_price: f64,
    /// Short contracts held
    pub short_position: f64,
    pub short_avg_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub trading_fees: f64,
    pub funding_fees: f64,
    pub last_mark_price: f64,
}

/// Tracks margin balance, reserved margin, both position sides with average
/// entries, realized/unrealized PnL and fee accrual.
pub struct BalanceTracker {
    trading_mode: TradingMode,
    quote_currency: String,
    fee_rate: f64,
    initial_margin_ratio: f64,
    maintenance_margin_ratio: f64,
    state: RwLock<BalanceState>,
}

impl BalanceTracker {
    pub fn new(trading_mode: TradingMode, quote_currency: impl Into<String>, fee_rate: f64) -> Self {
        Self {
            trading_mode,
            quote_currency: quote_currency.into(),
            fee_rate,
            initial_margin_ratio: 0.1,
            maintenance_margin_ratio: 0.05,
            state: RwLock::new(BalanceState::default()),
        }
    }

    pub fn with_margin_ratios(mut self, initial: f64, maintenance: f64) -> Self {
        self.initial_margin_ratio = initial;
        self.maintenance_margin_ratio = maintenance;
        self
    }

    /// Seed balances: from configuration in backtest, from the venue account
    /// and any existing position otherwise.
    pub async fn setup(
        &self,
        initial_margin: f64,
        exchange: &dyn Exchange,
        symbol: &str,
    ) -> BotResult<()> {
        if self.trading_mode == TradingMode::Backtest {
            let mut state = self.state.write().await;
            state.margin_balance = initial_margin;
            info!("Backtest margin seeded: {} {}", initial_margin, self.quote_currency);
            return Ok(());
        }

        let balances = exchange.get_balance().await?;
        let margin = balances
            .free
            .get(&self.quote_currency)
            .copied()
            .unwrap_or(0.0);

        let mut state = self.state.write().await;
        state.margin_balance = margin;

        match exchange.get_position(symbol).await? {
            Some(position) => {
                let size = position.contracts.abs();
                if position.side == "short" || position.contracts < 0.0 {
                    state.short_position = size;
                    state.short_avg_price = position.entry_price;
                } else {
                    state.long_position = size;
                    state.long_avg_price = position.entry_price;
                }
                state.unrealized_pnl = position.unrealized_pnl;
                info!(
                    "Account loaded: margin={} {}, position={} {}",
                    margin, self.quote_currency, position.side, size
                );
            }
            None => {
                info!(
                    "Account loaded: margin={} {}, no open position",
                    margin, self.quote_currency
                );
            }
        }
        Ok(())
    }

    fn initial_margin_estimate(&self, quantity: f64, price: f64) -> f64 {
        quantity * price * self.initial_margin_ratio
    }

    /// Reserve margin for a resting open order.
    pub async fn reserve_margin(&self, quantity: f64, price: f64) -> Result<(), ValidationError> {
        let required = self.initial_margin_estimate(quantity, price);
        let mut state = self.state.write().await;
        let available = state.margin_balance - state.reserved_margin;
        if available < required {
            return Err(ValidationError::InsufficientMargin {
                required,
                available,
            });
        }
        state.reserved_margin += required;
        Ok(())
    }

    /// Give back a reservation whose order never reached the venue.
    pub async fn release_margin(&self, quantity: f64, price: f64) {
        let released = self.initial_margin_estimate(quantity, price);
        let mut state = self.state.write().await;
        state.reserved_margin -= released;
        if state.reserved_margin < 0.0 {
            state.reserved_margin = 0.0;
        }
    }

    /// Apply a completed fill: fee accrual, position update (closing by
    /// position, not by side name), realized PnL, and per-fill release of
    /// the reserved initial-margin estimate.
    pub async fn record_fill(&self, order: &PerpOrder) {
        let price = order.fill_price();
        let filled = order.filled;
        let fee = self.fee_rate * filled * price;

        let mut state = self.state.write().await;
        state.trading_fees += fee;

        if order.side.is_buy() {
            if state.short_position > 0.0 {
                // Buy while short reduces the short, whatever the side says
                let close_qty = state.short_position.min(filled);
                let pnl = close_qty * (state.short_avg_price - price);
                state.short_position -= close_qty;
                if state.short_position <= 0.0 {
                    state.short_position = 0.0;
                    state.short_avg_price = 0.0;
                }
                state.realized_pnl += pnl;
                state.margin_balance += pnl;
            } else {
                let new_position = state.long_position + filled;
                let new_cost = state.long_position * state.long_avg_price + filled * price;
                state.long_position = new_position;
                state.long_avg_price = if new_position > 0.0 {
                    new_cost / new_position
                } else {
                    0.0
                };
            }
        } else if state.long_position > 0.0 {
            let close_qty = state.long_position.min(filled);
            let pnl = close_qty * (price - state.long_avg_price);
            state.long_position -= close_qty;
            if state.long_position <= 0.0 {
                state.long_position = 0.0;
                state.long_avg_price = 0.0;
            }
            state.realized_pnl += pnl;
            state.margin_balance += pnl;
        } else {
            let new_position = state.short_position + filled;
            let new_cost = state.short_position * state.short_avg_price + filled * price;
            state.short_position = new_position;
            state.short_avg_price = if new_position > 0.0 {
                new_cost / new_position
            } else {
                0.0
            };
        }

        // Release the initial-margin estimate reserved at placement
        state.reserved_margin -= filled * price * self.initial_margin_ratio;
        if state.reserved_margin < 0.0 {
            state.reserved_margin = 0.0;
        }

        state.margin_balance -= fee;

        info!(
            "Fill recorded: {:?} {} @ {} (fee {:.6}), long={} short={} realized={:.4}",
            order.side, filled, price, fee, state.long_position, state.short_position,
            state.realized_pnl
        );
    }

    /// Funding settlement: positive amounts are paid, negative received.
    pub async fn apply_funding_fee(&self, amount: f64) {
        let mut state = self.state.write().await;
        state.funding_fees += amount;
        state.margin_balance -= amount;
        info!(
            "Funding fee applied: {} {}. Margin balance now {}",
            amount, self.quote_currency, state.margin_balance
        );
    }

    /// Refresh unrealized PnL against a new mark price.
    pub async fn update_mark(&self, mark_price: f64) {
        let mut state = self.state.write().await;
        state.last_mark_price = mark_price;
        let long_pnl = if state.long_position > 0.0 {
            state.long_position * (mark_price - state.long_avg_price)
        } else {
            0.0
        };
        let short_pnl = if state.short_position > 0.0 {
            state.short_position * (state.short_avg_price - mark_price)
        } else {
            0.0
        };
        state.unrealized_pnl = long_pnl + short_pnl;
    }

    pub async fn available_margin(&self) -> f64 {
        let state = self.state.read().await;
        state.margin_balance - state.reserved_margin
    }

    /// Total margin including unrealized PnL
    pub async fn total_margin(&self) -> f64 {
        let state = self.state.read().await;
        state.margin_balance + state.unrealized_pnl
    }

    /// Total margin divided by total notional position at the mark price;
    /// infinity when no positions are held.
    pub async fn margin_ratio(&self, mark_price: f64) -> f64 {
        let state = self.state.read().await;
        let position_value = (state.long_position + state.short_position) * mark_price;
        if position_value == 0.0 {
            return f64::INFINITY;
        }
        (state.margin_balance + state.unrealized_pnl) / position_value
    }

    /// Whether the margin ratio clears the maintenance floor
    pub async fn check_margin(&self, mark_price: f64) -> bool {
        self.margin_ratio(mark_price).await >= self.maintenance_margin_ratio
    }

    /// Notional value of all open positions at the mark price
    pub async fn total_position_value(&self, mark_price: f64) -> f64 {
        let state = self.state.read().await;
        (state.long_position + state.short_position) * mark_price
    }

    pub async fn long_position(&self) -> f64 {
        self.state.read().await.long_position
    }

    pub async fn short_position(&self) -> f64 {
        self.state.read().await.short_position
    }

    pub async fn snapshot(&self) -> BalanceState {
        self.state.read().await.clone()
    }
}
