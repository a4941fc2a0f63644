//! Bot configuration

use config::{Config, File};
use serde::{Deserialize, Serialize};

use crate::errors::{BotError, BotResult};
use crate::order::MarginMode;

/// Selects adapters and enables sandbox behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Live,
    PaperTrading,
    Backtest,
    PerpetualLive,
}

impl TradingMode {
    pub fn is_backtest(&self) -> bool {
        matches!(self, TradingMode::Backtest)
    }

    pub fn is_live(&self) -> bool {
        matches!(self, TradingMode::Live | TradingMode::PerpetualLive)
    }
}

/// Gate for perpetual-only features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentType {
    Spot,
    Perpetual,
}

/// Lattice layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    SimpleGrid,
    HedgedGrid,
}

/// Level spacing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpacingType {
    Arithmetic,
    Geometric,
}

/// Venue and pair selection
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSettings {
    /// Selects the gateway adapter
    pub exchange_name: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub trading_mode: TradingMode,
    pub instrument_type: InstrumentType,
}

/// Lattice shape
#[derive(Debug, Clone, Deserialize)]
pub struct GridSettings {
    pub strategy_type: StrategyType,
    pub spacing_type: SpacingType,
    /// Upper anchor of the lattice and seeding trigger
    pub reversion_price: f64,
    /// Per-step ratio in (0, 1)
    pub grid_ratio: f64,
    /// Notional value assigned to each grid level
    pub grid_value: f64,
    pub num_grids: usize,
    /// Cap on concurrent live limit orders per side
    #[serde(default = "default_max_placed_orders")]
    pub max_placed_orders: usize,
}

/// Leverage and risk limits
#[derive(Debug, Clone, Deserialize)]
pub struct RiskSettings {
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_margin_mode")]
    pub margin_mode: MarginMode,
    /// Taker/maker fee as a fraction of notional
    #[serde(default = "default_trading_fee")]
    pub trading_fee: f64,
    /// Margin-ratio floor used by health checks
    #[serde(default = "default_liquidation_threshold")]
    pub liquidation_threshold: f64,
    /// Funding rates above this magnitude trigger de-risking
    #[serde(default = "default_funding_rate_threshold")]
    pub funding_rate_threshold: f64,
    /// Margin seeded in backtest mode
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
    #[serde(default)]
    pub take_profit_price: Option<f64>,
    #[serde(default)]
    pub stop_loss_price: Option<f64>,
}

/// Historical replay window
#[derive(Debug, Clone, Deserialize)]
pub struct BacktestSettings {
    pub timeframe: String,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_max_placed_orders() -> usize {
    5
}

fn default_leverage() -> u32 {
    1
}

fn default_margin_mode() -> MarginMode {
    MarginMode::Isolated
}

fn default_trading_fee() -> f64 {
    0.0005
}

fn default_liquidation_threshold() -> f64 {
    0.1
}

fn default_funding_rate_threshold() -> f64 {
    0.0003
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub exchange: ExchangeSettings,
    pub grid: GridSettings,
    pub risk: RiskSettings,
    #[serde(default)]
    pub backtest: Option<BacktestSettings>,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    /// Load settings from a configuration file, with `APP`-prefixed
    /// environment variables overriding file values
    /// (e.g. `APP_RISK__LEVERAGE=10`).
    pub fn new(config_path: &str) -> BotResult<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()
            .map_err(|e| BotError::InvalidConfig(e.to_string()))?
            .try_deserialize::<Settings>()
            .map_err(|e| BotError::InvalidConfig(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Perpetual symbol in `BASE/QUOTE:QUOTE` form
    pub fn symbol(&self) -> String {
        format!(
            "{}/{}:{}",
            self.exchange.base_currency,
            self.exchange.quote_currency,
            self.exchange.quote_currency
        )
    }

    /// Fatal-at-init validation
    pub fn validate(&self) -> BotResult<()> {
        if self.exchange.instrument_type != InstrumentType::Perpetual {
            return Err(BotError::InvalidConfig(
                "this engine trades perpetual instruments only".into(),
            ));
        }
        if self.exchange.exchange_name.is_empty() {
            return Err(BotError::InvalidConfig("exchange_name cannot be empty".into()));
        }
        if self.risk.leverage == 0 {
            return Err(BotError::InvalidConfig("leverage must be at least 1".into()));
        }
        if self.grid.reversion_price <= 0.0 {
            return Err(BotError::InvalidConfig(
                "reversion_price must be positive".into(),
            ));
        }
        if self.grid.grid_ratio <= 0.0 || self.grid.grid_ratio >= 1.0 {
            return Err(BotError::InvalidConfig("grid_ratio must be in (0, 1)".into()));
        }
        if self.grid.num_grids < 2 {
            return Err(BotError::InvalidConfig("num_grids must be at least 2".into()));
        }
        if self.exchange.trading_mode.is_backtest() && self.backtest.is_none() {
            return Err(BotError::InvalidConfig(
                "backtest mode requires a [backtest] section".into(),
            ));
        }
        if let Some(backtest) = &self.backtest {
            if backtest.timeframe.is_empty() {
                return Err(BotError::UnsupportedTimeframe("<empty>".into()));
            }
        }
        Ok(())
    }
}
