//! Perpetual grid bot binary
//!
//! ## Setup
//!
//! 1. Write a config file (TOML or JSON), e.g. `config.toml`:
//!    ```toml
//!    [exchange]
//!    exchange_name = "paper"
//!    base_currency = "BTC"
//!    quote_currency = "USDT"
//!    trading_mode = "paper_trading"
//!    instrument_type = "perpetual"
//!
//!    [grid]
//!    strategy_type = "simple_grid"
//!    spacing_type = "geometric"
//!    reversion_price = 100.0
//!    grid_ratio = 0.1
//!    grid_value = 100.0
//!    num_grids = 5
//!
//!    [risk]
//!    leverage = 10
//!    margin_mode = "isolated"
//!    initial_balance = 10000.0
//!    ```
//!
//! 2. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- --config config.toml
//!    ```
//!
//! Backtest mode additionally takes `--data <candles.json>`, a JSON array of
//! OHLCV bars, and a `[backtest]` section in the config.

use std::env;
use std::sync::Arc;

use log::{error, info};

use perp_grid_bot::bot::{BotController, PerpGridBot};
use perp_grid_bot::config::{Settings, TradingMode};
use perp_grid_bot::exchange::Candle;

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn load_candles(path: &str) -> Result<Vec<Candle>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let candles: Vec<Candle> = serde_json::from_str(&content)?;
    Ok(candles)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load .env if present; environment overrides config file values
    match dotenvy::dotenv() {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let args: Vec<String> = env::args().collect();
    let config_path = match parse_arg(&args, "--config") {
        Some(path) => path,
        None => {
            error!("Usage: grid_bot --config <file> [--data <candles.json>]");
            return;
        }
    };

    let settings = match Settings::new(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load config: {e}");
            return;
        }
    };

    info!(
        "Grid: {:?}/{:?}, reversion {}, ratio {}, {} levels, {}x leverage",
        settings.grid.strategy_type,
        settings.grid.spacing_type,
        settings.grid.reversion_price,
        settings.grid.grid_ratio,
        settings.grid.num_grids,
        settings.risk.leverage
    );

    let bot = match settings.exchange.trading_mode {
        TradingMode::Backtest => {
            let data_path = match parse_arg(&args, "--data") {
                Some(path) => path,
                None => {
                    error!("Backtest mode requires --data <candles.json>");
                    return;
                }
            };
            let candles = match load_candles(&data_path) {
                Ok(candles) => candles,
                Err(e) => {
                    error!("Failed to load candle data: {e}");
                    return;
                }
            };
            match PerpGridBot::with_backtest_data(settings, candles) {
                Ok(bot) => bot,
                Err(e) => {
                    error!("Failed to build bot: {e}");
                    return;
                }
            }
        }
        _ => match PerpGridBot::new(settings) {
            Ok(bot) => bot,
            Err(e) => {
                error!("Failed to build bot: {e}");
                return;
            }
        },
    };

    // Operator commands on stdin: quit, orders, balance, stop, restart,
    // pause <seconds>
    let controller = Arc::new(BotController::new(
        bot.event_bus(),
        bot.order_book(),
        bot.balance(),
    ));
    tokio::spawn(controller.command_listener());

    match bot.run().await {
        Ok(summary) => {
            info!("──── performance summary ────");
            info!("initial account value: {:.4}", summary.initial_account_value);
            info!("final account value:   {:.4}", summary.final_account_value);
            info!("realized pnl:          {:.4}", summary.realized_pnl);
            info!("trading fees:          {:.4}", summary.trading_fees);
            info!("funding fees:          {:.4}", summary.funding_fees);
            info!("completed orders:      {}", summary.completed_orders);
        }
        Err(e) => error!("Bot error: {e}"),
    }
}
