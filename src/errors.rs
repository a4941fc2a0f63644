//! Error types for the grid trading engine

use thiserror::Error;

use crate::order::{OrderSide, OrderType};

/// Top-level errors raised by the engine
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Unsupported exchange: {0}")]
    UnsupportedExchange(String),

    #[error("Unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),

    #[error("Missing required environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Data fetch error: {0}")]
    DataFetch(String),

    #[error("Order cancellation failed: {0}")]
    OrderCancellation(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Command parsing error: {0}")]
    CommandParsing(String),

    #[error("Strategy control error: {0}")]
    StrategyControl(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::DataFetch(format!("JSON parse error: {err}"))
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::DataFetch(err.to_string())
    }
}

/// Pre-trade validation failures. Local to a single grid level: the order
/// manager skips that level and logs a warning, never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Insufficient margin: required {required:.2}, available {available:.2}")]
    InsufficientMargin { required: f64, available: f64 },

    #[error("Insufficient position: held {held:.6}, requested {requested:.6}")]
    InsufficientPosition { held: f64, requested: f64 },

    #[error("Invalid contract quantity: {quantity:.6} (minimum {min_contract_size})")]
    InvalidContractQuantity { quantity: f64, min_contract_size: f64 },

    #[error("Post-trade margin ratio {ratio:.4} below maintenance rate {maintenance_rate}")]
    MarginRatio { ratio: f64, maintenance_rate: f64 },
}

/// Order execution failure after retries are exhausted, with enough context
/// to diagnose which submission failed.
#[derive(Error, Debug, Clone)]
#[error("Order execution failed ({side:?} {order_type:?} {symbol} qty={quantity} px={price}): {message}")]
pub struct ExecutionError {
    pub message: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub symbol: String,
    pub quantity: f64,
    pub price: f64,
}

impl ExecutionError {
    pub fn new(
        message: impl Into<String>,
        side: OrderSide,
        order_type: OrderType,
        symbol: impl Into<String>,
        quantity: f64,
        price: f64,
    ) -> Self {
        Self {
            message: message.into(),
            side,
            order_type,
            symbol: symbol.into(),
            quantity,
            price,
        }
    }
}

/// Result type for engine operations
pub type BotResult<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::InsufficientMargin {
            required: 100.0,
            available: 40.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("100.00"));
        assert!(msg.contains("40.00"));
    }

    #[test]
    fn test_execution_error_carries_context() {
        let err = ExecutionError::new(
            "venue rejected",
            OrderSide::BuyOpen,
            OrderType::Limit,
            "BTC/USDT:USDT",
            1.5,
            42000.0,
        );
        let msg = err.to_string();
        assert!(msg.contains("BTC/USDT:USDT"));
        assert!(msg.contains("venue rejected"));

        let bot_err: BotError = err.into();
        assert!(matches!(bot_err, BotError::Execution(_)));
    }
}
