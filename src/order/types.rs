//! Core order types for perpetual futures

use serde::{Deserialize, Serialize};

/// Whether an order opens new exposure or reduces an existing position.
///
/// Kept separate from the wire-level side string because both BUY_OPEN and
/// BUY_CLOSE serialize to "buy" (and both SELL_* to "sell") on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderIntent {
    Open,
    Close,
}

/// Order side with open/close intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    /// Buy to open a long (or, by position, close a short)
    BuyOpen,
    /// Sell to open a short
    SellOpen,
    /// Buy to close a short
    BuyClose,
    /// Sell to close a long
    SellClose,
}

impl OrderSide {
    /// Wire-level side string sent to the venue
    pub fn wire_side(&self) -> &'static str {
        match self {
            OrderSide::BuyOpen | OrderSide::BuyClose => "buy",
            OrderSide::SellOpen | OrderSide::SellClose => "sell",
        }
    }

    /// Open/close intent carried by the domain enum
    pub fn intent(&self) -> OrderIntent {
        match self {
            OrderSide::BuyOpen | OrderSide::SellOpen => OrderIntent::Open,
            OrderSide::BuyClose | OrderSide::SellClose => OrderIntent::Close,
        }
    }

    /// True for the buy wire side
    pub fn is_buy(&self) -> bool {
        matches!(self, OrderSide::BuyOpen | OrderSide::BuyClose)
    }

    /// Reconstruct the domain side from a wire side plus a known intent.
    ///
    /// The venue only reports "buy"/"sell"; the intent comes from the local
    /// order the response is matched against.
    pub fn from_wire(wire: &str, intent: OrderIntent) -> Self {
        let buy = wire.eq_ignore_ascii_case("buy") || wire.eq_ignore_ascii_case("b");
        match (buy, intent) {
            (true, OrderIntent::Open) => OrderSide::BuyOpen,
            (true, OrderIntent::Close) => OrderSide::BuyClose,
            (false, OrderIntent::Open) => OrderSide::SellOpen,
            (false, OrderIntent::Close) => OrderSide::SellClose,
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
    TakeProfitMarket,
    TakeProfitLimit,
    TrailingStop,
}

impl OrderType {
    /// Wire-level type string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::StopMarket => "stop_market",
            OrderType::StopLimit => "stop_limit",
            OrderType::TakeProfitMarket => "take_profit_market",
            OrderType::TakeProfitLimit => "take_profit_limit",
            OrderType::TrailingStop => "trailing_stop",
        }
    }

    /// Conditional orders rest in their own order book bucket
    pub fn is_conditional(&self) -> bool {
        !matches!(self, OrderType::Market | OrderType::Limit)
    }
}

/// Venue-reported order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Expired,
    Rejected,
    Liquidated,
    Adl,
    PartialClose,
    Unknown,
}

impl OrderStatus {
    /// Parse a venue status string; anything unrecognized maps to Unknown
    pub fn from_wire(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "open" => OrderStatus::Open,
            "closed" => OrderStatus::Closed,
            "canceled" | "cancelled" => OrderStatus::Canceled,
            "expired" => OrderStatus::Expired,
            "rejected" => OrderStatus::Rejected,
            "liquidated" => OrderStatus::Liquidated,
            "adl" => OrderStatus::Adl,
            "partial_close" => OrderStatus::PartialClose,
            _ => OrderStatus::Unknown,
        }
    }
}

/// Margin mode on the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Isolated => "isolated",
            MarginMode::Cross => "cross",
        }
    }
}

/// Position side for hedged-mode venues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

/// A single trade that (partially) filled an order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trade {
    pub price: f64,
    pub quantity: f64,
    pub timestamp: i64,
}

/// A perpetual-futures order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerpOrder {
    /// Venue-assigned identifier
    pub identifier: String,
    pub status: OrderStatus,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub price: f64,
    /// Average fill price, when the venue reports one
    pub average: Option<f64>,
    /// Number of contracts
    pub contracts: f64,
    /// Contract face value
    pub contract_size: f64,
    pub filled: f64,
    pub remaining: f64,
    /// Millisecond UTC timestamp of order creation
    pub timestamp: i64,
    pub last_trade_timestamp: Option<i64>,
    pub symbol: String,
    pub time_in_force: Option<String>,
    pub leverage: f64,
    pub margin_mode: MarginMode,
    pub position_side: PositionSide,
    pub reduce_only: bool,
    pub stop_price: Option<f64>,
    pub activation_price: Option<f64>,
    pub callback_rate: Option<f64>,
    /// Fee in quote currency, when reported
    pub fee: Option<f64>,
    #[serde(default)]
    pub trades: Vec<Trade>,
}

impl PerpOrder {
    /// Position size represented by this order (contracts × face value)
    pub fn amount(&self) -> f64 {
        self.contracts * self.contract_size
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Closed
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    pub fn is_canceled(&self) -> bool {
        self.status == OrderStatus::Canceled
    }

    /// Price the fill settled at: the venue average when present, else the
    /// limit price.
    pub fn fill_price(&self) -> f64 {
        match self.average {
            Some(avg) if avg > 0.0 => avg,
            _ => self.price,
        }
    }
}
