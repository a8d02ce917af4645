//! Venue adapter port and shared order model.
//!
//! The venue sits behind [`VenueAdapter`]; nothing in the core knows a wire
//! format. Adapters push [`VenueEvent`]s over a broadcast channel which the
//! [`cache::VenueCache`] consumes, so hot-path reads never perform I/O.

pub mod cache;
pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::VenueError;

pub use cache::VenueCache;
pub use sim::SimVenue;

/// Trade direction of a position or intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Profit when price rises.
    Long,
    /// Profit when price falls.
    Short,
}

impl Direction {
    /// Order side that opens a position in this direction.
    #[must_use]
    pub const fn entry_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in this direction.
    #[must_use]
    pub const fn exit_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    /// Stable string form for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    /// Parse the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

impl OrderSide {
    /// Signed multiplier applied to quantities (+1 buy, -1 sell).
    #[must_use]
    pub const fn sign(self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

/// Kind of order sent to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    /// Immediate execution at the venue's current price.
    Market,
    /// Resting stop order released when price crosses `trigger`.
    Stop {
        /// Trigger price for the stop.
        trigger: Decimal,
    },
}

/// Request to place an order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Venue instrument identifier.
    pub instrument: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Quantity in whole units.
    pub quantity: Decimal,
    /// Market or stop.
    pub kind: OrderKind,
}

impl OrderRequest {
    /// Market order for `quantity` units.
    #[must_use]
    pub fn market(instrument: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            instrument: instrument.to_string(),
            side,
            quantity,
            kind: OrderKind::Market,
        }
    }

    /// Stop order released at `trigger`.
    #[must_use]
    pub fn stop(instrument: &str, side: OrderSide, quantity: Decimal, trigger: Decimal) -> Self {
        Self {
            instrument: instrument.to_string(),
            side,
            quantity,
            kind: OrderKind::Stop { trigger },
        }
    }
}

/// Lifecycle state of an order at the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Accepted, not yet executed.
    Pending,
    /// Fully executed.
    Filled,
    /// Cancelled before execution.
    Cancelled,
    /// Rejected by the venue.
    Rejected,
}

impl OrderStatus {
    /// Whether the order can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

/// Point-in-time order state pushed by the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderUpdate {
    /// Venue order identifier.
    pub order_id: String,
    /// Instrument the order trades.
    pub instrument: String,
    /// Current lifecycle state.
    pub status: OrderStatus,
    /// Executed quantity so far.
    pub filled_quantity: Decimal,
    /// Average execution price, zero until a fill occurs.
    pub avg_fill_price: Decimal,
}

/// Net position reported by the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenuePosition {
    /// Instrument identifier.
    pub instrument: String,
    /// Signed net quantity (positive long, negative short).
    pub net_quantity: Decimal,
    /// Average entry price of the net position.
    pub avg_price: Decimal,
}

impl VenuePosition {
    /// Whether the venue holds no exposure in this instrument.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.net_quantity == Decimal::ZERO
    }
}

/// Push event emitted by a venue adapter.
#[derive(Debug, Clone)]
pub enum VenueEvent {
    /// Last traded price changed.
    Tick {
        /// Instrument identifier.
        instrument: String,
        /// Last traded price.
        price: Decimal,
        /// Venue timestamp of the tick.
        at: DateTime<Utc>,
    },
    /// An order changed state.
    Order(OrderUpdate),
    /// A net position changed.
    Position(VenuePosition),
}

/// Port to a trading venue.
///
/// `positions` and `last_price` are REST-equivalent calls and may block for
/// seconds; hot paths read the [`VenueCache`] instead and fall back to these
/// only when the cache cannot answer.
#[async_trait]
pub trait VenueAdapter: Send + Sync + 'static {
    /// Submit an order; returns the venue order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<String, VenueError>;

    /// Cancel a resting order.
    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError>;

    /// Current state of an order.
    async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, VenueError>;

    /// All open (non-terminal) orders.
    async fn open_orders(&self) -> Result<Vec<OrderUpdate>, VenueError>;

    /// All net positions, including flat entries the venue still reports.
    async fn positions(&self) -> Result<Vec<VenuePosition>, VenueError>;

    /// Last traded price of an instrument.
    async fn last_price(&self, instrument: &str) -> Result<Decimal, VenueError>;

    /// Subscribe to the adapter's push event stream.
    fn subscribe(&self) -> broadcast::Receiver<VenueEvent>;

    /// Short adapter name for logging.
    fn venue_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Long.entry_side(), OrderSide::Buy);
        assert_eq!(Direction::Long.exit_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.entry_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.exit_side(), OrderSide::Buy);
    }

    #[test]
    fn test_direction_roundtrip() {
        assert_eq!(Direction::parse("LONG"), Some(Direction::Long));
        assert_eq!(Direction::parse("SHORT"), Some(Direction::Short));
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
    }

    #[test]
    fn test_flat_position() {
        let flat = VenuePosition {
            instrument: "NIFTY24DECFUT".to_string(),
            net_quantity: Decimal::ZERO,
            avg_price: dec!(21500),
        };
        assert!(flat.is_flat());
    }
}
