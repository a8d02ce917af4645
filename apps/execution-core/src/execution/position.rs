//! Position lifecycle model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::venue::Direction;

/// Lifecycle state of a position.
///
/// Legal transitions: Opening → Open → Closing → Closed, plus → Error from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    /// Entry order submitted, protective stop not yet in place.
    Opening,
    /// Entry filled and protective stop resting.
    Open,
    /// Exit in progress.
    Closing,
    /// Fully exited; read-only history.
    Closed,
    /// Manual intervention required.
    Error,
}

impl PositionStatus {
    /// Stable string form for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "OPENING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        }
    }

    /// Parse the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPENING" => Some(Self::Opening),
            "OPEN" => Some(Self::Open),
            "CLOSING" => Some(Self::Closing),
            "CLOSED" => Some(Self::Closed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the position still has (or may have) market exposure.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Opening | Self::Open | Self::Closing)
    }

    /// Whether moving to `next` is a legal lifecycle step.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Opening, Self::Open)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
                | (Self::Opening | Self::Open | Self::Closing, Self::Error)
        )
    }
}

/// Why a position was exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Target reached; strategy-initiated exit.
    TargetHit,
    /// The venue-side protective stop filled on its own.
    BrokerStopFilled,
    /// Forced exit after stop placement exhausted its retries.
    Emergency,
    /// End-of-day square-off.
    EndOfDay,
    /// Operator-initiated exit.
    Manual,
}

impl ExitReason {
    /// Stable string form for persistence and alerts.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TargetHit => "TARGET_HIT",
            Self::BrokerStopFilled => "BROKER_STOP_FILLED",
            Self::Emergency => "EMERGENCY",
            Self::EndOfDay => "END_OF_DAY",
            Self::Manual => "MANUAL",
        }
    }

    /// Parse the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TARGET_HIT" => Some(Self::TargetHit),
            "BROKER_STOP_FILLED" => Some(Self::BrokerStopFilled),
            "EMERGENCY" => Some(Self::Emergency),
            "END_OF_DAY" => Some(Self::EndOfDay),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }

    /// Emergency exits may proceed even when the stop cancel fails.
    #[must_use]
    pub const fn is_emergency(self) -> bool {
        matches!(self, Self::Emergency)
    }
}

/// A tracked position.
#[derive(Debug, Clone)]
pub struct Position {
    /// Internal trade identifier.
    pub trade_id: String,
    /// Venue instrument identifier.
    pub instrument: String,
    /// Long or short.
    pub direction: Direction,
    /// Position size in whole units.
    pub quantity: Decimal,
    /// Average entry fill price.
    pub entry_price: Decimal,
    /// Entry fill time.
    pub entry_time: DateTime<Utc>,
    /// Venue order id of the resting protective stop, if one is in place.
    pub stop_order_id: Option<String>,
    /// Trigger price of the protective stop.
    pub stop_price: Decimal,
    /// Lifecycle state.
    pub status: PositionStatus,
    /// Average exit fill price, set on close.
    pub exit_price: Option<Decimal>,
    /// Exit fill time, set on close.
    pub exit_time: Option<DateTime<Utc>>,
    /// Why the position was exited, set on close.
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    /// Capital the position ties up at entry.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    /// Realized profit and loss once both fills are known.
    #[must_use]
    pub fn realized_pnl(&self) -> Option<Decimal> {
        let exit = self.exit_price?;
        let per_unit = match self.direction {
            Direction::Long => exit - self.entry_price,
            Direction::Short => self.entry_price - exit,
        };
        Some(per_unit * self.quantity)
    }
}
