//! Order execution: position lifecycle, stop retry policy, and the manager
//! that owns entries and exits.

pub mod manager;
pub mod position;
pub mod retry;

pub use manager::{EntryOutcome, ExecutionManager, ExitOutcome, StopCheck};
pub use position::{ExitReason, Position, PositionStatus};
pub use retry::StopRetryPolicy;

use rust_decimal::Decimal;

/// Rounding direction for tick alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickRound {
    /// Round toward zero distance below the raw price.
    Down,
    /// Round toward zero distance above the raw price.
    Up,
}

/// Align a price to the instrument tick grid.
///
/// Long stops round down and short stops round up, so the protective level
/// is never tighter than requested.
#[must_use]
pub fn round_to_tick(price: Decimal, tick: Decimal, direction: TickRound) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let steps = price / tick;
    let rounded = match direction {
        TickRound::Down => steps.floor(),
        TickRound::Up => steps.ceil(),
    };
    rounded * tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_down_to_tick() {
        assert_eq!(
            round_to_tick(dec!(21392.37), dec!(0.05), TickRound::Down),
            dec!(21392.35)
        );
    }

    #[test]
    fn test_round_up_to_tick() {
        assert_eq!(
            round_to_tick(dec!(21392.37), dec!(0.05), TickRound::Up),
            dec!(21392.40)
        );
    }

    #[test]
    fn test_aligned_price_unchanged() {
        assert_eq!(
            round_to_tick(dec!(21392.35), dec!(0.05), TickRound::Up),
            dec!(21392.35)
        );
    }
}
