//! Capital allocation ledger.
//!
//! Tracks how much buying power each open position has committed. The check
//! and the reservation happen under one lock so two concurrent entries can
//! never double-allocate the same capital.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tokio::sync::Mutex;

/// Why an allocation was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffordDenial {
    /// A reservation already exists for this instrument (no pyramiding).
    AlreadyHolding,
    /// The requested amount exceeds remaining buying power.
    InsufficientFunds,
}

impl AffordDenial {
    /// Stable string form for logs and block reasons.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyHolding => "ALREADY_HOLDING",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
        }
    }
}

/// Result of an affordability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffordCheck {
    /// Denial reason, `None` when the allocation is allowed.
    pub denial: Option<AffordDenial>,
    /// Buying power not yet committed.
    pub available: Decimal,
    /// Amount the check was run for.
    pub required: Decimal,
}

impl AffordCheck {
    /// Whether the allocation is allowed.
    #[must_use]
    pub const fn allowed(&self) -> bool {
        self.denial.is_none()
    }
}

/// Snapshot of the ledger for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapitalStatus {
    /// Configured base capital.
    pub base_capital: Decimal,
    /// Base capital times leverage.
    pub buying_power: Decimal,
    /// Sum of open reservations.
    pub committed: Decimal,
    /// Buying power minus committed.
    pub available: Decimal,
    /// Instruments with an open reservation.
    pub open_instruments: Vec<String>,
}

/// Capital allocator.
#[derive(Debug)]
pub struct CapitalAllocator {
    base_capital: Decimal,
    leverage: Decimal,
    reservations: Mutex<HashMap<String, Decimal>>,
}

impl CapitalAllocator {
    /// Create an allocator with the given base capital and leverage.
    #[must_use]
    pub fn new(base_capital: Decimal, leverage: Decimal) -> Self {
        Self {
            base_capital,
            leverage,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Total deployable buying power.
    #[must_use]
    pub fn buying_power(&self) -> Decimal {
        self.base_capital * self.leverage
    }

    /// Read-only affordability check.
    pub async fn can_afford(&self, instrument: &str, required: Decimal) -> AffordCheck {
        let reservations = self.reservations.lock().await;
        Self::check(&reservations, self.buying_power(), instrument, required)
    }

    /// Check and reserve atomically.
    ///
    /// On success the reservation is recorded before the lock is released;
    /// a concurrent entry for another instrument sees the reduced balance.
    pub async fn allocate(&self, instrument: &str, required: Decimal) -> AffordCheck {
        let mut reservations = self.reservations.lock().await;
        let check = Self::check(&reservations, self.buying_power(), instrument, required);

        if check.allowed() {
            reservations.insert(instrument.to_string(), required);
            tracing::info!(
                instrument = %instrument,
                allocated = %required,
                remaining = %(check.available - required),
                "capital allocated"
            );
        } else if let Some(denial) = check.denial {
            tracing::warn!(
                instrument = %instrument,
                required = %required,
                available = %check.available,
                reason = denial.as_str(),
                "capital allocation denied"
            );
        }

        check
    }

    /// Release the reservation for an instrument.
    ///
    /// Returns the released amount; zero when nothing was reserved. Releasing
    /// restores `available` to exactly its pre-allocation value.
    pub async fn release(&self, instrument: &str) -> Decimal {
        let mut reservations = self.reservations.lock().await;
        let released = reservations.remove(instrument).unwrap_or(Decimal::ZERO);

        if released > Decimal::ZERO {
            let committed: Decimal = reservations.values().copied().sum();
            tracing::info!(
                instrument = %instrument,
                released = %released,
                available = %(self.buying_power() - committed),
                "capital released"
            );
        }
        released
    }

    /// Current ledger snapshot.
    pub async fn status(&self) -> CapitalStatus {
        let reservations = self.reservations.lock().await;
        let committed: Decimal = reservations.values().copied().sum();
        let mut open_instruments: Vec<String> = reservations.keys().cloned().collect();
        open_instruments.sort();

        CapitalStatus {
            base_capital: self.base_capital,
            buying_power: self.buying_power(),
            committed,
            available: self.buying_power() - committed,
            open_instruments,
        }
    }

    fn check(
        reservations: &HashMap<String, Decimal>,
        buying_power: Decimal,
        instrument: &str,
        required: Decimal,
    ) -> AffordCheck {
        let committed: Decimal = reservations.values().copied().sum();
        let available = buying_power - committed;

        let denial = if reservations.contains_key(instrument) {
            Some(AffordDenial::AlreadyHolding)
        } else if required > available {
            Some(AffordDenial::InsufficientFunds)
        } else {
            None
        };

        AffordCheck {
            denial,
            available,
            required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn allocator() -> CapitalAllocator {
        // 100k at 5x = 500k buying power
        CapitalAllocator::new(dec!(100000), dec!(5))
    }

    #[tokio::test]
    async fn test_allocate_within_buying_power() {
        let capital = allocator();
        let check = capital.allocate("NIFTY24DECFUT", dec!(400000)).await;
        assert!(check.allowed());

        let status = capital.status().await;
        assert_eq!(status.committed, dec!(400000));
        assert_eq!(status.available, dec!(100000));
    }

    #[tokio::test]
    async fn test_denies_insufficient_funds() {
        let capital = allocator();
        capital.allocate("NIFTY24DECFUT", dec!(400000)).await;

        let check = capital.allocate("BANKNIFTY24DECFUT", dec!(200000)).await;
        assert_eq!(check.denial, Some(AffordDenial::InsufficientFunds));
        assert_eq!(check.available, dec!(100000));

        // Denied allocation must not mutate the ledger
        assert_eq!(capital.status().await.committed, dec!(400000));
    }

    #[tokio::test]
    async fn test_denies_already_holding() {
        let capital = allocator();
        capital.allocate("NIFTY24DECFUT", dec!(100000)).await;

        let check = capital.allocate("NIFTY24DECFUT", dec!(50000)).await;
        assert_eq!(check.denial, Some(AffordDenial::AlreadyHolding));
    }

    #[tokio::test]
    async fn test_release_restores_available_exactly() {
        let capital = allocator();
        let before = capital.status().await.available;

        capital.allocate("NIFTY24DECFUT", dec!(123456.78)).await;
        let released = capital.release("NIFTY24DECFUT").await;

        assert_eq!(released, dec!(123456.78));
        assert_eq!(capital.status().await.available, before);
    }

    #[tokio::test]
    async fn test_release_unknown_instrument_is_zero() {
        let capital = allocator();
        assert_eq!(capital.release("UNKNOWN").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_cannot_overcommit() {
        let capital = std::sync::Arc::new(allocator());

        let mut handles = Vec::new();
        for i in 0..10 {
            let capital = capital.clone();
            handles.push(tokio::spawn(async move {
                capital.allocate(&format!("INST-{i}"), dec!(100000)).await
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed() {
                allowed += 1;
            }
        }

        // 500k buying power fits exactly five 100k reservations
        assert_eq!(allowed, 5);
        assert_eq!(capital.status().await.available, Decimal::ZERO);
    }
}
