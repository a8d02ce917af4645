//! Reconciliation audit records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A quantity disagreement between the store and the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityMismatch {
    /// Instrument both sides report, with different sizes.
    pub instrument: String,
    /// Net quantity according to the position store.
    pub store_quantity: Decimal,
    /// Net quantity according to the venue.
    pub venue_quantity: Decimal,
}

/// Outcome classification of a completed comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileStatus {
    /// Store and venue agree.
    Clean,
    /// At least one orphan, phantom, or mismatch was found.
    Divergent,
}

impl ReconcileStatus {
    /// Stable string form for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "CLEAN",
            Self::Divergent => "DIVERGENT",
        }
    }

    /// Parse the persisted string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CLEAN" => Some(Self::Clean),
            "DIVERGENT" => Some(Self::Divergent),
            _ => None,
        }
    }
}

/// One append-only audit row per completed reconciliation comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    /// When the comparison ran.
    pub at: DateTime<Utc>,
    /// Live positions on the store side.
    pub store_count: u32,
    /// Non-flat positions on the venue side.
    pub venue_count: u32,
    /// Instruments the venue holds with no store record.
    pub orphans: Vec<String>,
    /// Instruments the store holds that the venue does not.
    pub phantoms: Vec<String>,
    /// Instruments both sides hold at different sizes.
    pub mismatches: Vec<QuantityMismatch>,
    /// Clean or divergent.
    pub status: ReconcileStatus,
    /// Wall-clock cost of the comparison.
    pub duration_ms: u64,
}

impl ReconciliationRecord {
    /// Whether store and venue agree.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self.status, ReconcileStatus::Clean)
    }

    /// One-line divergence summary for operator alerts.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "reconciliation {}: {} orphan(s) {:?}, {} phantom(s) {:?}, {} mismatch(es)",
            self.status.as_str(),
            self.orphans.len(),
            self.orphans,
            self.phantoms.len(),
            self.phantoms,
            self.mismatches.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_summary_names_divergent_instruments() {
        let record = ReconciliationRecord {
            at: Utc::now(),
            store_count: 1,
            venue_count: 2,
            orphans: vec!["BANKNIFTY24DECFUT".to_string()],
            phantoms: vec![],
            mismatches: vec![QuantityMismatch {
                instrument: "NIFTY24DECFUT".to_string(),
                store_quantity: dec!(50),
                venue_quantity: dec!(25),
            }],
            status: ReconcileStatus::Divergent,
            duration_ms: 12,
        };

        let summary = record.summary();
        assert!(summary.contains("BANKNIFTY24DECFUT"));
        assert!(summary.contains("1 mismatch(es)"));
        assert!(!record.is_clean());
    }

    #[test]
    fn test_status_roundtrip() {
        assert_eq!(
            ReconcileStatus::parse(ReconcileStatus::Clean.as_str()),
            Some(ReconcileStatus::Clean)
        );
        assert_eq!(ReconcileStatus::parse("???"), None);
    }
}
