//! Reconciliation engine.
//!
//! Periodically compares the position store against the venue and alerts on
//! any divergence. Divergences are never auto-corrected; a human decides.
//!
//! The common case for an intraday bot is flat-and-idle, so that case costs
//! nothing: when the venue cache is flat, the last comparison ended flat,
//! no order or position mutation has been applied since, and the store
//! snapshot is not dirty, the cycle is skipped without any venue or store
//! I/O.

pub mod report;

pub use report::{QuantityMismatch, ReconcileStatus, ReconciliationRecord};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Notify;

use crate::alert::Notifier;
use crate::config::ReconciliationConfig;
use crate::error::VenueError;
use crate::session::MarketSession;
use crate::store::{PositionStore, StoreError};
use crate::venue::{Direction, VenueAdapter, VenueCache, VenueEvent};

/// Cycle duration above these thresholds logs a slow-cycle warning.
const SLOW_CYCLE_IN_HOURS: Duration = Duration::from_millis(500);
const SLOW_CYCLE_OFF_HOURS: Duration = Duration::from_secs(3);

/// Reconciliation cycle failures. The loop logs these and retries on the
/// next cycle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The store snapshot refresh failed; the dirty flag stays set.
    #[error("store refresh failed: {0}")]
    Store(#[from] StoreError),
    /// The venue could not report positions.
    #[error("venue positions unavailable: {0}")]
    Venue(#[from] VenueError),
}

/// What one reconciliation cycle did.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Flat fast path; no I/O performed.
    Skipped,
    /// Full comparison ran.
    Completed(ReconciliationRecord),
}

/// Reconciliation engine.
pub struct ReconciliationEngine<V: VenueAdapter> {
    venue: Arc<V>,
    cache: Arc<VenueCache>,
    store: Arc<PositionStore>,
    notifier: Arc<dyn Notifier>,
    session: MarketSession,
    config: ReconciliationConfig,
    stopped: AtomicBool,
    wake: Notify,
    // Fast-path trackers: the last completed comparison ended flat, at this
    // cache mutation count.
    last_flat: AtomicBool,
    last_mutations: AtomicU64,
    refresh_failures: AtomicU32,
}

impl<V: VenueAdapter> ReconciliationEngine<V> {
    /// Create an engine wired to its collaborators.
    #[must_use]
    pub fn new(
        venue: Arc<V>,
        cache: Arc<VenueCache>,
        store: Arc<PositionStore>,
        notifier: Arc<dyn Notifier>,
        session: MarketSession,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            venue,
            cache,
            store,
            notifier,
            session,
            config,
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            // Pessimistic start: the first cycle always runs a comparison
            last_flat: AtomicBool::new(false),
            last_mutations: AtomicU64::new(0),
            refresh_failures: AtomicU32::new(0),
        }
    }

    /// Run one reconciliation cycle.
    pub async fn reconcile(&self) -> Result<CycleOutcome, ReconcileError> {
        let started = Instant::now();

        if self.cache.all_flat()
            && self.last_flat.load(Ordering::SeqCst)
            && self.cache.mutation_count() == self.last_mutations.load(Ordering::SeqCst)
            && !self.store.is_dirty()
        {
            tracing::trace!("reconciliation skipped, flat and unchanged");
            return Ok(CycleOutcome::Skipped);
        }

        // Venue side, cache first. An empty cache on a live cycle means we
        // have not seen a position event yet; fall back to the venue.
        let mut venue_positions = self.cache.positions_snapshot();
        if venue_positions.is_empty() {
            venue_positions = self.venue.positions().await?;
            for position in &venue_positions {
                self.cache.apply_event(VenueEvent::Position(position.clone()));
            }
        }

        // Store side, snapshot unless dirty
        let store_positions = if self.store.is_dirty() {
            match self.store.refresh_snapshot().await {
                Ok(fresh) => {
                    self.refresh_failures.store(0, Ordering::SeqCst);
                    fresh
                }
                Err(e) => {
                    let failures = self.refresh_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::error!(
                        consecutive_failures = failures,
                        error = %e,
                        "store snapshot refresh failed, cycle aborted"
                    );
                    if failures >= self.config.max_refresh_failures {
                        self.notifier
                            .send_alert(&format!(
                                "reconciliation blind: store refresh failed {failures} times in a row ({e})"
                            ))
                            .await;
                    }
                    return Err(e.into());
                }
            }
        } else {
            self.store.snapshot().await
        };

        let venue_map: HashMap<String, Decimal> = venue_positions
            .iter()
            .filter(|p| !p.is_flat())
            .map(|p| (p.instrument.clone(), p.net_quantity))
            .collect();
        let store_map: HashMap<String, Decimal> = store_positions
            .iter()
            .map(|p| {
                let signed = match p.direction {
                    Direction::Long => p.quantity,
                    Direction::Short => -p.quantity,
                };
                (p.instrument.clone(), signed)
            })
            .collect();

        let mut orphans: Vec<String> = venue_map
            .keys()
            .filter(|i| !store_map.contains_key(*i))
            .cloned()
            .collect();
        let mut phantoms: Vec<String> = store_map
            .keys()
            .filter(|i| !venue_map.contains_key(*i))
            .cloned()
            .collect();
        let mut mismatches: Vec<QuantityMismatch> = store_map
            .iter()
            .filter_map(|(instrument, &store_qty)| {
                let &venue_qty = venue_map.get(instrument)?;
                (venue_qty != store_qty).then(|| QuantityMismatch {
                    instrument: instrument.clone(),
                    store_quantity: store_qty,
                    venue_quantity: venue_qty,
                })
            })
            .collect();
        orphans.sort();
        phantoms.sort();
        mismatches.sort_by(|a, b| a.instrument.cmp(&b.instrument));

        let divergent = !(orphans.is_empty() && phantoms.is_empty() && mismatches.is_empty());
        let record = ReconciliationRecord {
            at: Utc::now(),
            store_count: store_map.len() as u32,
            venue_count: venue_map.len() as u32,
            orphans,
            phantoms,
            mismatches,
            status: if divergent {
                ReconcileStatus::Divergent
            } else {
                ReconcileStatus::Clean
            },
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let flat_now = record.venue_count == 0 && record.store_count == 0;
        self.last_flat.store(flat_now, Ordering::SeqCst);
        self.last_mutations
            .store(self.cache.mutation_count(), Ordering::SeqCst);

        if divergent {
            tracing::error!(
                orphans = ?record.orphans,
                phantoms = ?record.phantoms,
                mismatches = record.mismatches.len(),
                "state divergence detected"
            );
            self.notifier.send_alert(&record.summary()).await;
            if let Err(e) = self.store.log_reconciliation(&record).await {
                tracing::warn!(error = %e, "failed to persist reconciliation audit row");
            }
        } else {
            tracing::debug!(
                store_count = record.store_count,
                venue_count = record.venue_count,
                duration_ms = record.duration_ms,
                "reconciliation clean"
            );
        }

        Ok(CycleOutcome::Completed(record))
    }

    /// Interval until the next cycle, from session state and exposure.
    pub async fn current_interval(&self) -> Duration {
        let secs = if self.session.is_open(Utc::now()) {
            self.config.market_hours_interval_secs
        } else if !self.cache.all_flat() || !self.store.snapshot().await.is_empty() {
            self.config.off_hours_interval_secs
        } else {
            self.config.idle_interval_secs
        };
        Duration::from_secs(secs)
    }

    /// Run cycles until [`stop`](Self::stop) is called.
    ///
    /// The stop flag is checked once per cycle; in-flight I/O completes.
    pub async fn run_loop(self: Arc<Self>) {
        tracing::info!("reconciliation loop started");

        while !self.stopped.load(Ordering::SeqCst) {
            let started = Instant::now();
            let in_hours = self.session.is_open(Utc::now());

            match self.reconcile().await {
                Ok(CycleOutcome::Skipped) => {}
                Ok(CycleOutcome::Completed(record)) => {
                    tracing::trace!(status = record.status.as_str(), "cycle complete");
                }
                Err(e) => {
                    tracing::error!(error = %e, "reconciliation cycle failed");
                }
            }

            let elapsed = started.elapsed();
            let threshold = if in_hours {
                SLOW_CYCLE_IN_HOURS
            } else {
                SLOW_CYCLE_OFF_HOURS
            };
            if elapsed > threshold {
                tracing::warn!(
                    duration_ms = elapsed.as_millis() as u64,
                    in_hours,
                    "slow reconciliation cycle"
                );
            }

            let interval = self.current_interval().await;
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.wake.notified() => {}
            }
        }

        tracing::info!("reconciliation loop stopped");
    }

    /// Request a cooperative stop and wake the loop from its sleep.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ChannelNotifier;
    use crate::config::SessionConfig;
    use crate::execution::position::{Position, PositionStatus};
    use crate::venue::sim::SimVenue;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    const INSTRUMENT: &str = "NIFTY24DECFUT";

    struct Harness {
        venue: Arc<SimVenue>,
        cache: Arc<VenueCache>,
        store: Arc<PositionStore>,
        alerts: mpsc::UnboundedReceiver<String>,
        engine: Arc<ReconciliationEngine<SimVenue>>,
    }

    async fn harness() -> Harness {
        let venue = Arc::new(SimVenue::new());
        let cache = Arc::new(VenueCache::new());
        let store = Arc::new(PositionStore::in_memory().await.unwrap());
        let (notifier, alerts) = ChannelNotifier::new();
        let session = MarketSession::from_config(&SessionConfig::default()).unwrap();

        let engine = Arc::new(ReconciliationEngine::new(
            venue.clone(),
            cache.clone(),
            store.clone(),
            Arc::new(notifier),
            session,
            ReconciliationConfig::default(),
        ));

        Harness {
            venue,
            cache,
            store,
            alerts,
            engine,
        }
    }

    fn stored_position(instrument: &str, direction: Direction, quantity: Decimal) -> Position {
        Position {
            trade_id: uuid::Uuid::new_v4().to_string(),
            instrument: instrument.to_string(),
            direction,
            quantity,
            entry_price: dec!(21500),
            entry_time: Utc::now(),
            stop_order_id: None,
            stop_price: dec!(21392.50),
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut alerts = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            alerts.push(alert);
        }
        alerts
    }

    #[tokio::test]
    async fn test_flat_second_cycle_skips_with_zero_io() {
        let h = harness().await;

        // First cycle is always a full comparison
        let first = h.engine.reconcile().await.unwrap();
        assert!(matches!(first, CycleOutcome::Completed(r) if r.is_clean()));

        let calls_before = h.venue.call_count();
        let second = h.engine.reconcile().await.unwrap();

        assert!(matches!(second, CycleOutcome::Skipped));
        assert_eq!(h.venue.call_count(), calls_before);
        assert_eq!(h.store.reconciliation_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_fast_path() {
        let h = harness().await;
        h.engine.reconcile().await.unwrap();

        h.cache.apply_event(VenueEvent::Position(crate::venue::VenuePosition {
            instrument: INSTRUMENT.to_string(),
            net_quantity: dec!(50),
            avg_price: dec!(21500),
        }));

        let outcome = h.engine.reconcile().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_single_orphan_yields_one_alert_and_one_audit_row() {
        let mut h = harness().await;
        h.venue.seed_position(INSTRUMENT, dec!(50), dec!(21500));

        let outcome = h.engine.reconcile().await.unwrap();
        let CycleOutcome::Completed(record) = outcome else {
            panic!("expected completed cycle");
        };

        assert_eq!(record.orphans, vec![INSTRUMENT.to_string()]);
        assert!(record.phantoms.is_empty());
        assert!(record.mismatches.is_empty());
        assert_eq!(record.status, ReconcileStatus::Divergent);

        let alerts = drain(&mut h.alerts);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains(INSTRUMENT));

        assert_eq!(h.store.reconciliation_count().await.unwrap(), 1);
        let logged = h.store.last_reconciliation().await.unwrap().unwrap();
        assert_eq!(logged.orphans, record.orphans);
    }

    #[tokio::test]
    async fn test_phantom_when_store_has_what_venue_lacks() {
        let h = harness().await;
        h.store
            .record_entry(&stored_position(INSTRUMENT, Direction::Long, dec!(50)))
            .await
            .unwrap();

        let CycleOutcome::Completed(record) = h.engine.reconcile().await.unwrap() else {
            panic!("expected completed cycle");
        };

        assert_eq!(record.phantoms, vec![INSTRUMENT.to_string()]);
        assert!(record.orphans.is_empty());
    }

    #[tokio::test]
    async fn test_quantity_mismatch_alert_only() {
        let mut h = harness().await;
        h.store
            .record_entry(&stored_position(INSTRUMENT, Direction::Long, dec!(50)))
            .await
            .unwrap();
        h.venue.seed_position(INSTRUMENT, dec!(25), dec!(21500));

        let CycleOutcome::Completed(record) = h.engine.reconcile().await.unwrap() else {
            panic!("expected completed cycle");
        };

        assert_eq!(record.mismatches.len(), 1);
        assert_eq!(record.mismatches[0].store_quantity, dec!(50));
        assert_eq!(record.mismatches[0].venue_quantity, dec!(25));

        // Alerted but never corrected: both sides unchanged
        assert!(!drain(&mut h.alerts).is_empty());
        assert_eq!(
            h.venue.positions().await.unwrap()[0].net_quantity,
            dec!(25)
        );
        assert_eq!(h.store.open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_short_position_signs_compare_correctly() {
        let h = harness().await;
        h.store
            .record_entry(&stored_position(INSTRUMENT, Direction::Short, dec!(50)))
            .await
            .unwrap();
        h.venue.seed_position(INSTRUMENT, dec!(-50), dec!(21500));

        let CycleOutcome::Completed(record) = h.engine.reconcile().await.unwrap() else {
            panic!("expected completed cycle");
        };
        assert!(record.is_clean());
    }

    #[tokio::test]
    async fn test_dirty_store_forces_refresh() {
        let h = harness().await;
        h.engine.reconcile().await.unwrap();

        h.store
            .record_entry(&stored_position(INSTRUMENT, Direction::Long, dec!(50)))
            .await
            .unwrap();
        assert!(h.store.is_dirty());

        h.engine.reconcile().await.unwrap();
        assert!(!h.store.is_dirty());
    }

    #[tokio::test]
    async fn test_loop_stops_cooperatively() {
        let h = harness().await;
        let engine = h.engine.clone();
        let handle = tokio::spawn(engine.run_loop());

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.engine.stop();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();
    }
}
