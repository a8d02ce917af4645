//! In-process mirror of venue state.
//!
//! Fed by push events from the adapter, read by the execution manager, the
//! intent gate, and the reconciliation engine. Reads never perform network
//! I/O; each entry carries its update time and readers apply a freshness
//! window. Ticks go stale after 5 s and positions after 10 s, at which point
//! callers fall back to the adapter's REST-equivalent calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::{Notify, broadcast};

use crate::error::VenueError;

use super::{OrderStatus, OrderUpdate, VenueEvent, VenuePosition};

/// Ticks older than this are not served from cache.
pub const TICK_MAX_AGE: Duration = Duration::from_secs(5);

/// Position entries older than this are not served from cache.
pub const POSITION_MAX_AGE: Duration = Duration::from_secs(10);

/// Re-check cadence inside `wait_for_fill`, guards against missed wakeups.
const WAIT_POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct TickEntry {
    price: Decimal,
    at: Instant,
}

#[derive(Debug, Clone)]
struct PositionEntry {
    position: VenuePosition,
    at: Instant,
}

/// Venue state cache.
///
/// The mutation counter increments on every order or position change (not on
/// ticks) so the reconciliation fast path can cheaply establish "nothing
/// moved since last cycle".
#[derive(Debug, Default)]
pub struct VenueCache {
    ticks: RwLock<HashMap<String, TickEntry>>,
    positions: RwLock<HashMap<String, PositionEntry>>,
    orders: RwLock<HashMap<String, OrderUpdate>>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
    mutations: AtomicU64,
}

impl VenueCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one push event from the venue.
    pub fn apply_event(&self, event: VenueEvent) {
        match event {
            VenueEvent::Tick {
                instrument, price, ..
            } => {
                if let Ok(mut ticks) = self.ticks.write() {
                    ticks.insert(
                        instrument,
                        TickEntry {
                            price,
                            at: Instant::now(),
                        },
                    );
                }
            }
            VenueEvent::Order(update) => {
                let order_id = update.order_id.clone();
                if let Ok(mut orders) = self.orders.write() {
                    orders.insert(order_id.clone(), update);
                }
                self.mutations.fetch_add(1, Ordering::SeqCst);
                self.wake_waiter(&order_id);
            }
            VenueEvent::Position(position) => {
                if let Ok(mut positions) = self.positions.write() {
                    positions.insert(
                        position.instrument.clone(),
                        PositionEntry {
                            position,
                            at: Instant::now(),
                        },
                    );
                }
                self.mutations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Last tick price if updated within `max_age`.
    #[must_use]
    pub fn tick_within(&self, instrument: &str, max_age: Duration) -> Option<Decimal> {
        let ticks = self.ticks.read().ok()?;
        let entry = ticks.get(instrument)?;
        (entry.at.elapsed() <= max_age).then_some(entry.price)
    }

    /// Last tick price within the default freshness window.
    #[must_use]
    pub fn fresh_tick(&self, instrument: &str) -> Option<Decimal> {
        self.tick_within(instrument, TICK_MAX_AGE)
    }

    /// Cached position if updated within `max_age`.
    #[must_use]
    pub fn position_within(&self, instrument: &str, max_age: Duration) -> Option<VenuePosition> {
        let positions = self.positions.read().ok()?;
        let entry = positions.get(instrument)?;
        (entry.at.elapsed() <= max_age).then(|| entry.position.clone())
    }

    /// Cached position within the default freshness window.
    #[must_use]
    pub fn fresh_position(&self, instrument: &str) -> Option<VenuePosition> {
        self.position_within(instrument, POSITION_MAX_AGE)
    }

    /// Signed net quantity from cache regardless of age, `None` if never seen.
    #[must_use]
    pub fn net_quantity(&self, instrument: &str) -> Option<Decimal> {
        let positions = self.positions.read().ok()?;
        positions.get(instrument).map(|e| e.position.net_quantity)
    }

    /// All cached positions regardless of age.
    #[must_use]
    pub fn positions_snapshot(&self) -> Vec<VenuePosition> {
        self.positions
            .read()
            .map(|positions| positions.values().map(|e| e.position.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether every cached position is flat. An empty cache counts as flat.
    #[must_use]
    pub fn all_flat(&self) -> bool {
        self.positions
            .read()
            .map(|positions| positions.values().all(|e| e.position.is_flat()))
            .unwrap_or(false)
    }

    /// Monotonic count of order/position mutations applied.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Latest known state of an order.
    #[must_use]
    pub fn order_update(&self, order_id: &str) -> Option<OrderUpdate> {
        self.orders
            .read()
            .ok()
            .and_then(|orders| orders.get(order_id).cloned())
    }

    /// Block until the order reaches a terminal state or `timeout` elapses.
    ///
    /// Returns the fill on `Filled`; `Cancelled`/`Rejected` surface as
    /// [`VenueError::Rejected`], and silence as [`VenueError::Timeout`].
    pub async fn wait_for_fill(
        &self,
        order_id: &str,
        timeout: Duration,
    ) -> Result<OrderUpdate, VenueError> {
        let deadline = Instant::now() + timeout;
        let notify = self.waiter(order_id);

        loop {
            if let Some(update) = self.order_update(order_id) {
                match update.status {
                    OrderStatus::Filled => {
                        self.clear_waiter(order_id);
                        return Ok(update);
                    }
                    OrderStatus::Cancelled | OrderStatus::Rejected => {
                        self.clear_waiter(order_id);
                        return Err(VenueError::Rejected {
                            reason: format!("order {order_id} ended {:?}", update.status),
                        });
                    }
                    OrderStatus::Pending => {}
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.clear_waiter(order_id);
                return Err(VenueError::Timeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }

            let slice = WAIT_POLL_SLICE.min(deadline - now);
            let _ = tokio::time::timeout(slice, notify.notified()).await;
        }
    }

    fn waiter(&self, order_id: &str) -> Arc<Notify> {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters
                .entry(order_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        } else {
            Arc::new(Notify::new())
        }
    }

    fn wake_waiter(&self, order_id: &str) {
        if let Ok(waiters) = self.waiters.lock() {
            if let Some(notify) = waiters.get(order_id) {
                notify.notify_waiters();
            }
        }
    }

    fn clear_waiter(&self, order_id: &str) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(order_id);
        }
    }
}

/// Pump events from an adapter's broadcast stream into the cache.
///
/// Runs until the adapter drops its sender. A lagged receiver logs and keeps
/// going; the next REST fallback repairs any gap.
pub fn spawn_event_pump(
    cache: Arc<VenueCache>,
    mut rx: broadcast::Receiver<VenueEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => cache.apply_event(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "venue event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn tick(instrument: &str, price: Decimal) -> VenueEvent {
        VenueEvent::Tick {
            instrument: instrument.to_string(),
            price,
            at: Utc::now(),
        }
    }

    fn order(order_id: &str, status: OrderStatus, price: Decimal) -> VenueEvent {
        VenueEvent::Order(OrderUpdate {
            order_id: order_id.to_string(),
            instrument: "NIFTY24DECFUT".to_string(),
            status,
            filled_quantity: dec!(50),
            avg_fill_price: price,
        })
    }

    fn position(instrument: &str, qty: Decimal) -> VenueEvent {
        VenueEvent::Position(VenuePosition {
            instrument: instrument.to_string(),
            net_quantity: qty,
            avg_price: dec!(21500),
        })
    }

    #[test]
    fn test_fresh_tick_served_from_cache() {
        let cache = VenueCache::new();
        cache.apply_event(tick("NIFTY24DECFUT", dec!(21510.55)));

        assert_eq!(cache.fresh_tick("NIFTY24DECFUT"), Some(dec!(21510.55)));
        assert_eq!(cache.fresh_tick("BANKNIFTY24DECFUT"), None);
    }

    #[test]
    fn test_stale_tick_not_served() {
        let cache = VenueCache::new();
        cache.apply_event(tick("NIFTY24DECFUT", dec!(21510)));

        assert_eq!(cache.tick_within("NIFTY24DECFUT", Duration::ZERO), None);
    }

    #[test]
    fn test_ticks_do_not_bump_mutation_count() {
        let cache = VenueCache::new();
        cache.apply_event(tick("NIFTY24DECFUT", dec!(21510)));
        assert_eq!(cache.mutation_count(), 0);

        cache.apply_event(position("NIFTY24DECFUT", dec!(50)));
        assert_eq!(cache.mutation_count(), 1);

        cache.apply_event(order("ord-1", OrderStatus::Pending, Decimal::ZERO));
        assert_eq!(cache.mutation_count(), 2);
    }

    #[test]
    fn test_all_flat() {
        let cache = VenueCache::new();
        assert!(cache.all_flat());

        cache.apply_event(position("NIFTY24DECFUT", dec!(50)));
        assert!(!cache.all_flat());

        cache.apply_event(position("NIFTY24DECFUT", Decimal::ZERO));
        assert!(cache.all_flat());
    }

    #[tokio::test]
    async fn test_wait_for_fill_resolves_on_fill_event() {
        let cache = Arc::new(VenueCache::new());
        cache.apply_event(order("ord-1", OrderStatus::Pending, Decimal::ZERO));

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache.wait_for_fill("ord-1", Duration::from_secs(2)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.apply_event(order("ord-1", OrderStatus::Filled, dec!(21511)));

        let update = waiter.await.unwrap().unwrap();
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.avg_fill_price, dec!(21511));
    }

    #[tokio::test]
    async fn test_wait_for_fill_times_out() {
        let cache = VenueCache::new();
        let result = cache
            .wait_for_fill("ord-missing", Duration::from_millis(80))
            .await;
        assert!(matches!(result, Err(VenueError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_fill_surfaces_cancellation() {
        let cache = VenueCache::new();
        cache.apply_event(order("ord-1", OrderStatus::Cancelled, Decimal::ZERO));

        let result = cache.wait_for_fill("ord-1", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(VenueError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_event_pump_applies_events() {
        let cache = Arc::new(VenueCache::new());
        let (tx, rx) = broadcast::channel(16);
        let pump = spawn_event_pump(cache.clone(), rx);

        tx.send(tick("NIFTY24DECFUT", dec!(21510))).unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(cache.fresh_tick("NIFTY24DECFUT"), Some(dec!(21510)));
    }
}
