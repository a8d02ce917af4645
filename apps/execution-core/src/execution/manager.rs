//! Order execution manager.
//!
//! Owns every tracked position and the near-atomic entry sequence: allocate
//! capital, fill the entry, place the protective stop. A position is never
//! left unprotected; if the stop cannot be placed after bounded retries the
//! just-opened position is flattened immediately.
//!
//! Exits always cancel the protective stop before placing the closing order.
//! A stop resting at the venue while a manual exit fills would make the stop
//! a naked reversing order; the cancel-first rule removes that window. Exits
//! and stop monitoring for the same instrument serialize on one async lock,
//! so at most one closing order can ever be in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::alert::Notifier;
use crate::capital::CapitalAllocator;
use crate::config::Config;
use crate::error::VenueError;
use crate::store::{PositionStore, StoreError};
use crate::venue::{Direction, OrderRequest, OrderStatus, OrderUpdate, VenueAdapter, VenueCache};

use super::position::{ExitReason, Position, PositionStatus};
use super::retry::StopRetryPolicy;
use super::{TickRound, round_to_tick};

/// Outcome of an entry attempt. Blocks are guard decisions, not errors, and
/// are never retried by the manager.
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    /// Position opened with its protective stop resting.
    Entered(Position),
    /// A safety guard refused the entry before any order was sent.
    Blocked(String),
    /// The entry was attempted but could not be completed safely.
    Failed(String),
}

/// Outcome of an exit attempt.
#[derive(Debug, Clone)]
pub enum ExitOutcome {
    /// Position fully closed and recorded.
    Exited(Position),
    /// The exit could not proceed safely; the position is still live.
    Blocked(String),
    /// Nothing to exit.
    Noop,
}

/// Result of a protective stop check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCheck {
    /// Stop still resting; position unchanged.
    Intact,
    /// The venue-side stop filled; the position was finalized as closed.
    Filled,
    /// No live position (or no stop) to check.
    NoPosition,
    /// The stop state could not be determined this cycle.
    Unknown,
}

/// Startup reconciliation failures.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Reading tracked positions back from the store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The venue could not report positions or open orders.
    #[error(transparent)]
    Venue(#[from] VenueError),
}

/// What startup reconciliation found and did.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    /// Live positions re-adopted from the store.
    pub adopted: usize,
    /// Venue-side positions with no store record. Alerted, never adopted.
    pub orphans: Vec<String>,
    /// Stale venue orders cancelled.
    pub cancelled_orders: Vec<String>,
}

/// Fill price from an update, falling back when the venue reported none.
fn fill_price_or(update: &OrderUpdate, fallback: Decimal) -> Decimal {
    if update.avg_fill_price > Decimal::ZERO {
        update.avg_fill_price
    } else {
        fallback
    }
}

/// Order execution manager.
pub struct ExecutionManager<V: VenueAdapter> {
    venue: Arc<V>,
    cache: Arc<VenueCache>,
    store: Arc<PositionStore>,
    capital: Arc<CapitalAllocator>,
    notifier: Arc<dyn Notifier>,
    per_trade_allocation: Decimal,
    risk_per_trade_pct: Decimal,
    tick_size: Decimal,
    fill_timeout: Duration,
    stop_retry: StopRetryPolicy,
    positions: RwLock<HashMap<String, Position>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<V: VenueAdapter> ExecutionManager<V> {
    /// Create a manager wired to its collaborators.
    #[must_use]
    pub fn new(
        venue: Arc<V>,
        cache: Arc<VenueCache>,
        store: Arc<PositionStore>,
        capital: Arc<CapitalAllocator>,
        notifier: Arc<dyn Notifier>,
        config: &Config,
    ) -> Self {
        Self {
            venue,
            cache,
            store,
            capital,
            notifier,
            per_trade_allocation: config.capital.per_trade_allocation,
            risk_per_trade_pct: config.capital.risk_per_trade_pct,
            tick_size: config.venue.tick_size,
            fill_timeout: config.venue.fill_timeout(),
            stop_retry: StopRetryPolicy::with_attempts(config.venue.stop_retry_attempts),
            positions: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Per-instrument mutex; `exit` and `monitor_stop_status` share it.
    async fn instrument_lock(&self, instrument: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(instrument.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Currently tracked position for an instrument.
    pub async fn tracked_position(&self, instrument: &str) -> Option<Position> {
        self.positions.read().await.get(instrument).cloned()
    }

    /// Instruments with a live tracked position.
    pub async fn open_instruments(&self) -> Vec<String> {
        self.positions
            .read()
            .await
            .iter()
            .filter(|(_, p)| p.status.is_live())
            .map(|(i, _)| i.clone())
            .collect()
    }

    /// Open a position in `direction` on `instrument`.
    ///
    /// Sequence: guards → capital allocation → market entry → fill wait →
    /// protective stop with bounded retries. Every failure path releases the
    /// allocation, and a stop that cannot be placed flattens the position
    /// before returning.
    pub async fn enter(&self, instrument: &str, direction: Direction) -> EntryOutcome {
        let lock = self.instrument_lock(instrument).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.positions.read().await.get(instrument) {
            if existing.status.is_live() {
                tracing::warn!(
                    instrument = %instrument,
                    status = existing.status.as_str(),
                    "entry blocked, position already tracked"
                );
                return EntryOutcome::Blocked("ALREADY_HOLDING".to_string());
            }
        }

        // Venue already shows exposure we do not track
        if let Some(net) = self.cache.net_quantity(instrument) {
            if net != Decimal::ZERO {
                tracing::warn!(
                    instrument = %instrument,
                    venue_quantity = %net,
                    "entry blocked, venue reports an untracked position"
                );
                return EntryOutcome::Blocked("VENUE_POSITION_EXISTS".to_string());
            }
        }

        let price = match self.current_price(instrument).await {
            Ok(price) => price,
            Err(e) => {
                tracing::error!(
                    instrument = %instrument,
                    action = "price_lookup",
                    error = %e,
                    "entry failed, no usable price"
                );
                return EntryOutcome::Failed(format!("NO_PRICE: {e}"));
            }
        };

        if price <= Decimal::ZERO {
            tracing::error!(
                instrument = %instrument,
                price = %price,
                action = "price_lookup",
                "entry failed, non-positive price"
            );
            return EntryOutcome::Failed("NO_PRICE: non-positive price".to_string());
        }

        // Size from the per-trade budget, never the whole remaining balance
        let available = self.capital.status().await.available;
        let budget = self.per_trade_allocation.min(available);
        let quantity = (budget / price).floor();
        if quantity <= Decimal::ZERO {
            return EntryOutcome::Blocked("ZERO_QUANTITY".to_string());
        }
        let cost = quantity * price;

        let check = self.capital.allocate(instrument, cost).await;
        if let Some(denial) = check.denial {
            return EntryOutcome::Blocked(denial.as_str().to_string());
        }

        let entry_request = OrderRequest::market(instrument, direction.entry_side(), quantity);
        let entry_id = match self.venue.place_order(&entry_request).await {
            Ok(id) => id,
            Err(e) => {
                self.capital.release(instrument).await;
                tracing::error!(
                    instrument = %instrument,
                    action = "entry_order",
                    error = %e,
                    "entry order not accepted"
                );
                return EntryOutcome::Failed(format!("ENTRY_REJECTED: {e}"));
            }
        };

        let fill = match self.cache.wait_for_fill(&entry_id, self.fill_timeout).await {
            Ok(fill) => fill,
            Err(e) => {
                tracing::error!(
                    instrument = %instrument,
                    order_id = %entry_id,
                    action = "entry_fill_wait",
                    error = %e,
                    "entry did not fill, cancelling"
                );
                if let Err(cancel_err) = self.venue.cancel_order(&entry_id).await {
                    tracing::warn!(
                        instrument = %instrument,
                        order_id = %entry_id,
                        error = %cancel_err,
                        "cancel of unfilled entry failed"
                    );
                }
                self.capital.release(instrument).await;
                return EntryOutcome::Failed(format!("ENTRY_FILL_TIMEOUT: {e}"));
            }
        };

        let entry_price = fill.avg_fill_price;
        let stop_price = self.protective_stop_price(entry_price, direction);

        let Some(stop_order_id) = self
            .place_stop_with_retries(instrument, direction, quantity, stop_price)
            .await
        else {
            // Naked position: flatten before reporting failure
            self.notifier
                .send_alert(&format!(
                    "STOP PLACEMENT FAILED on {instrument}, emergency exit of {quantity} units"
                ))
                .await;
            self.emergency_flatten(instrument, direction, quantity).await;
            self.capital.release(instrument).await;
            return EntryOutcome::Failed("STOP_PLACEMENT_FAILED".to_string());
        };

        let position = Position {
            trade_id: Uuid::new_v4().to_string(),
            instrument: instrument.to_string(),
            direction,
            quantity,
            entry_price,
            entry_time: Utc::now(),
            stop_order_id: Some(stop_order_id.clone()),
            stop_price,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        };

        self.positions
            .write()
            .await
            .insert(instrument.to_string(), position.clone());

        if let Err(e) = self.store.record_entry(&position).await {
            tracing::error!(
                trade_id = %position.trade_id,
                instrument = %instrument,
                error = %e,
                "entry recorded in memory only, store write failed"
            );
            self.notifier
                .send_alert(&format!("store write failed for entry on {instrument}: {e}"))
                .await;
        }

        tracing::info!(
            trade_id = %position.trade_id,
            instrument = %instrument,
            direction = direction.as_str(),
            quantity = %quantity,
            entry_price = %entry_price,
            stop_order_id = %stop_order_id,
            stop_price = %stop_price,
            "position opened"
        );
        self.notifier
            .send_alert(&format!(
                "ENTERED {} {instrument} x{quantity} @ {entry_price}, stop {stop_price}",
                direction.as_str()
            ))
            .await;

        EntryOutcome::Entered(position)
    }

    /// Close the live position on `instrument`.
    ///
    /// The protective stop is always cancelled before the closing order is
    /// placed. If the cancel fails because the stop already filled, the
    /// position is finalized as closed by the venue and no further order is
    /// sent.
    pub async fn exit(&self, instrument: &str, reason: ExitReason) -> ExitOutcome {
        let lock = self.instrument_lock(instrument).await;
        let _guard = lock.lock().await;

        let Some(mut position) = self.positions.read().await.get(instrument).cloned() else {
            return ExitOutcome::Noop;
        };
        if !position.status.is_live() {
            return ExitOutcome::Noop;
        }

        position.status = PositionStatus::Closing;
        self.positions
            .write()
            .await
            .insert(instrument.to_string(), position.clone());

        // Step 1: take the protective stop off the book
        if reason != ExitReason::BrokerStopFilled {
            if let Some(stop_id) = position.stop_order_id.clone() {
                if let Err(cancel_err) = self.venue.cancel_order(&stop_id).await {
                    match self.stop_fill_state(&stop_id).await {
                        Some(update) if update.status == OrderStatus::Filled => {
                            // The stop beat us to it; nothing left to sell
                            tracing::info!(
                                instrument = %instrument,
                                stop_order_id = %stop_id,
                                "stop filled during exit, finalizing without close order"
                            );
                            let exit_price = fill_price_or(&update, position.stop_price);
                            let closed = self
                                .finalize_exit(position, exit_price, ExitReason::BrokerStopFilled)
                                .await;
                            return ExitOutcome::Exited(closed);
                        }
                        _ if reason.is_emergency() => {
                            tracing::warn!(
                                instrument = %instrument,
                                stop_order_id = %stop_id,
                                error = %cancel_err,
                                "stop cancel failed, emergency exit proceeding anyway"
                            );
                        }
                        _ => {
                            tracing::error!(
                                instrument = %instrument,
                                stop_order_id = %stop_id,
                                action = "stop_cancel",
                                error = %cancel_err,
                                "stop cancel failed and stop still resting, exit blocked"
                            );
                            self.notifier
                                .send_alert(&format!(
                                    "exit of {instrument} blocked: stop cancel failed ({cancel_err})"
                                ))
                                .await;
                            position.status = PositionStatus::Open;
                            self.positions
                                .write()
                                .await
                                .insert(instrument.to_string(), position);
                            return ExitOutcome::Blocked("STOP_CANCEL_FAILED".to_string());
                        }
                    }
                }
            }
        }

        // Step 2: closing order, unless the venue-side stop already closed us
        if reason == ExitReason::BrokerStopFilled {
            let exit_price = match position.stop_order_id.as_deref() {
                Some(stop_id) => self
                    .stop_fill_state(stop_id)
                    .await
                    .map_or(position.stop_price, |u| fill_price_or(&u, position.stop_price)),
                None => position.stop_price,
            };
            let closed = self
                .finalize_exit(position, exit_price, ExitReason::BrokerStopFilled)
                .await;
            return ExitOutcome::Exited(closed);
        }

        let close_request = OrderRequest::market(
            instrument,
            position.direction.exit_side(),
            position.quantity,
        );
        let close_id = match self.venue.place_order(&close_request).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    instrument = %instrument,
                    action = "close_order",
                    error = %e,
                    "closing order not accepted"
                );
                self.mark_error(instrument, &mut position).await;
                self.notifier
                    .send_alert(&format!(
                        "CLOSE ORDER REJECTED on {instrument}: {e}. Manual intervention required."
                    ))
                    .await;
                return ExitOutcome::Blocked(format!("CLOSE_REJECTED: {e}"));
            }
        };

        let fill = match self.cache.wait_for_fill(&close_id, self.fill_timeout).await {
            Ok(fill) => fill,
            Err(e) => {
                tracing::error!(
                    instrument = %instrument,
                    order_id = %close_id,
                    action = "close_fill_wait",
                    error = %e,
                    "closing order did not fill"
                );
                self.mark_error(instrument, &mut position).await;
                self.notifier
                    .send_alert(&format!(
                        "CLOSE ORDER UNFILLED on {instrument}: {e}. Manual intervention required."
                    ))
                    .await;
                return ExitOutcome::Blocked(format!("CLOSE_FILL_TIMEOUT: {e}"));
            }
        };

        let closed = self
            .finalize_exit(position, fill.avg_fill_price, reason)
            .await;
        ExitOutcome::Exited(closed)
    }

    /// Check whether the venue-side protective stop has filled.
    ///
    /// Shares the per-instrument lock with `exit`, so only one of the two
    /// can finalize a position. A detected fill closes the position without
    /// placing any order.
    pub async fn monitor_stop_status(&self, instrument: &str) -> StopCheck {
        let lock = self.instrument_lock(instrument).await;
        let _guard = lock.lock().await;

        let Some(position) = self.positions.read().await.get(instrument).cloned() else {
            return StopCheck::NoPosition;
        };
        if position.status != PositionStatus::Open {
            return StopCheck::NoPosition;
        }
        let Some(stop_id) = position.stop_order_id.clone() else {
            return StopCheck::NoPosition;
        };

        let Some(update) = self.stop_fill_state(&stop_id).await else {
            return StopCheck::Unknown;
        };

        if update.status == OrderStatus::Filled {
            tracing::warn!(
                instrument = %instrument,
                stop_order_id = %stop_id,
                fill_price = %update.avg_fill_price,
                "protective stop filled at venue"
            );
            let exit_price = fill_price_or(&update, position.stop_price);
            self.finalize_exit(position, exit_price, ExitReason::BrokerStopFilled)
                .await;
            return StopCheck::Filled;
        }

        StopCheck::Intact
    }

    /// Re-adopt live positions from the store and compare against the venue.
    ///
    /// Venue positions with no store record are alerted as orphans and never
    /// adopted or auto-closed. Venue orders that belong to no tracked stop
    /// are cancelled.
    pub async fn startup_reconciliation(&self) -> Result<StartupReport, StartupError> {
        let mut report = StartupReport::default();

        let stored = self.store.open_positions().await?;
        {
            let mut positions = self.positions.write().await;
            for position in stored {
                tracing::info!(
                    trade_id = %position.trade_id,
                    instrument = %position.instrument,
                    status = position.status.as_str(),
                    "re-adopted position from store"
                );
                positions.insert(position.instrument.clone(), position);
                report.adopted += 1;
            }
        }

        let venue_positions = self.venue.positions().await?;
        for vp in venue_positions.iter().filter(|vp| !vp.is_flat()) {
            let tracked = self.positions.read().await.contains_key(&vp.instrument);
            if !tracked {
                tracing::error!(
                    instrument = %vp.instrument,
                    venue_quantity = %vp.net_quantity,
                    "venue holds a position with no local record"
                );
                self.notifier
                    .send_alert(&format!(
                        "ORPHAN at venue: {} x{} with no local record. Not auto-corrected.",
                        vp.instrument, vp.net_quantity
                    ))
                    .await;
                report.orphans.push(vp.instrument.clone());
            }
        }

        let tracked_stops: Vec<String> = self
            .positions
            .read()
            .await
            .values()
            .filter_map(|p| p.stop_order_id.clone())
            .collect();
        for order in self.venue.open_orders().await? {
            if tracked_stops.contains(&order.order_id) {
                continue;
            }
            tracing::warn!(
                order_id = %order.order_id,
                instrument = %order.instrument,
                "cancelling stale venue order"
            );
            if let Err(e) = self.venue.cancel_order(&order.order_id).await {
                tracing::warn!(
                    order_id = %order.order_id,
                    error = %e,
                    "stale order cancel failed"
                );
            } else {
                report.cancelled_orders.push(order.order_id);
            }
        }

        Ok(report)
    }

    /// Exit every live position through the normal exit path.
    pub async fn close_all(&self, reason: ExitReason) -> Vec<(String, ExitOutcome)> {
        let instruments = self.open_instruments().await;
        tracing::info!(
            count = instruments.len(),
            reason = reason.as_str(),
            "closing all positions"
        );

        let mut results = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            let outcome = self.exit(&instrument, reason).await;
            results.push((instrument, outcome));
        }

        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, o)| matches!(o, ExitOutcome::Blocked(_)))
            .map(|(i, _)| i.as_str())
            .collect();
        if !failed.is_empty() {
            self.notifier
                .send_alert(&format!("close_all left positions live: {failed:?}"))
                .await;
        }

        results
    }

    /// Cache-first price, venue fallback.
    async fn current_price(&self, instrument: &str) -> Result<Decimal, VenueError> {
        if let Some(price) = self.cache.fresh_tick(instrument) {
            return Ok(price);
        }
        self.venue.last_price(instrument).await
    }

    fn protective_stop_price(&self, entry_price: Decimal, direction: Direction) -> Decimal {
        let fraction = self.risk_per_trade_pct / Decimal::new(100, 0);
        match direction {
            Direction::Long => round_to_tick(
                entry_price * (Decimal::ONE - fraction),
                self.tick_size,
                TickRound::Down,
            ),
            Direction::Short => round_to_tick(
                entry_price * (Decimal::ONE + fraction),
                self.tick_size,
                TickRound::Up,
            ),
        }
    }

    /// Place the protective stop, retrying transient failures within the
    /// policy budget. Returns `None` once the budget is spent or the venue
    /// answers with a non-retryable error.
    async fn place_stop_with_retries(
        &self,
        instrument: &str,
        direction: Direction,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Option<String> {
        let request = OrderRequest::stop(instrument, direction.exit_side(), quantity, stop_price);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.venue.place_order(&request).await {
                Ok(order_id) => return Some(order_id),
                Err(e) => {
                    tracing::warn!(
                        instrument = %instrument,
                        attempt,
                        action = "stop_order",
                        stop_price = %stop_price,
                        error = %e,
                        "protective stop placement failed"
                    );
                    if !e.is_retryable() {
                        return None;
                    }
                    match self.stop_retry.next_backoff(attempt) {
                        Some(backoff) => tokio::time::sleep(backoff).await,
                        None => return None,
                    }
                }
            }
        }
    }

    /// Market-flatten a just-opened position that could not be protected.
    async fn emergency_flatten(&self, instrument: &str, direction: Direction, quantity: Decimal) {
        let request = OrderRequest::market(instrument, direction.exit_side(), quantity);
        match self.venue.place_order(&request).await {
            Ok(order_id) => {
                if let Err(e) = self.cache.wait_for_fill(&order_id, self.fill_timeout).await {
                    tracing::error!(
                        instrument = %instrument,
                        order_id = %order_id,
                        error = %e,
                        "emergency exit order did not confirm"
                    );
                    self.notifier
                        .send_alert(&format!(
                            "EMERGENCY EXIT UNCONFIRMED on {instrument}: {e}. Manual intervention required."
                        ))
                        .await;
                } else {
                    tracing::warn!(
                        instrument = %instrument,
                        quantity = %quantity,
                        "unprotected position flattened"
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    instrument = %instrument,
                    action = "emergency_exit",
                    error = %e,
                    "emergency exit order failed"
                );
                self.notifier
                    .send_alert(&format!(
                        "EMERGENCY EXIT FAILED on {instrument}: {e}. NAKED POSITION, manual intervention required."
                    ))
                    .await;
            }
        }
    }

    /// Latest stop order state, cache first then venue.
    async fn stop_fill_state(&self, stop_id: &str) -> Option<OrderUpdate> {
        if let Some(update) = self.cache.order_update(stop_id) {
            return Some(update);
        }
        self.venue.order_status(stop_id).await.ok()
    }

    async fn mark_error(&self, instrument: &str, position: &mut Position) {
        position.status = PositionStatus::Error;
        self.positions
            .write()
            .await
            .insert(instrument.to_string(), position.clone());
    }

    /// Complete a close: transition, untrack, release capital, persist, alert.
    async fn finalize_exit(
        &self,
        mut position: Position,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> Position {
        let exit_time = Utc::now();
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(exit_time);
        position.exit_reason = Some(reason);

        self.positions.write().await.remove(&position.instrument);
        self.capital.release(&position.instrument).await;

        if let Err(e) = self
            .store
            .record_exit(&position.trade_id, exit_price, exit_time, reason)
            .await
        {
            tracing::error!(
                trade_id = %position.trade_id,
                instrument = %position.instrument,
                error = %e,
                "exit recorded in memory only, store write failed"
            );
            self.notifier
                .send_alert(&format!(
                    "store write failed for exit on {}: {e}",
                    position.instrument
                ))
                .await;
        }

        let pnl = position
            .realized_pnl()
            .map_or_else(|| "?".to_string(), |p| p.to_string());
        tracing::info!(
            trade_id = %position.trade_id,
            instrument = %position.instrument,
            exit_price = %exit_price,
            reason = reason.as_str(),
            pnl = %pnl,
            "position closed"
        );
        self.notifier
            .send_alert(&format!(
                "EXITED {} @ {exit_price} ({}) pnl {pnl}",
                position.instrument,
                reason.as_str()
            ))
            .await;

        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ChannelNotifier;
    use crate::venue::cache::spawn_event_pump;
    use crate::venue::sim::SimVenue;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    const INSTRUMENT: &str = "NIFTY24DECFUT";

    struct Harness {
        venue: Arc<SimVenue>,
        cache: Arc<VenueCache>,
        store: Arc<PositionStore>,
        capital: Arc<CapitalAllocator>,
        alerts: mpsc::UnboundedReceiver<String>,
        manager: Arc<ExecutionManager<SimVenue>>,
    }

    async fn harness() -> Harness {
        harness_with(Config::default()).await
    }

    async fn harness_with(mut config: Config) -> Harness {
        // Keep failure-path tests fast
        config.venue.fill_timeout_secs = 1;

        let venue = Arc::new(SimVenue::new());
        let cache = Arc::new(VenueCache::new());
        spawn_event_pump(cache.clone(), venue.subscribe());

        let store = Arc::new(PositionStore::in_memory().await.unwrap());
        let capital = Arc::new(CapitalAllocator::new(
            config.capital.base_capital,
            config.capital.leverage,
        ));
        let (notifier, alerts) = ChannelNotifier::new();

        let mut manager = ExecutionManager::new(
            venue.clone(),
            cache.clone(),
            store.clone(),
            capital.clone(),
            Arc::new(notifier),
            &config,
        );
        manager.stop_retry = StopRetryPolicy {
            max_attempts: config.venue.stop_retry_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };

        Harness {
            venue,
            cache,
            store,
            capital,
            alerts,
            manager: Arc::new(manager),
        }
    }

    async fn settle() {
        // Let the event pump drain the broadcast queue
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    fn drain_alerts(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut alerts = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            alerts.push(alert);
        }
        alerts
    }

    #[tokio::test]
    async fn test_enter_opens_position_with_protective_stop() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;

        let outcome = h.manager.enter(INSTRUMENT, Direction::Long).await;
        let EntryOutcome::Entered(position) = outcome else {
            panic!("expected entry, got {outcome:?}");
        };

        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.entry_price, dec!(21500));
        // 200k per-trade budget at 21500 floors to 9 units
        assert_eq!(position.quantity, dec!(9));
        assert!(position.stop_price < position.entry_price);

        let stop_id = position.stop_order_id.as_deref().unwrap();
        let stop = h.venue.order_status(stop_id).await.unwrap();
        assert_eq!(stop.status, crate::venue::OrderStatus::Pending);

        assert_eq!(h.store.open_positions().await.unwrap().len(), 1);
        assert!(h.store.is_dirty());
        assert!(h.capital.status().await.committed > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_enter_blocked_when_already_holding() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;

        h.manager.enter(INSTRUMENT, Direction::Long).await;
        let second = h.manager.enter(INSTRUMENT, Direction::Long).await;

        assert!(matches!(second, EntryOutcome::Blocked(reason) if reason == "ALREADY_HOLDING"));
    }

    #[tokio::test]
    async fn test_per_trade_budget_leaves_room_for_second_entry() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        h.venue.set_price("BANKNIFTY24DECFUT", dec!(46000));
        settle().await;

        let first = h.manager.enter(INSTRUMENT, Direction::Long).await;
        let second = h.manager.enter("BANKNIFTY24DECFUT", Direction::Short).await;

        // Each entry draws at most its per-trade budget, so both fit inside
        // the 500k buying power
        assert!(matches!(first, EntryOutcome::Entered(_)));
        assert!(matches!(second, EntryOutcome::Entered(_)));

        let status = h.capital.status().await;
        assert_eq!(status.open_instruments.len(), 2);
        assert!(status.committed <= dec!(400000));
        assert!(status.available > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_enter_fails_on_non_positive_price() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, Decimal::ZERO);
        settle().await;

        let outcome = h.manager.enter(INSTRUMENT, Direction::Long).await;
        assert!(matches!(outcome, EntryOutcome::Failed(reason) if reason.starts_with("NO_PRICE")));
        // Nothing was sent or reserved
        assert_eq!(h.capital.status().await.committed, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_enter_blocked_when_size_floors_to_zero() {
        let mut config = Config::default();
        config.capital.base_capital = dec!(1000);
        config.capital.leverage = dec!(1);
        let h = harness_with(config).await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;

        let outcome = h.manager.enter(INSTRUMENT, Direction::Long).await;
        assert!(matches!(outcome, EntryOutcome::Blocked(reason) if reason == "ZERO_QUANTITY"));
    }

    #[tokio::test]
    async fn test_rejected_entry_releases_capital() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;
        let before = h.capital.status().await.available;

        h.venue.set_reject_market(true);
        let outcome = h.manager.enter(INSTRUMENT, Direction::Long).await;

        assert!(matches!(outcome, EntryOutcome::Failed(_)));
        assert_eq!(h.capital.status().await.available, before);
        assert!(h.store.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_flattens_and_releases() {
        let mut h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;
        let before = h.capital.status().await.available;

        // All three attempts fail with a retryable transport error
        h.venue.fail_stop_placements(3);
        let outcome = h.manager.enter(INSTRUMENT, Direction::Long).await;

        assert!(matches!(outcome, EntryOutcome::Failed(reason) if reason == "STOP_PLACEMENT_FAILED"));

        // Emergency exit flattened the naked position
        let positions = h.venue.positions().await.unwrap();
        assert!(positions.iter().all(|p| p.is_flat()));
        assert_eq!(h.capital.status().await.available, before);

        let alerts = drain_alerts(&mut h.alerts);
        assert!(alerts.iter().any(|a| a.contains("STOP PLACEMENT FAILED")));
    }

    #[tokio::test]
    async fn test_exit_cancels_stop_then_closes() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;

        let EntryOutcome::Entered(position) = h.manager.enter(INSTRUMENT, Direction::Long).await
        else {
            panic!("entry failed");
        };
        let stop_id = position.stop_order_id.clone().unwrap();

        h.venue.set_price(INSTRUMENT, dec!(21610));
        settle().await;

        let outcome = h.manager.exit(INSTRUMENT, ExitReason::TargetHit).await;
        let ExitOutcome::Exited(closed) = outcome else {
            panic!("expected exit, got {outcome:?}");
        };

        assert_eq!(closed.exit_price, Some(dec!(21610)));
        assert_eq!(closed.exit_reason, Some(ExitReason::TargetHit));
        assert_eq!(
            h.venue.order_status(&stop_id).await.unwrap().status,
            crate::venue::OrderStatus::Cancelled
        );

        // Venue flat, capital released, store closed
        let positions = h.venue.positions().await.unwrap();
        assert!(positions.iter().all(|p| p.is_flat()));
        assert_eq!(h.capital.status().await.committed, Decimal::ZERO);
        assert!(h.store.open_positions().await.unwrap().is_empty());
        assert!(h.manager.tracked_position(INSTRUMENT).await.is_none());
    }

    #[tokio::test]
    async fn test_exit_blocked_when_stop_cancel_fails() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;

        h.manager.enter(INSTRUMENT, Direction::Long).await;
        let calls_before_exit = h.venue.call_count();

        h.venue.set_fail_cancel(true);
        let outcome = h.manager.exit(INSTRUMENT, ExitReason::TargetHit).await;

        assert!(matches!(outcome, ExitOutcome::Blocked(reason) if reason == "STOP_CANCEL_FAILED"));

        // No closing order was placed: only the cancel and the stop status
        // probe hit the venue after entry
        assert!(h.venue.call_count() <= calls_before_exit + 2);

        // Position still live and re-exitable
        let tracked = h.manager.tracked_position(INSTRUMENT).await.unwrap();
        assert_eq!(tracked.status, PositionStatus::Open);

        h.venue.set_fail_cancel(false);
        let retry = h.manager.exit(INSTRUMENT, ExitReason::TargetHit).await;
        assert!(matches!(retry, ExitOutcome::Exited(_)));
    }

    #[tokio::test]
    async fn test_exit_without_position_is_noop() {
        let h = harness().await;
        assert!(matches!(
            h.manager.exit(INSTRUMENT, ExitReason::Manual).await,
            ExitOutcome::Noop
        ));
    }

    #[tokio::test]
    async fn test_monitor_detects_broker_stop_fill() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;

        let EntryOutcome::Entered(position) = h.manager.enter(INSTRUMENT, Direction::Long).await
        else {
            panic!("entry failed");
        };

        // Price falls through the stop; the venue fills it on its own
        h.venue.set_price(INSTRUMENT, position.stop_price - dec!(5));
        settle().await;

        let check = h.manager.monitor_stop_status(INSTRUMENT).await;
        assert_eq!(check, StopCheck::Filled);

        let closed = h
            .store
            .closed_trades(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::BrokerStopFilled));
        assert_eq!(closed[0].exit_price, Some(position.stop_price));

        // A later exit finds nothing: no second closing order can fire
        assert!(matches!(
            h.manager.exit(INSTRUMENT, ExitReason::TargetHit).await,
            ExitOutcome::Noop
        ));
    }

    #[tokio::test]
    async fn test_concurrent_exit_and_monitor_close_exactly_once() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;

        let EntryOutcome::Entered(position) = h.manager.enter(INSTRUMENT, Direction::Long).await
        else {
            panic!("entry failed");
        };

        // The venue-side stop fills on its own, then an exit and the stop
        // monitor race for the same instrument
        h.venue.set_price(INSTRUMENT, position.stop_price - dec!(5));
        settle().await;

        let (exit_outcome, check) = tokio::join!(
            h.manager.exit(INSTRUMENT, ExitReason::TargetHit),
            h.manager.monitor_stop_status(INSTRUMENT),
        );

        // Whichever side won the lock finalized; the loser found nothing
        let exit_finalized = matches!(exit_outcome, ExitOutcome::Exited(_));
        let monitor_finalized = check == StopCheck::Filled;
        assert!(exit_finalized ^ monitor_finalized);
        assert!(h.manager.tracked_position(INSTRUMENT).await.is_none());

        // One closed trade, closed by the stop, no second closing order
        let closed = h
            .store
            .closed_trades(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, Some(ExitReason::BrokerStopFilled));

        let positions = h.venue.positions().await.unwrap();
        assert!(positions.iter().all(|p| p.is_flat()));
    }

    #[tokio::test]
    async fn test_monitor_intact_while_stop_rests() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;

        h.manager.enter(INSTRUMENT, Direction::Long).await;
        settle().await;

        assert_eq!(
            h.manager.monitor_stop_status(INSTRUMENT).await,
            StopCheck::Intact
        );
    }

    #[tokio::test]
    async fn test_close_all_exits_every_position() {
        let h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        h.venue.set_price("BANKNIFTY24DECFUT", dec!(46000));
        settle().await;

        h.manager.enter(INSTRUMENT, Direction::Long).await;
        h.manager.enter("BANKNIFTY24DECFUT", Direction::Short).await;

        let results = h.manager.close_all(ExitReason::EndOfDay).await;
        assert_eq!(results.len(), 2);
        assert!(
            results
                .iter()
                .all(|(_, o)| matches!(o, ExitOutcome::Exited(_)))
        );

        let positions = h.venue.positions().await.unwrap();
        assert!(positions.iter().all(|p| p.is_flat()));
        assert!(h.manager.open_instruments().await.is_empty());
    }

    #[tokio::test]
    async fn test_startup_alerts_orphan_and_adopts_store() {
        let mut h = harness().await;
        h.venue.set_price(INSTRUMENT, dec!(21500));
        settle().await;

        // Store knows a position the venue agrees with
        let EntryOutcome::Entered(_) = h.manager.enter(INSTRUMENT, Direction::Long).await else {
            panic!("entry failed");
        };
        drain_alerts(&mut h.alerts);

        // The venue also holds something the store never heard of
        h.venue.seed_position("BANKNIFTY24DECFUT", dec!(15), dec!(46000));
        settle().await;

        // Fresh manager over the same store and venue, as after a restart
        let config = {
            let mut c = Config::default();
            c.venue.fill_timeout_secs = 1;
            c
        };
        let (notifier, mut alerts) = ChannelNotifier::new();
        let fresh = ExecutionManager::new(
            h.venue.clone(),
            h.cache.clone(),
            h.store.clone(),
            h.capital.clone(),
            Arc::new(notifier),
            &config,
        );

        let report = fresh.startup_reconciliation().await.unwrap();
        assert_eq!(report.adopted, 1);
        assert_eq!(report.orphans, vec!["BANKNIFTY24DECFUT".to_string()]);

        let captured = drain_alerts(&mut alerts);
        assert!(captured.iter().any(|a| a.contains("ORPHAN")));
        assert!(fresh.tracked_position(INSTRUMENT).await.is_some());
    }
}
