//! In-process simulated venue.
//!
//! Backs the paper-trading mode of the binary and every test that needs a
//! venue. Market orders fill immediately at the last set price, stop orders
//! rest until a price crossing or an explicit trigger, and failure switches
//! script rejections, stop-placement faults, and cancel faults so every
//! error path can be exercised. Emits the same push events a live adapter
//! would.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;
use tokio::sync::broadcast;

use crate::error::VenueError;

use super::{
    OrderKind, OrderRequest, OrderSide, OrderStatus, OrderUpdate, VenueAdapter, VenueEvent,
    VenuePosition,
};

#[derive(Debug, Clone)]
struct SimOrder {
    request: OrderRequest,
    status: OrderStatus,
    filled_quantity: Decimal,
    avg_fill_price: Decimal,
}

#[derive(Debug, Default)]
struct SimState {
    prices: HashMap<String, Decimal>,
    positions: HashMap<String, VenuePosition>,
    orders: HashMap<String, SimOrder>,
    reject_market: bool,
    stop_failures_remaining: u32,
    fail_cancel: bool,
}

/// Simulated venue adapter.
#[derive(Debug)]
pub struct SimVenue {
    state: Mutex<SimState>,
    events: broadcast::Sender<VenueEvent>,
    order_seq: AtomicU64,
    calls: AtomicU64,
}

impl Default for SimVenue {
    fn default() -> Self {
        Self::new()
    }
}

impl SimVenue {
    /// Create an empty simulated venue.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(SimState::default()),
            events,
            order_seq: AtomicU64::new(1),
            calls: AtomicU64::new(0),
        }
    }

    /// Set the last traded price, emit a tick, and release any resting stops
    /// the new price crosses.
    pub fn set_price(&self, instrument: &str, price: Decimal) {
        let mut fills = Vec::new();
        if let Ok(mut state) = self.state.lock() {
            state.prices.insert(instrument.to_string(), price);

            let crossed: Vec<String> = state
                .orders
                .iter()
                .filter(|(_, order)| {
                    order.status == OrderStatus::Pending
                        && order.request.instrument == instrument
                        && stop_crossed(&order.request, price)
                })
                .map(|(id, _)| id.clone())
                .collect();

            for order_id in crossed {
                if let Some(events) = fill_order(&mut state, &order_id) {
                    fills.extend(events);
                }
            }
        }

        self.emit(VenueEvent::Tick {
            instrument: instrument.to_string(),
            price,
            at: Utc::now(),
        });
        for event in fills {
            self.emit(event);
        }
    }

    /// Fill a resting stop order at its trigger price.
    pub fn trigger_stop(&self, order_id: &str) {
        let mut fills = Vec::new();
        if let Ok(mut state) = self.state.lock() {
            if let Some(events) = fill_order(&mut state, order_id) {
                fills.extend(events);
            }
        }
        for event in fills {
            self.emit(event);
        }
    }

    /// Script the next market orders to be rejected.
    pub fn set_reject_market(&self, reject: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.reject_market = reject;
        }
    }

    /// Script the next `n` stop placements to fail with a transport error.
    pub fn fail_stop_placements(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.stop_failures_remaining = n;
        }
    }

    /// Script cancel requests to fail with a transport error.
    pub fn set_fail_cancel(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_cancel = fail;
        }
    }

    /// Seed a venue-side position directly, for divergence scenarios.
    pub fn seed_position(&self, instrument: &str, net_quantity: Decimal, avg_price: Decimal) {
        let position = VenuePosition {
            instrument: instrument.to_string(),
            net_quantity,
            avg_price,
        };
        if let Ok(mut state) = self.state.lock() {
            state
                .positions
                .insert(instrument.to_string(), position.clone());
        }
        self.emit(VenueEvent::Position(position));
    }

    /// Remove a position without any order flow, as if closed elsewhere.
    pub fn drop_position(&self, instrument: &str) {
        self.seed_position(instrument, Decimal::ZERO, Decimal::ZERO);
    }

    /// Number of adapter calls served so far.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn emit(&self, event: VenueEvent) {
        // No subscribers is fine; send only fails when none exist.
        let _ = self.events.send(event);
    }

    fn next_order_id(&self) -> String {
        format!("sim-{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }
}

fn stop_crossed(request: &OrderRequest, price: Decimal) -> bool {
    match request.kind {
        OrderKind::Stop { trigger } => match request.side {
            // Sell stop protects a long, releases as price falls through
            OrderSide::Sell => price <= trigger,
            // Buy stop protects a short, releases as price rises through
            OrderSide::Buy => price >= trigger,
        },
        OrderKind::Market => false,
    }
}

/// Fill an order in place and return the events to emit, or `None` if the
/// order is missing or already terminal.
fn fill_order(state: &mut SimState, order_id: &str) -> Option<Vec<VenueEvent>> {
    let order = state.orders.get_mut(order_id)?;
    if order.status != OrderStatus::Pending {
        return None;
    }

    let price = match order.request.kind {
        OrderKind::Stop { trigger } => trigger,
        OrderKind::Market => state
            .prices
            .get(&order.request.instrument)
            .copied()
            .unwrap_or(order.avg_fill_price),
    };

    order.status = OrderStatus::Filled;
    order.filled_quantity = order.request.quantity;
    order.avg_fill_price = price;

    let update = OrderUpdate {
        order_id: order_id.to_string(),
        instrument: order.request.instrument.clone(),
        status: OrderStatus::Filled,
        filled_quantity: order.request.quantity,
        avg_fill_price: price,
    };
    let request = order.request.clone();

    let position = apply_fill(state, &request, price);
    Some(vec![
        VenueEvent::Order(update),
        VenueEvent::Position(position),
    ])
}

/// Net a fill into the position book.
fn apply_fill(state: &mut SimState, request: &OrderRequest, price: Decimal) -> VenuePosition {
    let signed = request.quantity * Decimal::from(request.side.sign());
    let entry = state
        .positions
        .entry(request.instrument.clone())
        .or_insert_with(|| VenuePosition {
            instrument: request.instrument.clone(),
            net_quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        });

    let prior = entry.net_quantity;
    let new_net = prior + signed;

    if new_net == Decimal::ZERO {
        entry.avg_price = Decimal::ZERO;
    } else if prior == Decimal::ZERO || prior.signum() == signed.signum() {
        // Extending: volume-weighted average
        let prior_abs = prior.abs();
        let add_abs = signed.abs();
        entry.avg_price =
            (entry.avg_price * prior_abs + price * add_abs) / (prior_abs + add_abs);
    }
    // Reducing keeps the existing average

    entry.net_quantity = new_net;
    entry.clone()
}

#[async_trait]
impl VenueAdapter for SimVenue {
    async fn place_order(&self, request: &OrderRequest) -> Result<String, VenueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let order_id = self.next_order_id();
        let mut events = Vec::new();

        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| VenueError::Transport("sim state poisoned".to_string()))?;

            match request.kind {
                OrderKind::Market => {
                    if state.reject_market {
                        return Err(VenueError::Rejected {
                            reason: "scripted market rejection".to_string(),
                        });
                    }
                    if !state.prices.contains_key(&request.instrument) {
                        return Err(VenueError::Transport(format!(
                            "no price for {}",
                            request.instrument
                        )));
                    }
                    state.orders.insert(
                        order_id.clone(),
                        SimOrder {
                            request: request.clone(),
                            status: OrderStatus::Pending,
                            filled_quantity: Decimal::ZERO,
                            avg_fill_price: Decimal::ZERO,
                        },
                    );
                    if let Some(fill_events) = fill_order(&mut state, &order_id) {
                        events.extend(fill_events);
                    }
                }
                OrderKind::Stop { .. } => {
                    if state.stop_failures_remaining > 0 {
                        state.stop_failures_remaining -= 1;
                        return Err(VenueError::Transport(
                            "scripted stop placement failure".to_string(),
                        ));
                    }
                    state.orders.insert(
                        order_id.clone(),
                        SimOrder {
                            request: request.clone(),
                            status: OrderStatus::Pending,
                            filled_quantity: Decimal::ZERO,
                            avg_fill_price: Decimal::ZERO,
                        },
                    );
                    events.push(VenueEvent::Order(OrderUpdate {
                        order_id: order_id.clone(),
                        instrument: request.instrument.clone(),
                        status: OrderStatus::Pending,
                        filled_quantity: Decimal::ZERO,
                        avg_fill_price: Decimal::ZERO,
                    }));
                }
            }
        }

        for event in events {
            self.emit(event);
        }
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let update = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| VenueError::Transport("sim state poisoned".to_string()))?;

            if state.fail_cancel {
                return Err(VenueError::Transport("scripted cancel failure".to_string()));
            }

            let order = state
                .orders
                .get_mut(order_id)
                .ok_or_else(|| VenueError::NotFound {
                    what: format!("order {order_id}"),
                })?;

            match order.status {
                OrderStatus::Pending => {
                    order.status = OrderStatus::Cancelled;
                    OrderUpdate {
                        order_id: order_id.to_string(),
                        instrument: order.request.instrument.clone(),
                        status: OrderStatus::Cancelled,
                        filled_quantity: order.filled_quantity,
                        avg_fill_price: order.avg_fill_price,
                    }
                }
                OrderStatus::Filled => {
                    return Err(VenueError::Rejected {
                        reason: format!("order {order_id} already filled"),
                    });
                }
                OrderStatus::Cancelled | OrderStatus::Rejected => return Ok(()),
            }
        };

        self.emit(VenueEvent::Order(update));
        Ok(())
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderUpdate, VenueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self
            .state
            .lock()
            .map_err(|_| VenueError::Transport("sim state poisoned".to_string()))?;

        state
            .orders
            .get(order_id)
            .map(|order| OrderUpdate {
                order_id: order_id.to_string(),
                instrument: order.request.instrument.clone(),
                status: order.status,
                filled_quantity: order.filled_quantity,
                avg_fill_price: order.avg_fill_price,
            })
            .ok_or_else(|| VenueError::NotFound {
                what: format!("order {order_id}"),
            })
    }

    async fn open_orders(&self) -> Result<Vec<OrderUpdate>, VenueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self
            .state
            .lock()
            .map_err(|_| VenueError::Transport("sim state poisoned".to_string()))?;

        Ok(state
            .orders
            .iter()
            .filter(|(_, order)| order.status == OrderStatus::Pending)
            .map(|(id, order)| OrderUpdate {
                order_id: id.clone(),
                instrument: order.request.instrument.clone(),
                status: order.status,
                filled_quantity: order.filled_quantity,
                avg_fill_price: order.avg_fill_price,
            })
            .collect())
    }

    async fn positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self
            .state
            .lock()
            .map_err(|_| VenueError::Transport("sim state poisoned".to_string()))?;

        Ok(state.positions.values().cloned().collect())
    }

    async fn last_price(&self, instrument: &str) -> Result<Decimal, VenueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self
            .state
            .lock()
            .map_err(|_| VenueError::Transport("sim state poisoned".to_string()))?;

        state
            .prices
            .get(instrument)
            .copied()
            .ok_or_else(|| VenueError::NotFound {
                what: format!("price for {instrument}"),
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<VenueEvent> {
        self.events.subscribe()
    }

    fn venue_name(&self) -> &'static str {
        "sim"
    }
}
