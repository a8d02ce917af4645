//! Trade intent gate.
//!
//! Detection hands the gate a [`TradeSignal`]; the gate holds it as a
//! pending intent until price crosses the trigger (enter), crosses the
//! invalidation level (discard), or the intent times out. Each intent takes
//! exactly one terminal transition and is then destroyed, never revived.
//!
//! Overtrading guards run at submission: a daily intent cap, a
//! per-instrument cooldown, and a pause after consecutive losing trades.
//! Guard rejections are ordinary outcomes, not errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::alert::Notifier;
use crate::config::IntentsConfig;
use crate::execution::{EntryOutcome, ExecutionManager};
use crate::venue::{Direction, VenueAdapter, VenueCache};

/// A detection signal submitted to the gate.
#[derive(Debug, Clone)]
pub struct TradeSignal {
    /// Instrument to trade.
    pub instrument: String,
    /// Direction to enter when triggered.
    pub direction: Direction,
    /// Entry trigger level.
    pub trigger_price: Decimal,
    /// Level that invalidates the setup.
    pub invalidation_price: Decimal,
    /// Free-form context from detection, carried into logs.
    pub note: String,
}

/// A signal waiting for its trigger.
#[derive(Debug, Clone)]
pub struct PendingIntent {
    /// Intent identifier.
    pub id: Uuid,
    /// The originating signal.
    pub signal: TradeSignal,
    /// When the intent was accepted.
    pub created_at: DateTime<Utc>,
}

/// Why the gate refused a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardReason {
    /// The daily intent cap is spent.
    DailyCapReached,
    /// The instrument traded too recently.
    CooldownActive,
    /// Too many consecutive losses; paused for the day.
    LossPauseActive,
}

impl GuardReason {
    /// Stable string form for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DailyCapReached => "DAILY_CAP_REACHED",
            Self::CooldownActive => "COOLDOWN_ACTIVE",
            Self::LossPauseActive => "LOSS_PAUSE_ACTIVE",
        }
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Intent accepted and now pending.
    Accepted(Uuid),
    /// An overtrading guard refused the intent.
    Rejected(GuardReason),
    /// The signal's price geometry is inconsistent.
    Invalid(String),
}

/// Terminal transition an intent took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentResolution {
    /// Trigger crossed; the entry was handed to the execution manager.
    Triggered,
    /// Trigger crossed with manual confirmation on; parked for an operator.
    Parked,
    /// Invalidation level crossed first; discarded.
    Invalidated,
    /// Neither level crossed within the timeout.
    TimedOut,
}

#[derive(Debug)]
struct GuardState {
    day: NaiveDate,
    taken_today: u32,
    last_intent: HashMap<String, DateTime<Utc>>,
    consecutive_losses: u32,
}

impl GuardState {
    fn roll_day(&mut self, today: NaiveDate) {
        if self.day != today {
            self.day = today;
            self.taken_today = 0;
            self.consecutive_losses = 0;
            self.last_intent.clear();
        }
    }
}

/// Price-triggered intent gate.
pub struct IntentGate<V: VenueAdapter> {
    config: IntentsConfig,
    cache: Arc<VenueCache>,
    manager: Arc<ExecutionManager<V>>,
    notifier: Arc<dyn Notifier>,
    pending: Mutex<Vec<PendingIntent>>,
    parked: Mutex<Vec<PendingIntent>>,
    guard: Mutex<GuardState>,
    stopped: AtomicBool,
    wake: Notify,
}

impl<V: VenueAdapter> IntentGate<V> {
    /// Create a gate wired to its collaborators.
    #[must_use]
    pub fn new(
        config: IntentsConfig,
        cache: Arc<VenueCache>,
        manager: Arc<ExecutionManager<V>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            cache,
            manager,
            notifier,
            pending: Mutex::new(Vec::new()),
            parked: Mutex::new(Vec::new()),
            guard: Mutex::new(GuardState {
                day: Utc::now().date_naive(),
                taken_today: 0,
                last_intent: HashMap::new(),
                consecutive_losses: 0,
            }),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Submit a detection signal.
    pub async fn submit(&self, signal: TradeSignal, now: DateTime<Utc>) -> SubmitOutcome {
        let geometry_ok = match signal.direction {
            Direction::Long => signal.invalidation_price < signal.trigger_price,
            Direction::Short => signal.invalidation_price > signal.trigger_price,
        };
        if !geometry_ok {
            return SubmitOutcome::Invalid(format!(
                "invalidation {} does not oppose trigger {} for {}",
                signal.invalidation_price,
                signal.trigger_price,
                signal.direction.as_str()
            ));
        }

        {
            let mut guard = self.guard.lock().await;
            guard.roll_day(now.date_naive());

            let refusal = if guard.consecutive_losses >= self.config.max_consecutive_losses {
                Some(GuardReason::LossPauseActive)
            } else if guard.taken_today >= self.config.max_per_day {
                Some(GuardReason::DailyCapReached)
            } else if guard.last_intent.get(&signal.instrument).is_some_and(|at| {
                now - *at < chrono::Duration::minutes(self.config.cooldown_minutes)
            }) {
                Some(GuardReason::CooldownActive)
            } else {
                None
            };

            if let Some(reason) = refusal {
                tracing::info!(
                    instrument = %signal.instrument,
                    reason = reason.as_str(),
                    "intent refused by overtrading guard"
                );
                return SubmitOutcome::Rejected(reason);
            }

            guard.taken_today += 1;
            guard.last_intent.insert(signal.instrument.clone(), now);
        }

        let intent = PendingIntent {
            id: Uuid::new_v4(),
            signal,
            created_at: now,
        };
        let id = intent.id;

        tracing::info!(
            intent_id = %id,
            instrument = %intent.signal.instrument,
            direction = intent.signal.direction.as_str(),
            trigger = %intent.signal.trigger_price,
            invalidation = %intent.signal.invalidation_price,
            "intent pending"
        );
        self.pending.lock().await.push(intent);
        SubmitOutcome::Accepted(id)
    }

    /// Evaluate every pending intent against current cached prices.
    ///
    /// Returns the terminal transitions taken this pass. Intents whose
    /// instrument has no fresh tick are left pending.
    pub async fn poll(&self, now: DateTime<Utc>) -> Vec<(Uuid, IntentResolution)> {
        let mut resolved = Vec::new();
        let mut triggered = Vec::new();

        {
            let mut pending = self.pending.lock().await;
            let mut keep = Vec::with_capacity(pending.len());

            for intent in pending.drain(..) {
                let price = self.cache.fresh_tick(&intent.signal.instrument);
                match evaluate(&intent, price, now, self.config.timeout()) {
                    None => keep.push(intent),
                    Some(IntentResolution::Triggered) => triggered.push(intent),
                    Some(resolution) => {
                        tracing::info!(
                            intent_id = %intent.id,
                            instrument = %intent.signal.instrument,
                            resolution = ?resolution,
                            "intent resolved"
                        );
                        resolved.push((intent.id, resolution));
                    }
                }
            }

            *pending = keep;
        }

        for intent in triggered {
            if self.config.manual_confirmation {
                tracing::info!(
                    intent_id = %intent.id,
                    instrument = %intent.signal.instrument,
                    "intent triggered, parked for confirmation"
                );
                self.notifier
                    .send_alert(&format!(
                        "intent {} on {} triggered, awaiting confirmation",
                        intent.id, intent.signal.instrument
                    ))
                    .await;
                resolved.push((intent.id, IntentResolution::Parked));
                self.parked.lock().await.push(intent);
            } else {
                let id = intent.id;
                self.enter(intent).await;
                resolved.push((id, IntentResolution::Triggered));
            }
        }

        resolved
    }

    /// Approve a parked intent and enter.
    pub async fn confirm(&self, id: Uuid) -> Option<EntryOutcome> {
        let intent = {
            let mut parked = self.parked.lock().await;
            let index = parked.iter().position(|i| i.id == id)?;
            Some(parked.swap_remove(index))
        }?;
        Some(self.enter(intent).await)
    }

    /// Discard a parked intent without entering.
    pub async fn discard(&self, id: Uuid) -> bool {
        let mut parked = self.parked.lock().await;
        let before = parked.len();
        parked.retain(|i| i.id != id);
        parked.len() != before
    }

    /// Record a completed trade's result for the loss-pause guard.
    pub async fn record_outcome(&self, win: bool) {
        let mut guard = self.guard.lock().await;
        if win {
            guard.consecutive_losses = 0;
            return;
        }
        guard.consecutive_losses += 1;
        if guard.consecutive_losses == self.config.max_consecutive_losses {
            tracing::warn!(
                losses = guard.consecutive_losses,
                "consecutive loss limit reached, new intents paused"
            );
            self.notifier
                .send_alert(&format!(
                    "{} consecutive losses, intent gate paused for the day",
                    guard.consecutive_losses
                ))
                .await;
        }
    }

    /// Number of intents still pending.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Number of intents parked for confirmation.
    pub async fn parked_count(&self) -> usize {
        self.parked.lock().await.len()
    }

    /// Poll on the configured cadence until [`stop`](Self::stop) is called.
    pub async fn run_poll_loop(self: Arc<Self>) {
        tracing::info!(
            interval_secs = self.config.poll_interval_secs,
            "intent poll loop started"
        );

        while !self.stopped.load(Ordering::SeqCst) {
            self.poll(Utc::now()).await;
            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval()) => {}
                () = self.wake.notified() => {}
            }
        }

        tracing::info!("intent poll loop stopped");
    }

    /// Request a cooperative stop of the poll loop.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    async fn enter(&self, intent: PendingIntent) -> EntryOutcome {
        tracing::info!(
            intent_id = %intent.id,
            instrument = %intent.signal.instrument,
            note = %intent.signal.note,
            "intent triggered, entering"
        );
        let outcome = self
            .manager
            .enter(&intent.signal.instrument, intent.signal.direction)
            .await;
        match &outcome {
            EntryOutcome::Entered(position) => {
                tracing::info!(
                    intent_id = %intent.id,
                    trade_id = %position.trade_id,
                    "intent entered"
                );
            }
            EntryOutcome::Blocked(reason) | EntryOutcome::Failed(reason) => {
                tracing::warn!(
                    intent_id = %intent.id,
                    instrument = %intent.signal.instrument,
                    reason = %reason,
                    "triggered intent did not enter"
                );
            }
        }
        outcome
    }
}

/// Decide an intent's transition given the latest price, if any.
///
/// Price crossings win over the timeout; an intent is evaluated against
/// price first even on the tick that also exceeds its deadline.
fn evaluate(
    intent: &PendingIntent,
    price: Option<Decimal>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Option<IntentResolution> {
    if let Some(price) = price {
        let signal = &intent.signal;
        match signal.direction {
            Direction::Long => {
                if price >= signal.trigger_price {
                    return Some(IntentResolution::Triggered);
                }
                if price <= signal.invalidation_price {
                    return Some(IntentResolution::Invalidated);
                }
            }
            Direction::Short => {
                if price <= signal.trigger_price {
                    return Some(IntentResolution::Triggered);
                }
                if price >= signal.invalidation_price {
                    return Some(IntentResolution::Invalidated);
                }
            }
        }
    }

    let age = (now - intent.created_at).to_std().unwrap_or(Duration::ZERO);
    if age >= timeout {
        return Some(IntentResolution::TimedOut);
    }

    None
}
