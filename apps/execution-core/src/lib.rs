// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call,
        clippy::field_reassign_with_default
    )
)]

//! Execution core for an intraday trading bot.
//!
//! Detection and strategy code decide *what* to trade; this crate owns *how*
//! a decision becomes, stays, and stops being a position:
//!
//! - [`intent`]: price-triggered trade intents with overtrading guards.
//!   A signal waits for its trigger, gets invalidated, or times out, and
//!   takes exactly one of those transitions.
//! - [`execution`]: the near-atomic entry sequence (capital, fill,
//!   protective stop) and the cancel-stop-before-close exit sequence. No
//!   position is ever left without a resting stop.
//! - [`reconcile`]: periodic comparison of local records against venue
//!   truth. Divergence is alerted and audited, never auto-corrected.
//! - [`store`]: SQLite persistence of trades and reconciliation audit rows,
//!   with an in-memory snapshot and a dirty flag feeding the reconciler.
//! - [`venue`]: the venue port, an event-fed state cache, and a scriptable
//!   simulated venue for tests and paper sessions.
//! - [`bridge`]: a dedicated-thread tokio runtime that lets synchronous
//!   strategy code drive the async core, with ordered fail-fast startup.
//! - [`capital`], [`session`], [`alert`], [`config`], [`error`]: supporting
//!   concerns.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod alert;
pub mod bridge;
pub mod capital;
pub mod config;
pub mod error;
pub mod execution;
pub mod intent;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod venue;

pub use alert::{Notifier, TracingNotifier};
pub use bridge::{Bridge, BridgeComponents};
pub use capital::CapitalAllocator;
pub use config::{Config, load_config};
pub use error::{BridgeError, VenueError};
pub use execution::{
    EntryOutcome, ExecutionManager, ExitOutcome, ExitReason, Position, PositionStatus, StopCheck,
};
pub use intent::{IntentGate, IntentResolution, SubmitOutcome, TradeSignal};
pub use reconcile::ReconciliationEngine;
pub use session::MarketSession;
pub use store::PositionStore;
pub use venue::{Direction, VenueAdapter, VenueCache};
