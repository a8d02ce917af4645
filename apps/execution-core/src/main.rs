//! Execution core binary.
//!
//! Runs a paper session against the simulated venue: starts the bridge
//! runtime, wires the intent gate, and trades a scripted price feed until
//! interrupted. Live venue adapters plug in through the same
//! [`VenueAdapter`](execution_core::VenueAdapter) port.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin execution-core [config.yaml]
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;

use execution_core::alert::TracingNotifier;
use execution_core::bridge::Bridge;
use execution_core::config::load_config;
use execution_core::execution::ExitReason;
use execution_core::intent::{IntentGate, TradeSignal};
use execution_core::venue::Direction;
use execution_core::venue::sim::SimVenue;

/// Instrument the paper session trades.
const PAPER_INSTRUMENT: &str = "NIFTY24DECFUT";

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())?;

    tracing::info!(
        base_capital = %config.capital.base_capital,
        leverage = %config.capital.leverage,
        store = %config.store.path,
        "starting execution core (paper session)"
    );

    let venue = Arc::new(SimVenue::new());
    venue.set_price(PAPER_INSTRUMENT, dec!(21500));

    let notifier = Arc::new(TracingNotifier::new());
    let bridge = Bridge::start(config.clone(), venue.clone(), notifier.clone())?;

    let components = bridge.components().clone();
    let gate = Arc::new(IntentGate::new(
        config.intents.clone(),
        components.cache.clone(),
        components.manager.clone(),
        notifier,
    ));
    bridge.run_background(gate.clone().run_poll_loop());

    // Scripted breakout so the paper session exercises the full path
    let signal = TradeSignal {
        instrument: PAPER_INSTRUMENT.to_string(),
        direction: Direction::Long,
        trigger_price: dec!(21520),
        invalidation_price: dec!(21400),
        note: "paper session breakout".to_string(),
    };
    let outcome = bridge.run({
        let gate = gate.clone();
        async move { gate.submit(signal, chrono::Utc::now()).await }
    })?;
    tracing::info!(outcome = ?outcome, "paper intent submitted");
    drive_paper_ticks(&venue);

    tracing::info!("execution core ready, Ctrl+C to stop");
    bridge.run(async {
        let _ = tokio::signal::ctrl_c().await;
    })?;

    tracing::info!("shutdown requested, closing positions");
    gate.stop();
    let manager = components.manager;
    let results = bridge.run(async move { manager.close_all(ExitReason::EndOfDay).await })?;
    for (instrument, outcome) in results {
        tracing::info!(instrument = %instrument, outcome = ?outcome, "end-of-day close");
    }

    bridge.shutdown();
    tracing::info!("execution core stopped");
    Ok(())
}

/// Initialize the tracing subscriber with environment filter.
///
/// Uses static directive strings that are compile-time constants guaranteed
/// to parse.
#[allow(clippy::expect_used)]
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "execution_core=info"
                    .parse()
                    .expect("static directive 'execution_core=info' is valid"),
            ),
        )
        .init();
}

/// Walk the paper price through the trigger on a background thread.
fn drive_paper_ticks(venue: &Arc<SimVenue>) {
    let venue = venue.clone();
    std::thread::spawn(move || {
        for price in [dec!(21505), dec!(21512), dec!(21521)] {
            std::thread::sleep(Duration::from_secs(3));
            venue.set_price(PAPER_INSTRUMENT, price);
        }
    });
}
