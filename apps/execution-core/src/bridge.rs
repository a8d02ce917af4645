//! Concurrency bridge between synchronous strategy code and the async core.
//!
//! The bridge owns one dedicated thread running a current-thread tokio
//! runtime. All async components live on that runtime; synchronous callers
//! interact with them only through [`Bridge::run`] and
//! [`Bridge::run_background`], never by touching component state directly.
//!
//! Startup is ordered and fail-fast: notifier, position store, venue
//! cache/session, capital allocator, execution manager, then the detached
//! reconciliation loop. A failure at any stage constructs nothing after it
//! and surfaces as [`BridgeError::Init`] from [`Bridge::start`].

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::alert::Notifier;
use crate::capital::CapitalAllocator;
use crate::config::Config;
use crate::error::BridgeError;
use crate::execution::ExecutionManager;
use crate::reconcile::ReconciliationEngine;
use crate::session::MarketSession;
use crate::store::PositionStore;
use crate::venue::cache::spawn_event_pump;
use crate::venue::{VenueAdapter, VenueCache, VenueEvent};

/// How long `start` waits for the bridge thread to report ready.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// The components constructed on the bridge runtime.
pub struct BridgeComponents<V: VenueAdapter> {
    /// The venue adapter the bridge was started with.
    pub venue: Arc<V>,
    /// Event-fed venue state cache.
    pub cache: Arc<VenueCache>,
    /// Position store.
    pub store: Arc<PositionStore>,
    /// Capital allocator.
    pub capital: Arc<CapitalAllocator>,
    /// Order execution manager.
    pub manager: Arc<ExecutionManager<V>>,
    /// Reconciliation engine; its loop runs detached on the bridge runtime.
    pub reconciler: Arc<ReconciliationEngine<V>>,
    /// Operator notifier.
    pub notifier: Arc<dyn Notifier>,
}

impl<V: VenueAdapter> Clone for BridgeComponents<V> {
    fn clone(&self) -> Self {
        Self {
            venue: self.venue.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            capital: self.capital.clone(),
            manager: self.manager.clone(),
            reconciler: self.reconciler.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

/// Handle to the bridge runtime.
pub struct Bridge<V: VenueAdapter> {
    handle: tokio::runtime::Handle,
    components: BridgeComponents<V>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl<V: VenueAdapter> Bridge<V> {
    /// Start the bridge: spawn the runtime thread and construct every
    /// component on it, in order, fail-fast.
    pub fn start(
        config: Config,
        venue: Arc<V>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, BridgeError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("exec-bridge".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(BridgeError::Init {
                            stage: "runtime",
                            message: e.to_string(),
                        }));
                        return;
                    }
                };

                let init = rt.block_on(init_components(config, venue, notifier));
                match init {
                    Ok((components, loop_handle)) => {
                        let handle = rt.handle().clone();
                        if ready_tx.send(Ok((handle, components))).is_err() {
                            return;
                        }
                        // Park here driving spawned tasks until shutdown
                        rt.block_on(async {
                            let _ = shutdown_rx.await;
                        });
                        // Let the reconciliation loop take its cooperative exit
                        let _ = rt.block_on(loop_handle);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| BridgeError::Init {
                stage: "thread",
                message: e.to_string(),
            })?;

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok((handle, components))) => {
                tracing::info!("bridge started");
                Ok(Self {
                    handle,
                    components,
                    shutdown_tx: Some(shutdown_tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(BridgeError::StartTimeout {
                waited_ms: STARTUP_TIMEOUT.as_millis() as u64,
            }),
        }
    }

    /// Components constructed on the bridge runtime.
    #[must_use]
    pub const fn components(&self) -> &BridgeComponents<V> {
        &self.components
    }

    /// Run a future on the bridge runtime, blocking the calling thread until
    /// it completes.
    pub fn run<F, T>(&self, future: F) -> Result<T, BridgeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.recv()
            .map_err(|_| BridgeError::TaskFailed("task ended without a result".to_string()))
    }

    /// Schedule a future on the bridge runtime without waiting for it.
    pub fn run_background<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Stop the reconciliation loop, the runtime, and the bridge thread.
    pub fn shutdown(mut self) {
        tracing::info!("bridge shutting down");
        self.components.reconciler.stop();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Ordered component construction on the bridge runtime.
async fn init_components<V: VenueAdapter>(
    config: Config,
    venue: Arc<V>,
    notifier: Arc<dyn Notifier>,
) -> Result<
    (
        BridgeComponents<V>,
        tokio::task::JoinHandle<()>,
    ),
    BridgeError,
> {
    // Stage 1: notifier (injected; the alert channel must exist before
    // anything that can fail wants to report)
    tracing::info!(venue = venue.venue_name(), "bridge init: notifier ready");

    // Stage 2: position store
    let store = Arc::new(
        PositionStore::connect(&config.store.path)
            .await
            .map_err(|e| BridgeError::Init {
                stage: "position_store",
                message: e.to_string(),
            })?,
    );
    tracing::info!(path = %config.store.path, "bridge init: position store ready");

    // Stage 3: venue cache and event session, primed from the venue
    let cache = Arc::new(VenueCache::new());
    spawn_event_pump(cache.clone(), venue.subscribe());
    let venue_positions = venue.positions().await.map_err(|e| BridgeError::Init {
        stage: "venue_session",
        message: e.to_string(),
    })?;
    for position in venue_positions {
        cache.apply_event(VenueEvent::Position(position));
    }
    tracing::info!("bridge init: venue session ready");

    // Stage 4: capital allocator
    let capital = Arc::new(CapitalAllocator::new(
        config.capital.base_capital,
        config.capital.leverage,
    ));
    tracing::info!(buying_power = %capital.buying_power(), "bridge init: capital allocator ready");

    // Stage 5: execution manager, re-adopting state from the store
    let manager = Arc::new(ExecutionManager::new(
        venue.clone(),
        cache.clone(),
        store.clone(),
        capital.clone(),
        notifier.clone(),
        &config,
    ));
    let report = manager
        .startup_reconciliation()
        .await
        .map_err(|e| BridgeError::Init {
            stage: "execution_manager",
            message: e.to_string(),
        })?;
    tracing::info!(
        adopted = report.adopted,
        orphans = report.orphans.len(),
        cancelled_orders = report.cancelled_orders.len(),
        "bridge init: execution manager ready"
    );

    // Detached last: the reconciliation loop
    let session = MarketSession::from_config(&config.session).map_err(|e| BridgeError::Init {
        stage: "session",
        message: e.to_string(),
    })?;
    let reconciler = Arc::new(ReconciliationEngine::new(
        venue.clone(),
        cache.clone(),
        store.clone(),
        notifier.clone(),
        session,
        config.reconciliation.clone(),
    ));
    let loop_handle = tokio::spawn(reconciler.clone().run_loop());

    Ok((
        BridgeComponents {
            venue,
            cache,
            store,
            capital,
            manager,
            reconciler,
            notifier,
        },
        loop_handle,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::TracingNotifier;
    use crate::venue::sim::SimVenue;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.store.path = ":memory:".to_string();
        config.venue.fill_timeout_secs = 1;
        config
    }

    #[test]
    fn test_start_run_shutdown() {
        let venue = Arc::new(SimVenue::new());
        let bridge = Bridge::start(test_config(), venue, Arc::new(TracingNotifier::new()))
            .expect("bridge should start");

        let answer = bridge.run(async { 21 * 2 }).unwrap();
        assert_eq!(answer, 42);

        bridge.shutdown();
    }

    #[test]
    fn test_store_failure_aborts_startup_before_venue() {
        let venue = Arc::new(SimVenue::new());
        let mut config = test_config();
        config.store.path = "/nonexistent-dir/never/positions.db".to_string();

        let result = Bridge::start(config, venue.clone(), Arc::new(TracingNotifier::new()));

        let Err(BridgeError::Init { stage, .. }) = result else {
            panic!("expected init failure");
        };
        assert_eq!(stage, "position_store");
        // Nothing after the failing stage ran: the venue was never touched
        assert_eq!(venue.call_count(), 0);
    }

    #[test]
    fn test_enter_through_bridge() {
        let venue = Arc::new(SimVenue::new());
        venue.set_price("NIFTY24DECFUT", dec!(21500));

        let bridge = Bridge::start(test_config(), venue, Arc::new(TracingNotifier::new()))
            .expect("bridge should start");

        let manager = bridge.components().manager.clone();
        let outcome = bridge
            .run(async move {
                manager
                    .enter("NIFTY24DECFUT", crate::venue::Direction::Long)
                    .await
            })
            .unwrap();

        assert!(matches!(
            outcome,
            crate::execution::EntryOutcome::Entered(_)
        ));
        bridge.shutdown();
    }

    #[test]
    fn test_run_background_executes() {
        let venue = Arc::new(SimVenue::new());
        let bridge = Bridge::start(test_config(), venue, Arc::new(TracingNotifier::new()))
            .expect("bridge should start");

        let (tx, rx) = mpsc::channel();
        bridge.run_background(async move {
            let _ = tx.send(7);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        bridge.shutdown();
    }
}
