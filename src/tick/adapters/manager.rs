//! Tick manager backed by a Tokio watch channel.

use crate::tick::ports::{Tick, TickCallback, TickScheduler, TickSubscription};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const ONE_SECOND: Duration = Duration::from_secs(1);

/// Logical clock with periodic callbacks.
///
/// A manager created with [`TickManager::manual`] only moves when
/// [`TickManager::advance`] is called, which makes it the scheduler of
/// choice for tests. [`TickManager::start`] additionally spawns a driver
/// task that advances the clock at the configured rate.
///
/// Periodic callbacks run inline on the task that advances the clock and
/// must not wait on the same scheduler.
#[derive(Clone)]
pub struct TickManager {
    state: Arc<TickState>,
}

struct TickState {
    ticks_per_second: u32,
    clock: watch::Sender<Tick>,
    handlers: Mutex<BTreeMap<u64, PeriodicHandler>>,
    next_handler: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct PeriodicHandler {
    interval: u64,
    next_due: Tick,
    callback: TickCallback,
}

impl TickManager {
    /// Creates a clock that only advances when stepped by hand.
    #[must_use]
    pub fn manual(ticks_per_second: u32) -> Self {
        let (clock, _) = watch::channel(0);
        Self {
            state: Arc::new(TickState {
                ticks_per_second: ticks_per_second.max(1),
                clock,
                handlers: Mutex::new(BTreeMap::new()),
                next_handler: AtomicU64::new(0),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Creates a clock driven in real time by a background task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(ticks_per_second: u32) -> Self {
        let manager = Self::manual(ticks_per_second);
        let period = ONE_SECOND
            .checked_div(manager.state.ticks_per_second)
            .unwrap_or(ONE_SECOND);
        let weak = Arc::downgrade(&manager.state);
        let handle = tokio::spawn(drive(weak, period));
        *manager
            .state
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(ticks_per_second, "tick driver started");
        manager
    }

    /// Stops the real-time driver, if any. The clock keeps its value.
    pub fn stop(&self) {
        let handle = self
            .state
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = handle {
            driver.abort();
            info!("tick driver stopped");
        }
    }

    /// Advances the clock by `ticks`, running due callbacks after each step.
    pub async fn advance(&self, ticks: u64) {
        for _ in 0..ticks {
            self.state.step().await;
        }
    }

    /// Number of registered periodic callbacks.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.state
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl TickState {
    async fn step(&self) {
        self.clock.send_modify(|tick| *tick = tick.saturating_add(1));
        let now = *self.clock.borrow();

        let due: Vec<TickCallback> = {
            let mut handlers = self
                .handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            handlers
                .values_mut()
                .filter(|handler| handler.next_due <= now)
                .map(|handler| {
                    handler.next_due = now.saturating_add(handler.interval);
                    Arc::clone(&handler.callback)
                })
                .collect()
        };

        for callback in due {
            callback().await;
        }
    }
}

async fn drive(state: Weak<TickState>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(live) = state.upgrade() else {
            debug!("tick manager dropped, driver exiting");
            return;
        };
        live.step().await;
    }
}

impl TickScheduler for TickManager {
    fn ticks_per_second(&self) -> u32 {
        self.state.ticks_per_second
    }

    fn now(&self) -> Tick {
        *self.state.clock.borrow()
    }

    fn wait_ticks(&self, ticks: u64) -> BoxFuture<'static, ()> {
        let mut receiver = self.state.clock.subscribe();
        let target = receiver.borrow_and_update().saturating_add(ticks);
        Box::pin(async move {
            if receiver.wait_for(|now| *now >= target).await.is_err() {
                debug!(target, "tick clock closed while waiting");
            }
        })
    }

    fn register(&self, interval: u64, callback: TickCallback) -> TickSubscription {
        let period = interval.max(1);
        let id = self.state.next_handler.fetch_add(1, Ordering::Relaxed);
        let next_due = self.now().saturating_add(period);
        self.state
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                PeriodicHandler {
                    interval: period,
                    next_due,
                    callback,
                },
            );

        let weak = Arc::downgrade(&self.state);
        TickSubscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state
                    .handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        })
    }
}
