//! Scheduler port consumed by the registry, agents and client runtimes.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A point on the logical clock, counted in ticks since the scheduler began.
pub type Tick = u64;

/// Periodic callback invoked by a scheduler.
pub type TickCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`TickCallback`].
pub fn tick_callback<F, Fut>(callback: F) -> TickCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(callback()) })
}

/// Logical timer shared by every component of the network layer.
pub trait TickScheduler: Send + Sync {
    /// Rate of the clock.
    fn ticks_per_second(&self) -> u32;

    /// Current tick.
    fn now(&self) -> Tick;

    /// Returns a future that resolves once `ticks` ticks have elapsed,
    /// counted from this call rather than from the first poll.
    fn wait_ticks(&self, ticks: u64) -> BoxFuture<'static, ()>;

    /// Runs `callback` every `interval` ticks until the returned subscription
    /// is cancelled.
    fn register(&self, interval: u64, callback: TickCallback) -> TickSubscription;
}

/// Cancellation handle for a periodic callback.
///
/// Dropping the handle leaves the callback registered; call
/// [`TickSubscription::unsubscribe`] to stop it.
pub struct TickSubscription {
    cancel: Box<dyn FnOnce() + Send + Sync>,
}

impl TickSubscription {
    /// Creates a subscription that runs `cancel` when unsubscribed.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    /// Stops the periodic callback.
    pub fn unsubscribe(self) {
        (self.cancel)();
    }
}

impl fmt::Debug for TickSubscription {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("TickSubscription").finish_non_exhaustive()
    }
}
