//! Background tick driver
//!
//! Expiry only advances when somebody calls `tick()`. A [`Ticker`] owns a tokio
//! task that does so once per resolution, whether or not the table sees any
//! traffic.

use super::table::{ExpiringTable, ExpiryHooks};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Something whose logical clock can be advanced by one step
pub trait Tick: Send + Sync {
    /// Advance by one tick, returning how many entries were evicted
    fn tick(&self) -> usize;

    /// Short name used in log output
    fn label(&self) -> &'static str {
        "cache"
    }
}

impl<K, V, H, S> Tick for ExpiringTable<K, V, H, S>
where
    K: Hash + Eq + Send,
    V: Send,
    H: ExpiryHooks<K, V>,
    S: BuildHasher + Send,
{
    fn tick(&self) -> usize {
        ExpiringTable::tick(self)
    }
}

/// Handle to a running tick task
///
/// The task stops when the handle is dropped or [`Ticker::stop`] is called.
pub struct Ticker {
    resolution: Duration,
    task: JoinHandle<()>,
}

impl Ticker {
    /// Start ticking `target` every `resolution`
    ///
    /// The first tick fires one full resolution after the call. Missed ticks
    /// are caught up in a burst so no expiry is skipped.
    pub fn spawn<T>(target: Arc<T>, resolution: Duration) -> Self
    where
        T: Tick + ?Sized + 'static,
    {
        let resolution = resolution.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut clock = interval_at(Instant::now() + resolution, resolution);
            clock.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                clock.tick().await;
                let evicted = target.tick();
                if evicted > 0 {
                    tracing::trace!(table = target.label(), evicted, "tick");
                }
            }
        });

        Self { resolution, task }
    }

    /// Wall-clock time between ticks
    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Whether the task is still scheduled
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop ticking
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
