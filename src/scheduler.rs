//! Cancellable background timers.
//!
//! Every timer in the crate (bus flush, consumer batch flush, auto-save,
//! tracker buffer flush, cache cleanup, post-completion purge) is one of these
//! handles, stored next to whatever owns it and cancelled explicitly. Dropping a
//! handle also cancels the task.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Runs `tick` every `period`, starting one period from now.
#[derive(Debug)]
pub struct RecurringTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl RecurringTask {
    /// Spawn the timer on the current tokio runtime.
    ///
    /// Returns `None` (and logs) when called outside a runtime, so components
    /// built in synchronous contexts degrade to manual flushing instead of
    /// panicking.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Option<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("no tokio runtime; timer `{name}` not started");
                return None;
            }
        };
        let period = period.max(Duration::from_millis(1));
        let handle = runtime.spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                // The callback returns false once its owner is gone.
                if !tick().await {
                    tracing::debug!("timer `{name}` stopped by its owner");
                    break;
                }
            }
        });
        Some(Self {
            name,
            handle: Some(handle),
        })
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!("timer `{}` cancelled", self.name);
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RecurringTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Runs `work` once after `delay` unless cancelled first.
#[derive(Debug)]
pub struct DelayedTask {
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    pub fn spawn<Fut>(delay: Duration, work: Fut) -> Option<Self>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let handle = runtime.spawn(async move {
            time::sleep(delay).await;
            work.await;
        });
        Some(Self {
            handle: Some(handle),
        })
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Fire-and-forget background work. Returns false when there is no runtime
/// to run it on.
pub fn spawn_detached<Fut>(what: &'static str, work: Fut) -> bool
where
    Fut: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(work);
            true
        }
        Err(_) => {
            tracing::warn!("no tokio runtime; {what} skipped");
            false
        }
    }
}
