//! # Resource Lifecycle Registry
//!
//! Process-wide bookkeeping for every live timer, cancelable operation and
//! ad-hoc teardown callback. One idempotent `cleanup()` drains everything,
//! swallowing per-resource failures so teardown always runs to completion.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Current counts of each tracked resource kind, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ResourceCounts {
    pub timers: usize,
    pub operations: usize,
    pub cleanup_callbacks: usize,
}

struct RegistryInner {
    timers: HashMap<u64, CancellationToken>,
    operations: HashMap<u64, CancellationToken>,
    cleanup_fns: HashMap<u64, CleanupFn>,
    cleaned_up: bool,
    next_id: u64,
}

impl RegistryInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared handle to the process-scoped registry. Cheap to clone; every clone
/// points at the same bookkeeping sets.
#[derive(Clone)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                timers: HashMap::new(),
                operations: HashMap::new(),
                cleanup_fns: HashMap::new(),
                cleaned_up: false,
                next_id: 0,
            })),
        }
    }

    /// Registers a timer slot and returns its handle. The handle does not
    /// cancel on drop; an abandoned timer stays registered until `cleanup()`.
    pub fn register_timer(&self) -> ManagedTimer {
        let token = CancellationToken::new();
        let id = {
            let mut inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
            let id = inner.next_id();
            if inner.cleaned_up {
                log::debug!("Timer {} registered after cleanup already ran", id);
            }
            inner.timers.insert(id, token.clone());
            id
        };
        ManagedTimer {
            id,
            token,
            registry: self.clone(),
        }
    }

    pub fn unregister_timer(&self, id: u64) {
        let mut inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
        inner.timers.remove(&id);
    }

    /// Registers a cancelable unit of work (an in-flight request, a driver
    /// task). Canceling through the handle aborts it and deregisters it.
    pub fn managed_operation(&self) -> ManagedOperation {
        let token = CancellationToken::new();
        let id = {
            let mut inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
            let id = inner.next_id();
            inner.operations.insert(id, token.clone());
            id
        };
        ManagedOperation {
            id,
            token,
            registry: self.clone(),
        }
    }

    pub fn unregister_operation(&self, id: u64) {
        let mut inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
        inner.operations.remove(&id);
    }

    /// Registers a teardown callback, executed at most once.
    pub fn register_cleanup<F>(&self, f: F) -> CleanupHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = {
            let mut inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
            let id = inner.next_id();
            inner.cleanup_fns.insert(id, Box::new(f));
            id
        };
        CleanupHandle {
            id,
            registry: self.clone(),
        }
    }

    pub fn unregister_cleanup(&self, id: u64) {
        let mut inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
        inner.cleanup_fns.remove(&id);
    }

    /// Spawns a recurring callback on a fixed period, tracked by the
    /// registry. Dropping the returned handle leaves the tick loop running;
    /// stop it through `cancel()` or registry cleanup.
    pub fn managed_interval<F>(&self, period: Duration, mut tick_fn: F) -> ManagedTimer
    where
        F: FnMut() + Send + 'static,
    {
        let timer = self.register_timer();
        let token = timer.token.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so ticks land on
            // period boundaries.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => tick_fn(),
                }
            }
        });
        timer
    }

    /// A one-shot delay tracked as a timer for its whole duration. Returns
    /// `true` when the delay elapsed, `false` when it was canceled by
    /// cleanup. The slot is released on either path, including mid-await
    /// drops.
    pub async fn managed_sleep(&self, delay: Duration) -> bool {
        struct Slot {
            registry: CleanupRegistry,
            id: u64,
        }
        impl Drop for Slot {
            fn drop(&mut self) {
                self.registry.unregister_timer(self.id);
            }
        }

        let timer = self.register_timer();
        let _slot = Slot {
            registry: self.clone(),
            id: timer.id,
        };
        tokio::select! {
            _ = timer.token.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    /// Cancels every registered timer, aborts every registered operation and
    /// runs every registered callback, in that order. Idempotent until
    /// `force_cleanup()` resets the completed flag. Never panics outward; a
    /// misbehaving callback is logged and skipped.
    pub fn cleanup(&self) {
        let (timers, operations, cleanup_fns) = {
            let mut inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
            if inner.cleaned_up {
                return;
            }
            inner.cleaned_up = true;
            (
                inner.timers.drain().collect::<Vec<_>>(),
                inner.operations.drain().collect::<Vec<_>>(),
                inner.cleanup_fns.drain().collect::<Vec<_>>(),
            )
        };

        let counts = (timers.len(), operations.len(), cleanup_fns.len());

        for (_, token) in timers {
            token.cancel();
        }
        for (_, token) in operations {
            token.cancel();
        }
        for (id, f) in cleanup_fns {
            if catch_unwind(AssertUnwindSafe(move || f())).is_err() {
                log::warn!("Cleanup callback {} panicked; continuing teardown", id);
            }
        }

        log::info!(
            "CleanupRegistry: canceled {} timers, aborted {} operations, ran {} callbacks",
            counts.0,
            counts.1,
            counts.2
        );
    }

    /// Resets the completed flag and runs a full cleanup again. Meant for
    /// diagnostics and tests.
    pub fn force_cleanup(&self) {
        {
            let mut inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
            inner.cleaned_up = false;
        }
        self.cleanup();
    }

    pub fn is_cleaned_up(&self) -> bool {
        let inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
        inner.cleaned_up
    }

    pub fn resource_counts(&self) -> ResourceCounts {
        let inner = self.inner.lock().expect("CleanupRegistry lock poisoned");
        ResourceCounts {
            timers: inner.timers.len(),
            operations: inner.operations.len(),
            cleanup_callbacks: inner.cleanup_fns.len(),
        }
    }
}

/// Handle to a registered timer. Canceling stops the underlying tick loop
/// and removes the slot so it is not tracked twice.
pub struct ManagedTimer {
    id: u64,
    token: CancellationToken,
    registry: CleanupRegistry,
}

impl ManagedTimer {
    pub fn cancel(&self) {
        self.token.cancel();
        self.registry.unregister_timer(self.id);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Handle to a cancelable operation. The operation itself races its work
/// against `token()`; canceling aborts it and deregisters the slot.
pub struct ManagedOperation {
    id: u64,
    token: CancellationToken,
    registry: CleanupRegistry,
}

impl ManagedOperation {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
        self.registry.unregister_operation(self.id);
    }
}

/// Handle to a registered cleanup callback; allows removing it before
/// teardown runs.
pub struct CleanupHandle {
    id: u64,
    registry: CleanupRegistry,
}

impl CleanupHandle {
    pub fn unregister(&self) {
        self.registry.unregister_cleanup(self.id);
    }
}
