//! Single-flight guard for revalidation and paging.
//!
//! The first caller spawns the work and parks a shared handle in the slot;
//! everyone arriving while it runs awaits the same handle. The slot clears
//! itself when the work finishes.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use lamina_core::{CacheResult, InvariantError};

/// Shared handle to in-flight work.
pub type Flight = Shared<BoxFuture<'static, CacheResult<()>>>;

#[derive(Default)]
struct Slot {
    generation: u64,
    current: Option<Flight>,
}

/// At most one piece of work in flight at a time.
#[derive(Clone, Default)]
pub struct SingleFlight {
    slot: Arc<Mutex<Slot>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The in-flight work, if any.
    pub fn current(&self) -> Option<Flight> {
        self.lock().current.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Join the in-flight work, or start `make()` if nothing is running.
    ///
    /// The work is spawned onto the runtime immediately, so it makes
    /// progress even if nobody awaits the returned handle.
    pub fn run<F, Fut>(&self, make: F) -> Flight
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<()>> + Send + 'static,
    {
        let mut slot = self.lock();
        if let Some(existing) = &slot.current {
            return existing.clone();
        }
        slot.generation += 1;
        let generation = slot.generation;
        let cleanup = self.clone();
        let handle = tokio::spawn(make());

        let flight: Flight = async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(InvariantError::TaskAborted {
                    reason: e.to_string(),
                }
                .into()),
            };
            cleanup.finish(generation);
            result
        }
        .boxed()
        .shared();

        slot.current = Some(flight.clone());
        drop(slot);

        // Drive the join side as well so the slot clears without a waiter.
        tokio::spawn(flight.clone().map(|_| ()));
        flight
    }

    fn finish(&self, generation: u64) {
        let mut slot = self.lock();
        if slot.generation == generation {
            slot.current = None;
        }
    }
}
