//! Registry of populations currently in progress, one per key.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::domain::entities::{CacheEntry, CacheKey};

/// Result shared with everyone waiting on a population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Population {
    /// The entry was written through and is servable.
    Stored(CacheEntry),
    /// The response was not cacheable.
    NotStored,
    /// The fetch or the store failed.
    Failed(String),
    /// The key was invalidated while the population was running.
    Invalidated,
}

struct Slot {
    id: u64,
    tx: watch::Sender<Option<Population>>,
}

#[derive(Default)]
struct RegistryState {
    slots: HashMap<CacheKey, Slot>,
    /// Sequence at which each key's last stored population finished. Only
    /// kept while a store call that began earlier is still open.
    settled: HashMap<CacheKey, u64>,
    /// Start sequences of the open store calls.
    open_calls: BTreeSet<u64>,
    next_seq: u64,
}

impl RegistryState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Outcome of trying to register a population for a key.
pub enum Registration {
    /// This caller owns the population and must resolve it.
    Leader(Lease),
    /// Someone else owns it; wait for their result.
    Follower(FetchWaiter),
}

/// Process-local registry guaranteeing at most one active population per key.
#[derive(Default)]
pub struct InFlightRegistry {
    state: Mutex<RegistryState>,
}

impl InFlightRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store call. Populations stored for a key after this point
    /// take precedence over this call for as long as it is open.
    pub fn enter(self: &Arc<Self>) -> StoreCall {
        let mut state = self.state.lock();
        let seq = state.next_seq();
        state.open_calls.insert(seq);
        StoreCall {
            registry: Arc::clone(self),
            seq,
        }
    }

    /// Registers a population for `key`, or joins the active one.
    pub fn register(self: &Arc<Self>, key: &CacheKey) -> Registration {
        let mut state = self.state.lock();
        self.register_locked(&mut state, key)
    }

    /// Like [`Self::register`] for an open store call. Returns `None` when a
    /// population for `key` was stored after the call began; that one stands.
    pub fn register_call(self: &Arc<Self>, call: &StoreCall, key: &CacheKey) -> Option<Registration> {
        let mut state = self.state.lock();
        if !state.slots.contains_key(key)
            && state.settled.get(key).is_some_and(|settled| *settled > call.seq)
        {
            trace!(key = %key, "Population settled since the call began");
            return None;
        }
        Some(self.register_locked(&mut state, key))
    }

    fn register_locked(self: &Arc<Self>, state: &mut RegistryState, key: &CacheKey) -> Registration {
        if let Some(slot) = state.slots.get(key) {
            trace!(key = %key, "Joining in-flight population");
            return Registration::Follower(FetchWaiter {
                rx: slot.tx.subscribe(),
            });
        }

        let id = state.next_seq();
        let (tx, _) = watch::channel(None);
        state.slots.insert(key.clone(), Slot { id, tx });
        trace!(key = %key, id = id, "Registered population");

        Registration::Leader(Lease {
            registry: Arc::clone(self),
            key: key.clone(),
            id,
            resolved: false,
        })
    }

    /// Returns true if a population for `key` is active.
    #[must_use]
    pub fn is_active(&self, key: &CacheKey) -> bool {
        self.state.lock().slots.contains_key(key)
    }

    /// Number of active populations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Returns true if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the registration for `key`, telling its waiters it was invalidated.
    /// The leader's later resolution becomes a no-op.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let slot = {
            let mut state = self.state.lock();
            state.settled.remove(key);
            state.slots.remove(key)
        };
        match slot {
            Some(slot) => {
                slot.tx.send_replace(Some(Population::Invalidated));
                debug!(key = %key, "Cancelled in-flight population");
                true
            }
            None => false,
        }
    }

    fn is_current(&self, key: &CacheKey, id: u64) -> bool {
        self.state
            .lock()
            .slots
            .get(key)
            .is_some_and(|slot| slot.id == id)
    }

    fn finish(&self, key: &CacheKey, id: u64, population: Population) -> bool {
        let slot = {
            let mut state = self.state.lock();
            match state.slots.get(key) {
                Some(slot) if slot.id == id => {
                    if matches!(population, Population::Stored(_)) && !state.open_calls.is_empty() {
                        let seq = state.next_seq();
                        state.settled.insert(key.clone(), seq);
                    }
                    state.slots.remove(key)
                }
                _ => None,
            }
        };
        match slot {
            Some(slot) => {
                slot.tx.send_replace(Some(population));
                true
            }
            None => false,
        }
    }

    fn close(&self, seq: u64) {
        let mut state = self.state.lock();
        state.open_calls.remove(&seq);
        match state.open_calls.first().copied() {
            Some(oldest) => state.settled.retain(|_, settled| *settled > oldest),
            None => state.settled.clear(),
        }
    }
}

/// An open `store` call. Closing it (dropping) lets the registry forget
/// settlements no open call can be affected by.
pub struct StoreCall {
    registry: Arc<InFlightRegistry>,
    seq: u64,
}

impl Drop for StoreCall {
    fn drop(&mut self) {
        self.registry.close(self.seq);
    }
}

/// Ownership of one registered population.
///
/// Dropping an unresolved lease releases the key and reports failure to the
/// waiters, so an abandoned fetch never leaves the key stuck.
pub struct Lease {
    registry: Arc<InFlightRegistry>,
    key: CacheKey,
    id: u64,
    resolved: bool,
}

impl Lease {
    /// Key this lease owns.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Returns false once the registration has been cancelled.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.registry.is_current(&self.key, self.id)
    }

    /// Publishes the result and clears the registration.
    /// Returns false if the registration had already been cancelled.
    pub fn resolve(mut self, population: Population) -> bool {
        self.resolved = true;
        self.registry.finish(&self.key, self.id, population)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.resolved {
            debug!(key = %self.key, "Population abandoned, releasing key");
            self.registry.finish(
                &self.key,
                self.id,
                Population::Failed("population abandoned".to_string()),
            );
        }
    }
}

/// Handle for a caller waiting on someone else's population.
pub struct FetchWaiter {
    rx: watch::Receiver<Option<Population>>,
}

impl FetchWaiter {
    /// Waits for the leader's result.
    pub async fn wait(mut self) -> Population {
        match self.rx.wait_for(Option::is_some).await {
            Ok(population) => (*population)
                .clone()
                .unwrap_or_else(|| Population::Failed("population abandoned".to_string())),
            Err(_) => Population::Failed("population abandoned".to_string()),
        }
    }
}
