//! Reference-counted registry of shared, lazily started resources
//!
//! A resource is identified by a key. The first [`SharedRegistry::acquire`]
//! for a key spawns a driver task that publishes the resource state into a
//! watch channel; later acquisitions for the same key share that channel and
//! immediately observe the latest state. When the last [`Lease`] of a key is
//! dropped, the driver is aborted and the teardown runs on the last value it
//! published.
//!
//! A new acquisition for a key whose previous instance is still tearing down
//! starts its driver only after that teardown finished, so two instances of
//! one key are never live at the same time.

use core::fmt::{self, Display};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ircnostr_core::{BridgeError, Result};

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

/// State of a shared resource as seen by its lease holders
#[derive(Debug, Clone)]
pub enum Shared<V> {
    /// Being set up (or re-established)
    Pending,
    /// Live and usable
    Ready(V),
    /// Setup failed permanently
    Failed(BridgeError),
}

impl<V> Shared<V> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Shared::Pending)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Shared::Ready(_))
    }
}

/// Receiving side of a resource's state
pub type SharedWatch<V> = watch::Receiver<Shared<V>>;

/// Wait until a resource is ready, or report why it never will be
pub async fn wait_ready<V: Clone>(state: &mut SharedWatch<V>, what: &str) -> Result<V> {
    let current = state
        .wait_for(|s| !s.is_pending())
        .await
        .map_err(|_| BridgeError::ConnectionClosed {
            key: what.to_string(),
        })?;

    match &*current {
        Shared::Ready(value) => Ok(value.clone()),
        Shared::Failed(err) => Err(err.clone()),
        Shared::Pending => Err(BridgeError::ConnectionClosed {
            key: what.to_string(),
        }),
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

type Teardown<V> = Box<dyn FnOnce(V) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot<V> {
    generation: u64,
    holders: usize,
    state: SharedWatch<V>,
    driver: JoinHandle<()>,
    teardown: Teardown<V>,
    /// Teardown of the previous instance of this key, if it was still running
    /// when this instance started
    previous: Option<watch::Receiver<bool>>,
}

struct RegistryInner<K, V> {
    name: &'static str,
    slots: DashMap<K, Slot<V>>,
    draining: DashMap<K, (u64, watch::Receiver<bool>)>,
    generations: AtomicU64,
}

/// Registry of shared resources keyed by `K`
pub struct SharedRegistry<K, V> {
    inner: Arc<RegistryInner<K, V>>,
}

impl<K, V> Clone for SharedRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash, V> fmt::Debug for SharedRegistry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("name", &self.inner.name)
            .field("live", &self.inner.slots.len())
            .field("draining", &self.inner.draining.len())
            .finish()
    }
}

impl<K, V> SharedRegistry<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty registry; `name` only shows up in logs
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                name,
                slots: DashMap::new(),
                draining: DashMap::new(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Take a lease on `key`, starting the resource if nobody holds it yet
    ///
    /// `driver` and `teardown` are only used when this call starts a new
    /// instance. The driver publishes state changes until it returns or is
    /// aborted; the teardown receives the last value the driver published
    /// if that was [`Shared::Ready`].
    pub fn acquire<D, DF, T, TF>(&self, key: K, driver: D, teardown: T) -> Lease<K, V>
    where
        D: FnOnce(watch::Sender<Shared<V>>) -> DF,
        DF: Future<Output = ()> + Send + 'static,
        T: FnOnce(V) -> TF + Send + Sync + 'static,
        TF: Future<Output = ()> + Send + 'static,
    {
        let state = match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let slot = slot.get_mut();
                slot.holders += 1;
                debug!("{} {} shared by {} holders", self.inner.name, key, slot.holders);
                slot.state.clone()
            }
            Entry::Vacant(vacant) => {
                let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                let previous = self.inner.draining.get(&key).map(|d| d.1.clone());
                let (sender, receiver) = watch::channel(Shared::Pending);

                let drive = driver(sender);
                let mut wait_previous = previous.clone();
                let driver = tokio::spawn(async move {
                    if let Some(previous) = wait_previous.as_mut() {
                        let _ = previous.wait_for(|done| *done).await;
                    }
                    drive.await;
                });

                debug!("{} {} started (generation {})", self.inner.name, key, generation);
                vacant.insert(Slot {
                    generation,
                    holders: 1,
                    state: receiver.clone(),
                    driver,
                    teardown: Box::new(move |value| Box::pin(teardown(value))),
                    previous,
                });
                receiver
            }
        };

        Lease {
            key,
            state,
            inner: self.inner.clone(),
        }
    }

    /// Number of keys with at least one holder
    pub fn live(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of holders of `key`
    pub fn holders(&self, key: &K) -> usize {
        self.inner.slots.get(key).map(|s| s.holders).unwrap_or(0)
    }

    /// Whether nothing is held and every teardown has finished
    pub fn is_idle(&self) -> bool {
        self.inner.slots.is_empty() && self.inner.draining.is_empty()
    }
}

impl<K, V> RegistryInner<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn release(self: &Arc<Self>, key: &K) {
        let Entry::Occupied(mut occupied) = self.slots.entry(key.clone()) else {
            return;
        };

        let slot = occupied.get_mut();
        slot.holders = slot.holders.saturating_sub(1);
        if slot.holders > 0 {
            debug!("{} {} released, {} holders left", self.name, key, slot.holders);
            return;
        }

        // Register the teardown before the slot disappears so that an
        // acquisition racing with this release waits for it.
        let (done, done_receiver) = watch::channel(false);
        let generation = slot.generation;
        self.draining.insert(key.clone(), (generation, done_receiver));
        let slot = occupied.remove();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("{} {} released outside of a runtime, skipping teardown", self.name, key);
            slot.driver.abort();
            self.draining.remove_if(key, |_, (g, _)| *g == generation);
            return;
        };

        debug!("{} {} has no holders left, tearing down", self.name, key);
        let inner = self.clone();
        let key = key.clone();
        handle.spawn(async move {
            let Slot {
                state,
                driver,
                teardown,
                previous,
                ..
            } = slot;

            driver.abort();
            let _ = driver.await;

            let last = state.borrow().clone();
            drop(state);
            if let Shared::Ready(value) = last {
                teardown(value).await;
            }

            if let Some(mut previous) = previous {
                let _ = previous.wait_for(|done| *done).await;
            }

            let _ = done.send(true);
            inner.draining.remove_if(&key, |_, (g, _)| *g == generation);
            debug!("{} {} torn down", inner.name, key);
        });
    }
}

// ----------------------------------------------------------------------------
// Lease
// ----------------------------------------------------------------------------

/// A holder's share of a resource; dropping the last lease tears it down
pub struct Lease<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    key: K,
    state: SharedWatch<V>,
    inner: Arc<RegistryInner<K, V>>,
}

impl<K, V> Lease<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Latest state
    pub fn current(&self) -> Shared<V> {
        self.state.borrow().clone()
    }

    /// A receiver of state changes, starting at the latest state
    pub fn watch(&self) -> SharedWatch<V> {
        self.state.clone()
    }

    /// Wait until the resource is ready
    pub async fn ready(&self) -> Result<V> {
        let mut state = self.state.clone();
        wait_ready(&mut state, &self.key.to_string()).await
    }
}

impl<K, V> fmt::Debug for Lease<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("registry", &self.inner.name)
            .field("key", &self.key.to_string())
            .finish()
    }
}

impl<K, V> Drop for Lease<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}
