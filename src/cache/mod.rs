//! Cache Module - Stale-While-Revalidate Bindings
//!
//! Serves last-known-good data synchronously, then silently refreshes from a
//! caller-supplied asynchronous fetch operation:
//! - Synchronous seed from durable storage (or an initial default)
//! - Exactly one background fetch per key activation
//! - Fetch success replaces the value and writes it back to storage
//! - Fetch failure retains stale data (logged, never surfaced as fatal)
//! - Teardown guard: no storage write after the last handle is dropped

use crate::storage::KeyValueStore;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Revalidation fetch failure.
///
/// Absorbed by the binding: stale data is retained and the failure is only
/// observable through `CacheHandle::last_error`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("fetch failed: {0}")]
pub struct FetchError(pub String);

impl FetchError {
    pub fn msg(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The fetch operation bound to a cache key.
pub type Fetcher<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

struct BindingState<T> {
    key: String,
    value: RwLock<T>,
    revalidating: AtomicBool,
    last_error: RwLock<Option<String>>,
    /// Latest supplied fetch operation. Replacing it does not restart the
    /// cycle; the next triggered fetch picks it up.
    fetcher: RwLock<Fetcher<T>>,
}

/// Cache service binding keys to fetch operations.
///
/// Bindings for the same key share one activation: binding an already-active
/// key joins it (swapping in the newest fetcher) instead of starting a second
/// concurrent fetch. Once every handle for a key is dropped, the activation
/// ends and the next bind starts a fresh fetch cycle.
pub struct CacheRevalidator {
    store: Arc<dyn KeyValueStore>,
    active: Mutex<HashMap<String, Weak<dyn Any + Send + Sync>>>,
}

impl CacheRevalidator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `key` to a fetch operation.
    ///
    /// Returns a handle whose first observable value is the stored entry for
    /// `key` (when present and parseable) or `initial` otherwise. A single
    /// background revalidation is started per activation; it must be called
    /// from within a tokio runtime.
    pub fn bind<T>(&self, key: &str, fetcher: Fetcher<T>, initial: T) -> CacheHandle<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());

        // Join an in-progress activation for this key if one is still alive.
        if let Some(existing) = active.get(key).and_then(Weak::upgrade) {
            if let Ok(state) = existing.downcast::<BindingState<T>>() {
                *state.fetcher.write().unwrap_or_else(|e| e.into_inner()) = fetcher;
                return CacheHandle {
                    state,
                    store: Arc::clone(&self.store),
                };
            }
        }

        let seeded = self.seed(key, initial);
        let state = Arc::new(BindingState {
            key: key.to_string(),
            value: RwLock::new(seeded),
            revalidating: AtomicBool::new(true),
            last_error: RwLock::new(None),
            fetcher: RwLock::new(fetcher),
        });

        let erased: Arc<dyn Any + Send + Sync> = state.clone();
        active.insert(key.to_string(), Arc::downgrade(&erased));
        drop(active);

        spawn_revalidation(Arc::downgrade(&state), Arc::clone(&self.store));

        CacheHandle {
            state,
            store: Arc::clone(&self.store),
        }
    }

    /// Read the stored value for `key`, collapsing a missing, unreadable, or
    /// malformed entry to `initial`.
    fn seed<T: DeserializeOwned>(&self, key: &str, initial: T) -> T {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return initial,
            Err(e) => {
                log::warn!("Cache read for '{}' failed: {}", key, e);
                return initial;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                // Corrupt blob is treated as a cache miss.
                log::warn!("Discarding malformed cache entry '{}': {}", key, e);
                initial
            }
        }
    }
}

/// Handle to one cache binding.
///
/// Cloning shares the activation; dropping the last clone tears the binding
/// down and discards any in-flight fetch result.
pub struct CacheHandle<T> {
    state: Arc<BindingState<T>>,
    store: Arc<dyn KeyValueStore>,
}

impl<T> Clone for CacheHandle<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
        }
    }
}

impl<T> CacheHandle<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Current value (stale-but-valid during revalidation).
    pub fn current(&self) -> T {
        self.state
            .value
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether a revalidation fetch is in flight.
    pub fn is_revalidating(&self) -> bool {
        self.state.revalidating.load(Ordering::Acquire)
    }

    /// Most recent revalidation failure, cleared on the next success.
    pub fn last_error(&self) -> Option<String> {
        self.state
            .last_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the fetch operation without restarting the cycle.
    pub fn update_fetcher(&self, fetcher: Fetcher<T>) {
        *self
            .state
            .fetcher
            .write()
            .unwrap_or_else(|e| e.into_inner()) = fetcher;
    }

    /// Trigger another revalidation using the latest fetcher.
    ///
    /// A no-op while a fetch is already in flight, so overlapping fetches for
    /// the same key never run.
    pub fn revalidate(&self) {
        if self
            .state
            .revalidating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        spawn_revalidation(Arc::downgrade(&self.state), Arc::clone(&self.store));
    }
}

/// Run one fetch cycle against the latest fetcher.
///
/// Holds only a weak reference to the binding: if every handle is dropped
/// before the fetch resolves, the result is discarded and storage is left
/// untouched.
fn spawn_revalidation<T>(weak: Weak<BindingState<T>>, store: Arc<dyn KeyValueStore>)
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let fut = match weak.upgrade() {
            Some(state) => {
                let fetcher = state.fetcher.read().unwrap_or_else(|e| e.into_inner());
                (fetcher)()
            }
            None => return,
        };

        let result = fut.await;

        // Teardown guard: the binding may be gone by the time the fetch
        // settles.
        let Some(state) = weak.upgrade() else {
            return;
        };

        match result {
            Ok(value) => {
                match serde_json::to_string(&value) {
                    Ok(raw) => {
                        if let Err(e) = store.set(&state.key, &raw) {
                            log::error!("Cache write for '{}' failed: {}", state.key, e);
                        }
                    }
                    Err(e) => {
                        log::error!("Cache serialization for '{}' failed: {}", state.key, e);
                    }
                }
                *state.value.write().unwrap_or_else(|e| e.into_inner()) = value;
                *state
                    .last_error
                    .write()
                    .unwrap_or_else(|e| e.into_inner()) = None;
            }
            Err(e) => {
                // Stale data is retained; the failure is absorbed here.
                log::warn!(
                    "Revalidation of '{}' failed, keeping stale data: {}",
                    state.key,
                    e
                );
                *state
                    .last_error
                    .write()
                    .unwrap_or_else(|e| e.into_inner()) = Some(e.to_string());
            }
        }

        state.revalidating.store(false, Ordering::Release);
    });
}

// ============================================================================
// Tests
// ============================================================================
