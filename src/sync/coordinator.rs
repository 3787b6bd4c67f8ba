//! Sync Coordinator - Push-Driven Status Map & Conflict Lifecycle
//!
//! Tracks the latest known sync status per entity, driven by push frames:
//! - Last-write-wins status map (no transition validation; the push source
//!   is trusted)
//! - Debounced per-entity reconciliation fetch after terminal statuses,
//!   coalescing bursts into a single list read
//! - Conflict detail fetch and resolution dispatch with an optimistic
//!   `pending` status and rollback on rejection
//! - One resolution in flight per entity; cleared by the next pushed status

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::api::{SyncApiError, SyncBackend};
use super::channel::PushChannel;
use super::models::{ConflictRecord, EntityKey, EntityRecord, ResolutionStrategy, SyncStatus};

/// Coordinator configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CoordinatorConfig {
    /// Coalescing window for reconciliation fetches after terminal statuses.
    pub reconcile_debounce_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            reconcile_debounce_ms: 500,
        }
    }
}

/// Observable coordinator events for views.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StatusChanged {
        key: EntityKey,
        status: SyncStatus,
    },
    /// Authoritative list re-read completed after a terminal status.
    Reconciled {
        entity_type: String,
        entities: Vec<EntityRecord>,
    },
}

/// Coordinator errors
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] SyncApiError),

    #[error("A resolution for {0} is already in flight")]
    ResolutionInFlight(EntityKey),
}

struct CoordinatorShared {
    backend: Arc<dyn SyncBackend>,
    config: CoordinatorConfig,
    statuses: RwLock<HashMap<EntityKey, SyncStatus>>,
    /// Scheduled reconciliation per entity; rescheduling cancels the prior
    /// timer so bursts coalesce.
    pending_reconciles: Mutex<HashMap<EntityKey, JoinHandle<()>>>,
    /// Entities with a dispatched resolution awaiting their next pushed
    /// status.
    resolving: Mutex<HashSet<EntityKey>>,
    events: broadcast::Sender<SyncEvent>,
}

/// Client-side sync coordinator.
pub struct SyncCoordinator {
    shared: Arc<CoordinatorShared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new(backend: Arc<dyn SyncBackend>, config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(CoordinatorShared {
                backend,
                config,
                statuses: RwLock::new(HashMap::new()),
                pending_reconciles: Mutex::new(HashMap::new()),
                resolving: Mutex::new(HashSet::new()),
                events,
            }),
            listener: Mutex::new(None),
        }
    }

    /// Subscribe to a push channel and consume its sync updates.
    ///
    /// Replaces any previous attachment. Must be called from within a tokio
    /// runtime.
    pub fn attach(&self, channel: &PushChannel) {
        let mut subscription = channel.subscribe();
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            // Dropping the subscription on abort unsubscribes us.
            while let Some(message) = subscription.recv().await {
                if let Some((key, status)) = message.as_sync_update() {
                    apply_update(&shared, key, status);
                }
            }
        });

        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = listener.replace(handle) {
            old.abort();
        }
    }

    /// Stop consuming push updates and cancel scheduled reconciliations.
    pub fn detach(&self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let mut pending = self
            .shared
            .pending_reconciles
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }

    /// Latest known status for an entity. Absent entries are implicitly
    /// `synced`.
    pub fn status_of(&self, entity_type: &str, entity_id: &str) -> SyncStatus {
        self.shared
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&EntityKey::new(entity_type, entity_id))
            .cloned()
            .unwrap_or(SyncStatus::Synced)
    }

    /// Apply one push frame directly (views pumping their own subscription).
    pub fn apply_push(&self, message: &super::models::PushMessage) {
        if let Some((key, status)) = message.as_sync_update() {
            apply_update(&self.shared, key, status);
        }
    }

    /// Fold statuses carried by a bulk list read into the map.
    ///
    /// Used when no push-derived status is held (e.g. after reload).
    pub fn apply_entities(&self, entity_type: &str, entities: &[EntityRecord]) {
        let mut statuses = self
            .shared
            .statuses
            .write()
            .unwrap_or_else(|e| e.into_inner());
        for entity in entities {
            if let Some(status) = &entity.sync_status {
                statuses.insert(
                    EntityKey::new(entity_type, entity.id.clone()),
                    status.clone(),
                );
            }
        }
    }

    /// Observe status changes and reconciliation results.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Fetch the local/remote snapshots for an entity in conflict.
    ///
    /// Idempotent read. When the conflict was resolved elsewhere in the
    /// meantime, the local status map is stale: a status re-check is
    /// scheduled and `ConflictNotFound` is returned for the caller to
    /// surface as a dismissable notice.
    pub async fn open_conflict(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<ConflictRecord, SyncError> {
        match self
            .shared
            .backend
            .fetch_conflict(entity_type, entity_id)
            .await
        {
            Ok(record) => Ok(record),
            Err(SyncApiError::ConflictNotFound) => {
                let key = EntityKey::new(entity_type, entity_id);
                log::warn!("Conflict for {} vanished before it was opened", key);
                schedule_reconcile(&self.shared, key);
                Err(SyncError::Api(SyncApiError::ConflictNotFound))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Dispatch a resolution choice for an entity in conflict.
    ///
    /// Optimistically sets the entity to `pending`; the backend confirms
    /// asynchronously via a later `sync_update` push. A rejected dispatch
    /// rolls the status back. At most one resolution per entity may be in
    /// flight until its next pushed status arrives.
    pub async fn resolve_conflict(
        &self,
        entity_type: &str,
        entity_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<(), SyncError> {
        let key = EntityKey::new(entity_type, entity_id);

        {
            let mut resolving = self
                .shared
                .resolving
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !resolving.insert(key.clone()) {
                return Err(SyncError::ResolutionInFlight(key));
            }
        }

        // Optimistic: resolution is asynchronous on the backend.
        let prior = {
            let mut statuses = self
                .shared
                .statuses
                .write()
                .unwrap_or_else(|e| e.into_inner());
            statuses.insert(key.clone(), SyncStatus::Pending)
        };
        emit(
            &self.shared,
            SyncEvent::StatusChanged {
                key: key.clone(),
                status: SyncStatus::Pending,
            },
        );

        match self
            .shared
            .backend
            .resolve_conflict(entity_type, entity_id, strategy)
            .await
        {
            Ok(()) => {
                log::info!("Resolution '{}' dispatched for {}", strategy.as_str(), key);
                Ok(())
            }
            Err(e) => {
                // Roll the optimistic status back and release the guard. A
                // push that landed during the dispatch already overwrote the
                // optimistic `pending`; that newer status wins over the
                // rollback.
                let restored = prior.unwrap_or(SyncStatus::Conflict);
                let rolled_back = {
                    let mut statuses = self
                        .shared
                        .statuses
                        .write()
                        .unwrap_or_else(|e| e.into_inner());
                    if statuses.get(&key) == Some(&SyncStatus::Pending) {
                        statuses.insert(key.clone(), restored.clone());
                        true
                    } else {
                        false
                    }
                };
                self.shared
                    .resolving
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&key);
                if rolled_back {
                    emit(
                        &self.shared,
                        SyncEvent::StatusChanged {
                            key: key.clone(),
                            status: restored,
                        },
                    );
                }
                log::warn!("Resolution for {} failed: {}", key, e);
                Err(e.into())
            }
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.detach();
    }
}

// ============================================================================
// Internals
// ============================================================================

/// Apply one pushed status: overwrite, clear the resolution guard, and
/// schedule reconciliation on terminal statuses.
fn apply_update(shared: &Arc<CoordinatorShared>, key: EntityKey, status: SyncStatus) {
    {
        let mut statuses = shared.statuses.write().unwrap_or_else(|e| e.into_inner());
        statuses.insert(key.clone(), status.clone());
    }

    // A pushed transition for this entity ends any outstanding resolution
    // cycle.
    shared
        .resolving
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&key);

    emit(
        shared,
        SyncEvent::StatusChanged {
            key: key.clone(),
            status: status.clone(),
        },
    );

    if status.is_terminal() {
        schedule_reconcile(shared, key);
    }
}

/// Schedule (or reschedule) the debounced reconciliation fetch for one
/// entity. An existing timer is cancelled, so bursts within the window
/// collapse into a single fetch.
fn schedule_reconcile(shared: &Arc<CoordinatorShared>, key: EntityKey) {
    let mut pending = shared
        .pending_reconciles
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if let Some(old) = pending.remove(&key) {
        old.abort();
    }

    let task_shared = Arc::clone(shared);
    let task_key = key.clone();
    let debounce = Duration::from_millis(shared.config.reconcile_debounce_ms);

    let handle = tokio::spawn(async move {
        tokio::time::sleep(debounce).await;

        task_shared
            .pending_reconciles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_key);

        match task_shared
            .backend
            .list_entities(&task_key.entity_type)
            .await
        {
            Ok(entities) => {
                {
                    let mut statuses = task_shared
                        .statuses
                        .write()
                        .unwrap_or_else(|e| e.into_inner());
                    for entity in &entities {
                        if let Some(status) = &entity.sync_status {
                            statuses.insert(
                                EntityKey::new(task_key.entity_type.clone(), entity.id.clone()),
                                status.clone(),
                            );
                        }
                    }
                }
                emit(
                    &task_shared,
                    SyncEvent::Reconciled {
                        entity_type: task_key.entity_type.clone(),
                        entities,
                    },
                );
            }
            Err(e) => {
                // Badges stay as pushed; the next terminal status retries.
                log::warn!(
                    "Reconciliation fetch for '{}' failed: {}",
                    task_key.entity_type,
                    e
                );
            }
        }
    });

    pending.insert(key, handle);
}

fn emit(shared: &CoordinatorShared, event: SyncEvent) {
    // No receivers is fine.
    let _ = shared.events.send(event);
}

// ============================================================================
// Tests
// ============================================================================
