//! # Atlas Sync Client
//!
//! Client-side sync core of the Atlas operations dashboard.
//!
//! Two components make up the crate:
//! - [`cache::CacheRevalidator`]: stale-while-revalidate bindings over a
//!   durable key-value store, so views render last-known-good data
//!   instantly and refresh in the background.
//! - [`sync::SyncCoordinator`]: per-entity sync status map driven by push
//!   frames from the Altimeter bridge, with conflict detail fetch,
//!   resolution dispatch, and debounced reconciliation.
//!
//! The surrounding services (push channel, REST client, storage) are
//! injectable so views and tests can swap transports freely.

pub mod cache;
pub mod storage;
pub mod sync;

pub use cache::{CacheHandle, CacheRevalidator, FetchError, Fetcher};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, StorageError};
pub use sync::{
    ChannelConfig, ChannelState, ConflictRecord, CoordinatorConfig, EntityKey, EntityRecord,
    PushChannel, PushMessage, ResolutionStrategy, SyncApiClient, SyncCoordinator, SyncStatus,
    WebSocketTransport,
};
