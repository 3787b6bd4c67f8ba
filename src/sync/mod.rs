//! Sync Module - Push-Driven Task Synchronization
//!
//! Client-side contract with the Altimeter bridge:
//! - Sync status map driven by `sync_update` push frames (last-write-wins)
//! - Conflict detail fetch and resolution dispatch over REST
//! - Auto-reconnecting push channel with broadcast fan-out
//! - Debounced reconciliation fetches after terminal statuses
//!
//! Architecture:
//! - Pub/sub channel object with injectable transport (no ambient singleton)
//! - Coordinator owns the status map and conflict lifecycle
//! - Views observe through `SyncEvent` and `ChannelState`

pub mod api;
pub mod channel;
pub mod coordinator;
pub mod models;


// Re-export commonly used types
pub use models::{
    ConflictRecord, EntityKey, EntityRecord, EntitySnapshot, PushMessage, ResolutionStrategy,
    SyncStatus, SYNC_UPDATE_TYPE,
};

pub use api::{SyncApiClient, SyncApiError, SyncBackend};
pub use channel::{
    ChannelConfig, ChannelError, ChannelState, PushChannel, PushTransport, Subscription,
    WebSocketTransport,
};
pub use coordinator::{CoordinatorConfig, SyncCoordinator, SyncError, SyncEvent};
