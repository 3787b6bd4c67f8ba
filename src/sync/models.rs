//! Sync Data Models - Client-Side Structures
//!
//! Defines the shapes shared between the push channel, the bridge REST API
//! and the sync coordinator:
//! - PushMessage: wire envelope for push frames
//! - SyncStatus: per-entity sync state (unknown values kept verbatim)
//! - ConflictRecord: local/remote snapshots of a diverged entity
//! - EntityRecord: bulk list item with its own authoritative sync status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Push frame type interpreted by the coordinator. Every other frame type is
/// passed through to subscribers untouched.
pub const SYNC_UPDATE_TYPE: &str = "sync_update";

// ============================================================================
// Entity Identity
// ============================================================================

/// Identifies a syncable entity across namespaces sharing the status map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

// ============================================================================
// Sync Status
// ============================================================================

/// Per-entity sync state.
///
/// Pushed status strings are accepted verbatim: values outside the known set
/// round-trip through `Other` instead of failing deserialization, since the
/// push source is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SyncStatus {
    Synced,
    Pending,
    Error,
    Conflict,
    Other(String),
}

impl SyncStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Error => "error",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Other(s) => s,
        }
    }

    /// Terminal statuses trigger a reconciliation fetch.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Synced | SyncStatus::Conflict)
    }
}

impl From<String> for SyncStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "synced" => SyncStatus::Synced,
            "pending" => SyncStatus::Pending,
            "error" => SyncStatus::Error,
            "conflict" => SyncStatus::Conflict,
            _ => SyncStatus::Other(s),
        }
    }
}

impl From<SyncStatus> for String {
    fn from(status: SyncStatus) -> Self {
        status.as_str().to_string()
    }
}

// ============================================================================
// Push Messages
// ============================================================================

/// Wire envelope for push channel frames.
///
/// Only `type` is required; sync updates additionally carry the entity
/// identity and its new status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl PushMessage {
    /// Interpret this frame as a sync update, if it is one.
    pub fn as_sync_update(&self) -> Option<(EntityKey, SyncStatus)> {
        if self.kind != SYNC_UPDATE_TYPE {
            return None;
        }
        let entity_type = self.entity_type.as_deref()?;
        let entity_id = self.entity_id.as_deref()?;
        let status = SyncStatus::from(self.status.clone()?);
        Some((EntityKey::new(entity_type, entity_id), status))
    }

    /// Build a sync update frame (used by tests and tooling).
    pub fn sync_update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            kind: SYNC_UPDATE_TYPE.to_string(),
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
            status: Some(status.into()),
        }
    }
}

// ============================================================================
// Conflict Resolution
// ============================================================================

/// Which snapshot becomes authoritative when resolving a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Keep the local version (discard remote changes)
    Local,

    /// Keep the remote version (discard local changes)
    Remote,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Local => "local",
            ResolutionStrategy::Remote => "remote",
        }
    }
}

/// Point-in-time snapshot of one side of a diverged entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub title: String,
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

/// Local and remote snapshots of the same logical entity at a point of
/// divergence. Fetched on demand for conflict display, never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub local: EntitySnapshot,
    pub remote: EntitySnapshot,
}

// ============================================================================
// Entity Lists
// ============================================================================

/// Bulk list item returned by the reconciliation fetch.
///
/// `sync_status` is the fallback source of truth when no push-derived status
/// is held in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub title: String,
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
}

// ============================================================================
// Tests
// ============================================================================
