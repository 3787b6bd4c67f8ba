//! Sync API Client - HTTP communication with the Altimeter bridge
//!
//! Handles the REST calls the sync coordinator depends on:
//! - Conflict detail fetch (local/remote snapshots)
//! - Conflict resolution dispatch
//! - Bulk entity list (reconciliation source of truth)

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use super::models::{ConflictRecord, EntityRecord, ResolutionStrategy};

const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";

/// Backend operations the coordinator depends on.
///
/// Seam for tests and alternative transports; `SyncApiClient` is the
/// production implementation.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Fetch conflict snapshots for a diverged entity. Pure read.
    async fn fetch_conflict(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<ConflictRecord, SyncApiError>;

    /// Dispatch a resolution choice. Does not mutate the entity locally.
    async fn resolve_conflict(
        &self,
        entity_type: &str,
        entity_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<(), SyncApiError>;

    /// Bulk list of entities of one type, used for reconciliation.
    async fn list_entities(&self, entity_type: &str) -> Result<Vec<EntityRecord>, SyncApiError>;
}

/// API client for the Altimeter bridge sync endpoints.
pub struct SyncApiClient {
    client: Client,
    base_url: String,
}

impl SyncApiClient {
    /// Create a client against the default bridge URL.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Create a client against a specific base URL (tests, staging).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.into(),
        }
    }
}

impl Default for SyncApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncBackend for SyncApiClient {
    async fn fetch_conflict(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<ConflictRecord, SyncApiError> {
        let response = self
            .client
            .get(format!(
                "{}/sync/{}/{}/conflict",
                self.base_url, entity_type, entity_id
            ))
            .send()
            .await?;

        // A missing conflict means it was resolved elsewhere between the
        // push and the user opening it.
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncApiError::ConflictNotFound);
        }

        handle_response(response).await
    }

    async fn resolve_conflict(
        &self,
        entity_type: &str,
        entity_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<(), SyncApiError> {
        let req = ResolveRequest { strategy };

        let response = self
            .client
            .post(format!(
                "{}/sync/{}/{}/resolve",
                self.base_url, entity_type, entity_id
            ))
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // Entity already resolved, deleted, or in a state the backend
        // declines to resolve from.
        if matches!(
            status,
            StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::GONE
        ) {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Resolution declined".to_string());
            return Err(SyncApiError::ResolutionRejected(msg));
        }

        Err(handle_error(response).await)
    }

    async fn list_entities(&self, entity_type: &str) -> Result<Vec<EntityRecord>, SyncApiError> {
        let response = self
            .client
            .get(format!("{}/sync/{}", self.base_url, entity_type))
            .send()
            .await?;

        handle_response(response).await
    }
}

// ============================================================================
// API Request Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct ResolveRequest {
    strategy: ResolutionStrategy,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Conflict no longer exists for this entity")]
    ConflictNotFound,

    #[error("Resolution rejected: {0}")]
    ResolutionRejected(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response from server")]
    InvalidResponse,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();

    match status {
        StatusCode::INTERNAL_SERVER_ERROR => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::ServerError(msg)
        }
        _ => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::NetworkError(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
