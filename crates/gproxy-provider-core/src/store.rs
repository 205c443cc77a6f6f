use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::credential::{CallerScope, Credential, CredentialUsageUpdate};
use crate::record::RequestLog;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub created_at: OffsetDateTime,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyKeyRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub enabled: bool,
}

/// Persistence seam for credentials, request logs and proxy keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Active credentials visible to `scope`, ordered by id.
    async fn active_credentials(&self, scope: &CallerScope) -> Result<Vec<Credential>, StoreError>;

    /// Request-log history per credential, most recent first.
    async fn credential_history(
        &self,
        credential_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<HistoryEntry>>, StoreError>;

    /// Inserts or replaces logs keyed by `request_id`.
    async fn upsert_request_logs(&self, logs: &[RequestLog]) -> Result<(), StoreError>;

    async fn apply_usage_updates(
        &self,
        updates: &[CredentialUsageUpdate],
    ) -> Result<(), StoreError>;

    async fn find_proxy_key(&self, key: &str) -> Result<Option<ProxyKeyRecord>, StoreError>;
}
