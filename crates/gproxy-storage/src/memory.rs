use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use gproxy_provider_core::{
    CallerScope, Credential, CredentialUsageUpdate, HistoryEntry, KeyStore, ProxyKeyRecord,
    RequestLog, StoreError,
};

/// In-process [`KeyStore`] for tests and single-node experiments.
#[derive(Default)]
pub struct MemoryStore {
    credentials: RwLock<BTreeMap<i64, Credential>>,
    logs: RwLock<BTreeMap<String, RequestLog>>,
    proxy_keys: RwLock<HashMap<String, ProxyKeyRecord>>,
    log_failures: AtomicUsize,
    log_writes: AtomicUsize,
    usage_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let map = credentials.into_iter().map(|cred| (cred.id, cred)).collect();
        Self {
            credentials: RwLock::new(map),
            ..Self::default()
        }
    }

    pub async fn insert_proxy_key(&self, key: impl Into<String>, record: ProxyKeyRecord) {
        self.proxy_keys.write().await.insert(key.into(), record);
    }

    pub async fn credential(&self, id: i64) -> Option<Credential> {
        self.credentials.read().await.get(&id).cloned()
    }

    pub async fn request_logs(&self) -> Vec<RequestLog> {
        self.logs.read().await.values().cloned().collect()
    }

    pub async fn request_log(&self, request_id: &str) -> Option<RequestLog> {
        self.logs.read().await.get(request_id).cloned()
    }

    /// Makes the next `count` log upserts fail.
    pub fn fail_next_log_writes(&self, count: usize) {
        self.log_failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful `upsert_request_logs` calls.
    pub fn log_writes(&self) -> usize {
        self.log_writes.load(Ordering::SeqCst)
    }

    pub fn usage_writes(&self) -> usize {
        self.usage_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn active_credentials(&self, scope: &CallerScope) -> Result<Vec<Credential>, StoreError> {
        Ok(self
            .credentials
            .read()
            .await
            .values()
            .filter(|cred| cred.visible_to(scope))
            .cloned()
            .collect())
    }

    async fn credential_history(
        &self,
        credential_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<HistoryEntry>>, StoreError> {
        let logs = self.logs.read().await;
        let mut history: HashMap<i64, Vec<HistoryEntry>> = HashMap::new();
        for log in logs.values() {
            let Some(credential_id) = log.credential_id else {
                continue;
            };
            if !credential_ids.contains(&credential_id) {
                continue;
            }
            history.entry(credential_id).or_default().push(HistoryEntry {
                created_at: log.created_at,
                success: log.success,
            });
        }
        for entries in history.values_mut() {
            entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        Ok(history)
    }

    async fn upsert_request_logs(&self, logs: &[RequestLog]) -> Result<(), StoreError> {
        let pending_failures = self.log_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.log_failures.store(pending_failures - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        let mut stored = self.logs.write().await;
        for log in logs {
            stored.insert(log.request_id.clone(), log.clone());
        }
        self.log_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_usage_updates(
        &self,
        updates: &[CredentialUsageUpdate],
    ) -> Result<(), StoreError> {
        let mut credentials = self.credentials.write().await;
        for update in updates {
            let Some(cred) = credentials.get_mut(&update.credential_id) else {
                continue;
            };
            cred.success_count += update.success_delta;
            cred.failure_count += update.failure_delta;
            if update.last_used_at.is_some() {
                cred.last_used_at = update.last_used_at;
            }
            if update.last_error_at.is_some() {
                cred.last_error_at = update.last_error_at;
            }
        }
        self.usage_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_proxy_key(&self, key: &str) -> Result<Option<ProxyKeyRecord>, StoreError> {
        Ok(self.proxy_keys.read().await.get(key).cloned())
    }
}
