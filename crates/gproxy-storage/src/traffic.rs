use std::collections::HashMap;

use async_trait::async_trait;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Expr, ExprTrait, OnConflict};
use sea_orm::{
    ActiveValue, Condition, Database, DatabaseConnection, DbErr, QueryOrder, QuerySelect, Schema,
    TransactionTrait,
};
use time::OffsetDateTime;
use tracing::debug;

use gproxy_provider_core::{
    CallerScope, Credential, CredentialUsageUpdate, HistoryEntry, KeyStore, ProxyKeyRecord,
    RequestLog, StoreError,
};

use crate::entities;

/// [`KeyStore`] backed by a relational database through sea-orm.
#[derive(Clone)]
pub struct TrafficStorage {
    db: DatabaseConnection,
}

impl TrafficStorage {
    pub async fn connect(database_url: &str) -> Result<Self, DbErr> {
        let db = Database::connect(database_url).await?;
        Ok(Self { db })
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Credentials)
            .register(entities::ProxyKeys)
            .register(entities::RequestLogs)
            .sync(&self.db)
            .await
    }

    /// Inserts the credential unless one with the same secret already exists.
    pub async fn ensure_credential(
        &self,
        secret: &str,
        label: Option<String>,
        owner_id: Option<i64>,
    ) -> Result<i64, DbErr> {
        use entities::credentials::Column;

        if let Some(existing) = entities::Credentials::find()
            .filter(Column::Secret.eq(secret))
            .one(&self.db)
            .await?
        {
            return Ok(existing.id);
        }

        let active = entities::credentials::ActiveModel {
            id: ActiveValue::NotSet,
            secret: ActiveValue::Set(secret.to_string()),
            label: ActiveValue::Set(label),
            active: ActiveValue::Set(true),
            success_count: ActiveValue::Set(0),
            failure_count: ActiveValue::Set(0),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            last_used_at: ActiveValue::Set(None),
            last_error_at: ActiveValue::Set(None),
            owner_id: ActiveValue::Set(owner_id),
        };
        let result = entities::Credentials::insert(active).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    pub async fn ensure_proxy_key(
        &self,
        key_value: &str,
        user_id: Option<i64>,
        label: Option<String>,
    ) -> Result<(), DbErr> {
        use entities::proxy_keys::Column;

        let active = entities::proxy_keys::ActiveModel {
            id: ActiveValue::NotSet,
            key_value: ActiveValue::Set(key_value.to_string()),
            user_id: ActiveValue::Set(user_id),
            label: ActiveValue::Set(label),
            enabled: ActiveValue::Set(true),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };

        entities::ProxyKeys::insert(active)
            .on_conflict(
                OnConflict::column(Column::KeyValue)
                    .update_columns([Column::UserId, Column::Label, Column::Enabled])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KeyStore for TrafficStorage {
    async fn active_credentials(&self, scope: &CallerScope) -> Result<Vec<Credential>, StoreError> {
        use entities::credentials::Column;

        let owner = Condition::any()
            .add(Column::OwnerId.is_null())
            .add_option(scope.owner_id.map(|owner_id| Column::OwnerId.eq(owner_id)));
        let rows = entities::Credentials::find()
            .filter(Column::Active.eq(true))
            .filter(owner)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(Credential::from).collect())
    }

    async fn credential_history(
        &self,
        credential_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<HistoryEntry>>, StoreError> {
        use entities::request_logs::Column;

        let mut history: HashMap<i64, Vec<HistoryEntry>> = HashMap::new();
        if credential_ids.is_empty() {
            return Ok(history);
        }

        let rows: Vec<(Option<i64>, OffsetDateTime, bool)> = entities::RequestLogs::find()
            .select_only()
            .column(Column::CredentialId)
            .column(Column::CreatedAt)
            .column(Column::Success)
            .filter(Column::CredentialId.is_in(credential_ids.iter().copied()))
            .order_by_desc(Column::CreatedAt)
            .into_tuple()
            .all(&self.db)
            .await
            .map_err(db_err)?;

        for (credential_id, created_at, success) in rows {
            let Some(credential_id) = credential_id else {
                continue;
            };
            history
                .entry(credential_id)
                .or_default()
                .push(HistoryEntry { created_at, success });
        }
        Ok(history)
    }

    async fn upsert_request_logs(&self, logs: &[RequestLog]) -> Result<(), StoreError> {
        use entities::request_logs::Column;

        if logs.is_empty() {
            return Ok(());
        }
        let models = logs
            .iter()
            .map(request_log_model)
            .collect::<Result<Vec<_>, _>>()?;

        entities::RequestLogs::insert_many(models)
            .on_conflict(
                OnConflict::column(Column::RequestId)
                    .update_columns([
                        Column::ClientRequestId,
                        Column::CredentialId,
                        Column::ProxyKeyId,
                        Column::UserId,
                        Column::Format,
                        Column::Model,
                        Column::IsStream,
                        Column::RequestSnapshot,
                        Column::ResponseSnapshot,
                        Column::Error,
                        Column::Success,
                        Column::DurationMs,
                        Column::Attempts,
                        Column::UpstreamStatus,
                        Column::PromptTokens,
                        Column::CompletionTokens,
                        Column::TotalTokens,
                        Column::UsageModel,
                        Column::UpstreamResponseId,
                        Column::UsageRaw,
                        Column::AttemptLog,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await
            .map_err(db_err)?;
        debug!(event = "request_logs_upserted", count = logs.len());
        Ok(())
    }

    async fn apply_usage_updates(
        &self,
        updates: &[CredentialUsageUpdate],
    ) -> Result<(), StoreError> {
        use entities::credentials::Column;

        if updates.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin().await.map_err(db_err)?;
        for update in updates {
            let mut query = entities::Credentials::update_many()
                .col_expr(
                    Column::SuccessCount,
                    Expr::col(Column::SuccessCount).add(update.success_delta),
                )
                .col_expr(
                    Column::FailureCount,
                    Expr::col(Column::FailureCount).add(update.failure_delta),
                );
            if let Some(at) = update.last_used_at {
                query = query.col_expr(Column::LastUsedAt, Expr::value(at));
            }
            if let Some(at) = update.last_error_at {
                query = query.col_expr(Column::LastErrorAt, Expr::value(at));
            }
            query
                .filter(Column::Id.eq(update.credential_id))
                .exec(&txn)
                .await
                .map_err(db_err)?;
        }
        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn find_proxy_key(&self, key: &str) -> Result<Option<ProxyKeyRecord>, StoreError> {
        use entities::proxy_keys::Column;

        let row = entities::ProxyKeys::find()
            .filter(Column::KeyValue.eq(key))
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(row.map(|row| ProxyKeyRecord {
            id: row.id,
            user_id: row.user_id,
            enabled: row.enabled,
        }))
    }
}

fn db_err(err: DbErr) -> StoreError {
    StoreError::Database(err.to_string())
}

fn request_log_model(log: &RequestLog) -> Result<entities::request_logs::ActiveModel, StoreError> {
    let usage = log.usage.as_ref();
    Ok(entities::request_logs::ActiveModel {
        id: ActiveValue::NotSet,
        request_id: ActiveValue::Set(log.request_id.clone()),
        client_request_id: ActiveValue::Set(log.client_request_id.clone()),
        credential_id: ActiveValue::Set(log.credential_id),
        proxy_key_id: ActiveValue::Set(log.proxy_key_id),
        user_id: ActiveValue::Set(log.user_id),
        format: ActiveValue::Set(log.format.as_str().to_string()),
        model: ActiveValue::Set(log.model.clone()),
        is_stream: ActiveValue::Set(log.stream),
        request_snapshot: ActiveValue::Set(log.request.clone()),
        response_snapshot: ActiveValue::Set(log.response.clone()),
        error: ActiveValue::Set(log.error.clone()),
        success: ActiveValue::Set(log.success),
        duration_ms: ActiveValue::Set(log.duration_ms),
        attempts: ActiveValue::Set(log.attempts),
        upstream_status: ActiveValue::Set(log.upstream_status),
        prompt_tokens: ActiveValue::Set(log.prompt_tokens()),
        completion_tokens: ActiveValue::Set(log.completion_tokens()),
        total_tokens: ActiveValue::Set(log.total_tokens()),
        usage_model: ActiveValue::Set(usage.and_then(|usage| usage.model.clone())),
        upstream_response_id: ActiveValue::Set(usage.and_then(|usage| usage.response_id.clone())),
        usage_raw: ActiveValue::Set(usage.map(|usage| usage.raw.clone())),
        attempt_log: ActiveValue::Set(serde_json::to_value(&log.attempt_log)?),
        created_at: ActiveValue::Set(log.created_at),
    })
}

impl From<entities::credentials::Model> for Credential {
    fn from(row: entities::credentials::Model) -> Self {
        Credential {
            id: row.id,
            secret: row.secret,
            label: row.label,
            active: row.active,
            success_count: row.success_count,
            failure_count: row.failure_count,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
            last_error_at: row.last_error_at,
            owner_id: row.owner_id,
        }
    }
}
