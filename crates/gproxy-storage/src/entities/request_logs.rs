use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub request_id: String,
    pub client_request_id: Option<String>,
    pub credential_id: Option<i64>,
    pub proxy_key_id: Option<i64>,
    pub user_id: Option<i64>,
    pub format: String,
    pub model: Option<String>,
    pub is_stream: bool,
    pub request_snapshot: Json,
    pub response_snapshot: Option<Json>,
    pub error: Option<Json>,
    pub success: bool,
    pub duration_ms: i64,
    pub attempts: i32,
    pub upstream_status: Option<i32>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub usage_model: Option<String>,
    pub upstream_response_id: Option<String>,
    pub usage_raw: Option<Json>,
    pub attempt_log: Json,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "credential_id", to = "id")]
    pub credential: HasOne<super::credentials::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
