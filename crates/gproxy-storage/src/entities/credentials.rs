use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub secret: String,
    pub label: Option<String>,
    pub active: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub last_error_at: Option<OffsetDateTime>,
    pub owner_id: Option<i64>,
    #[sea_orm(has_many)]
    pub request_logs: HasMany<super::request_logs::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
