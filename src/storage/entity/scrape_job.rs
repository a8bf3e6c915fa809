use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "scrape_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub parent_job_id: Option<i32>,
    pub query: String,
    pub country: String,
    pub scraper_type: String,
    pub proxy_layer_requested: String, // auto / direct / residential / unlocker / browser
    #[sea_orm(column_type = "Text")]
    pub config_snapshot: String, // JobConfig JSON，只写一次
    pub schedule_type: String, // once / recurring / recurring_instance
    pub frequency: Option<String>,
    pub next_run_at: Option<i64>,
    pub is_active: bool,
    pub status: String, // pending / scheduled / running / completed / failed
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub layer2_mode_used: Option<String>,
    pub attempts: i32,
    pub fallback_used: bool,
    pub estimated_cost_usd: f64,
    pub content_length: i64,
    pub origin_ip: Option<String>,
    pub origin_verified: Option<bool>,
    pub origin_warning: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub payload_snapshot: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
