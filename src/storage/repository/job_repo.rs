use crate::jobs::model::{interval_secs, ConfigSnapshot, JobStats, JobStatus, ScheduleType};
use crate::storage::entity::scrape_job::{self, ActiveModel as ScrapeJobActiveModel, Entity as ScrapeJob};
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};

/// 执行结束后写回的遥测字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFinish {
    pub success: bool,
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub layer2_mode_used: Option<String>,
    pub attempts: i32,
    pub fallback_used: bool,
    pub estimated_cost_usd: f64,
    pub content_length: i64,
    pub origin_ip: Option<String>,
    pub origin_verified: Option<bool>,
    pub origin_warning: Option<String>,
    pub payload_snapshot: Option<String>,
}

pub struct JobRepository;

impl JobRepository {
    /// 新建 once 作业或 recurring 模板；frequency / next_run_at 只属于 recurring
    pub async fn create(
        db: &DatabaseConnection,
        snapshot: &ConfigSnapshot,
        schedule: ScheduleType,
        status: JobStatus,
        next_run_at: Option<i64>,
        now: i64,
    ) -> Result<scrape_job::Model, DbErr> {
        let cfg = snapshot.config();
        let recurring = schedule == ScheduleType::Recurring;
        let active_model = ScrapeJobActiveModel {
            parent_job_id: Set(None),
            query: Set(cfg.query.clone()),
            country: Set(cfg.country.clone()),
            scraper_type: Set(cfg.scraper_type.clone()),
            proxy_layer_requested: Set(cfg.proxy_layer.clone()),
            config_snapshot: Set(snapshot.raw().to_string()),
            schedule_type: Set(schedule.as_str().to_string()),
            frequency: Set(if recurring { cfg.frequency.clone() } else { None }),
            next_run_at: Set(if recurring { next_run_at } else { None }),
            is_active: Set(true),
            status: Set(status.as_str().to_string()),
            created_at: Set(now),
            attempts: Set(0),
            fallback_used: Set(false),
            estimated_cost_usd: Set(0.0),
            content_length: Set(0),
            ..Default::default()
        };
        active_model.insert(db).await
    }

    pub async fn get(db: &DatabaseConnection, id: i32) -> Result<Option<scrape_job::Model>, DbErr> {
        ScrapeJob::find_by_id(id).one(db).await
    }

    pub async fn list(
        db: &DatabaseConnection,
        status: Option<JobStatus>,
        limit: u64,
    ) -> Result<Vec<scrape_job::Model>, DbErr> {
        let mut query = ScrapeJob::find();
        if let Some(st) = status {
            query = query.filter(scrape_job::Column::Status.eq(st.as_str()));
        }
        query
            .order_by_desc(scrape_job::Column::Id)
            .limit(limit)
            .all(db)
            .await
    }

    pub async fn instances_of(
        db: &DatabaseConnection,
        parent_id: i32,
    ) -> Result<Vec<scrape_job::Model>, DbErr> {
        ScrapeJob::find()
            .filter(scrape_job::Column::ParentJobId.eq(parent_id))
            .order_by_asc(scrape_job::Column::Id)
            .all(db)
            .await
    }

    /// 到期的 recurring 模板，按 next_run_at、id 排序
    pub async fn due_jobs(
        db: &DatabaseConnection,
        now: i64,
    ) -> Result<Vec<scrape_job::Model>, DbErr> {
        ScrapeJob::find()
            .filter(scrape_job::Column::ScheduleType.eq(ScheduleType::Recurring.as_str()))
            .filter(scrape_job::Column::Frequency.is_not_null())
            .filter(scrape_job::Column::IsActive.eq(true))
            .filter(scrape_job::Column::NextRunAt.is_not_null())
            .filter(scrape_job::Column::NextRunAt.lte(now))
            .order_by_asc(scrape_job::Column::NextRunAt)
            .order_by_asc(scrape_job::Column::Id)
            .all(db)
            .await
    }

    /// 同一事务内：模板 next_run_at 前移一个周期，并插入 running 状态的实例。
    /// 模板在读取后被改动（暂停或已被推进）时返回 None。
    pub async fn spawn_instance_and_advance(
        db: &DatabaseConnection,
        parent: &scrape_job::Model,
        now: i64,
    ) -> Result<Option<scrape_job::Model>, DbErr> {
        let (Some(frequency), Some(due_at)) = (parent.frequency.as_deref(), parent.next_run_at)
        else {
            return Ok(None);
        };
        let next = due_at + interval_secs(frequency);

        let txn = db.begin().await?;

        let advanced = ScrapeJob::update_many()
            .col_expr(scrape_job::Column::NextRunAt, Expr::value(next))
            .filter(scrape_job::Column::Id.eq(parent.id))
            .filter(scrape_job::Column::NextRunAt.eq(due_at))
            .filter(scrape_job::Column::IsActive.eq(true))
            .exec(&txn)
            .await?;
        if advanced.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(None);
        }

        let instance = ScrapeJobActiveModel {
            parent_job_id: Set(Some(parent.id)),
            query: Set(parent.query.clone()),
            country: Set(parent.country.clone()),
            scraper_type: Set(parent.scraper_type.clone()),
            proxy_layer_requested: Set(parent.proxy_layer_requested.clone()),
            config_snapshot: Set(parent.config_snapshot.clone()),
            schedule_type: Set(ScheduleType::RecurringInstance.as_str().to_string()),
            frequency: Set(None),
            next_run_at: Set(None),
            is_active: Set(true),
            status: Set(JobStatus::Running.as_str().to_string()),
            created_at: Set(now),
            started_at: Set(Some(now)),
            attempts: Set(0),
            fallback_used: Set(false),
            estimated_cost_usd: Set(0.0),
            content_length: Set(0),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok(Some(instance))
    }

    /// 条件更新（WHERE status = from），重复调用不会产生副作用
    pub async fn transition(
        db: &DatabaseConnection,
        id: i32,
        from: JobStatus,
        to: JobStatus,
        now: i64,
    ) -> Result<bool, DbErr> {
        if !JobStatus::can_transition(from, to) {
            return Ok(false);
        }
        let mut update = ScrapeJob::update_many()
            .col_expr(scrape_job::Column::Status, Expr::value(to.as_str()))
            .filter(scrape_job::Column::Id.eq(id))
            .filter(scrape_job::Column::Status.eq(from.as_str()));
        if to == JobStatus::Running {
            update = update.col_expr(scrape_job::Column::StartedAt, Expr::value(now));
        }
        if to.is_terminal() {
            update = update.col_expr(scrape_job::Column::CompletedAt, Expr::value(now));
        }
        let res = update.exec(db).await?;
        Ok(res.rows_affected == 1)
    }

    /// running -> completed | failed，同时写入遥测
    pub async fn finish(
        db: &DatabaseConnection,
        id: i32,
        finish: &JobFinish,
        now: i64,
    ) -> Result<bool, DbErr> {
        let status = if finish.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let res = ScrapeJob::update_many()
            .col_expr(scrape_job::Column::Status, Expr::value(status.as_str()))
            .col_expr(scrape_job::Column::Error, Expr::value(finish.error.clone()))
            .col_expr(scrape_job::Column::CompletedAt, Expr::value(now))
            .col_expr(
                scrape_job::Column::DurationSeconds,
                Expr::value(finish.duration_seconds),
            )
            .col_expr(
                scrape_job::Column::Layer2ModeUsed,
                Expr::value(finish.layer2_mode_used.clone()),
            )
            .col_expr(scrape_job::Column::Attempts, Expr::value(finish.attempts))
            .col_expr(
                scrape_job::Column::FallbackUsed,
                Expr::value(finish.fallback_used),
            )
            .col_expr(
                scrape_job::Column::EstimatedCostUsd,
                Expr::value(finish.estimated_cost_usd),
            )
            .col_expr(
                scrape_job::Column::ContentLength,
                Expr::value(finish.content_length),
            )
            .col_expr(scrape_job::Column::OriginIp, Expr::value(finish.origin_ip.clone()))
            .col_expr(
                scrape_job::Column::OriginVerified,
                Expr::value(finish.origin_verified),
            )
            .col_expr(
                scrape_job::Column::OriginWarning,
                Expr::value(finish.origin_warning.clone()),
            )
            .col_expr(
                scrape_job::Column::PayloadSnapshot,
                Expr::value(finish.payload_snapshot.clone()),
            )
            .filter(scrape_job::Column::Id.eq(id))
            .filter(scrape_job::Column::Status.eq(JobStatus::Running.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 作业开始执行前就失败（例如快照损坏），直接落为 failed
    pub async fn fail_unstarted(
        db: &DatabaseConnection,
        id: i32,
        error: &str,
        now: i64,
    ) -> Result<bool, DbErr> {
        let res = ScrapeJob::update_many()
            .col_expr(scrape_job::Column::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(scrape_job::Column::Error, Expr::value(error.to_string()))
            .col_expr(scrape_job::Column::CompletedAt, Expr::value(now))
            .filter(scrape_job::Column::Id.eq(id))
            .filter(
                scrape_job::Column::Status
                    .eq(JobStatus::Pending.as_str())
                    .or(scrape_job::Column::Status.eq(JobStatus::Running.as_str())),
            )
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 只对 recurring 模板生效
    pub async fn set_active(db: &DatabaseConnection, id: i32, active: bool) -> Result<bool, DbErr> {
        let res = ScrapeJob::update_many()
            .col_expr(scrape_job::Column::IsActive, Expr::value(active))
            .filter(scrape_job::Column::Id.eq(id))
            .filter(scrape_job::Column::ScheduleType.eq(ScheduleType::Recurring.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 硬删除；删除模板时连同其实例一起删除
    pub async fn delete(db: &DatabaseConnection, id: i32) -> Result<u64, DbErr> {
        let txn = db.begin().await?;
        let children = ScrapeJob::delete_many()
            .filter(scrape_job::Column::ParentJobId.eq(id))
            .exec(&txn)
            .await?;
        let own = ScrapeJob::delete_by_id(id).exec(&txn).await?;
        if own.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(0);
        }
        txn.commit().await?;
        Ok(own.rows_affected + children.rows_affected)
    }

    /// 把早于 cutoff 开始、仍处于 running 的作业标记为 failed
    pub async fn fail_stale_running(
        db: &DatabaseConnection,
        cutoff: i64,
        error: &str,
        now: i64,
    ) -> Result<u64, DbErr> {
        let started_before = Condition::any()
            .add(scrape_job::Column::StartedAt.lt(cutoff))
            .add(
                Condition::all()
                    .add(scrape_job::Column::StartedAt.is_null())
                    .add(scrape_job::Column::CreatedAt.lt(cutoff)),
            );
        let res = ScrapeJob::update_many()
            .col_expr(scrape_job::Column::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(scrape_job::Column::Error, Expr::value(error.to_string()))
            .col_expr(scrape_job::Column::CompletedAt, Expr::value(now))
            .filter(scrape_job::Column::Status.eq(JobStatus::Running.as_str()))
            .filter(started_before)
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn pending_once(db: &DatabaseConnection) -> Result<Vec<scrape_job::Model>, DbErr> {
        ScrapeJob::find()
            .filter(scrape_job::Column::Status.eq(JobStatus::Pending.as_str()))
            .filter(scrape_job::Column::ScheduleType.eq(ScheduleType::Once.as_str()))
            .order_by_asc(scrape_job::Column::Id)
            .all(db)
            .await
    }

    pub async fn get_stats(db: &DatabaseConnection) -> Result<JobStats, DbErr> {
        let count_status = |st: JobStatus| {
            ScrapeJob::find()
                .filter(scrape_job::Column::Status.eq(st.as_str()))
                .count(db)
        };

        let total = ScrapeJob::find().count(db).await? as usize;
        let pending = count_status(JobStatus::Pending).await? as usize;
        let scheduled = count_status(JobStatus::Scheduled).await? as usize;
        let running = count_status(JobStatus::Running).await? as usize;
        let completed = count_status(JobStatus::Completed).await? as usize;
        let failed = count_status(JobStatus::Failed).await? as usize;
        let active_schedules = ScrapeJob::find()
            .filter(scrape_job::Column::ScheduleType.eq(ScheduleType::Recurring.as_str()))
            .filter(scrape_job::Column::IsActive.eq(true))
            .count(db)
            .await? as usize;

        let total_cost_usd = ScrapeJob::find()
            .select_only()
            .column_as(scrape_job::Column::EstimatedCostUsd.sum(), "total_cost")
            .into_tuple::<Option<f64>>()
            .one(db)
            .await?
            .flatten()
            .unwrap_or(0.0);

        Ok(JobStats {
            total,
            pending,
            scheduled,
            running,
            completed,
            failed,
            active_schedules,
            total_cost_usd,
        })
    }
}
