use crate::jobs::model::{ConfigSnapshot, JobError};
use crate::jobs::service::JobService;
use crate::storage::entity::scrape_job;
use crate::storage::repository::JobRepository;
use chrono::Utc;
use log::{error, info};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// 一次 tick 的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub due: usize,
    pub spawned: Vec<i32>,
    pub skipped: usize,
    pub errors: usize,
    pub failed_stale: u64,
}

#[derive(Clone)]
pub struct Scheduler {
    db: Arc<DatabaseConnection>,
    service: JobService,
    interval: Duration,
    stale_grace: Option<Duration>,
}

impl Scheduler {
    pub fn new(db: Arc<DatabaseConnection>, service: JobService, interval: Duration) -> Self {
        Self {
            db,
            service,
            interval,
            stale_grace: None,
        }
    }

    /// 每次 tick 顺带清理超出宽限期的 running 作业
    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = Some(grace);
        self
    }

    /// 常驻轮询；单次 tick 出错只记日志
    pub async fn run(self) {
        info!("调度器启动，间隔 {:?}", self.interval);
        loop {
            let now = Utc::now().timestamp();
            match self.tick(now).await {
                Ok(report) if report.due > 0 => info!(
                    "tick: 到期 {}，派发 {}，跳过 {}，出错 {}",
                    report.due,
                    report.spawned.len(),
                    report.skipped,
                    report.errors
                ),
                Ok(_) => {}
                Err(e) => error!("tick 失败: {}", e),
            }
            sleep(self.interval).await;
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn tick(&self, now: i64) -> Result<TickReport, JobError> {
        let due = JobRepository::due_jobs(&self.db, now).await?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        if let Some(grace) = self.stale_grace {
            match self.service.fail_stale(grace, now).await {
                Ok(n) => report.failed_stale = n,
                Err(e) => {
                    error!("清理超时 running 作业失败: {}", e);
                    report.errors += 1;
                }
            }
        }

        for job in &due {
            // 每个到期作业各自兜底，互不影响
            match self.spawn_one(job, now).await {
                Ok(Some((instance_id, snapshot))) => {
                    info!(
                        "[job {}] 由 recurring #{} 派生，下次运行已前移",
                        instance_id, job.id
                    );
                    self.service.dispatch(instance_id, snapshot);
                    report.spawned.push(instance_id);
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!("[job {}] 调度失败: {}", job.id, e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// 先落库（实例 + 前移）再派发
    async fn spawn_one(
        &self,
        parent: &scrape_job::Model,
        now: i64,
    ) -> Result<Option<(i32, ConfigSnapshot)>, JobError> {
        let snapshot = ConfigSnapshot::parse(&parent.config_snapshot)?;
        let instance = JobRepository::spawn_instance_and_advance(&self.db, parent, now).await?;
        Ok(instance.map(|inst| (inst.id, snapshot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::backend::BackendRegistry;
    use crate::jobs::model::{JobConfig, JobStatus, ScheduleType};
    use crate::jobs::testing::{executor, StaticBackend};
    use crate::proxy::catalog::Layer2Mode;
    use crate::storage::establish_connection;
    use sea_orm::sea_query::Expr;
    use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
    use tokio::sync::mpsc;

    const T0: i64 = 1_700_000_000;
    const WEEK: i64 = 604_800;

    async fn scheduler() -> (Scheduler, Arc<StaticBackend>) {
        let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
        let direct = StaticBackend::new(true);
        let registry = BackendRegistry::new().with(Layer2Mode::Direct, direct.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = JobService::new(db.clone(), executor(registry), tx);
        (Scheduler::new(db, service, Duration::from_secs(60)), direct)
    }

    async fn recurring(s: &Scheduler, frequency: &str, next_run_at: i64) -> scrape_job::Model {
        let mut cfg = JobConfig::new("https://news.example.com", "fr");
        cfg.proxy_layer = "direct".into();
        cfg.frequency = Some(frequency.into());
        JobRepository::create(
            &s.db,
            &ConfigSnapshot::new(cfg).unwrap(),
            ScheduleType::Recurring,
            JobStatus::Scheduled,
            Some(next_run_at),
            T0 - 100,
        )
        .await
        .unwrap()
    }

    async fn wait_instances_done(s: &Scheduler, parent: i32) {
        for _ in 0..200 {
            let all = JobRepository::instances_of(&s.db, parent).await.unwrap();
            if all.iter().all(|j| j.status != "running") {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("instances of {} never finished", parent);
    }

    #[tokio::test]
    async fn weekly_job_spawns_exactly_one_instance() {
        let (s, direct) = scheduler().await;
        let parent = recurring(&s, "weekly", T0).await;

        let report = s.tick(T0 + 1).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.spawned.len(), 1);

        let parent_row = JobRepository::get(&s.db, parent.id).await.unwrap().unwrap();
        assert_eq!(parent_row.next_run_at, Some(T0 + WEEK));
        assert_eq!(parent_row.status, "scheduled");

        // 同一时刻再 tick 一次不会重复派生
        let again = s.tick(T0 + 1).await.unwrap();
        assert_eq!(again.due, 0);

        wait_instances_done(&s, parent.id).await;
        let instances = JobRepository::instances_of(&s.db, parent.id).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, "completed");
        assert_eq!(instances[0].config_snapshot, parent.config_snapshot);
        assert_eq!(direct.calls(), 1);
    }

    #[tokio::test]
    async fn paused_jobs_are_never_due() {
        let (s, _) = scheduler().await;
        let parent = recurring(&s, "hourly", T0 - 10_000).await;
        s.service.pause(parent.id).await.unwrap();

        let report = s.tick(T0).await.unwrap();
        assert_eq!(report.due, 0);
        assert!(JobRepository::instances_of(&s.db, parent.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn lagging_parent_catches_up_one_interval_per_tick() {
        let (s, _) = scheduler().await;
        let parent = recurring(&s, "hourly", T0 - 3 * 3_600).await;

        s.tick(T0).await.unwrap();
        let row = JobRepository::get(&s.db, parent.id).await.unwrap().unwrap();
        assert_eq!(row.next_run_at, Some(T0 - 2 * 3_600));

        s.tick(T0).await.unwrap();
        let row = JobRepository::get(&s.db, parent.id).await.unwrap().unwrap();
        assert_eq!(row.next_run_at, Some(T0 - 3_600));
        wait_instances_done(&s, parent.id).await;
    }

    #[tokio::test]
    async fn broken_snapshot_does_not_block_other_jobs() {
        let (s, _) = scheduler().await;
        let broken = recurring(&s, "daily", T0 - 20).await;
        let healthy = recurring(&s, "daily", T0 - 10).await;
        scrape_job::Entity::update_many()
            .col_expr(scrape_job::Column::ConfigSnapshot, Expr::value("{oops"))
            .filter(scrape_job::Column::Id.eq(broken.id))
            .exec(s.db.as_ref())
            .await
            .unwrap();

        let report = s.tick(T0).await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.spawned.len(), 1);

        let broken_row = JobRepository::get(&s.db, broken.id).await.unwrap().unwrap();
        assert_eq!(broken_row.next_run_at, Some(T0 - 20));
        wait_instances_done(&s, healthy.id).await;
    }

    #[tokio::test]
    async fn tick_sweeps_runs_past_the_grace_window() {
        let (s, _) = scheduler().await;
        let s = s.with_stale_grace(Duration::from_secs(1800));
        let hung = JobRepository::create(
            &s.db,
            &ConfigSnapshot::new(JobConfig::new("q", "fr")).unwrap(),
            ScheduleType::Once,
            JobStatus::Pending,
            None,
            T0 - 7200,
        )
        .await
        .unwrap();
        JobRepository::transition(&s.db, hung.id, JobStatus::Pending, JobStatus::Running, T0 - 7200)
            .await
            .unwrap();

        let report = s.tick(T0).await.unwrap();
        assert_eq!(report.failed_stale, 1);
        assert_eq!(report.due, 0);
        let row = JobRepository::get(&s.db, hung.id).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
    }

    #[tokio::test]
    async fn once_jobs_are_ignored_by_tick() {
        let (s, direct) = scheduler().await;
        JobRepository::create(
            &s.db,
            &ConfigSnapshot::new(JobConfig::new("q", "fr")).unwrap(),
            ScheduleType::Once,
            JobStatus::Pending,
            Some(T0 - 1),
            T0 - 1,
        )
        .await
        .unwrap();
        let report = s.tick(T0).await.unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(direct.calls(), 0);
    }
}
