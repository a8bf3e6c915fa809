use crate::app_state::AppEvent;
use crate::execution::fallback::FallbackExecutor;
use crate::execution::model::{ExecutionContext, ExecutionRequest, ExecutionResult};
use crate::jobs::model::{
    is_known_frequency, truncate_chars, truncate_error, ConfigSnapshot, JobError, JobRequest,
    JobStats, JobStatus, ScheduleType, SubmitResponse, PAYLOAD_MAX_CHARS,
};
use crate::proxy::resolver::normalize_country;
use crate::storage::entity::scrape_job;
use crate::storage::repository::{JobFinish, JobRepository};
use chrono::Utc;
use log::{error, info, warn};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const INTERRUPTED_ERROR: &str = "interrupted: process restarted before completion";
pub const STALE_ERROR: &str = "stale: still running after the grace window";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub failed_stale: u64,
    pub redispatched: usize,
}

#[derive(Clone)]
pub struct JobService {
    db: Arc<DatabaseConnection>,
    executor: Arc<FallbackExecutor>,
    evt_tx: mpsc::UnboundedSender<AppEvent>,
    default_country: Option<String>,
    verify_origin: bool,
}

impl JobService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        executor: Arc<FallbackExecutor>,
        evt_tx: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            db,
            executor,
            evt_tx,
            default_country: None,
            verify_origin: true,
        }
    }

    pub fn with_default_country(mut self, country: Option<String>) -> Self {
        self.default_country = country.map(|c| normalize_country(&c));
        self
    }

    /// 全局开关；关闭后忽略作业自身的 verify_origin
    pub fn with_origin_verification(mut self, enabled: bool) -> Self {
        self.verify_origin = enabled;
        self
    }

    pub fn executor(&self) -> &FallbackExecutor {
        &self.executor
    }

    pub async fn submit(&self, mut req: JobRequest) -> Result<SubmitResponse, JobError> {
        req.query = req.query.trim().to_string();
        if req.query.is_empty() {
            return Err(JobError::InvalidRequest("query must not be empty".to_string()));
        }
        req.scraper_type = req.scraper_type.trim().to_lowercase();
        req.country = self.effective_country(&req.country)?;

        if let Some(freq) = req.frequency.as_mut() {
            *freq = freq.trim().to_lowercase();
            if !is_known_frequency(freq) {
                warn!("未识别的频率 {}，按 24 小时执行", freq);
            }
        }
        req.frequency = req.frequency.filter(|f| !f.is_empty());

        let now = Utc::now().timestamp();
        let recurring = req.frequency.is_some();
        let next_run_at = if recurring {
            Some(req.start_date.map(|d| d.timestamp()).unwrap_or(now))
        } else {
            None
        };

        let snapshot = ConfigSnapshot::new(req)?;
        let (schedule, status) = if recurring {
            (ScheduleType::Recurring, JobStatus::Scheduled)
        } else {
            (ScheduleType::Once, JobStatus::Pending)
        };
        let job =
            JobRepository::create(&self.db, &snapshot, schedule, status, next_run_at, now).await?;
        info!(
            "[job {}] 已创建 {} 作业: {} [{}]",
            job.id,
            schedule,
            snapshot.config().query,
            snapshot.config().country
        );

        if !recurring {
            self.dispatch(job.id, snapshot);
        }

        Ok(SubmitResponse {
            job_id: job.id,
            status,
            next_run_at: job.next_run_at,
        })
    }

    /// 不支持的国家在有 DEFAULT_COUNTRY 时替换并告警，否则拒绝
    fn effective_country(&self, requested: &str) -> Result<String, JobError> {
        let cc = normalize_country(requested);
        let resolver = self.executor.resolver();
        if resolver.is_supported(&cc) {
            return Ok(cc);
        }
        match &self.default_country {
            Some(dc) if resolver.is_supported(dc) => {
                warn!("国家 {:?} 不受支持，改用默认国家 {}", cc, dc);
                let _ = self.evt_tx.send(AppEvent::Log(format!(
                    "⚠ 国家 {:?} 不受支持，改用默认国家 {}",
                    cc, dc
                )));
                Ok(dc.clone())
            }
            _ => Err(JobError::InvalidRequest(format!(
                "unsupported country: {:?}",
                cc
            ))),
        }
    }

    /// 启动独立任务执行作业，不等待结果
    pub fn dispatch(&self, job_id: i32, snapshot: ConfigSnapshot) {
        let svc = self.clone();
        tokio::spawn(async move {
            if let Err(e) = svc.run_job(job_id, snapshot).await {
                error!("[job {}] 执行出错: {}", job_id, e);
                let _ = svc
                    .evt_tx
                    .send(AppEvent::Error(format!("作业 #{} 执行出错: {}", job_id, e)));
            }
        });
    }

    pub async fn run_job(&self, job_id: i32, snapshot: ConfigSnapshot) -> Result<(), JobError> {
        let ctx = ExecutionContext::for_job(job_id);
        let now = Utc::now().timestamp();

        // once 作业在这里认领；recurring 实例创建时已经是 running
        let claimed =
            JobRepository::transition(&self.db, job_id, JobStatus::Pending, JobStatus::Running, now)
                .await?;
        if !claimed {
            let job = JobRepository::get(&self.db, job_id)
                .await?
                .ok_or(JobError::NotFound(job_id))?;
            let is_instance = job.schedule_type == ScheduleType::RecurringInstance.as_str();
            if !(is_instance && job.status == JobStatus::Running.as_str()) {
                info!("{} 状态为 {}，跳过执行", ctx, job.status);
                return Ok(());
            }
        }

        let cfg = snapshot.config();
        let req = ExecutionRequest {
            target: cfg.target(),
            country: cfg.country.clone(),
            selection: cfg.selection(),
            allow_fallback: cfg.allow_fallback,
            verify_origin: cfg.verify_origin && self.verify_origin,
        };

        let started = Instant::now();
        let (finish, summary) = match self.executor.execute(&req, &ctx).await {
            Ok(result) => {
                let summary = summarize(&result);
                (finish_from_result(result), summary)
            }
            Err(e) => {
                warn!("{} 作业失败: {}", ctx, e);
                let finish = JobFinish {
                    success: false,
                    error: Some(truncate_error(&e.to_string())),
                    duration_seconds: started.elapsed().as_secs_f64(),
                    ..Default::default()
                };
                (finish, e.to_string())
            }
        };

        let success = finish.success;
        let written =
            JobRepository::finish(&self.db, job_id, &finish, Utc::now().timestamp()).await?;
        if !written {
            warn!("{} 结束时作业已不在 running 状态（可能已删除）", ctx);
        }

        let _ = self.evt_tx.send(AppEvent::JobFinished {
            job_id,
            success,
            summary,
        });
        Ok(())
    }

    pub async fn pause(&self, job_id: i32) -> Result<(), JobError> {
        self.set_active(job_id, false).await
    }

    pub async fn resume(&self, job_id: i32) -> Result<(), JobError> {
        self.set_active(job_id, true).await
    }

    async fn set_active(&self, job_id: i32, active: bool) -> Result<(), JobError> {
        if JobRepository::set_active(&self.db, job_id, active).await? {
            info!(
                "[job {}] {}",
                job_id,
                if active { "已恢复调度" } else { "已暂停调度" }
            );
            return Ok(());
        }
        match JobRepository::get(&self.db, job_id).await? {
            None => Err(JobError::NotFound(job_id)),
            Some(job) => Err(JobError::InvalidRequest(format!(
                "job {} is {}, only recurring jobs can be paused or resumed",
                job_id, job.schedule_type
            ))),
        }
    }

    pub async fn delete(&self, job_id: i32) -> Result<u64, JobError> {
        let removed = JobRepository::delete(&self.db, job_id).await?;
        if removed == 0 {
            return Err(JobError::NotFound(job_id));
        }
        info!("[job {}] 已删除（共 {} 行）", job_id, removed);
        Ok(removed)
    }

    pub async fn get(&self, job_id: i32) -> Result<scrape_job::Model, JobError> {
        JobRepository::get(&self.db, job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: u64,
    ) -> Result<Vec<scrape_job::Model>, JobError> {
        Ok(JobRepository::list(&self.db, status, limit).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, JobError> {
        Ok(JobRepository::get_stats(&self.db).await?)
    }

    /// 启动恢复：单进程下启动时残留的 running 都已成孤儿，一律判失败；
    /// pending 的 once 作业重新派发。recurring 模板的 next_run_at 不回拨。
    pub async fn recover(&self) -> Result<RecoveryReport, JobError> {
        let now = Utc::now().timestamp();
        let failed_stale =
            JobRepository::fail_stale_running(&self.db, now + 1, INTERRUPTED_ERROR, now).await?;
        if failed_stale > 0 {
            warn!("恢复: {} 个中断的 running 作业已标记为 failed", failed_stale);
        }

        let mut redispatched = 0;
        for job in JobRepository::pending_once(&self.db).await? {
            match ConfigSnapshot::parse(&job.config_snapshot) {
                Ok(snapshot) => {
                    self.dispatch(job.id, snapshot);
                    redispatched += 1;
                }
                Err(e) => {
                    error!("[job {}] 快照无法解析: {}", job.id, e);
                    JobRepository::fail_unstarted(
                        &self.db,
                        job.id,
                        &truncate_error(&e.to_string()),
                        now,
                    )
                    .await?;
                }
            }
        }
        if redispatched > 0 {
            info!("恢复: 重新派发 {} 个 pending 作业", redispatched);
        }

        Ok(RecoveryReport {
            failed_stale,
            redispatched,
        })
    }

    /// 运行中超出宽限期仍未写回的作业判失败
    pub async fn fail_stale(&self, grace: Duration, now: i64) -> Result<u64, JobError> {
        let cutoff = now - grace.as_secs() as i64;
        let n = JobRepository::fail_stale_running(&self.db, cutoff, STALE_ERROR, now).await?;
        if n > 0 {
            warn!("{} 个 running 作业超出宽限期 {:?}，已标记为 failed", n, grace);
        }
        Ok(n)
    }
}

fn summarize(result: &ExecutionResult) -> String {
    let mut s = format!(
        "mode={} attempts={} fallback={} cost=${:.4} {:.2}s",
        result.mode_used,
        result.attempts,
        result.fallback_used,
        result.estimated_cost_usd,
        result.duration.as_secs_f64()
    );
    if let Some(e) = &result.error {
        s.push_str(&format!(" error={}", e));
    }
    s
}

fn finish_from_result(result: ExecutionResult) -> JobFinish {
    let warning = if result.warnings.is_empty() {
        None
    } else {
        Some(truncate_error(&result.warnings.join("; ")))
    };
    JobFinish {
        success: result.success,
        error: result.error.as_deref().map(truncate_error),
        duration_seconds: result.duration.as_secs_f64(),
        layer2_mode_used: Some(result.mode_used.as_str().to_string()),
        attempts: result.attempts as i32,
        fallback_used: result.fallback_used,
        estimated_cost_usd: result.estimated_cost_usd,
        content_length: result.content_length as i64,
        origin_ip: result
            .origin
            .as_ref()
            .map(|o| o.ip.clone())
            .filter(|ip| !ip.is_empty()),
        origin_verified: result.origin.as_ref().map(|o| o.verified),
        origin_warning: warning,
        payload_snapshot: result
            .payload
            .as_deref()
            .map(|p| truncate_chars(p, PAYLOAD_MAX_CHARS)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::backend::BackendRegistry;
    use crate::jobs::model::JobConfig;
    use crate::jobs::testing::{escalating_registry, executor, StaticBackend};
    use crate::proxy::catalog::Layer2Mode;
    use crate::storage::establish_connection;

    async fn service(registry: BackendRegistry) -> JobService {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        JobService::new(Arc::new(db), executor(registry), tx)
    }

    async fn wait_terminal(svc: &JobService, id: i32) -> scrape_job::Model {
        for _ in 0..200 {
            let job = svc.get(id).await.unwrap();
            if job.status == "completed" || job.status == "failed" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn once_job_runs_to_completion_with_fallback() {
        let svc = service(escalating_registry()).await;
        let mut req = JobConfig::new("https://shop.example.com/item/1", "IT");
        req.proxy_layer = "direct".into();

        let resp = svc.submit(req).await.unwrap();
        assert_eq!(resp.status, JobStatus::Pending);
        assert_eq!(resp.next_run_at, None);

        let job = wait_terminal(&svc, resp.job_id).await;
        assert_eq!(job.status, "completed");
        assert_eq!(job.country, "it");
        assert_eq!(job.attempts, 3);
        assert_eq!(job.layer2_mode_used.as_deref(), Some("unlocker"));
        assert!(job.fallback_used);
        assert_eq!(job.origin_verified, Some(true));
        assert_eq!(job.origin_ip.as_deref(), Some("203.0.113.7"));
        assert!(job.payload_snapshot.unwrap().contains("unlocker"));
        assert!(job.estimated_cost_usd > 0.0);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn no_fallback_failure_is_recorded() {
        let svc = service(escalating_registry()).await;
        let mut req = JobConfig::new("https://shop.example.com/item/2", "de");
        req.proxy_layer = "direct".into();
        req.allow_fallback = false;

        let resp = svc.submit(req).await.unwrap();
        let job = wait_terminal(&svc, resp.job_id).await;
        assert_eq!(job.status, "failed");
        assert_eq!(job.attempts, 1);
        assert!(!job.fallback_used);
        assert_eq!(job.error.as_deref(), Some("direct failed: direct blocked"));
    }

    #[tokio::test]
    async fn recurring_submit_is_scheduled_not_run() {
        let direct = StaticBackend::new(true);
        let svc = service(BackendRegistry::new().with(Layer2Mode::Direct, direct.clone())).await;
        let start = chrono::DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut req = JobConfig::new("espresso", "fr");
        req.frequency = Some(" Weekly ".into());
        req.start_date = Some(start);

        let resp = svc.submit(req).await.unwrap();
        assert_eq!(resp.status, JobStatus::Scheduled);
        assert_eq!(resp.next_run_at, Some(start.timestamp()));

        let job = svc.get(resp.job_id).await.unwrap();
        assert_eq!(job.frequency.as_deref(), Some("weekly"));
        assert_eq!(job.schedule_type, "recurring");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(direct.calls(), 0);
    }

    #[tokio::test]
    async fn unsupported_country_is_rejected_or_substituted() {
        let svc = service(escalating_registry()).await;
        let err = svc.submit(JobConfig::new("q", "jp")).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));

        let svc = svc.with_default_country(Some("GB".into()));
        let mut req = JobConfig::new("q", "jp");
        req.frequency = Some("daily".into());
        let resp = svc.submit(req).await.unwrap();
        assert_eq!(svc.get(resp.job_id).await.unwrap().country, "uk");
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let svc = service(escalating_registry()).await;
        assert!(matches!(
            svc.submit(JobConfig::new("   ", "fr")).await,
            Err(JobError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn pause_resume_only_for_recurring() {
        let svc = service(BackendRegistry::new()).await;
        let mut req = JobConfig::new("q", "se");
        req.frequency = Some("hourly".into());
        let id = svc.submit(req).await.unwrap().job_id;

        svc.pause(id).await.unwrap();
        assert!(!svc.get(id).await.unwrap().is_active);
        svc.resume(id).await.unwrap();
        assert!(svc.get(id).await.unwrap().is_active);

        let once = svc.submit(JobConfig::new("q", "se")).await.unwrap().job_id;
        assert!(matches!(svc.pause(once).await, Err(JobError::InvalidRequest(_))));
        assert!(matches!(svc.pause(9999).await, Err(JobError::NotFound(9999))));
    }

    #[tokio::test]
    async fn delete_missing_job_is_not_found() {
        let svc = service(BackendRegistry::new()).await;
        assert!(matches!(svc.delete(42).await, Err(JobError::NotFound(42))));
    }

    #[tokio::test]
    async fn recover_fails_stale_and_redispatches_pending() {
        let direct = StaticBackend::new(true);
        let svc = service(BackendRegistry::new().with(Layer2Mode::Direct, direct.clone())).await;
        let now = Utc::now().timestamp();

        let stale = JobRepository::create(
            &svc.db,
            &ConfigSnapshot::new(JobConfig::new("https://a.example", "fr")).unwrap(),
            ScheduleType::Once,
            JobStatus::Pending,
            None,
            now - 7200,
        )
        .await
        .unwrap();
        JobRepository::transition(&svc.db, stale.id, JobStatus::Pending, JobStatus::Running, now - 7200)
            .await
            .unwrap();
        let pending = JobRepository::create(
            &svc.db,
            &ConfigSnapshot::new(JobConfig::new("https://b.example", "fr")).unwrap(),
            ScheduleType::Once,
            JobStatus::Pending,
            None,
            now - 60,
        )
        .await
        .unwrap();

        let report = svc.recover().await.unwrap();
        assert_eq!(report.failed_stale, 1);
        assert_eq!(report.redispatched, 1);

        let stale = svc.get(stale.id).await.unwrap();
        assert_eq!(stale.status, "failed");
        assert_eq!(stale.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert_eq!(wait_terminal(&svc, pending.id).await.status, "completed");
        assert_eq!(direct.calls(), 1);
    }

    #[tokio::test]
    async fn recover_fails_recently_started_runs_too() {
        let direct = StaticBackend::new(true);
        let svc = service(BackendRegistry::new().with(Layer2Mode::Direct, direct.clone())).await;
        let now = Utc::now().timestamp();

        let claimed = JobRepository::create(
            &svc.db,
            &ConfigSnapshot::new(JobConfig::new("https://c.example", "fr")).unwrap(),
            ScheduleType::Once,
            JobStatus::Pending,
            None,
            now - 60,
        )
        .await
        .unwrap();
        JobRepository::transition(&svc.db, claimed.id, JobStatus::Pending, JobStatus::Running, now - 60)
            .await
            .unwrap();

        let report = svc.recover().await.unwrap();
        assert_eq!(report.failed_stale, 1);
        assert_eq!(report.redispatched, 0);

        let job = svc.get(claimed.id).await.unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert_eq!(direct.calls(), 0);
    }

    #[tokio::test]
    async fn fail_stale_respects_grace_window() {
        let svc = service(escalating_registry()).await;
        let now = Utc::now().timestamp();
        let mut ids = Vec::new();
        for started in [now - 7200, now - 60] {
            let job = JobRepository::create(
                &svc.db,
                &ConfigSnapshot::new(JobConfig::new("q", "fr")).unwrap(),
                ScheduleType::Once,
                JobStatus::Pending,
                None,
                started,
            )
            .await
            .unwrap();
            JobRepository::transition(&svc.db, job.id, JobStatus::Pending, JobStatus::Running, started)
                .await
                .unwrap();
            ids.push(job.id);
        }

        let n = svc.fail_stale(Duration::from_secs(1800), now).await.unwrap();
        assert_eq!(n, 1);
        let old = svc.get(ids[0]).await.unwrap();
        assert_eq!(old.status, "failed");
        assert_eq!(old.error.as_deref(), Some(STALE_ERROR));
        assert_eq!(svc.get(ids[1]).await.unwrap().status, "running");
    }

    #[tokio::test]
    async fn stats_reflect_jobs() {
        let svc = service(escalating_registry()).await;
        let mut req = JobConfig::new("q", "nl");
        req.frequency = Some("daily".into());
        svc.submit(req).await.unwrap();
        let stats = svc.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.active_schedules, 1);
    }
}
