use crate::execution::model::{LayerSelection, Target};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// 作业 error 字段的上限（字符数）
pub const ERROR_MAX_CHARS: usize = 500;
/// 诊断用载荷快照的上限（字符数）
pub const PAYLOAD_MAX_CHARS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Scheduled,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// 合法的状态流转；recurring 模板停留在 scheduled，不参与流转
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        matches!(
            (from, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| JobError::InvalidRequest(format!("unknown status: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Recurring,
    RecurringInstance,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Once => "once",
            ScheduleType::Recurring => "recurring",
            ScheduleType::RecurringInstance => "recurring_instance",
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "once" => Ok(ScheduleType::Once),
            "recurring" => Ok(ScheduleType::Recurring),
            "recurring_instance" => Ok(ScheduleType::RecurringInstance),
            other => Err(JobError::InvalidRequest(format!(
                "unknown schedule type: {}",
                other
            ))),
        }
    }
}

/// frequency -> 间隔秒数
pub const FREQUENCY_INTERVALS: &[(&str, i64)] = &[
    ("hourly", 3_600),
    ("2_per_day", 43_200),
    ("1_per_day", 86_400),
    ("daily", 86_400),
    ("2_per_week", 302_400),
    ("1_per_week", 604_800),
    ("weekly", 604_800),
    ("monthly", 2_592_000),
];

pub const DEFAULT_INTERVAL_SECS: i64 = 86_400;

pub fn is_known_frequency(frequency: &str) -> bool {
    let f = frequency.trim().to_lowercase();
    FREQUENCY_INTERVALS.iter().any(|(name, _)| *name == f)
}

/// 未识别的频率按 24 小时处理
pub fn interval_secs(frequency: &str) -> i64 {
    let f = frequency.trim().to_lowercase();
    FREQUENCY_INTERVALS
        .iter()
        .find(|(name, _)| *name == f)
        .map(|(_, secs)| *secs)
        .unwrap_or(DEFAULT_INTERVAL_SECS)
}

fn default_true() -> bool {
    true
}

fn default_scraper() -> String {
    "generic".to_string()
}

fn default_layer() -> String {
    "auto".to_string()
}

/// 作业提交时的完整意图，序列化后作为 config_snapshot 落库
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub query: String,
    pub country: String,
    #[serde(default = "default_scraper")]
    pub scraper_type: String,
    #[serde(default = "default_layer")]
    pub proxy_layer: String,
    #[serde(default)]
    pub use_residential_proxy: bool,
    #[serde(default)]
    pub use_scraping_browser: bool,
    #[serde(default)]
    pub use_web_unlocker: bool,
    #[serde(default = "default_true")]
    pub allow_fallback: bool,
    #[serde(default = "default_true")]
    pub verify_origin: bool,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
}

/// 提交作业时的请求体
pub type JobRequest = JobConfig;

impl JobConfig {
    pub fn new(query: &str, country: &str) -> Self {
        Self {
            query: query.to_string(),
            country: country.to_string(),
            scraper_type: default_scraper(),
            proxy_layer: default_layer(),
            use_residential_proxy: false,
            use_scraping_browser: false,
            use_web_unlocker: false,
            allow_fallback: true,
            verify_origin: true,
            frequency: None,
            start_date: None,
        }
    }

    pub fn target(&self) -> Target {
        Target::new(&self.query, &self.scraper_type)
    }

    pub fn selection(&self) -> LayerSelection {
        LayerSelection {
            proxy_layer: self.proxy_layer.clone(),
            use_residential_proxy: self.use_residential_proxy,
            use_scraping_browser: self.use_scraping_browser,
            use_web_unlocker: self.use_web_unlocker,
        }
    }
}

/// 创建时生成一次，之后只读；实例作业原样复用 raw
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    config: Arc<JobConfig>,
    raw: Arc<str>,
}

impl ConfigSnapshot {
    pub fn new(config: JobConfig) -> Result<Self, JobError> {
        let raw = serde_json::to_string(&config)
            .map_err(|e| JobError::InvalidSnapshot(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            raw: Arc::from(raw),
        })
    }

    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let config: JobConfig =
            serde_json::from_str(raw).map_err(|e| JobError::InvalidSnapshot(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            raw: Arc::from(raw),
        })
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitResponse {
    pub job_id: i32,
    pub status: JobStatus,
    pub next_run_at: Option<i64>,
}

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("job {0} not found")]
    NotFound(i32),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid config snapshot: {0}")]
    InvalidSnapshot(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub active_schedules: usize,
    pub total_cost_usd: f64,
}

/// 按字符截断，避免切到多字节字符中间
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

pub fn truncate_error(msg: &str) -> String {
    truncate_chars(msg, ERROR_MAX_CHARS)
}
