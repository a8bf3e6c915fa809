use crate::jobs::model::JobStats;
use crate::proxy::catalog::LayerInfo;
use crate::storage::entity::scrape_job;
use chrono::{TimeZone, Utc};

#[derive(Debug)]
pub enum AppEvent {
    Log(String),
    Message(String),
    Error(String),
    JobFinished {
        job_id: i32,
        success: bool,
        summary: String,
    },
    Jobs(Vec<scrape_job::Model>),
    Detail(Box<scrape_job::Model>),
    Stats(JobStats),
    Modes(Vec<&'static LayerInfo>),
}

fn fmt_ts(ts: Option<i64>) -> String {
    ts.and_then(|t| Utc.timestamp_opt(t, 0).single())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn job_line(job: &scrape_job::Model) -> String {
    let schedule = match (&job.frequency, job.is_active) {
        (Some(f), true) => format!("{} next={}", f, fmt_ts(job.next_run_at)),
        (Some(f), false) => format!("{} (paused)", f),
        (None, _) => job.schedule_type.clone(),
    };
    format!(
        "#{:<5} {:<10} {:<3} {:<11} {:<28} {}",
        job.id,
        job.status,
        job.country,
        job.layer2_mode_used.as_deref().unwrap_or("-"),
        schedule,
        job.query
    )
}

impl AppEvent {
    /// 输出到终端的文本
    pub fn render(&self) -> String {
        match self {
            AppEvent::Log(msg) | AppEvent::Message(msg) => msg.clone(),
            AppEvent::Error(msg) => format!("✗ {}", msg),
            AppEvent::JobFinished {
                job_id,
                success,
                summary,
            } => {
                let mark = if *success { "✓" } else { "✗" };
                format!("{} 作业 #{} {}", mark, job_id, summary)
            }
            AppEvent::Jobs(jobs) if jobs.is_empty() => "（无作业）".to_string(),
            AppEvent::Jobs(jobs) => jobs.iter().map(job_line).collect::<Vec<_>>().join("\n"),
            AppEvent::Detail(job) => {
                let mut lines = vec![job_line(job)];
                if let Some(parent) = job.parent_job_id {
                    lines.push(format!("  parent:     #{}", parent));
                }
                lines.push(format!(
                    "  layer:      requested={} used={} attempts={} fallback={}",
                    job.proxy_layer_requested,
                    job.layer2_mode_used.as_deref().unwrap_or("-"),
                    job.attempts,
                    job.fallback_used
                ));
                lines.push(format!(
                    "  timing:     created={} started={} completed={} duration={}",
                    fmt_ts(Some(job.created_at)),
                    fmt_ts(job.started_at),
                    fmt_ts(job.completed_at),
                    job.duration_seconds
                        .map(|d| format!("{:.2}s", d))
                        .unwrap_or_else(|| "-".to_string())
                ));
                lines.push(format!(
                    "  cost:       ${:.4}  content={} bytes",
                    job.estimated_cost_usd, job.content_length
                ));
                lines.push(format!(
                    "  origin:     ip={} verified={}",
                    job.origin_ip.as_deref().unwrap_or("-"),
                    job.origin_verified
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".to_string())
                ));
                if let Some(w) = &job.origin_warning {
                    lines.push(format!("  warning:    {}", w));
                }
                if let Some(e) = &job.error {
                    lines.push(format!("  error:      {}", e));
                }
                lines.join("\n")
            }
            AppEvent::Stats(s) => format!(
                "总计 {} | pending {} | scheduled {} (活跃 {}) | running {} | completed {} | failed {} | 成本 ${:.4}",
                s.total,
                s.pending,
                s.scheduled,
                s.active_schedules,
                s.running,
                s.completed,
                s.failed,
                s.total_cost_usd
            ),
            AppEvent::Modes(infos) => infos
                .iter()
                .map(|i| {
                    format!(
                        "{:<12} {:<26} {:<16} 成功率 {:>3.0}%  适用: {}",
                        i.mode.as_str(),
                        i.name,
                        i.cost_label,
                        i.success_rate * 100.0,
                        i.best_for.join(", ")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}
