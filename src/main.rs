mod app_state;
mod commands;
mod config;
mod execution;
mod jobs;
mod proxy;
mod storage;

use anyhow::Context;
use log::{info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::app_state::AppEvent;
use crate::commands::{AppCommand, HELP_TEXT};
use crate::config::AppConfig;
use crate::execution::{registry_from_config, FallbackExecutor};
use crate::jobs::{JobService, Scheduler};
use crate::proxy::{HttpGeoProbe, Layer2Mode, OriginVerifier, ProxyResolver};

const LIST_LIMIT: u64 = 50;

fn init_logging(cfg: &AppConfig) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = &cfg.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("无法打开日志文件 {}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder
        .filter_level(log::LevelFilter::Warn)
        .filter_module("geoharvest", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error)
        .init();
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cfg = AppConfig::from_env().context("配置无效")?;
    init_logging(&cfg)?;

    let db = Arc::new(
        storage::establish_connection(&cfg.database_url)
            .await
            .with_context(|| format!("数据库连接失败: {}", cfg.database_url))?,
    );

    let resolver = Arc::new(ProxyResolver::new(cfg.proxy.clone()));
    let verifier = OriginVerifier::new(Arc::new(HttpGeoProbe::new(
        cfg.probe_url.clone(),
        cfg.probe_timeout,
    )));
    let registry = Arc::new(registry_from_config(&cfg));
    info!("已注册的 backend: {:?}", registry);
    let executor = Arc::new(FallbackExecutor::new(
        resolver,
        verifier,
        registry,
        cfg.backend_timeout,
        cfg.retry,
    ));

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<AppCommand>();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<AppEvent>();

    let service = JobService::new(db.clone(), executor, evt_tx.clone())
        .with_default_country(cfg.default_country.clone())
        .with_origin_verification(cfg.verify_origin);

    match service.recover().await {
        Ok(report) => info!(
            "启动恢复完成: 失败 {}，重新派发 {}",
            report.failed_stale, report.redispatched
        ),
        Err(e) => warn!("启动恢复失败: {}", e),
    }

    let scheduler = Scheduler::new(db.clone(), service.clone(), cfg.scheduler_interval)
        .with_stale_grace(cfg.stale_run_grace);
    scheduler.clone().spawn();

    // 事件输出
    let printer = tokio::spawn(async move {
        while let Some(evt) = evt_rx.recv().await {
            println!("{}", evt.render());
        }
    });

    // 命令处理 (Actor)
    let actor = tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                AppCommand::Submit(req) => match service.submit(*req).await {
                    Ok(resp) => {
                        let msg = match resp.next_run_at {
                            Some(at) => format!(
                                "已创建作业 #{} [{}]，首次运行 {}",
                                resp.job_id,
                                resp.status,
                                chrono::DateTime::from_timestamp(at, 0)
                                    .map(|d| d.to_rfc3339())
                                    .unwrap_or_else(|| at.to_string())
                            ),
                            None => format!("已创建作业 #{} [{}]", resp.job_id, resp.status),
                        };
                        let _ = evt_tx.send(AppEvent::Message(msg));
                    }
                    Err(e) => {
                        let _ = evt_tx.send(AppEvent::Error(format!("提交失败: {}", e)));
                    }
                },
                AppCommand::List { status } => match service.list(status, LIST_LIMIT).await {
                    Ok(jobs) => {
                        let _ = evt_tx.send(AppEvent::Jobs(jobs));
                    }
                    Err(e) => {
                        let _ = evt_tx.send(AppEvent::Error(format!("查询失败: {}", e)));
                    }
                },
                AppCommand::Show { id } => match service.get(id).await {
                    Ok(job) => {
                        let _ = evt_tx.send(AppEvent::Detail(Box::new(job)));
                    }
                    Err(e) => {
                        let _ = evt_tx.send(AppEvent::Error(format!("查询失败: {}", e)));
                    }
                },
                AppCommand::Pause { id } => {
                    let evt = match service.pause(id).await {
                        Ok(()) => AppEvent::Message(format!("作业 #{} 已暂停", id)),
                        Err(e) => AppEvent::Error(format!("暂停失败: {}", e)),
                    };
                    let _ = evt_tx.send(evt);
                }
                AppCommand::Resume { id } => {
                    let evt = match service.resume(id).await {
                        Ok(()) => AppEvent::Message(format!("作业 #{} 已恢复", id)),
                        Err(e) => AppEvent::Error(format!("恢复失败: {}", e)),
                    };
                    let _ = evt_tx.send(evt);
                }
                AppCommand::Delete { id } => {
                    let evt = match service.delete(id).await {
                        Ok(n) => AppEvent::Message(format!("作业 #{} 已删除（{} 行）", id, n)),
                        Err(e) => AppEvent::Error(format!("删除失败: {}", e)),
                    };
                    let _ = evt_tx.send(evt);
                }
                AppCommand::Tick => {
                    let evt = match scheduler.tick(chrono::Utc::now().timestamp()).await {
                        Ok(r) => AppEvent::Message(format!(
                            "tick: 到期 {}，派发 {:?}，跳过 {}，出错 {}，超时失败 {}",
                            r.due, r.spawned, r.skipped, r.errors, r.failed_stale
                        )),
                        Err(e) => AppEvent::Error(format!("tick 失败: {}", e)),
                    };
                    let _ = evt_tx.send(evt);
                }
                AppCommand::Stats => {
                    let evt = match service.stats().await {
                        Ok(s) => AppEvent::Stats(s),
                        Err(e) => AppEvent::Error(format!("统计失败: {}", e)),
                    };
                    let _ = evt_tx.send(evt);
                }
                AppCommand::Modes => {
                    let available = service.executor().registry().available_modes();
                    let _ = evt_tx.send(AppEvent::Modes(
                        Layer2Mode::ALL.iter().map(|m| m.info()).collect(),
                    ));
                    let _ = evt_tx.send(AppEvent::Message(format!(
                        "已启用: {}",
                        available
                            .iter()
                            .map(|m| m.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                }
                AppCommand::Help => {
                    let _ = evt_tx.send(AppEvent::Message(HELP_TEXT.to_string()));
                }
                AppCommand::Quit => break,
                AppCommand::Unknown(msg) => {
                    if !msg.is_empty() {
                        let _ = evt_tx.send(AppEvent::Error(msg));
                    }
                }
            }
        }
    });

    println!("geoharvest 已启动，输入 help 查看命令");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let cmd = line
            .parse::<AppCommand>()
            .unwrap_or_else(|_| AppCommand::Unknown(line.clone()));
        let quit = cmd == AppCommand::Quit;
        if cmd_tx.send(cmd).is_err() || quit {
            break;
        }
    }
    drop(cmd_tx);

    let _ = actor.await;
    printer.abort();
    println!("收到退出命令");
    Ok(())
}
