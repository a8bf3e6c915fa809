use crate::config::parse_bool;
use crate::jobs::model::{JobConfig, JobStatus};
use chrono::{DateTime, Utc};
use std::str::FromStr;

pub const HELP_TEXT: &str = "可用命令: submit country=<cc> [scraper=..] [layer=..] [every=..] [start=<rfc3339>] [fallback=on|off] [verify=on|off] <query…> | list [status] | show <id> | pause <id> | resume <id> | delete <id> | tick | stats | modes | help | quit";

const SUBMIT_USAGE: &str = "用法: submit country=<cc> [scraper=..] [layer=..] [every=..] [start=<rfc3339>] [fallback=on|off] [verify=on|off] <query…>";

#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    Submit(Box<JobConfig>),
    List { status: Option<JobStatus> },
    Show { id: i32 },
    Pause { id: i32 },
    Resume { id: i32 },
    Delete { id: i32 },
    Tick,
    Stats,
    Modes,
    Help,
    Quit,
    Unknown(String),
}

impl FromStr for AppCommand {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(AppCommand::Unknown("".to_string()));
        }

        match parts[0] {
            "submit" => Ok(parse_submit(&parts[1..])
                .map(|cfg| AppCommand::Submit(Box::new(cfg)))
                .unwrap_or_else(AppCommand::Unknown)),
            "list" | "ls" => match parts.get(1) {
                None => Ok(AppCommand::List { status: None }),
                Some(st) => match st.parse::<JobStatus>() {
                    Ok(status) => Ok(AppCommand::List {
                        status: Some(status),
                    }),
                    Err(_) => Ok(AppCommand::Unknown(format!(
                        "未知状态: {}（pending/scheduled/running/completed/failed）",
                        st
                    ))),
                },
            },
            "show" => Ok(with_id(&parts, |id| AppCommand::Show { id })),
            "pause" => Ok(with_id(&parts, |id| AppCommand::Pause { id })),
            "resume" => Ok(with_id(&parts, |id| AppCommand::Resume { id })),
            "delete" | "rm" => Ok(with_id(&parts, |id| AppCommand::Delete { id })),
            "tick" => Ok(AppCommand::Tick),
            "stats" => Ok(AppCommand::Stats),
            "modes" => Ok(AppCommand::Modes),
            "help" | "h" => Ok(AppCommand::Help),
            "quit" | "q" | "exit" => Ok(AppCommand::Quit),
            _ => Ok(AppCommand::Unknown(format!("未知命令: {}", parts[0]))),
        }
    }
}

fn with_id(parts: &[&str], build: impl FnOnce(i32) -> AppCommand) -> AppCommand {
    match parts.get(1).and_then(|s| s.trim_start_matches('#').parse::<i32>().ok()) {
        Some(id) => build(id),
        None => AppCommand::Unknown(format!("用法: {} <id>", parts[0])),
    }
}

/// 开头的 key=value 为选项，第一个非选项 token 起全部拼成 query
fn parse_submit(args: &[&str]) -> Result<JobConfig, String> {
    let mut cfg = JobConfig::new("", "");
    let mut idx = 0;

    while let Some(tok) = args.get(idx) {
        let Some((key, value)) = tok.split_once('=') else {
            break;
        };
        match key {
            "country" | "cc" => cfg.country = value.to_string(),
            "scraper" => cfg.scraper_type = value.to_string(),
            "layer" => cfg.proxy_layer = value.to_string(),
            "every" | "frequency" => cfg.frequency = Some(value.to_string()),
            "start" => {
                let start = DateTime::parse_from_rfc3339(value)
                    .map_err(|e| format!("start 不是合法的 RFC3339 时间 ({}): {}", e, value))?;
                cfg.start_date = Some(start.with_timezone(&Utc));
            }
            "fallback" => {
                cfg.allow_fallback =
                    parse_bool(value).ok_or_else(|| format!("fallback 只能是 on/off: {}", value))?
            }
            "verify" => {
                cfg.verify_origin =
                    parse_bool(value).ok_or_else(|| format!("verify 只能是 on/off: {}", value))?
            }
            // 不是已知选项，视为 query 的开头（例如带参数的 URL）
            _ => break,
        }
        idx += 1;
    }

    cfg.query = args[idx..].join(" ");
    if cfg.query.is_empty() || cfg.country.is_empty() {
        return Err(SUBMIT_USAGE.to_string());
    }
    Ok(cfg)
}
