use crate::proxy::catalog::{auto_select, CostInputs, Layer2Mode};
use crate::proxy::origin::OriginInfo;
use crate::proxy::resolver::ResolveError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 按 scraper 类型拼目标地址；查询本身是 URL 时直接使用
const SEARCH_URLS: &[(&str, &str)] = &[
    ("google_ai", "https://www.google.com/search"),
    ("perplexity", "https://www.perplexity.ai/search"),
    ("chatgpt", "https://chatgpt.com/"),
    ("bing", "https://www.bing.com/search"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub query: String,
    pub scraper_type: String,
    pub url: Option<String>,
}

impl Target {
    pub fn new(query: &str, scraper_type: &str) -> Self {
        let query = query.trim();
        let scraper_type = scraper_type.trim().to_lowercase();

        let url = if query.starts_with("http://") || query.starts_with("https://") {
            Some(query.to_string())
        } else {
            SEARCH_URLS
                .iter()
                .find(|(st, _)| *st == scraper_type)
                .and_then(|(_, base)| reqwest::Url::parse_with_params(base, &[("q", query)]).ok())
                .map(|u| u.to_string())
        };

        Self {
            query: query.to_string(),
            scraper_type,
            url,
        }
    }
}

/// 显式传递的执行上下文，日志前缀用
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub job_id: Option<i32>,
}

impl ExecutionContext {
    pub fn for_job(job_id: i32) -> Self {
        Self {
            job_id: Some(job_id),
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.job_id {
            Some(id) => write!(f, "[job {}]", id),
            None => write!(f, "[adhoc]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSource {
    Explicit,
    LegacyFlag,
    Auto,
}

/// 请求里与 Layer 2 选择相关的全部字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerSelection {
    pub proxy_layer: String,
    pub use_residential_proxy: bool,
    pub use_scraping_browser: bool,
    pub use_web_unlocker: bool,
}

impl LayerSelection {
    pub fn auto() -> Self {
        Self {
            proxy_layer: "auto".to_string(),
            ..Default::default()
        }
    }

    pub fn explicit(mode: Layer2Mode) -> Self {
        Self {
            proxy_layer: mode.as_str().to_string(),
            ..Default::default()
        }
    }

    /// 起始模式：显式 proxy_layer > 旧布尔开关 > 自动选择
    pub fn starting_mode(&self, target: &Target) -> (Layer2Mode, ModeSource) {
        let layer = self.proxy_layer.trim();
        if !layer.is_empty() && !layer.eq_ignore_ascii_case("auto") {
            match layer.parse::<Layer2Mode>() {
                Ok(mode) => return (mode, ModeSource::Explicit),
                Err(e) => warn!("{}，改为自动选择", e),
            }
        }

        if self.use_scraping_browser {
            return (Layer2Mode::Browser, ModeSource::LegacyFlag);
        }
        if self.use_residential_proxy {
            return (Layer2Mode::Residential, ModeSource::LegacyFlag);
        }
        if self.use_web_unlocker {
            return (Layer2Mode::Unlocker, ModeSource::LegacyFlag);
        }

        (
            auto_select(&target.scraper_type, target.url.as_deref()),
            ModeSource::Auto,
        )
    }
}

/// backend 单次调用的统一返回
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendOutcome {
    pub success: bool,
    pub payload: Option<String>,
    pub cost_inputs: CostInputs,
    pub error: Option<String>,
    pub retryable: bool,
}

impl BackendOutcome {
    pub fn ok(payload: String, cost_inputs: CostInputs) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            cost_inputs,
            error: None,
            retryable: false,
        }
    }

    pub fn failed(msg: impl Into<String>, retryable: bool, cost_inputs: CostInputs) -> Self {
        Self {
            success: false,
            payload: None,
            cost_inputs,
            error: Some(msg.into()),
            retryable,
        }
    }
}

/// 单个链节失败的原因；都会推进到下一个模式
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AttemptError {
    #[error("backend unavailable for mode {0}")]
    BackendUnavailable(Layer2Mode),
    #[error("{mode} failed: {message}")]
    Execution { mode: Layer2Mode, message: String },
    #[error("{mode} timed out after {secs}s")]
    Timeout { mode: Layer2Mode, secs: u64 },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// 作业级失败，只有这两类会让作业进入 failed
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error(transparent)]
    UnsupportedCountry(#[from] ResolveError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    ChainExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub target: Target,
    pub country: String,
    pub selection: LayerSelection,
    pub allow_fallback: bool,
    pub verify_origin: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub mode: Layer2Mode,
    pub success: bool,
    pub tries: u32,
    pub cost_usd: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub payload: Option<String>,
    pub content_length: usize,
    pub country: String,
    pub requested_mode: Layer2Mode,
    pub mode_source: ModeSource,
    /// 成功时为成功的模式，失败时为链上最后一个模式
    pub mode_used: Layer2Mode,
    pub attempts: u32,
    pub attempted: Vec<AttemptRecord>,
    pub fallback_used: bool,
    pub estimated_cost_usd: f64,
    pub duration: Duration,
    pub origin: Option<OriginInfo>,
    pub warnings: Vec<String>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn attempted_modes(&self) -> Vec<Layer2Mode> {
        self.attempted.iter().map(|a| a.mode).collect()
    }
}
