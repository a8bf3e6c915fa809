use crate::config::AppConfig;
use crate::execution::backend::{BackendRegistry, ExecutionBackend};
use crate::execution::model::{BackendOutcome, ExecutionContext, Target};
use crate::proxy::catalog::{is_premium_target, CostInputs, Layer2Mode};
use crate::proxy::resolver::ProxyEndpoint;
use async_trait::async_trait;
use log::{info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

fn build_proxied_client(endpoint: &ProxyEndpoint, timeout: Duration) -> Result<Client, String> {
    let proxy = reqwest::Proxy::all(&endpoint.url).map_err(|e| e.to_string())?;
    Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .user_agent("geoharvest/0.1")
        .build()
        .map_err(|e| e.to_string())
}

/// 429 与 5xx 视为可重试
fn status_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn transport_error(e: &reqwest::Error) -> BackendOutcome {
    let msg = if e.is_timeout() {
        format!("timeout: {}", e)
    } else {
        e.to_string()
    };
    BackendOutcome::failed(msg, true, CostInputs::default())
}

/// direct / residential：直接经代理 GET 目标地址
pub struct ProxiedHttpBackend {
    mode: Layer2Mode,
    timeout: Duration,
}

impl ProxiedHttpBackend {
    pub fn new(mode: Layer2Mode, timeout: Duration) -> Self {
        Self { mode, timeout }
    }
}

#[async_trait]
impl ExecutionBackend for ProxiedHttpBackend {
    fn name(&self) -> &str {
        match self.mode {
            Layer2Mode::Residential => "residential-http",
            _ => "vpn-http",
        }
    }

    async fn execute(
        &self,
        target: &Target,
        endpoint: &ProxyEndpoint,
        ctx: &ExecutionContext,
    ) -> BackendOutcome {
        let Some(url) = target.url.as_deref() else {
            return BackendOutcome::failed(
                format!("no fetchable url for scraper type {}", target.scraper_type),
                false,
                CostInputs::default(),
            );
        };

        let client = match build_proxied_client(endpoint, self.timeout) {
            Ok(c) => c,
            Err(e) => return BackendOutcome::failed(e, false, CostInputs::default()),
        };

        info!("{} {} GET {} via {}", ctx, self.mode, url, endpoint.url);
        let resp = match client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return transport_error(&e),
        };

        let status = resp.status();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return transport_error(&e),
        };
        let cost = CostInputs {
            bytes_transferred: body.len() as u64,
            request_count: 1,
            ..Default::default()
        };

        if status == StatusCode::OK {
            BackendOutcome::ok(body, cost)
        } else {
            BackendOutcome::failed(
                format!("HTTP {}", status.as_u16()),
                status_retryable(status),
                cost,
            )
        }
    }
}

/// Web Unlocker：向厂商 API 发一次请求，流量仍经 Layer 1
pub struct UnlockerBackend {
    api_url: String,
    token: String,
    zone: String,
    timeout: Duration,
}

impl UnlockerBackend {
    pub fn new(api_url: String, token: String, zone: String, timeout: Duration) -> Self {
        Self {
            api_url,
            token,
            zone,
            timeout,
        }
    }
}

#[async_trait]
impl ExecutionBackend for UnlockerBackend {
    fn name(&self) -> &str {
        "web-unlocker"
    }

    async fn execute(
        &self,
        target: &Target,
        endpoint: &ProxyEndpoint,
        ctx: &ExecutionContext,
    ) -> BackendOutcome {
        let Some(url) = target.url.as_deref() else {
            return BackendOutcome::failed(
                format!("no fetchable url for scraper type {}", target.scraper_type),
                false,
                CostInputs::default(),
            );
        };

        let client = match build_proxied_client(endpoint, self.timeout) {
            Ok(c) => c,
            Err(e) => return BackendOutcome::failed(e, false, CostInputs::default()),
        };

        let premium = is_premium_target(url);
        info!("{} unlocker 请求: {} (premium={})", ctx, url, premium);

        let body = serde_json::json!({
            "zone": self.zone,
            "url": url,
            "country": endpoint.country,
            "format": "raw",
        });
        let resp = match client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return transport_error(&e),
        };

        let status = resp.status();
        let content = match resp.text().await {
            Ok(c) => c,
            Err(e) => return transport_error(&e),
        };

        // 只有成功的请求计费
        if status == StatusCode::OK {
            let cost = CostInputs {
                bytes_transferred: content.len() as u64,
                request_count: 1,
                premium,
                captchas_solved: 0,
            };
            BackendOutcome::ok(content, cost)
        } else {
            let snippet: String = content.chars().take(200).collect();
            warn!("{} unlocker 错误: {} - {}", ctx, status.as_u16(), snippet);
            BackendOutcome::failed(
                format!("HTTP {}", status.as_u16()),
                status_retryable(status),
                CostInputs {
                    bytes_transferred: content.len() as u64,
                    premium,
                    ..Default::default()
                },
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct BrowserServiceResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    html_content: Option<String>,
    #[serde(default)]
    response_text: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data_transferred_kb: Option<f64>,
    #[serde(default)]
    captcha_solved: bool,
}

/// 远程浏览器自动化服务；协议对调度核心不透明，只做一次 POST
pub struct BrowserServiceBackend {
    client: Client,
    scrape_url: String,
}

impl BrowserServiceBackend {
    pub fn new(service_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("geoharvest/0.1")
            .build()?;
        Ok(Self {
            client,
            scrape_url: format!("{}/scrape", service_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ExecutionBackend for BrowserServiceBackend {
    fn name(&self) -> &str {
        "browser-service"
    }

    async fn execute(
        &self,
        target: &Target,
        endpoint: &ProxyEndpoint,
        ctx: &ExecutionContext,
    ) -> BackendOutcome {
        let body = serde_json::json!({
            "query": target.query,
            "url": target.url,
            "scraper_type": target.scraper_type,
            "country": endpoint.country,
            "proxy": endpoint.url,
        });
        info!("{} browser 请求: {} -> {}", ctx, target.query, self.scrape_url);

        let resp = match self.client.post(&self.scrape_url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return transport_error(&e),
        };
        let status = resp.status();
        if !status.is_success() {
            return BackendOutcome::failed(
                format!("HTTP {}", status.as_u16()),
                status_retryable(status),
                CostInputs {
                    request_count: 1,
                    ..Default::default()
                },
            );
        }

        let parsed: BrowserServiceResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                return BackendOutcome::failed(
                    format!("invalid browser service response: {}", e),
                    false,
                    CostInputs {
                        request_count: 1,
                        ..Default::default()
                    },
                )
            }
        };

        let payload = parsed
            .html_content
            .or(parsed.response_text)
            .unwrap_or_default();
        let bytes = parsed
            .data_transferred_kb
            .map(|kb| (kb * 1024.0) as u64)
            .unwrap_or(payload.len() as u64);
        let cost = CostInputs {
            bytes_transferred: bytes,
            request_count: 1,
            premium: false,
            captchas_solved: u32::from(parsed.captcha_solved),
        };

        if parsed.status.as_deref() == Some("failed") {
            let msg = parsed
                .error
                .unwrap_or_else(|| "browser service reported failure".to_string());
            return BackendOutcome::failed(msg, false, cost);
        }
        BackendOutcome::ok(payload, cost)
    }
}

/// 按配置填充 backend 注册表；缺少凭据的模式不注册
pub fn registry_from_config(cfg: &AppConfig) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(
        Layer2Mode::Direct,
        Arc::new(ProxiedHttpBackend::new(
            Layer2Mode::Direct,
            cfg.backend_timeout,
        )),
    );
    registry.register(
        Layer2Mode::Residential,
        Arc::new(ProxiedHttpBackend::new(
            Layer2Mode::Residential,
            cfg.backend_timeout,
        )),
    );

    match &cfg.unlocker {
        Some(u) => registry.register(
            Layer2Mode::Unlocker,
            Arc::new(UnlockerBackend::new(
                u.api_url.clone(),
                u.token.clone(),
                u.zone.clone(),
                cfg.backend_timeout,
            )),
        ),
        None => warn!("未配置 BRIGHTDATA_API_TOKEN，unlocker 模式不可用"),
    }

    match cfg.browser_service_url.as_deref() {
        Some(url) => match BrowserServiceBackend::new(url, cfg.backend_timeout) {
            Ok(b) => registry.register(Layer2Mode::Browser, Arc::new(b)),
            Err(e) => warn!("browser 服务客户端创建失败: {}", e),
        },
        None => warn!("未配置 BROWSER_SERVICE_URL，browser 模式不可用"),
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn registry_skips_unconfigured_vendors() {
        let cfg = AppConfig::from_map(&HashMap::new()).unwrap();
        let registry = registry_from_config(&cfg);
        assert_eq!(
            registry.available_modes(),
            vec![Layer2Mode::Direct, Layer2Mode::Residential]
        );
    }

    #[test]
    fn registry_with_all_vendors() {
        let mut vars = HashMap::new();
        vars.insert("BRIGHTDATA_API_TOKEN".to_string(), "t".to_string());
        vars.insert(
            "BROWSER_SERVICE_URL".to_string(),
            "http://browser:5000/".to_string(),
        );
        let cfg = AppConfig::from_map(&vars).unwrap();
        let registry = registry_from_config(&cfg);
        assert_eq!(registry.available_modes(), Layer2Mode::ALL.to_vec());
        assert_eq!(
            registry.get(Layer2Mode::Browser).map(|b| b.name().to_string()),
            Some("browser-service".to_string())
        );
    }

    #[tokio::test]
    async fn query_without_url_fails_fast() {
        let backend = ProxiedHttpBackend::new(Layer2Mode::Direct, Duration::from_secs(1));
        let target = Target::new("just words", "generic");
        let endpoint = ProxyEndpoint {
            country: "it".into(),
            mode: Layer2Mode::Direct,
            url: "http://proxy-it:8888".into(),
            is_residential_sidecar: false,
        };
        let out = backend
            .execute(&target, &endpoint, &ExecutionContext::default())
            .await;
        assert!(!out.success);
        assert!(!out.retryable);
    }
}
