use crate::proxy::resolver::{normalize_country, ProxyEndpoint};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// VPN 厂商总部所在城市；流量出口落在这里通常说明路由没有生效
const ANOMALOUS_HUBS: &[(&str, &str)] = &[("zurich", "ch"), ("zürich", "ch"), ("zuerich", "ch")];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginInfo {
    pub ip: String,
    pub city: String,
    pub country_code: String,
    pub verified: bool,
    pub warning: Option<String>,
}

/// 探测服务返回的原始地理信息
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GeoLookup {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("{0}")]
    Network(String),
    #[error("timeout after {0}s")]
    Timeout(u64),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait GeoProbe: Send + Sync {
    async fn lookup(&self, endpoint: &ProxyEndpoint) -> Result<GeoLookup, ProbeError>;
}

/// 通过代理请求 ipinfo 风格的 JSON 接口
pub struct HttpGeoProbe {
    probe_url: String,
    timeout: Duration,
}

impl HttpGeoProbe {
    pub fn new(probe_url: String, timeout: Duration) -> Self {
        Self { probe_url, timeout }
    }
}

#[async_trait]
impl GeoProbe for HttpGeoProbe {
    async fn lookup(&self, endpoint: &ProxyEndpoint) -> Result<GeoLookup, ProbeError> {
        let proxy =
            reqwest::Proxy::all(&endpoint.url).map_err(|e| ProbeError::Network(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        let resp = client.get(&self.probe_url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout.as_secs())
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            return Err(ProbeError::Status(resp.status().as_u16()));
        }

        resp.json::<GeoLookup>()
            .await
            .map_err(|e| ProbeError::InvalidResponse(e.to_string()))
    }
}

/// 预期国家转成探测服务使用的 ISO 代码（uk -> GB）
fn expected_iso(expected_country: &str) -> String {
    let cc = normalize_country(expected_country);
    if cc == "uk" {
        "GB".to_string()
    } else {
        cc.to_uppercase()
    }
}

fn observed_iso(country: &str) -> String {
    let cc = country.trim().to_uppercase();
    if cc == "UK" {
        "GB".to_string()
    } else {
        cc
    }
}

/// 分类规则按优先级：探测失败 > 疑似误路由 > 国家不符 > 通过
pub fn classify(lookup: Result<GeoLookup, ProbeError>, expected_country: &str) -> OriginInfo {
    let geo = match lookup {
        Ok(geo) => geo,
        Err(e) => {
            return OriginInfo {
                verified: false,
                warning: Some(format!("probe failed: {}", e)),
                ..Default::default()
            };
        }
    };

    let expected = expected_iso(expected_country);
    let observed = observed_iso(&geo.country);
    let city = geo.city.trim().to_lowercase();

    let misrouted = ANOMALOUS_HUBS
        .iter()
        .any(|(hub, home)| city.contains(hub) && expected_iso(home) != expected);

    let warning = if misrouted {
        Some("suspected misroute".to_string())
    } else if observed != expected {
        let got = if observed.is_empty() { "unknown" } else { observed.as_str() };
        Some(format!("country mismatch: got {} expected {}", got, expected))
    } else {
        None
    };

    OriginInfo {
        ip: geo.ip,
        city: geo.city,
        country_code: observed,
        verified: warning.is_none(),
        warning,
    }
}

#[derive(Clone)]
pub struct OriginVerifier {
    probe: Arc<dyn GeoProbe>,
}

impl OriginVerifier {
    pub fn new(probe: Arc<dyn GeoProbe>) -> Self {
        Self { probe }
    }

    /// 校验结果只作提示，不会阻断执行
    pub async fn verify(&self, endpoint: &ProxyEndpoint, expected_country: &str) -> OriginInfo {
        let origin = classify(self.probe.lookup(endpoint).await, expected_country);
        match &origin.warning {
            Some(w) => warn!("[Layer 1] {} via {}: {}", endpoint.country, endpoint.url, w),
            None => info!(
                "[Layer 1] 出口校验通过 {} ({}, {})",
                origin.ip, origin.city, origin.country_code
            ),
        }
        origin
    }
}
