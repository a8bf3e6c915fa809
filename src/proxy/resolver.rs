use crate::proxy::catalog::Layer2Mode;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 带 VPN 容器与住宅 sidecar 的国家
pub const SUPPORTED_COUNTRIES: &[&str] = &["fr", "de", "nl", "it", "es", "uk", "ch", "se"];

/// 统一国家代码：小写、去空白，gb 归一到 uk
pub fn normalize_country(country: &str) -> String {
    let cc = country.trim().to_lowercase();
    if cc == "gb" {
        "uk".to_string()
    } else {
        cc
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("unsupported country {country} for mode {mode}")]
    UnsupportedCountry { country: String, mode: Layer2Mode },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub country: String,
    pub mode: Layer2Mode,
    pub url: String,
    pub is_residential_sidecar: bool,
}

impl ProxyEndpoint {
    /// 底层 VPN hop 的标识；同一 hop 的模式共享一次来源探测
    pub fn hop(&self) -> &str {
        &self.url
    }
}

/// 代理命名约定与覆盖项，启动时一次性读入
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub host_prefix: String,
    pub vpn_port: u16,
    pub residential_port: u16,
    /// country -> 数据中心 VPN 代理 URL（PROXY_{CC}）
    pub datacenter_overrides: HashMap<String, String>,
    /// country -> 住宅 sidecar URL（RESIDENTIAL_PROXY_{CC}）
    pub residential_overrides: HashMap<String, String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host_prefix: "proxy".to_string(),
            vpn_port: 8888,
            residential_port: 8889,
            datacenter_overrides: HashMap::new(),
            residential_overrides: HashMap::new(),
        }
    }
}

impl ProxySettings {
    /// 从一组 (key, value) 中收集覆盖项，便于直接喂 `std::env::vars()`
    pub fn collect_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            // 只认两位字母后缀，PROXY_HOST_PREFIX 之类的键会被跳过
            if let Some(cc) = key.strip_prefix("RESIDENTIAL_PROXY_") {
                if is_country_suffix(cc) {
                    self.residential_overrides
                        .insert(normalize_country(cc), value);
                }
            } else if let Some(cc) = key.strip_prefix("PROXY_") {
                if is_country_suffix(cc) {
                    self.datacenter_overrides
                        .insert(normalize_country(cc), value);
                }
            }
        }
    }
}

fn is_country_suffix(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic())
}

#[derive(Debug, Clone)]
pub struct ProxyResolver {
    settings: ProxySettings,
}

impl ProxyResolver {
    pub fn new(settings: ProxySettings) -> Self {
        Self { settings }
    }

    /// 解析优先级：配置覆盖 > 命名约定 > UnsupportedCountry
    pub fn resolve(&self, country: &str, mode: Layer2Mode) -> Result<ProxyEndpoint, ResolveError> {
        let cc = normalize_country(country);
        let residential = mode == Layer2Mode::Residential;

        let overrides = if residential {
            &self.settings.residential_overrides
        } else {
            &self.settings.datacenter_overrides
        };

        let url = if let Some(url) = overrides.get(&cc) {
            info!("使用配置覆盖的代理 [{} / {}]: {}", cc, mode, url);
            url.clone()
        } else if SUPPORTED_COUNTRIES.contains(&cc.as_str()) {
            let port = if residential {
                self.settings.residential_port
            } else {
                self.settings.vpn_port
            };
            format!("http://{}-{}:{}", self.settings.host_prefix, cc, port)
        } else {
            return Err(ResolveError::UnsupportedCountry { country: cc, mode });
        };

        Ok(ProxyEndpoint {
            country: cc,
            mode,
            url,
            is_residential_sidecar: residential,
        })
    }

    pub fn is_supported(&self, country: &str) -> bool {
        let cc = normalize_country(country);
        SUPPORTED_COUNTRIES.contains(&cc.as_str())
            || self.settings.datacenter_overrides.contains_key(&cc)
            || self.settings.residential_overrides.contains_key(&cc)
    }
}
