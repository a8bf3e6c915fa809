use crate::execution::backoff::RetryPolicy;
use crate::proxy::resolver::{normalize_country, ProxySettings};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct UnlockerConfig {
    pub api_url: String,
    pub token: String,
    pub zone: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_file: Option<String>,
    pub scheduler_interval: Duration,
    pub backend_timeout: Duration,
    pub probe_url: String,
    pub probe_timeout: Duration,
    pub verify_origin: bool,
    pub default_country: Option<String>,
    pub stale_run_grace: Duration,
    pub retry: RetryPolicy,
    pub proxy: ProxySettings,
    pub unlocker: Option<UnlockerConfig>,
    pub browser_service_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_map(&std::env::vars().collect())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut proxy = ProxySettings::default();
        if let Some(prefix) = get("PROXY_HOST_PREFIX") {
            proxy.host_prefix = prefix;
        }
        proxy.vpn_port = parse_or(vars, "PROXY_VPN_PORT", proxy.vpn_port)?;
        proxy.residential_port = parse_or(vars, "PROXY_RESIDENTIAL_PORT", proxy.residential_port)?;
        proxy.collect_overrides(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

        let unlocker = get("BRIGHTDATA_API_TOKEN").map(|token| UnlockerConfig {
            api_url: get("BRIGHTDATA_API_URL")
                .unwrap_or_else(|| "https://api.brightdata.com/request".to_string()),
            token,
            zone: get("BRIGHTDATA_UNLOCKER_ZONE").unwrap_or_else(|| "web_unlocker1".to_string()),
        });

        let retry = RetryPolicy::new(
            parse_or(vars, "BACKEND_MAX_TRIES", 1u32)?,
            Duration::from_millis(parse_or(vars, "BACKEND_RETRY_BASE_MS", 500u64)?),
            Duration::from_millis(parse_or(vars, "BACKEND_RETRY_MAX_MS", 10_000u64)?),
        );

        Ok(Self {
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://geoharvest.db?mode=rwc".to_string()),
            log_file: get("LOG_FILE"),
            scheduler_interval: Duration::from_secs(
                parse_or(vars, "SCHEDULER_INTERVAL_SECS", 60u64)?.max(1),
            ),
            backend_timeout: Duration::from_secs(
                parse_or(vars, "BACKEND_TIMEOUT_SECS", 60u64)?.max(1),
            ),
            probe_url: get("PROBE_URL").unwrap_or_else(|| "https://ipinfo.io/json".to_string()),
            probe_timeout: Duration::from_secs(parse_or(vars, "PROBE_TIMEOUT_SECS", 15u64)?),
            verify_origin: parse_bool_or(vars, "VERIFY_ORIGIN", true)?,
            default_country: get("DEFAULT_COUNTRY").map(|c| normalize_country(&c)),
            stale_run_grace: Duration::from_secs(parse_or(vars, "STALE_RUN_GRACE_SECS", 1800u64)?),
            retry,
            proxy,
            unlocker,
            browser_service_url: get("BROWSER_SERVICE_URL"),
        })
    }
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            value: raw.to_string(),
        }),
        None => Ok(default),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_bool_or(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => parse_bool(raw).ok_or_else(|| ConfigError::Invalid {
            key,
            value: raw.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let cfg = AppConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(cfg.scheduler_interval, Duration::from_secs(60));
        assert_eq!(cfg.backend_timeout, Duration::from_secs(60));
        assert_eq!(cfg.probe_url, "https://ipinfo.io/json");
        assert!(cfg.verify_origin);
        assert!(cfg.unlocker.is_none());
        assert!(cfg.browser_service_url.is_none());
        assert_eq!(cfg.retry.max_tries, 1);
        assert_eq!(cfg.proxy.host_prefix, "proxy");
    }

    #[test]
    fn reads_overrides_and_vendor_settings() {
        let cfg = AppConfig::from_map(&vars(&[
            ("PROXY_IT", "http://it.local:1"),
            ("RESIDENTIAL_PROXY_GB", "http://res-uk.local:2"),
            ("BRIGHTDATA_API_TOKEN", "tok"),
            ("VERIFY_ORIGIN", "off"),
            ("DEFAULT_COUNTRY", "GB"),
            ("BACKEND_MAX_TRIES", "3"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.proxy.datacenter_overrides.get("it").map(String::as_str),
            Some("http://it.local:1")
        );
        assert_eq!(
            cfg.proxy.residential_overrides.get("uk").map(String::as_str),
            Some("http://res-uk.local:2")
        );
        let unlocker = cfg.unlocker.unwrap();
        assert_eq!(unlocker.zone, "web_unlocker1");
        assert!(!cfg.verify_origin);
        assert_eq!(cfg.default_country.as_deref(), Some("uk"));
        assert_eq!(cfg.retry.max_tries, 3);
    }

    #[test]
    fn zero_durations_are_clamped() {
        let cfg = AppConfig::from_map(&vars(&[
            ("BACKEND_TIMEOUT_SECS", "0"),
            ("SCHEDULER_INTERVAL_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.backend_timeout, Duration::from_secs(1));
        assert_eq!(cfg.scheduler_interval, Duration::from_secs(1));
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = AppConfig::from_map(&vars(&[("SCHEDULER_INTERVAL_SECS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "SCHEDULER_INTERVAL_SECS",
                value: "soon".to_string()
            }
        );
    }
}
