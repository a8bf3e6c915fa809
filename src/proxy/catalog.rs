use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Layer 2 增强模式，按成本/可靠性升序排列
///
/// 变体的声明顺序就是 rank 顺序，`Ord` 派生依赖这一点。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer2Mode {
    Direct,
    Residential,
    Unlocker,
    Browser,
}

impl Layer2Mode {
    pub const ALL: [Layer2Mode; 4] = [
        Layer2Mode::Direct,
        Layer2Mode::Residential,
        Layer2Mode::Unlocker,
        Layer2Mode::Browser,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer2Mode::Direct => "direct",
            Layer2Mode::Residential => "residential",
            Layer2Mode::Unlocker => "unlocker",
            Layer2Mode::Browser => "browser",
        }
    }

    pub fn rank(&self) -> u8 {
        *self as u8
    }

    /// 下一个更贵的模式；browser 之后没有
    pub fn next(&self) -> Option<Layer2Mode> {
        Self::ALL.get(self.rank() as usize + 1).copied()
    }

    pub fn info(&self) -> &'static LayerInfo {
        &LAYER_TABLE[self.rank() as usize]
    }
}

impl fmt::Display for Layer2Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("unknown layer2 mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for Layer2Mode {
    type Err = UnknownMode;

    /// 同时接受旧接口的命名（vpn_direct / web_unlocker / scraping_browser）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" | "vpn_direct" => Ok(Layer2Mode::Direct),
            "residential" => Ok(Layer2Mode::Residential),
            "unlocker" | "web_unlocker" => Ok(Layer2Mode::Unlocker),
            "browser" | "scraping_browser" => Ok(Layer2Mode::Browser),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CostModel {
    Free,
    PerGigabyte(f64),
    /// 只对计费请求收费；premium 域名单价更高
    PerRequestTiered { standard: f64, premium: f64 },
    PerRequestPlusTraffic {
        per_request: f64,
        per_gb: f64,
        per_captcha: f64,
    },
}

#[derive(Debug)]
pub struct LayerInfo {
    pub mode: Layer2Mode,
    pub name: &'static str,
    pub cost_label: &'static str,
    pub cost: CostModel,
    pub success_rate: f64,
    pub best_for: &'static [&'static str],
}

static LAYER_TABLE: [LayerInfo; 4] = [
    LayerInfo {
        mode: Layer2Mode::Direct,
        name: "VPN Only",
        cost_label: "Free (VPN subscription)",
        cost: CostModel::Free,
        success_rate: 0.70,
        best_for: &["Simple sites", "High volume", "Non-protected content"],
    },
    LayerInfo {
        mode: Layer2Mode::Residential,
        name: "Residential IP",
        cost_label: "~$8.40/GB",
        cost: CostModel::PerGigabyte(8.40),
        success_rate: 0.85,
        best_for: &["Sites blocking datacenter IPs", "E-commerce", "Social media"],
    },
    LayerInfo {
        mode: Layer2Mode::Unlocker,
        name: "Web Unlocker",
        cost_label: "~$3-10 per 1000 requests",
        cost: CostModel::PerRequestTiered {
            standard: 0.003,
            premium: 0.010,
        },
        success_rate: 0.95,
        best_for: &["Google", "Amazon", "LinkedIn", "Protected sites"],
    },
    LayerInfo {
        mode: Layer2Mode::Browser,
        name: "Cloud Browser",
        cost_label: "~$0.01-0.03/request",
        cost: CostModel::PerRequestPlusTraffic {
            per_request: 0.01,
            per_gb: 9.50,
            per_captcha: 0.02,
        },
        success_rate: 0.98,
        best_for: &["JavaScript-heavy sites", "ChatGPT", "Complex automation"],
    },
];

/// 一次尝试的计费输入，由 backend 上报
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInputs {
    pub bytes_transferred: u64,
    pub request_count: u32,
    pub premium: bool,
    pub captchas_solved: u32,
}

pub fn cost_estimate(mode: Layer2Mode, inputs: &CostInputs) -> f64 {
    let gb = inputs.bytes_transferred as f64 / BYTES_PER_GB;
    match mode.info().cost {
        CostModel::Free => 0.0,
        CostModel::PerGigabyte(rate) => gb * rate,
        CostModel::PerRequestTiered { standard, premium } => {
            let unit = if inputs.premium { premium } else { standard };
            unit * inputs.request_count as f64
        }
        CostModel::PerRequestPlusTraffic {
            per_request,
            per_gb,
            per_captcha,
        } => {
            per_request * inputs.request_count as f64
                + gb * per_gb
                + per_captcha * inputs.captchas_solved as f64
        }
    }
}

/// scraper 类型 -> 已知可靠的模式
const SCRAPER_MODES: &[(&str, Layer2Mode)] = &[
    ("google_ai", Layer2Mode::Unlocker),
    ("chatgpt", Layer2Mode::Browser),
    ("perplexity", Layer2Mode::Browser),
    ("bing", Layer2Mode::Direct),
];

/// 目标域名提示，按顺序匹配，先命中先用
const HOST_HINTS: &[(&str, Layer2Mode)] = &[
    ("chatgpt.com", Layer2Mode::Browser),
    ("chat.openai.com", Layer2Mode::Browser),
    ("perplexity.ai", Layer2Mode::Browser),
    ("claude.ai", Layer2Mode::Browser),
    ("bard.google.com", Layer2Mode::Browser),
    ("google.", Layer2Mode::Unlocker),
    ("linkedin.com", Layer2Mode::Unlocker),
    ("amazon.", Layer2Mode::Unlocker),
    ("yelp.com", Layer2Mode::Residential),
    ("tripadvisor.com", Layer2Mode::Residential),
    ("glassdoor.com", Layer2Mode::Residential),
    ("indeed.com", Layer2Mode::Residential),
    ("instagram.com", Layer2Mode::Residential),
    ("facebook.com", Layer2Mode::Residential),
    ("twitter.com", Layer2Mode::Residential),
    ("x.com", Layer2Mode::Residential),
    ("wikipedia.org", Layer2Mode::Direct),
    ("github.com", Layer2Mode::Direct),
    ("stackoverflow.com", Layer2Mode::Direct),
    ("reddit.com", Layer2Mode::Direct),
];

/// unlocker 的 premium 计费域名
const PREMIUM_HOSTS: &[&str] = &[
    "google.",
    "linkedin.com",
    "amazon.",
    "instagram.com",
    "facebook.com",
    "twitter.com",
    "x.com",
];

fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

fn host_matches(host: &str, pattern: &str) -> bool {
    if pattern.ends_with('.') {
        // "google." 匹配 google.com / www.google.co.uk 等
        host.starts_with(pattern) || host.contains(&format!(".{}", pattern))
    } else {
        host == pattern || host.ends_with(&format!(".{}", pattern))
    }
}

pub fn is_premium_target(url: &str) -> bool {
    host_of(url)
        .map(|h| PREMIUM_HOSTS.iter().any(|p| host_matches(&h, p)))
        .unwrap_or(false)
}

/// 自动选择起始模式：scraper 类型表 > 域名提示表 > 最便宜的模式
pub fn auto_select(scraper_type: &str, target_url: Option<&str>) -> Layer2Mode {
    let st = scraper_type.trim().to_lowercase();
    if let Some((_, mode)) = SCRAPER_MODES.iter().find(|(name, _)| *name == st) {
        return *mode;
    }
    if let Some(host) = target_url.and_then(host_of) {
        if let Some((_, mode)) = HOST_HINTS.iter().find(|(p, _)| host_matches(&host, p)) {
            return *mode;
        }
    }
    Layer2Mode::Direct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_total_and_matches_rank() {
        let ranks: Vec<u8> = Layer2Mode::ALL.iter().map(|m| m.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert!(Layer2Mode::Direct < Layer2Mode::Residential);
        assert!(Layer2Mode::Unlocker < Layer2Mode::Browser);
        assert_eq!(Layer2Mode::Unlocker.next(), Some(Layer2Mode::Browser));
        assert_eq!(Layer2Mode::Browser.next(), None);
    }

    #[test]
    fn parses_legacy_names() {
        assert_eq!("vpn_direct".parse::<Layer2Mode>(), Ok(Layer2Mode::Direct));
        assert_eq!(" Web_Unlocker ".parse::<Layer2Mode>(), Ok(Layer2Mode::Unlocker));
        assert_eq!(
            "scraping_browser".parse::<Layer2Mode>(),
            Ok(Layer2Mode::Browser)
        );
        assert!("auto".parse::<Layer2Mode>().is_err());
    }

    #[test]
    fn auto_select_prefers_scraper_table_then_hosts() {
        assert_eq!(auto_select("google_ai", None), Layer2Mode::Unlocker);
        assert_eq!(
            auto_select("chatgpt", Some("https://example.com")),
            Layer2Mode::Browser
        );
        assert_eq!(
            auto_select("generic", Some("https://www.instagram.com/p/1")),
            Layer2Mode::Residential
        );
        assert_eq!(
            auto_select("generic", Some("https://www.google.co.uk/search?q=x")),
            Layer2Mode::Unlocker
        );
        assert_eq!(
            auto_select("generic", Some("https://example.org")),
            Layer2Mode::Direct
        );
        // "x.com" 不应误伤 box.com 之类的域名
        assert_eq!(
            auto_select("generic", Some("https://dropbox.com")),
            Layer2Mode::Direct
        );
    }

    #[test]
    fn cost_models() {
        let gb = CostInputs {
            bytes_transferred: 1024 * 1024 * 1024,
            request_count: 1,
            ..Default::default()
        };
        assert_eq!(cost_estimate(Layer2Mode::Direct, &gb), 0.0);
        assert!((cost_estimate(Layer2Mode::Residential, &gb) - 8.40).abs() < 1e-9);
        assert!((cost_estimate(Layer2Mode::Browser, &gb) - 9.51).abs() < 1e-9);

        let premium = CostInputs {
            request_count: 2,
            premium: true,
            ..Default::default()
        };
        assert!((cost_estimate(Layer2Mode::Unlocker, &premium) - 0.02).abs() < 1e-9);
        let unbilled = CostInputs::default();
        assert_eq!(cost_estimate(Layer2Mode::Unlocker, &unbilled), 0.0);
    }

    #[test]
    fn premium_targets() {
        assert!(is_premium_target("https://www.google.com/search?q=a"));
        assert!(is_premium_target("https://www.amazon.de/dp/1"));
        assert!(!is_premium_target("https://www.bing.com/search?q=a"));
    }
}
