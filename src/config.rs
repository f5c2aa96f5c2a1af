use std::time::Duration;

/// 孩子档案、账户、统计数据后端
pub const DEFAULT_API_BASE_URL: &str = "https://xoul-data-backend-267146952341.us-east1.run.app";

/// WhatsApp 配对服务
pub const DEFAULT_SCRAPER_BASE_URL: &str = "https://xoul-dev.duckdns.org";

const ENV_API_BASE_URL: &str = "XOUL_API_BASE_URL";
const ENV_SCRAPER_BASE_URL: &str = "XOUL_SCRAPER_BASE_URL";
const ENV_REQUEST_TIMEOUT_SECS: &str = "XOUL_REQUEST_TIMEOUT_SECS";

/// 配对流程参数
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// 从发起请求起算的硬性过期窗口
    pub qr_expiry: Duration,
    /// session_saved 后二维码继续展示的时间
    pub success_grace: Duration,
    /// 事件流缓冲区大小
    pub stream_buffer: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            qr_expiry: Duration::from_secs(2 * 60),
            success_grace: Duration::from_millis(1500),
            stream_buffer: 32,
        }
    }
}

/// 后端服务配置
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api_base_url: String,
    pub scraper_base_url: String,
    /// 普通请求的超时；事件流不受限制
    pub request_timeout: Duration,
    pub pairing: PairingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            scraper_base_url: DEFAULT_SCRAPER_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            pairing: PairingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// 指定两个后端地址，其余取默认值
    pub fn new(api_base_url: impl AsRef<str>, scraper_base_url: impl AsRef<str>) -> Self {
        Self {
            api_base_url: normalize_base_url(api_base_url.as_ref()),
            scraper_base_url: normalize_base_url(scraper_base_url.as_ref()),
            ..Self::default()
        }
    }

    /// 默认值 + 环境变量覆盖
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_API_BASE_URL).filter(|s| !s.trim().is_empty()) {
            config.api_base_url = normalize_base_url(&url);
        }
        if let Some(url) = lookup(ENV_SCRAPER_BASE_URL).filter(|s| !s.trim().is_empty()) {
            config.scraper_base_url = normalize_base_url(&url);
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.request_timeout = Duration::from_secs(secs),
                _ => tracing::warn!("Ignoring invalid {}: {:?}", ENV_REQUEST_TIMEOUT_SECS, raw),
            }
        }

        tracing::info!(
            "Service endpoints: api={}, scraper={}",
            config.api_base_url,
            config.scraper_base_url
        );
        config
    }

    pub fn with_pairing(mut self, pairing: PairingConfig) -> Self {
        self.pairing = pairing;
        self
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
