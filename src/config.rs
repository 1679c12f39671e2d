use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Keys whose environment values are comma-separated lists
const LIST_KEYS: &[&str] = &[
    "auth.api_keys",
    "destination.allowed_schemes",
    "destination.allowed_host_suffixes",
    "destination.allowed_cidrs",
];

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub logging: LoggingSettings,
    pub auth: AuthSettings,
    pub destination: DestinationSettings,
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub admission: AdmissionSettings,
    pub proxy: ProxySettings,
    pub cache: CacheSettings,
    pub helper: HelperSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub environment: String,
    /// Origin used when `/stream` hands out proxy URLs; the request's Host
    /// header is used when unset
    pub public_base_url: Option<String>,
    pub max_body_bytes: usize,
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub api_keys: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DestinationSettings {
    pub allowed_schemes: Vec<String>,
    pub allowed_host_suffixes: Vec<String>,
    pub allowed_cidrs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub max_requests: u32,
    pub burst: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionSettings {
    pub max_active_per_url: usize,
    pub queue_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub connect_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub max_redirects: u32,
    pub channel_capacity: usize,
    pub user_agent: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub capacity: usize,
    pub stream_url_ttl_secs: u64,
    pub stream_url_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HelperSettings {
    pub binary: String,
    pub cookies_path: Option<PathBuf>,
    pub proxy: Option<String>,
    pub fast_timeout_secs: u64,
    pub broad_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    pub fast_player_client: String,
    pub credential_suspend_secs: u64,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut env_source = Environment::with_prefix("STREAM_RELAY")
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in LIST_KEYS {
            env_source = env_source.with_list_parse_key(key);
        }

        let config = Config::builder()
            // Start with default values
            .set_default("application.host", "0.0.0.0")?
            .set_default("application.port", 8787)?
            .set_default("application.environment", environment.clone())?
            .set_default("application.max_body_bytes", 16 * 1024)?
            .set_default("application.maintenance_interval_secs", 60)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "compact")?
            .set_default("auth.api_keys", Vec::<String>::new())?
            .set_default("destination.allowed_schemes", vec!["https"])?
            .set_default(
                "destination.allowed_host_suffixes",
                vec!["googlevideo.com", "youtube.com", "ytimg.com"],
            )?
            .set_default("destination.allowed_cidrs", Vec::<String>::new())?
            .set_default("rate_limit.window_secs", 60)?
            .set_default("rate_limit.max_requests", 60)?
            .set_default("rate_limit.burst", 10)?
            .set_default("circuit_breaker.failure_threshold", 5)?
            .set_default("circuit_breaker.cooldown_secs", 30)?
            .set_default("admission.max_active_per_url", 1)?
            .set_default("admission.queue_timeout_secs", 10)?
            .set_default("proxy.max_retries", 6)?
            .set_default("proxy.retry_backoff_ms", 250)?
            .set_default("proxy.connect_timeout_secs", 10)?
            .set_default("proxy.stall_timeout_secs", 20)?
            .set_default("proxy.max_redirects", 3)?
            .set_default("proxy.channel_capacity", 16)?
            .set_default(
                "proxy.user_agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            )?
            .set_default("cache.ttl_secs", 600)?
            .set_default("cache.capacity", 500)?
            .set_default("cache.stream_url_ttl_secs", 300)?
            .set_default("cache.stream_url_capacity", 500)?
            .set_default("helper.binary", "yt-dlp")?
            .set_default("helper.fast_timeout_secs", 8)?
            .set_default("helper.broad_timeout_secs", 20)?
            .set_default("helper.extract_timeout_secs", 25)?
            .set_default("helper.fast_player_client", "android")?
            .set_default("helper.credential_suspend_secs", 3600)?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(env_source)
            .build()?;

        config.try_deserialize()
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }
}
