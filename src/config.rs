//! Configuration file handling.
//!
//! Settings are read from `.rewind.toml` and then overridden by CLI
//! arguments. Every field has a default so a partial file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cache::TtlPolicy;
use crate::limiter::{BackoffPolicy, QuotaWindow};
use crate::orchestrator::PipelineSettings;
use crate::upstream::{ChatClientConfig, RiotClientConfig};

pub const DEFAULT_CONFIG_FILE: &str = ".rewind.toml";

/// Upper bound for `telemetry.max_age_days`; match history is not kept longer.
pub const MAX_AGE_DAYS_LIMIT: u32 = 730;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub jobs: JobsConfig,
}

/// A setting that cannot be used.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("telemetry API key is missing (set RIOT_API_KEY or [telemetry].api_key)")]
    MissingApiKey,

    #[error("at least one quota window is required")]
    NoQuotaWindows,

    #[error("quota window {index} must have a positive limit and length")]
    InvalidQuotaWindow { index: usize },

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("{name} must be at most {max}, got {value}")]
    TooLarge {
        name: &'static str,
        max: u64,
        value: u64,
    },

    #[error("backoff floor ({floor}s) exceeds ceiling ({ceiling}s)")]
    FloorAboveCeiling { floor: u64, ceiling: u64 },

    #[error("backoff multiplier must be at least 1.0, got {0}")]
    Multiplier(f64),

    #[error("backoff jitter must be in [0, 1), got {0}")]
    Jitter(f64),

    #[error("temperature must be between 0.0 and 1.0, got {0}")]
    Temperature(f32),

    #[error("{name} must start with 'http://' or 'https://'")]
    Url { name: &'static str },
}

/// HTTP service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the service listens on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Allowed CORS origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Seconds between SSE keep-alive comments.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: Vec::new(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_keepalive_secs() -> u64 {
    15
}

/// One sliding quota window as written in the config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    pub limit: usize,
    pub secs: u64,
}

/// Match telemetry API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// API key. Usually supplied through `RIOT_API_KEY`.
    #[serde(default)]
    pub api_key: String,

    /// Regional routing host (accounts, matches).
    #[serde(default = "default_regional_url")]
    pub regional_url: String,

    /// Platform routing host (summoners, leagues).
    #[serde(default = "default_platform_url")]
    pub platform_url: String,

    #[serde(default = "default_telemetry_timeout")]
    pub timeout_secs: u64,

    /// Quota windows; all must have room before a call goes out.
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowConfig>,

    /// Match ids requested per discovery page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Ignore matches older than this. Zero disables the bound.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Most match ids listed before selection.
    #[serde(default = "default_discovery_limit")]
    pub discovery_limit: usize,

    /// Matches inspected to estimate the share of ranked games.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Detail fetches in flight at once.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Wait after a 429 without a `Retry-After` header.
    #[serde(default = "default_throttle_pause")]
    pub throttle_pause_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            regional_url: default_regional_url(),
            platform_url: default_platform_url(),
            timeout_secs: default_telemetry_timeout(),
            windows: default_windows(),
            page_size: default_page_size(),
            max_age_days: default_max_age_days(),
            discovery_limit: default_discovery_limit(),
            sample_size: default_sample_size(),
            fetch_concurrency: default_fetch_concurrency(),
            throttle_pause_secs: default_throttle_pause(),
        }
    }
}

fn default_regional_url() -> String {
    "https://americas.api.riotgames.com".to_string()
}

fn default_platform_url() -> String {
    "https://na1.api.riotgames.com".to_string()
}

fn default_telemetry_timeout() -> u64 {
    30
}

fn default_windows() -> Vec<WindowConfig> {
    vec![
        WindowConfig { limit: 20, secs: 1 },
        WindowConfig {
            limit: 100,
            secs: 120,
        },
    ]
}

fn default_page_size() -> usize {
    100
}

fn default_max_age_days() -> u32 {
    100
}

fn default_discovery_limit() -> usize {
    300
}

fn default_sample_size() -> usize {
    50
}

fn default_fetch_concurrency() -> usize {
    10
}

fn default_throttle_pause() -> u64 {
    10
}

/// Inference service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Chat endpoint base URL.
    #[serde(default = "default_inference_url")]
    pub url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,

    /// Minimum spacing between consecutive calls.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "default_backoff_floor")]
    pub backoff_floor_secs: u64,

    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay added as random jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Calls per job before giving up on a throttling service.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: default_inference_url(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_inference_timeout(),
            min_interval_ms: default_min_interval_ms(),
            backoff_floor_secs: default_backoff_floor(),
            backoff_ceiling_secs: default_backoff_ceiling(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_inference_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_inference_timeout() -> u64 {
    120
}

fn default_min_interval_ms() -> u64 {
    350
}

fn default_backoff_floor() -> u64 {
    5
}

fn default_backoff_ceiling() -> u64 {
    120
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_max_attempts() -> u32 {
    3
}

/// Durable record cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding `matches.json` and `profiles.json`.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Write records to `dir`. When false the cache lives in memory only.
    #[serde(default = "default_persist")]
    pub persist: bool,

    /// TTL for records that change (profiles, ranks).
    #[serde(default = "default_volatile_ttl")]
    pub volatile_ttl_secs: u64,

    /// TTL for immutable records (finished matches).
    #[serde(default = "default_stable_ttl")]
    pub stable_ttl_secs: u64,

    /// Age past which `sweep` drops entries.
    #[serde(default = "default_sweep_max_age_days")]
    pub sweep_max_age_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            persist: default_persist(),
            volatile_ttl_secs: default_volatile_ttl(),
            stable_ttl_secs: default_stable_ttl(),
            sweep_max_age_days: default_sweep_max_age_days(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".rewind-cache")
}

fn default_persist() -> bool {
    true
}

fn default_volatile_ttl() -> u64 {
    3600
}

fn default_stable_ttl() -> u64 {
    86_400
}

fn default_sweep_max_age_days() -> u64 {
    7
}

/// Job bookkeeping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// How long finished jobs stay queryable.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Buffered events per job before slow subscribers lag.
    #[serde(default = "default_broker_capacity")]
    pub broker_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            reap_interval_secs: default_reap_interval(),
            broker_capacity: default_broker_capacity(),
        }
    }
}

fn default_retention() -> u64 {
    1800
}

fn default_reap_interval() -> u64 {
    60
}

fn default_broker_capacity() -> usize {
    64
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// Only explicitly provided values override the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref dir) = args.cache_dir {
            self.cache.dir = dir.clone();
        }
        if let Some(ref key) = args.api_key {
            self.telemetry.api_key = key.clone();
        }
        if let Some(ref url) = args.inference_url {
            self.inference.url = url.clone();
        }

        match &args.command {
            crate::cli::Command::Serve { bind: Some(bind) } => {
                self.server.bind = bind.clone();
            }
            crate::cli::Command::Sweep {
                max_age_days: Some(days),
            } => {
                self.cache.sweep_max_age_days = *days;
            }
            _ => {}
        }
    }

    /// Reject settings the limiters, caches or clients cannot work with.
    pub fn validate(&self, require_api_key: bool) -> Result<(), ConfigError> {
        if require_api_key && self.telemetry.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }

        if self.telemetry.windows.is_empty() {
            return Err(ConfigError::NoQuotaWindows);
        }
        if let Some(index) = self
            .telemetry
            .windows
            .iter()
            .position(|w| w.limit == 0 || w.secs == 0)
        {
            return Err(ConfigError::InvalidQuotaWindow { index });
        }

        non_zero("telemetry.page_size", self.telemetry.page_size as u64)?;
        non_zero(
            "telemetry.discovery_limit",
            self.telemetry.discovery_limit as u64,
        )?;
        non_zero("telemetry.sample_size", self.telemetry.sample_size as u64)?;
        if self.telemetry.max_age_days > MAX_AGE_DAYS_LIMIT {
            return Err(ConfigError::TooLarge {
                name: "telemetry.max_age_days",
                max: u64::from(MAX_AGE_DAYS_LIMIT),
                value: u64::from(self.telemetry.max_age_days),
            });
        }
        non_zero(
            "telemetry.fetch_concurrency",
            self.telemetry.fetch_concurrency as u64,
        )?;
        non_zero("telemetry.timeout_secs", self.telemetry.timeout_secs)?;
        non_zero("inference.timeout_secs", self.inference.timeout_secs)?;
        non_zero("inference.max_attempts", self.inference.max_attempts as u64)?;
        non_zero("inference.backoff_floor_secs", self.inference.backoff_floor_secs)?;
        non_zero("cache.volatile_ttl_secs", self.cache.volatile_ttl_secs)?;
        non_zero("cache.stable_ttl_secs", self.cache.stable_ttl_secs)?;
        non_zero("cache.sweep_max_age_days", self.cache.sweep_max_age_days)?;
        non_zero("jobs.retention_secs", self.jobs.retention_secs)?;
        non_zero("jobs.reap_interval_secs", self.jobs.reap_interval_secs)?;
        non_zero("jobs.broker_capacity", self.jobs.broker_capacity as u64)?;
        non_zero("server.keepalive_secs", self.server.keepalive_secs)?;

        let inference = &self.inference;
        if inference.backoff_floor_secs > inference.backoff_ceiling_secs {
            return Err(ConfigError::FloorAboveCeiling {
                floor: inference.backoff_floor_secs,
                ceiling: inference.backoff_ceiling_secs,
            });
        }
        if !(inference.multiplier >= 1.0) {
            return Err(ConfigError::Multiplier(inference.multiplier));
        }
        if !(0.0..1.0).contains(&inference.jitter) {
            return Err(ConfigError::Jitter(inference.jitter));
        }
        if !(0.0..=1.0).contains(&inference.temperature) {
            return Err(ConfigError::Temperature(inference.temperature));
        }

        check_url("inference.url", &inference.url)?;
        check_url("telemetry.regional_url", &self.telemetry.regional_url)?;
        check_url("telemetry.platform_url", &self.telemetry.platform_url)?;

        Ok(())
    }

    pub fn quota_windows(&self) -> Vec<QuotaWindow> {
        self.telemetry
            .windows
            .iter()
            .map(|w| QuotaWindow::new(w.limit, Duration::from_secs(w.secs)))
            .collect()
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let inference = &self.inference;
        BackoffPolicy {
            min_interval: Duration::from_millis(inference.min_interval_ms),
            floor: Duration::from_secs(inference.backoff_floor_secs),
            ceiling: Duration::from_secs(inference.backoff_ceiling_secs),
            multiplier: inference.multiplier,
            jitter: inference.jitter,
            max_attempts: inference.max_attempts,
        }
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            volatile: Duration::from_secs(self.cache.volatile_ttl_secs),
            stable: Duration::from_secs(self.cache.stable_ttl_secs),
        }
    }

    pub fn sweep_max_age(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_max_age_days.saturating_mul(86_400))
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            fetch_concurrency: self.telemetry.fetch_concurrency,
            max_age_days: self.telemetry.max_age_days,
            page_size: self.telemetry.page_size,
            discovery_limit: self.telemetry.discovery_limit,
            sample_size: self.telemetry.sample_size,
            throttle_pause: Duration::from_secs(self.telemetry.throttle_pause_secs),
            retention: Duration::from_secs(self.jobs.retention_secs),
            reap_interval: Duration::from_secs(self.jobs.reap_interval_secs),
            broker_capacity: self.jobs.broker_capacity,
        }
    }

    pub fn riot_client_config(&self) -> RiotClientConfig {
        RiotClientConfig {
            api_key: self.telemetry.api_key.clone(),
            regional_url: self.telemetry.regional_url.clone(),
            platform_url: self.telemetry.platform_url.clone(),
            timeout: Duration::from_secs(self.telemetry.timeout_secs),
        }
    }

    pub fn chat_client_config(&self) -> ChatClientConfig {
        ChatClientConfig {
            url: self.inference.url.clone(),
            model: self.inference.model.clone(),
            temperature: self.inference.temperature,
            timeout: Duration::from_secs(self.inference.timeout_secs),
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

fn non_zero(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { name })
    } else {
        Ok(())
    }
}

fn check_url(name: &'static str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Url { name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed() -> Config {
        let mut config = Config::default();
        config.telemetry.api_key = "RGAPI-test".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert_eq!(config.telemetry.windows.len(), 2);
        assert_eq!(config.inference.max_attempts, 3);
        assert_eq!(config.cache.dir, PathBuf::from(".rewind-cache"));
        assert!(config.validate(false).is_ok());
        assert_eq!(config.validate(true), Err(ConfigError::MissingApiKey));
        assert!(keyed().validate(true).is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_content = r#"
[telemetry]
api_key = "RGAPI-abc"
windows = [{ limit = 2, secs = 1 }]

[inference]
model = "qwen2.5:7b"
max_attempts = 5

[jobs]
broker_capacity = 8
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.telemetry.api_key, "RGAPI-abc");
        assert_eq!(config.telemetry.windows, vec![WindowConfig { limit: 2, secs: 1 }]);
        assert_eq!(config.telemetry.page_size, 100);
        assert_eq!(config.inference.model, "qwen2.5:7b");
        assert_eq!(config.backoff_policy().max_attempts, 5);
        assert_eq!(config.jobs.broker_capacity, 8);
        assert_eq!(config.server.keepalive_secs, 15);
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut config = keyed();
        config.telemetry.windows.clear();
        assert_eq!(config.validate(true), Err(ConfigError::NoQuotaWindows));

        let mut config = keyed();
        config.telemetry.windows[1].limit = 0;
        assert_eq!(
            config.validate(true),
            Err(ConfigError::InvalidQuotaWindow { index: 1 })
        );

        let mut config = keyed();
        config.telemetry.fetch_concurrency = 0;
        assert!(matches!(
            config.validate(true),
            Err(ConfigError::Zero { name: "telemetry.fetch_concurrency" })
        ));

        let mut config = keyed();
        config.inference.max_attempts = 0;
        assert!(config.validate(true).is_err());

        let mut config = keyed();
        config.cache.stable_ttl_secs = 0;
        assert!(config.validate(true).is_err());

        let mut config = keyed();
        config.telemetry.sample_size = 0;
        assert!(config.validate(true).is_err());
    }

    #[test]
    fn test_validate_bounds_match_age() {
        let mut config = keyed();
        config.telemetry.max_age_days = MAX_AGE_DAYS_LIMIT;
        assert!(config.validate(true).is_ok());

        config.telemetry.max_age_days = u32::MAX;
        assert!(matches!(
            config.validate(true),
            Err(ConfigError::TooLarge {
                name: "telemetry.max_age_days",
                ..
            })
        ));

        // Zero still means unbounded.
        config.telemetry.max_age_days = 0;
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = keyed();
        config.inference.backoff_floor_secs = 200;
        assert!(matches!(
            config.validate(true),
            Err(ConfigError::FloorAboveCeiling { .. })
        ));

        let mut config = keyed();
        config.inference.backoff_floor_secs = 0;
        assert_eq!(
            config.validate(true),
            Err(ConfigError::Zero {
                name: "inference.backoff_floor_secs"
            })
        );

        let mut config = keyed();
        config.inference.multiplier = 0.5;
        assert_eq!(config.validate(true), Err(ConfigError::Multiplier(0.5)));

        let mut config = keyed();
        config.inference.jitter = 1.0;
        assert_eq!(config.validate(true), Err(ConfigError::Jitter(1.0)));

        let mut config = keyed();
        config.inference.url = "localhost:11434".to_string();
        assert_eq!(
            config.validate(true),
            Err(ConfigError::Url {
                name: "inference.url"
            })
        );
    }

    #[test]
    fn test_converters() {
        let config = Config::default();
        let windows = config.quota_windows();
        assert_eq!(windows[0].limit, 20);
        assert_eq!(windows[1].duration, Duration::from_secs(120));

        let policy = config.backoff_policy();
        assert_eq!(policy.min_interval, Duration::from_millis(350));
        assert_eq!(policy.floor, Duration::from_secs(5));

        assert_eq!(config.ttl_policy().volatile, Duration::from_secs(3600));
        assert_eq!(config.sweep_max_age(), Duration::from_secs(7 * 86_400));

        let settings = config.pipeline_settings();
        assert_eq!(settings.fetch_concurrency, 10);
        assert_eq!(settings.throttle_pause, Duration::from_secs(10));
        assert_eq!(settings.retention, Duration::from_secs(1800));
        assert_eq!(settings.discovery_limit, 300);
        assert_eq!(settings.sample_size, 50);
        assert!(config.cache.persist);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("[telemetry]"));
        assert!(toml_str.contains("[inference]"));
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[jobs]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.telemetry.windows.len(), 2);
    }
}
