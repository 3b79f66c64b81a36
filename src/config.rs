use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::monitor::PollPolicy;
use crate::probe::ProbeSettings;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "convergence-bench.toml";

const ENV_PREFIX: &str = "CONVERGENCE_BENCH_";

// ─── Sections ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Stream the probe observes for change entries.
    #[serde(default = "default_change_stream")]
    pub change_stream: String,

    /// Hash key prefix for probe documents.
    #[serde(default = "default_record_prefix")]
    pub record_prefix: String,

    /// Entries per `XREAD` round.
    #[serde(default = "default_feed_batch_size")]
    pub feed_batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_repoll_delay")]
    pub repoll_delay_ms: u64,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    #[serde(default = "default_payload_size")]
    pub payload_size: usize,

    /// Upper bound accepted for one HTTP-started run.
    #[serde(default = "default_max_run")]
    pub max_run_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub hang_timeout_secs: Option<u64>,

    #[serde(default)]
    pub sample_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `convergence_bench=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `compact`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_change_stream() -> String {
    "probe:changes".to_string()
}

fn default_record_prefix() -> String {
    "probe".to_string()
}

fn default_feed_batch_size() -> usize {
    100
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_key_prefix() -> String {
    "probe".to_string()
}

fn default_probe_timeout() -> u64 {
    3600
}

fn default_heartbeat() -> u64 {
    3600
}

fn default_repoll_delay() -> u64 {
    1
}

fn default_sample_interval() -> u64 {
    250
}

fn default_payload_size() -> usize {
    1024
}

fn default_max_run() -> u64 {
    3600
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_max_wait() -> u64 {
    3600 * 12
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            change_stream: default_change_stream(),
            record_prefix: default_record_prefix(),
            feed_batch_size: default_feed_batch_size(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            timeout_secs: default_probe_timeout(),
            heartbeat_secs: default_heartbeat(),
            repoll_delay_ms: default_repoll_delay(),
            sample_interval_ms: default_sample_interval(),
            payload_size: default_payload_size(),
            max_run_secs: default_max_run(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            max_wait_secs: default_max_wait(),
            max_retries: None,
            hang_timeout_secs: None,
            sample_retries: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────

impl Config {
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::Toml { path, source: e })
    }

    /// Reads `path`, or [`DEFAULT_CONFIG_FILE`] if present, or defaults;
    /// then applies `CONVERGENCE_BENCH_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok());
    }

    /// `lookup` receives the variable name without the prefix.
    /// Unparsable numbers leave the current value in place.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(raw: Option<String>, slot: &mut T) {
            if let Some(v) = raw.and_then(|s| s.parse().ok()) {
                *slot = v;
            }
        }

        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(stream) = lookup("CHANGE_STREAM") {
            self.redis.change_stream = stream;
        }
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        parsed(lookup("PORT"), &mut self.server.port);
        parsed(lookup("PROBE_TIMEOUT_SECS"), &mut self.probe.timeout_secs);
        parsed(lookup("PROBE_INTERVAL_MS"), &mut self.probe.sample_interval_ms);
        parsed(lookup("POLL_INTERVAL_MS"), &mut self.polling.interval_ms);
        parsed(lookup("POLL_MAX_WAIT_SECS"), &mut self.polling.max_wait_secs);
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.url.is_empty() {
            return Err(ConfigError::Validation("redis.url cannot be empty".to_string()));
        }
        if self.redis.change_stream.is_empty() {
            return Err(ConfigError::Validation(
                "redis.change_stream cannot be empty".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server.port must be non-zero".to_string()));
        }
        if self.probe.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "probe.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.probe.heartbeat_secs == 0 {
            return Err(ConfigError::Validation(
                "probe.heartbeat_secs must be at least 1".to_string(),
            ));
        }
        if self.probe.key_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "probe.key_prefix cannot be empty".to_string(),
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "polling.interval_ms must be at least 1".to_string(),
            ));
        }
        if self.polling.max_wait_secs == 0 {
            return Err(ConfigError::Validation(
                "polling.max_wait_secs must be at least 1".to_string(),
            ));
        }
        if self.polling.max_retries == Some(0) {
            return Err(ConfigError::Validation(
                "polling.max_retries must be at least 1 when set".to_string(),
            ));
        }
        if !["pretty", "compact"].contains(&self.logging.format.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log format '{}', must be 'pretty' or 'compact'",
                self.logging.format
            )));
        }
        Ok(())
    }

    // ── Conversions ──────────────────────────────────────────────

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            key_prefix: self.probe.key_prefix.clone(),
            timeout: Duration::from_secs(self.probe.timeout_secs),
            heartbeat: Duration::from_secs(self.probe.heartbeat_secs),
            repoll_delay: Duration::from_millis(self.probe.repoll_delay_ms),
            sample_interval: Duration::from_millis(self.probe.sample_interval_ms),
            payload_size: self.probe.payload_size,
        }
    }

    /// Fixed-interval policy from the `polling` section.
    pub fn poll_policy(&self) -> PollPolicy {
        let p = &self.polling;
        let mut policy = PollPolicy::fixed(
            Duration::from_millis(p.interval_ms),
            Duration::from_secs(p.max_wait_secs),
        )
        .with_sample_retries(p.sample_retries);
        if let Some(retries) = p.max_retries {
            policy = policy.with_max_retries(retries);
        }
        if let Some(hang) = p.hang_timeout_secs {
            policy = policy.with_hang_timeout(Duration::from_secs(hang));
        }
        policy
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML in {path:?}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.probe.timeout_secs, 3600);
        assert_eq!(config.probe.sample_interval_ms, 250);
        assert!(config.validate().is_ok());

        let settings = config.probe_settings();
        assert_eq!(settings, ProbeSettings::default());
    }

    #[test]
    fn test_toml_deserialization_fills_defaults() {
        let toml_str = r#"
            [redis]
            url = "redis://cache:6380/"

            [polling]
            interval_ms = 500
            max_retries = 60
            hang_timeout_secs = 30
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.redis.url, "redis://cache:6380/");
        assert_eq!(config.redis.change_stream, "probe:changes");

        let policy = config.poll_policy();
        assert_eq!(policy.max_retries, Some(60));
        assert_eq!(policy.hang_timeout, Some(Duration::from_secs(30)));
        assert_eq!(policy.schedule.interval_for(0), Duration::from_millis(500));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REDIS_URL", "redis://other:6379/"),
            ("PORT", "8080"),
            ("PROBE_TIMEOUT_SECS", "not-a-number"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| (*v).to_string()));
        assert_eq!(config.redis.url, "redis://other:6379/");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.probe.timeout_secs, 3600);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.probe.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polling.max_retries = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_poll_interval() {
        let mut config = Config::default();
        config.polling.interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("polling.interval_ms"), "{err}");

        let vars: HashMap<&str, &str> = [("POLL_INTERVAL_MS", "0")].into_iter().collect();
        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| (*v).to_string()));
        assert!(config.validate().is_err());
    }
}
