//! Configuration management for shelfcrawl.
//!
//! Settings load from an optional TOML file, with environment variables
//! taking precedence for the values operators most often override.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default maximum number of concurrently executing tasks.
pub const DEFAULT_MAX_TASKS: usize = 10;
/// Default message visibility timeout in seconds.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 300;
/// Default number of seconds before lease expiry at which renewal fires.
pub const DEFAULT_VISIBILITY_TIMEOUT_OFFSET_SECS: u64 = 10;
/// Default long-poll wait per grace-period attempt, in seconds.
pub const DEFAULT_LONG_POLL_WAIT_SECS: u64 = 20;

/// Which backend implementation to use for the queue and cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Task runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Maximum number of tasks executing at once.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// Message lease duration in seconds.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    /// Renew the lease this many seconds before it expires.
    #[serde(default = "default_visibility_timeout_offset")]
    pub visibility_timeout_offset_secs: u64,
    /// Whether the idle grace period runs before shutdown.
    #[serde(default = "default_true")]
    pub grace_period_enabled: bool,
    /// Grace period length in seconds. Defaults to lease + offset.
    #[serde(default)]
    pub grace_period_secs: Option<u64>,
    /// Long-poll wait per grace-period receive attempt, in seconds.
    #[serde(default = "default_long_poll_wait")]
    pub long_poll_wait_secs: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
            visibility_timeout_offset_secs: DEFAULT_VISIBILITY_TIMEOUT_OFFSET_SECS,
            grace_period_enabled: true,
            grace_period_secs: None,
            long_poll_wait_secs: DEFAULT_LONG_POLL_WAIT_SECS,
        }
    }
}

impl RunnerSettings {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn visibility_timeout_offset(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_offset_secs)
    }

    pub fn long_poll_wait(&self) -> Duration {
        Duration::from_secs(self.long_poll_wait_secs)
    }

    /// Grace period duration, defaulting to lease + offset.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(
            self.grace_period_secs
                .unwrap_or(self.visibility_timeout_secs + self.visibility_timeout_offset_secs),
        )
    }
}

/// Queue connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Name of the input queue tasks are pulled from.
    pub input_queue: String,
    /// Fixed output queue. When absent, each message's `result_queue` is used.
    #[serde(default)]
    pub output_queue: Option<String>,
    #[serde(default)]
    pub backend: BackendKind,
    /// Connection URL for the redis backend.
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            input_queue: "shelfcrawl-input".to_string(),
            output_queue: None,
            backend: BackendKind::Memory,
            redis_url: None,
        }
    }
}

/// Fingerprint cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Sites caching applies to. Jobs for other sites always fetch live.
    #[serde(default)]
    pub sites: Vec<String>,
    /// Default entry TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sites: Vec::new(),
            default_ttl_secs: default_cache_ttl(),
            backend: BackendKind::Memory,
            redis_url: None,
        }
    }
}

impl CacheSettings {
    /// Whether caching applies to a given job. Summary jobs never cache.
    pub fn applies_to(&self, site: &str, summary: bool) -> bool {
        self.enabled && !summary && self.sites.iter().any(|s| s == site)
    }
}

/// Output object storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Bucket name (or root directory for the filesystem store).
    pub bucket: String,
    /// Key prefix for uploaded result objects.
    #[serde(default = "default_output_prefix")]
    pub prefix: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            bucket: "shelfcrawl-output".to_string(),
            prefix: default_output_prefix(),
        }
    }
}

/// Per-site settings for generically supported sites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteSettings {
    /// Search listing URL with a `{query}` placeholder. Absent means the
    /// site only supports single-product tasks.
    #[serde(default)]
    pub search_url: Option<String>,
}

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub output: OutputSettings,
    /// Sites served by the generic extractor, keyed by site name.
    #[serde(default)]
    pub sites: HashMap<String, SiteSettings>,
}

impl Settings {
    /// Load settings from a TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => Settings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Environment variables override file values for deploy-time knobs.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SHELFCRAWL_INPUT_QUEUE") {
            self.queue.input_queue = v;
        }
        if let Ok(v) = std::env::var("SHELFCRAWL_OUTPUT_QUEUE") {
            self.queue.output_queue = Some(v);
        }
        if let Ok(v) = std::env::var("SHELFCRAWL_OUTPUT_BUCKET") {
            self.output.bucket = v;
        }
        if let Ok(v) = std::env::var("SHELFCRAWL_MAX_TASKS") {
            match v.parse() {
                Ok(n) => self.runner.max_tasks = n,
                Err(_) => tracing::warn!("Ignoring non-numeric SHELFCRAWL_MAX_TASKS={}", v),
            }
        }
        if let Ok(v) = std::env::var("SHELFCRAWL_REDIS_URL") {
            self.queue.redis_url = Some(v.clone());
            self.cache.redis_url = Some(v);
        }
    }
}

fn default_max_tasks() -> usize {
    DEFAULT_MAX_TASKS
}

fn default_visibility_timeout() -> u64 {
    DEFAULT_VISIBILITY_TIMEOUT_SECS
}

fn default_visibility_timeout_offset() -> u64 {
    DEFAULT_VISIBILITY_TIMEOUT_OFFSET_SECS
}

fn default_long_poll_wait() -> u64 {
    DEFAULT_LONG_POLL_WAIT_SECS
}

fn default_cache_ttl() -> u64 {
    86400
}

fn default_output_prefix() -> String {
    "output".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.runner.max_tasks, 10);
        assert_eq!(settings.runner.visibility_timeout_secs, 300);
        assert_eq!(settings.runner.grace_period(), Duration::from_secs(310));
        assert!(settings.runner.grace_period_enabled);
    }

    #[test]
    fn test_cache_applies_to() {
        let cache = CacheSettings {
            enabled: true,
            sites: vec!["acme".to_string()],
            ..Default::default()
        };
        assert!(cache.applies_to("acme", false));
        assert!(!cache.applies_to("acme", true));
        assert!(!cache.applies_to("other", false));

        let disabled = CacheSettings::default();
        assert!(!disabled.applies_to("acme", false));
    }

    #[test]
    fn test_parse_toml() {
        let settings: Settings = toml::from_str(
            r#"
            [runner]
            max_tasks = 4
            grace_period_secs = 60

            [queue]
            input_queue = "tasks"
            backend = "redis"
            redis_url = "redis://localhost:6379"

            [cache]
            enabled = true
            sites = ["acme"]
            "#,
        )
        .unwrap();
        assert_eq!(settings.runner.max_tasks, 4);
        assert_eq!(settings.runner.grace_period(), Duration::from_secs(60));
        assert_eq!(settings.queue.backend, BackendKind::Redis);
        assert!(settings.cache.enabled);
    }
}
