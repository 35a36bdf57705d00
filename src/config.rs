//! Configuration management for Tollgate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    BucketCodec, BucketConfig, TokenBucketLimiter, DEFAULT_CAPACITY, DEFAULT_KEY_PREFIX,
    DEFAULT_RATE,
};
use crate::store::{
    BucketStore, MemoryStore, RedisStore, RedisStoreConfig, ReplyEncoding, DEFAULT_SWEEP_INTERVAL,
};

/// Prefix of environment variables overriding file settings,
/// e.g. `TOLLGATE__LIMITER__RATE=50`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Bucket parameters
    #[serde(default)]
    pub limiter: LimiterSettings,
}

/// Which store holds bucket state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, only shared within one process
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Prefix prepended to every rate limit key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connect and round-trip timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Reply encoding of the memory backend
    #[serde(default)]
    pub reply_encoding: ReplyEncoding,

    /// Seconds between sweeps of expired records in the memory backend
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
            reply_encoding: ReplyEncoding::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_command_timeout_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

impl StoreConfig {
    /// Round-trip timeout as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Open the configured store.
    pub async fn connect(&self) -> Result<Arc<dyn BucketStore>> {
        if self.command_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.command_timeout_ms must be > 0".to_string(),
            ));
        }

        match self.backend {
            StoreBackend::Memory => {
                if self.sweep_interval_secs == 0 {
                    return Err(TollgateError::Config(
                        "store.sweep_interval_secs must be > 0".to_string(),
                    ));
                }

                info!(
                    encoding = ?self.reply_encoding,
                    sweep_interval_secs = self.sweep_interval_secs,
                    "Using in-process bucket store"
                );
                Ok(Arc::new(
                    MemoryStore::new()
                        .with_encoding(self.reply_encoding)
                        .with_sweep_interval(Duration::from_secs(self.sweep_interval_secs)),
                ))
            }
            StoreBackend::Redis => {
                let store = RedisStore::connect_with_config(RedisStoreConfig {
                    url: self.url.clone(),
                    command_timeout: self.command_timeout(),
                })
                .await?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// Bucket parameters as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Maximum tokens per bucket (burst)
    #[serde(default = "default_capacity")]
    pub capacity: i64,

    /// Seconds of inactivity after which a bucket is reclaimed
    #[serde(default = "default_idle_expiration_secs")]
    pub idle_expiration_secs: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
            idle_expiration_secs: default_idle_expiration_secs(),
        }
    }
}

fn default_rate() -> f64 {
    DEFAULT_RATE
}

fn default_capacity() -> i64 {
    DEFAULT_CAPACITY
}

fn default_idle_expiration_secs() -> u64 {
    3600
}

impl LimiterSettings {
    /// Validate into a bucket configuration.
    pub fn bucket_config(&self) -> Result<BucketConfig> {
        BucketConfig::new(
            self.rate,
            self.capacity,
            Duration::from_secs(self.idle_expiration_secs),
        )
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional YAML file, overridden by
    /// `TOLLGATE__SECTION__FIELD` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Yaml,
            ));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Connect the configured store and build a limiter over it.
    pub async fn build_limiter(&self) -> Result<TokenBucketLimiter> {
        let bucket = self.limiter.bucket_config()?;
        let store = self.store.connect().await?;

        info!(
            rate = bucket.rate(),
            capacity = bucket.capacity(),
            idle_expiration = ?bucket.idle_expiration(),
            backend = ?self.store.backend,
            "Token bucket limiter ready"
        );

        Ok(TokenBucketLimiter::new(store, bucket)
            .with_codec(BucketCodec::new(self.store.key_prefix.clone())))
    }
}
