//! Redis-backed bucket store.
//!
//! Bucket state lives in one hash per key (`tokens`, `ts`) and the whole
//! step runs as a single Lua script, which Redis executes without
//! interleaving any other command. The script is sent with `EVALSHA` and
//! loaded on demand when the server does not know it yet.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script, Value};
use tracing::{debug, info, trace};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{BucketCodec, BucketRecord, BucketRequest, ReplyValue};

use super::script::TOKEN_BUCKET_SCRIPT;
use super::BucketStore;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379/`)
    pub url: String,
    /// Upper bound on connecting and on every round trip
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            command_timeout: Duration::from_millis(500),
        }
    }
}

/// Bucket store on a shared Redis server.
pub struct RedisStore {
    connection: RwLock<Option<ConnectionManager>>,
    script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("script_hash", &self.script.get_hash())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default settings.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(RedisStoreConfig {
            url: url.to_string(),
            ..RedisStoreConfig::default()
        })
        .await
    }

    /// Connect with custom settings.
    ///
    /// Fails with `Config` for a malformed URL and with `StoreUnavailable`
    /// when the server cannot be reached within `command_timeout`.
    pub async fn connect_with_config(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| TollgateError::Config(format!("invalid redis url: {}", e)))?;

        let connection = match tokio::time::timeout(
            config.command_timeout,
            ConnectionManager::new(client),
        )
        .await
        {
            Ok(connection) => connection?,
            Err(_) => {
                return Err(TollgateError::StoreUnavailable(format!(
                    "connecting to redis timed out after {:?}",
                    config.command_timeout
                )))
            }
        };

        info!(
            timeout = ?config.command_timeout,
            "Connected to redis bucket store"
        );

        Ok(Self {
            connection: RwLock::new(Some(connection)),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            config,
        })
    }

    /// The connection settings.
    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| TollgateError::StoreUnavailable("redis store is closed".to_string()))
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(TollgateError::from),
            Err(_) => Err(TollgateError::StoreUnavailable(format!(
                "redis {} timed out after {:?}",
                operation, self.config.command_timeout
            ))),
        }
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn execute(&self, request: &BucketRequest) -> Result<ReplyValue> {
        let mut connection = self.connection()?;

        let mut invocation = self.script.key(request.key.as_str());
        for arg in request.args() {
            invocation.arg(arg);
        }

        trace!(request = %request, "Running bucket script");

        let value: Value = self
            .bounded("script", invocation.invoke_async(&mut connection))
            .await?;

        Ok(to_reply(value))
    }

    async fn fetch(&self, key: &str) -> Result<Option<BucketRecord>> {
        let mut connection = self.connection()?;

        let fields: HashMap<String, String> =
            self.bounded("HGETALL", connection.hgetall(key)).await?;

        BucketCodec::decode_record(&fields)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut connection = self.connection()?;

        let removed: i64 = self.bounded("DEL", connection.del(key)).await?;

        debug!(key = %key, removed = removed, "Deleted bucket");
        Ok(removed > 0)
    }

    async fn close(&self) -> Result<()> {
        if self.connection.write().take().is_some() {
            info!("Closed redis bucket store");
        }
        Ok(())
    }
}

/// Reduce a raw redis reply to the kinds the codec understands.
fn to_reply(value: Value) -> ReplyValue {
    match value {
        Value::Nil => ReplyValue::Nil,
        Value::Int(n) => ReplyValue::Int(n),
        Value::Boolean(b) => ReplyValue::Bool(b),
        Value::Double(d) => ReplyValue::Double(d),
        Value::BulkString(bytes) => match String::from_utf8(bytes) {
            Ok(text) => ReplyValue::Text(text),
            Err(_) => ReplyValue::Other("non-utf8 bulk string".to_string()),
        },
        Value::SimpleString(text) => ReplyValue::Text(text),
        Value::Array(items) => ReplyValue::Array(items.into_iter().map(to_reply).collect()),
        other => ReplyValue::Other(format!("{:?}", other)),
    }
}
